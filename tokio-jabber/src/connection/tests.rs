use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};

use tokio::io::{AsyncReadExt, DuplexStream, ReadBuf};
use tokio::time::{sleep_until, Instant};

use super::*;

const SERVER_HEADER: &[u8] = b"<?xml version='1.0'?>\
    <stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
    id='s-1' from='localhost' version='1.0'>";

async fn attached() -> (Connection, DuplexStream) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client, server) = tokio::io::duplex(16384);
    let conn = Connection::new("localhost", 5222).with_keepalive(KeepAlive::disabled());
    conn.attach(client).await.unwrap();
    (conn, server)
}

/// Read from the server side until `needle` showed up.
async fn read_until(server: &mut DuplexStream, needle: &str) -> String {
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    while !String::from_utf8_lossy(&seen).contains(needle) {
        let n = server.read(&mut buf).await.unwrap();
        assert_ne!(n, 0, "client closed before sending {needle:?}");
        seen.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(seen).unwrap()
}

async fn until_disconnected(conn: &Connection) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while conn.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Transport which never yields data and records what is written, until
/// it gets broken.
#[derive(Clone, Default)]
struct SilentPeer {
    written: Arc<StdMutex<Vec<u8>>>,
    broken: Arc<AtomicBool>,
}

impl SilentPeer {
    fn text(&self) -> String {
        String::from_utf8(self.written.lock().unwrap().clone()).unwrap()
    }

    fn break_pipe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl AsyncRead for SilentPeer {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for SilentPeer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.broken.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn capture_exception(conn: &Connection) -> oneshot::Receiver<String> {
    let (tx, rx) = oneshot::channel();
    let tx = StdMutex::new(Some(tx));
    conn.on_connection_exception(move |e: &Error| {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(e.to_string());
        }
    });
    rx
}

#[tokio::test]
async fn open_stream_writes_header() {
    let (conn, mut server) = attached().await;
    assert!(conn.is_connected());
    conn.open_stream("capulet.lit").await.unwrap();
    let sent = read_until(&mut server, "version=\"1.0\">").await;
    assert_eq!(sent, ns::stream_header("capulet.lit"));
}

#[tokio::test]
async fn request_gets_iq_reply() {
    let (conn, mut server) = attached().await;
    server.write_all(SERVER_HEADER).await.unwrap();

    let server_task = tokio::spawn(async move {
        let sent = read_until(&mut server, "</iq>").await;
        assert!(sent.contains("id=\"roster-1\""));
        server
            .write_all(
                b"<message from='a@b'><body>noise</body></message>\
                  <iq type='set' id='roster-1'/>\
                  <iq type='result' id='roster-1'><query xmlns='jabber:iq:roster'/></iq>",
            )
            .await
            .unwrap();
        server
    });

    let query = StanzaTree::new("iq")
        .with_attr("type", "get")
        .with_attr("id", "roster-1")
        .with_child(StanzaTree::new("query").with_ns("jabber:iq:roster"));
    let reply = conn
        .request(
            &query,
            Connection::iq_reply_matcher("roster-1"),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap()
        .expect("reply");
    assert_eq!(reply.attr("type"), Some("result"));
    assert!(reply.child("query").unwrap().is("query", "jabber:iq:roster"));
    drop(server_task.await.unwrap());
}

#[tokio::test]
async fn request_times_out_and_handler_retires() {
    let (conn, mut server) = attached().await;
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let recorded = seen.clone();
    conn.add_filter("all", move |stanza: &StanzaTree| {
        recorded.lock().unwrap().push(stanza.name().to_owned());
        stanza.consume();
    })
    .await
    .unwrap();

    let reply = conn
        .request(
            "<iq type='get' id='lost'/>",
            Connection::iq_reply_matcher("lost"),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    assert!(reply.is_none());

    // A late reply now goes to the filter.
    server.write_all(SERVER_HEADER).await.unwrap();
    server
        .write_all(b"<iq type='result' id='lost'/></stream:stream>")
        .await
        .unwrap();
    until_disconnected(&conn).await;
    assert_eq!(*seen.lock().unwrap(), ["stream", "iq"]);
}

#[tokio::test]
async fn handlers_take_precedence_over_filters() {
    let (conn, mut server) = attached().await;
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let recorded = seen.clone();
    conn.add_filter("all", move |stanza: &StanzaTree| {
        recorded.lock().unwrap().push(stanza.name().to_owned());
    })
    .await
    .unwrap();

    let token = conn
        .send_with("<presence/>", |stanza: &StanzaTree| {
            if stanza.name() == "message" {
                stanza.consume();
            }
        })
        .await
        .unwrap();
    server.write_all(SERVER_HEADER).await.unwrap();
    server
        .write_all(
            b"<presence from='a@b'/><message><body>hi</body></message><presence from='c@d'/>\
              </stream:stream>",
        )
        .await
        .unwrap();
    conn.wait_for(token, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    until_disconnected(&conn).await;
    assert_eq!(*seen.lock().unwrap(), ["stream", "presence", "presence"]);
}

#[tokio::test]
async fn close_releases_waiters() {
    let (conn, mut server) = attached().await;
    let conn = Arc::new(conn);
    let token = conn
        .send_with("<iq type='get' id='x'/>", |_: &StanzaTree| ())
        .await
        .unwrap();
    let waiter = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.wait_for(token, None).await })
    };
    tokio::task::yield_now().await;

    conn.close().await;
    assert!(!conn.is_connected());
    assert!(matches!(waiter.await.unwrap(), Err(Error::Disconnected)));

    let sent = read_until(&mut server, ns::STREAM_FOOTER).await;
    assert!(sent.ends_with(ns::STREAM_FOOTER));
    assert!(matches!(
        conn.send("<presence/>").await,
        Err(Error::TransportWrite(_))
    ));
}

#[tokio::test]
async fn eof_is_reported_and_releases_waiters() {
    let (conn, mut server) = attached().await;
    let (tx, rx) = oneshot::channel();
    let tx = StdMutex::new(Some(tx));
    conn.on_connection_exception(move |e: &Error| {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(e.to_string());
        }
    });
    conn.add_filter("sink", |stanza: &StanzaTree| stanza.consume())
        .await
        .unwrap();
    let token = conn
        .send_with("<iq type='get' id='y'/>", |_: &StanzaTree| ())
        .await
        .unwrap();

    server.write_all(SERVER_HEADER).await.unwrap();
    server.write_all(b"<presence/>").await.unwrap();
    drop(server);

    let message = rx.await.unwrap();
    assert!(
        message.starts_with("protocol error") || message.starts_with("transport read error"),
        "{message}"
    );
    assert!(matches!(
        conn.wait_for(token, Some(Duration::from_secs(5))).await,
        Err(Error::Disconnected)
    ));
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn stanzas_wait_for_first_registrant() {
    let (conn, mut server) = attached().await;
    server.write_all(SERVER_HEADER).await.unwrap();
    server
        .write_all(b"<message id='early'/>")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    conn.add_filter("late", move |stanza: &StanzaTree| {
        if stanza.name() == "message" {
            if let Some(tx) = tx.take() {
                let _ = tx.send(stanza.attr("id").map(str::to_owned));
            }
        }
    })
    .await
    .unwrap();
    let id = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id.as_deref(), Some("early"));
}

#[tokio::test]
async fn invalid_and_unattached_use() {
    let conn = Connection::new("localhost", 5222);
    assert!(!conn.is_connected());
    assert!(matches!(
        conn.add_filter("", |_: &StanzaTree| ()).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(!conn.remove_filter("missing").await);
    assert!(matches!(
        conn.send("<presence/>").await,
        Err(Error::TransportWrite(_))
    ));

    let (conn, _server) = attached().await;
    let (again, _other) = tokio::io::duplex(64);
    assert!(matches!(
        conn.attach(again).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn iq_reply_matcher_accepts_result_and_error_only() {
    let matcher = Connection::iq_reply_matcher("q1");
    let iq = |ty: &str, id: &str| StanzaTree::new("iq").with_attr("type", ty).with_attr("id", id);
    assert!(matcher(&iq("result", "q1")));
    assert!(matcher(&iq("error", "q1")));
    assert!(!matcher(&iq("get", "q1")));
    assert!(!matcher(&iq("result", "q2")));
    assert!(!matcher(&StanzaTree::new("message").with_attr("id", "q1")));
}

#[tokio::test]
async fn send_with_after_server_closed() {
    let (conn, mut server) = attached().await;
    conn.add_filter("sink", |stanza: &StanzaTree| stanza.consume())
        .await
        .unwrap();
    server.write_all(SERVER_HEADER).await.unwrap();
    server.shutdown().await.unwrap();
    until_disconnected(&conn).await;

    assert!(matches!(
        conn.send_with("<iq type='get' id='late'/>", |_: &StanzaTree| ())
            .await,
        Err(Error::Disconnected)
    ));
    assert!(matches!(
        conn.send("<presence/>").await,
        Err(Error::TransportWrite(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn keepalive_pings_idle_stream_until_write_fails() {
    let _ = env_logger::builder().is_test(true).try_init();
    let start = Instant::now();
    let peer = SilentPeer::default();
    let conn = Connection::new("localhost", 5222);
    let exception = capture_exception(&conn);
    conn.attach(peer.clone()).await.unwrap();
    let token = conn
        .send_with("<iq type='get' id='k1'/>", |_: &StanzaTree| ())
        .await
        .unwrap();

    // Without this send, the first ping would go out at 32s.
    sleep_until(start + Duration::from_secs(21)).await;
    conn.send("<presence/>").await.unwrap();
    sleep_until(start + Duration::from_secs(41)).await;
    assert_eq!(peer.text(), "<iq type='get' id='k1'/><presence/>");
    sleep_until(start + Duration::from_secs(43)).await;
    assert_eq!(peer.text(), "<iq type='get' id='k1'/><presence/> ");

    // The next ping, at 64s, hits the broken transport.
    peer.break_pipe();
    let message = exception.await.unwrap();
    assert!(message.starts_with("transport write error"), "{message}");
    assert!(Instant::now() >= start + Duration::from_secs(63));
    assert!(matches!(
        conn.wait_for(token, None).await,
        Err(Error::Disconnected)
    ));
    assert!(!conn.is_connected());
    assert!(matches!(
        conn.send_with("<presence/>", |_: &StanzaTree| ()).await,
        Err(Error::Disconnected)
    ));
}
