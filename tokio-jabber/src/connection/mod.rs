//! # Raw XML stream connections
//!
//! A [`Connection`] owns the write half of a stream and a background reader
//! task which parses the read half into [`StanzaTree`]s. Every incoming
//! stanza is offered to the registrants of the connection, in this order:
//!
//! 1. one-shot response handlers registered with [`Connection::send_with`],
//!    oldest first;
//! 2. named filters registered with [`Connection::add_filter`], in
//!    registration order.
//!
//! The first registrant which calls [`StanzaTree::consume`] claims the
//! stanza and nobody after it sees it. A consuming response handler is
//! removed and whoever awaits its [`ResponseToken`] is woken.
//!
//! While no registrant exists at all, the reader task holds back the
//! stanza it has just parsed until something gets registered, so no
//! stanza is lost between connecting and installing the first filter.
//!
//! ```no_run
//! # use std::time::Duration;
//! # use tokio_jabber::{Connection, StanzaTree};
//! # async fn demo() -> Result<(), tokio_jabber::Error> {
//! let conn = Connection::new("localhost", 5222);
//! conn.connect().await?;
//! conn.add_filter("presence-log", |stanza: &StanzaTree| {
//!     if stanza.name() == "presence" {
//!         log::info!("presence from {:?}", stanza.attr("from"));
//!         stanza.consume();
//!     }
//! })
//! .await?;
//! conn.open_stream("localhost").await?;
//! let ping = StanzaTree::new("iq")
//!     .with_attr("type", "get")
//!     .with_attr("id", "ping-1")
//!     .with_child(StanzaTree::new("ping").with_ns("urn:xmpp:ping"));
//! let _reply = conn
//!     .request(ping, Connection::iq_reply_matcher("ping-1"), Some(Duration::from_secs(5)))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use core::time::Duration;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::ns;
use crate::stanza::StanzaTree;
use crate::xmlstream::{ReadError, StreamEvent, StreamParser};

mod keepalive;
mod registry;

pub use keepalive::KeepAlive;
pub use registry::StanzaCallback;

use keepalive::{IdleCounter, WHITESPACE_PING};
use registry::Registry;

#[cfg(test)]
mod tests;

/// Serialized data to be written to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(String);

impl Payload {
    /// The text which goes on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload(s.to_owned())
    }
}

impl From<StanzaTree> for Payload {
    fn from(tree: StanzaTree) -> Self {
        Payload(tree.to_string())
    }
}

impl From<&StanzaTree> for Payload {
    fn from(tree: &StanzaTree) -> Self {
        Payload(tree.to_string())
    }
}

/// Handle on a response handler registered with [`Connection::send_with`].
///
/// Pass it to [`Connection::wait_for`] to suspend until the handler
/// consumed a stanza. Dropping the token without waiting leaves the handler
/// registered.
#[derive(Debug)]
pub struct ResponseToken {
    id: u64,
    stale: Arc<AtomicBool>,
    rx: oneshot::Receiver<Result<(), Error>>,
}

impl ResponseToken {
    /// Identifier of the handler, unique per connection.
    pub fn id(&self) -> u64 {
        self.id
    }
}

type ExceptionCallback = Arc<dyn Fn(&Error) + Send + Sync>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Core {
    writer: Option<BoxedWriter>,
    registry: Registry,
}

struct Shared {
    core: Mutex<Core>,
    registered: Notify,
    stop: Notify,
    idle: IdleCounter,
    connected: AtomicBool,
    next_token: AtomicU64,
    on_exception: SyncMutex<Option<ExceptionCallback>>,
}

impl Shared {
    fn new(keepalive: &KeepAlive) -> Self {
        Shared {
            core: Mutex::new(Core {
                writer: None,
                registry: Registry::default(),
            }),
            registered: Notify::new(),
            stop: Notify::new(),
            idle: keepalive.counter(),
            connected: AtomicBool::new(false),
            next_token: AtomicU64::new(1),
            on_exception: SyncMutex::new(None),
        }
    }

    async fn write(core: &mut Core, idle: &IdleCounter, text: &str) -> Result<(), Error> {
        let writer = core.writer.as_mut().ok_or_else(|| {
            Error::TransportWrite(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
        })?;
        writer
            .write_all(text.as_bytes())
            .await
            .map_err(Error::TransportWrite)?;
        writer.flush().await.map_err(Error::TransportWrite)?;
        idle.reset();
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<(), Error> {
        let mut core = self.core.lock().await;
        log::debug!("SEND: {}", text);
        Self::write(&mut core, &self.idle, text).await
    }

    async fn receive(&self, stanza: StanzaTree) {
        loop {
            {
                let mut core = self.core.lock().await;
                if !core.registry.is_empty() {
                    core.registry.dispatch(&stanza);
                    return;
                }
            }
            log::trace!("no registrant yet, holding back <{}/>", stanza.name());
            self.registered.notified().await;
        }
    }

    fn report(&self, error: &Error) {
        log::error!("connection failure: {}", error);
        let callback = match self.on_exception.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(error))).is_err() {
                log::error!("exception callback panicked");
            }
        }
    }

    /// Mark the connection as ended, drop the writer and release every
    /// registered handler.
    async fn shut_down(&self) {
        // Cleared before taking the lock: `send_with` checks it under the lock.
        self.connected.store(false, Ordering::Release);
        let mut core = self.core.lock().await;
        core.writer = None;
        core.registry.release_all();
    }

    async fn read_loop<R: AsyncRead + Unpin>(self: Arc<Self>, io: R) {
        tokio::select! {
            _ = self.stop.notified() => log::debug!("reader stopped"),
            _ = self.pump(io) => (),
        }
        self.shut_down().await;
    }

    async fn pump<R: AsyncRead + Unpin>(&self, io: R) {
        let mut parser = StreamParser::new(BufReader::new(io));
        loop {
            match parser.next().await {
                Ok(StreamEvent::Header(header)) => {
                    log::debug!("RECV: {}", header);
                    self.receive(header).await;
                }
                Ok(StreamEvent::Stanza(stanza)) => {
                    log::debug!("RECV: {}", stanza);
                    self.receive(stanza).await;
                }
                Ok(StreamEvent::Footer) => {
                    log::debug!("RECV: {}", ns::STREAM_FOOTER);
                    return;
                }
                Err(ReadError::Finished) => return,
                Err(e) => {
                    self.report(&e.into());
                    return;
                }
            }
        }
    }

    async fn keep_alive(self: Arc<Self>, keepalive: KeepAlive) {
        let error = keepalive
            .run(&self.idle, || self.send(WHITESPACE_PING))
            .await;
        if !self.connected.load(Ordering::Acquire) {
            // The reader already ended the stream.
            return;
        }
        self.report(&error);
        self.stop.notify_one();
        self.shut_down().await;
    }
}

/// Client side of a raw TCP XML stream.
pub struct Connection {
    host: String,
    port: u16,
    keepalive: KeepAlive,
    shared: Arc<Shared>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Prepare a connection to `host:port` with the default keepalive.
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        let keepalive = KeepAlive::default();
        Connection {
            host: host.into(),
            port,
            shared: Arc::new(Shared::new(&keepalive)),
            keepalive,
            tasks: SyncMutex::new(Vec::new()),
        }
    }

    /// Replace the keepalive configuration. Must be called before the
    /// connection is attached.
    pub fn with_keepalive(mut self, keepalive: KeepAlive) -> Self {
        self.shared = Arc::new(Shared::new(&keepalive));
        self.keepalive = keepalive;
        self
    }

    /// Host this connection connects to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this connection connects to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Open the TCP connection and start the background tasks.
    pub async fn connect(&self) -> Result<(), Error> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(Error::TransportWrite)?;
        stream.set_nodelay(true).map_err(Error::TransportWrite)?;
        log::debug!("connected to {}:{}", self.host, self.port);
        self.attach(stream).await
    }

    /// Run the connection over an already established stream.
    pub async fn attach<Io>(&self, io: Io) -> Result<(), Error>
    where
        Io: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        {
            let mut core = self.shared.core.lock().await;
            if core.writer.is_some() {
                return Err(Error::InvalidArgument("connection is already attached"));
            }
            core.writer = Some(Box::new(writer));
        }
        self.shared.idle.reset();
        self.shared.connected.store(true, Ordering::Release);

        let mut tasks = self.tasks();
        tasks.push(tokio::spawn(self.shared.clone().read_loop(reader)));
        if self.keepalive.is_enabled() {
            let keepalive = self.keepalive.clone();
            tasks.push(tokio::spawn(self.shared.clone().keep_alive(keepalive)));
        }
        Ok(())
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Send the stream header towards `domain`.
    pub async fn open_stream(&self, domain: &str) -> Result<(), Error> {
        self.send(ns::stream_header(domain)).await
    }

    /// Whether the stream is attached and neither side ended it.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Write `payload` to the stream.
    pub async fn send<P: Into<Payload>>(&self, payload: P) -> Result<(), Error> {
        self.shared.send(payload.into().as_str()).await
    }

    /// Register `handler` and then write `payload`.
    ///
    /// The handler sees every incoming stanza, ahead of all filters, until
    /// it consumes one. Registration happens before the write under the same
    /// lock as dispatch, so even an immediate reply reaches it.
    ///
    /// Fails with [`Error::Disconnected`] once the stream ended, since no
    /// reader is left to feed the handler.
    pub async fn send_with<P, F>(&self, payload: P, handler: F) -> Result<ResponseToken, Error>
    where
        P: Into<Payload>,
        F: FnMut(&StanzaTree) + Send + 'static,
    {
        let payload = payload.into();
        let id = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        let stale = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        let mut core = self.shared.core.lock().await;
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        core.registry
            .add_handler(id, Box::new(handler), tx, stale.clone());
        self.shared.registered.notify_one();
        log::debug!("SEND: {}", payload.as_str());
        if let Err(e) = Shared::write(&mut core, &self.shared.idle, payload.as_str()).await {
            core.registry.remove_handler(id);
            return Err(e);
        }
        Ok(ResponseToken { id, stale, rx })
    }

    /// Suspend until the handler behind `token` consumed a stanza.
    ///
    /// With a `timeout`, gives up with [`Error::Timeout`] and retires the
    /// handler. Returns [`Error::Disconnected`] once the connection ended.
    pub async fn wait_for(
        &self,
        token: ResponseToken,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let ResponseToken { id, stale, mut rx } = token;
        let received = match timeout {
            None => (&mut rx).await,
            Some(duration) => match tokio::time::timeout(duration, &mut rx).await {
                Ok(received) => received,
                Err(_) => {
                    // Consumed right at the deadline: the reply counts.
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                    log::debug!("response handler #{} timed out", id);
                    stale.store(true, Ordering::Release);
                    return Err(Error::Timeout);
                }
            },
        };
        received.unwrap_or(Err(Error::Disconnected))
    }

    /// Send `payload` and return the first stanza accepted by `matcher`.
    ///
    /// Returns `Ok(None)` when nothing matched within `timeout`.
    pub async fn request<P, M>(
        &self,
        payload: P,
        matcher: M,
        timeout: Option<Duration>,
    ) -> Result<Option<StanzaTree>, Error>
    where
        P: Into<Payload>,
        M: Fn(&StanzaTree) -> bool + Send + 'static,
    {
        let (reply_tx, mut reply_rx) = oneshot::channel();
        let mut reply_tx = Some(reply_tx);
        let token = self
            .send_with(payload, move |stanza: &StanzaTree| {
                if matcher(stanza) {
                    stanza.consume();
                    if let Some(tx) = reply_tx.take() {
                        let _ = tx.send(stanza.clone());
                    }
                }
            })
            .await?;
        match self.wait_for(token, timeout).await {
            Ok(()) => Ok(reply_rx.try_recv().ok()),
            Err(Error::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Matcher for [`Connection::request`] accepting the `result` or
    /// `error` reply to the iq with the given `id`.
    pub fn iq_reply_matcher<S: Into<String>>(
        id: S,
    ) -> impl Fn(&StanzaTree) -> bool + Send + Sync + 'static {
        let id = id.into();
        move |stanza: &StanzaTree| {
            stanza.name() == "iq"
                && stanza.attr("id") == Some(id.as_str())
                && matches!(stanza.attr("type"), Some("result") | Some("error"))
        }
    }

    /// Offer `stanza` to the registrants.
    ///
    /// The reader task calls this for every stanza it parses. While no
    /// registrant exists, this waits until one is added.
    pub async fn receive(&self, stanza: StanzaTree) {
        self.shared.receive(stanza).await
    }

    /// Register a filter under `name`, replacing any filter of that name
    /// in place.
    pub async fn add_filter<N, F>(&self, name: N, callback: F) -> Result<(), Error>
    where
        N: Into<String>,
        F: FnMut(&StanzaTree) + Send + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument("filter name must not be empty"));
        }
        self.shared
            .core
            .lock()
            .await
            .registry
            .add_filter(name, Box::new(callback));
        self.shared.registered.notify_one();
        Ok(())
    }

    /// Remove the filter registered under `name`. Returns whether it
    /// existed.
    pub async fn remove_filter(&self, name: &str) -> bool {
        self.shared.core.lock().await.registry.remove_filter(name)
    }

    /// Install the callback which receives failures of the background
    /// reader and keepalive tasks.
    pub fn on_connection_exception<F>(&self, callback: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        let callback: ExceptionCallback = Arc::new(callback);
        match self.shared.on_exception.lock() {
            Ok(mut guard) => *guard = Some(callback),
            Err(poisoned) => *poisoned.into_inner() = Some(callback),
        }
    }

    /// End the stream, stop the background tasks and release every caller
    /// suspended in [`Connection::wait_for`].
    pub async fn close(&self) {
        for task in self.tasks().drain(..) {
            task.abort();
        }
        {
            let mut core = self.shared.core.lock().await;
            if self.is_connected() {
                log::debug!("SEND: {}", ns::STREAM_FOOTER);
                if let Err(e) = Shared::write(&mut core, &self.shared.idle, ns::STREAM_FOOTER).await {
                    log::warn!("failed to send stream footer: {}", e);
                }
            }
            if let Some(mut writer) = core.writer.take() {
                if let Err(e) = writer.shutdown().await {
                    log::warn!("failed to shut down transport: {}", e);
                }
            }
        }
        self.shared.shut_down().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }
}
