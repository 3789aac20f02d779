//! Request bodies and credential encodings for the BOSH handshake.

use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use sha1::{Digest, Sha1};

use crate::ids::make_id;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::StanzaTree;

const CONTENT: &str = "text/xml; charset=utf-8";

/// How the session authenticates after opening the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStrategy {
    /// SASL PLAIN, followed by a stream restart and resource binding
    #[default]
    Sasl,
    /// XEP-0078 with the password in clear text
    LegacyPlain,
    /// XEP-0078 with a SHA-1 digest of stream id and password
    LegacyDigest,
}

impl AuthStrategy {
    /// Whether this is a SASL strategy.
    pub fn is_sasl(self) -> bool {
        matches!(self, AuthStrategy::Sasl)
    }
}

/// `base64(bare \0 node \0 password)`
// Built by hand: the bare JID goes into the authzid slot, which sasl's Plain cannot do.
pub(crate) fn sasl_plain(jid: &Jid, password: &str) -> String {
    let node = jid.node().map(|n| n.as_str()).unwrap_or_default();
    let message = format!("{}\0{}\0{}", jid.to_bare(), node, password);
    Base64.encode(message)
}

/// Lowercase hex SHA-1 of `stream_id` immediately followed by `password`.
pub(crate) fn legacy_digest(stream_id: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn body(sasl: bool) -> StanzaTree {
    let body = StanzaTree::new("body")
        .with_ns(ns::HTTPBIND)
        .with_attr("content", CONTENT);
    if sasl {
        body.with_attr("xmlns:xmpp", ns::XBOSH)
            .with_attr("xmpp:version", "1.0")
    } else {
        body
    }
}

/// Session creation request, without rid.
pub(crate) fn open_body(domain: &str, wait: u32, hold: u32, sasl: bool) -> StanzaTree {
    body(sasl)
        .with_attr("to", domain)
        .with_attr("secure", "true")
        .with_attr("wait", wait)
        .with_attr("hold", hold)
}

/// SASL PLAIN `<auth/>` wrapped in a body.
pub(crate) fn sasl_auth_body(jid: &Jid, password: &str) -> StanzaTree {
    body(true).with_child(
        StanzaTree::new("auth")
            .with_ns(ns::SASL)
            .with_attr("mechanism", "PLAIN")
            .with_text(sasl_plain(jid, password)),
    )
}

/// Stream restart after successful SASL authentication.
pub(crate) fn restart_body(domain: &str) -> StanzaTree {
    body(true)
        .with_attr("xmpp:restart", "true")
        .with_attr("to", domain)
}

fn iq_set(payload: StanzaTree) -> StanzaTree {
    StanzaTree::new("iq")
        .with_ns(ns::JABBER_CLIENT)
        .with_attr("type", "set")
        .with_attr("id", make_id("iq"))
        .with_child(payload)
}

/// Resource binding request.
pub(crate) fn bind_body(jid: &Jid) -> StanzaTree {
    let mut resource = StanzaTree::new("resource");
    if let Some(res) = jid.resource() {
        resource = resource.with_text(res.as_str());
    }
    body(true).with_child(iq_set(
        StanzaTree::new("bind").with_ns(ns::BIND).with_child(resource),
    ))
}

/// Legacy `jabber:iq:auth` request. `stream_id` selects digest mode.
pub(crate) fn legacy_auth_body(jid: &Jid, password: &str, stream_id: Option<&str>) -> StanzaTree {
    let node = jid.node().map(|n| n.as_str()).unwrap_or_default();
    let resource = jid.resource().map(|r| r.as_str()).unwrap_or_default();
    let secret = match stream_id {
        Some(stream_id) => StanzaTree::new("digest").with_text(legacy_digest(stream_id, password)),
        None => StanzaTree::new("password").with_text(password),
    };
    let query = StanzaTree::new("query")
        .with_ns(ns::AUTH)
        .with_child(StanzaTree::new("username").with_text(node))
        .with_child(secret)
        .with_child(StanzaTree::new("resource").with_text(resource));
    body(false).with_child(iq_set(query))
}
