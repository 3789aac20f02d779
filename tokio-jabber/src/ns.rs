//! Namespaces and fixed wire fragments.

/// Default namespace of client streams
pub const JABBER_CLIENT: &str = "jabber:client";

/// Namespace of the `stream:` prefix
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// XEP-0124 body wrapper
pub const HTTPBIND: &str = "http://jabber.org/protocol/httpbind";

/// XEP-0206 attributes on the body wrapper
pub const XBOSH: &str = "urn:xmpp:xbosh";

/// RFC 6120 SASL negotiation
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// RFC 6120 resource binding
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// XEP-0078 legacy authentication
pub const AUTH: &str = "jabber:iq:auth";

/// Stream footer which ends a raw XML stream.
pub const STREAM_FOOTER: &str = "</stream:stream>";

/// Build the opening of a raw XML stream towards `domain`.
pub fn stream_header(domain: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <stream:stream to=\"{}\" xmlns=\"{}\" xmlns:stream=\"{}\" version=\"1.0\">",
        crate::stanza::escape(domain),
        JABBER_CLIENT,
        STREAM
    )
}
