//! Jabber/XMPP client transport with asynchronous I/O using [tokio](https://tokio.rs/).
//!
//! # Getting started
//!
//! There are two ways to talk to a server:
//!
//! - a [`Connection`] speaks the XML stream protocol over TCP. It parses
//!   incoming data into [`StanzaTree`]s in a background task and offers
//!   them to response handlers and named filters. Replies are correlated
//!   with [`Connection::send_with`] and [`Connection::wait_for`], or in one
//!   go with [`Connection::request`].
//! - a [`BoshSession`] opens, authenticates and binds an XMPP-over-BOSH
//!   session through a connection manager's http-bind endpoint. You can find
//!   a complete example in the `examples/bosh_login.rs` file.
//!
//! # Features
//!
//! Supported transports:
//! - [x] Plaintext TCP (IPv4/IPv6)
//! - [x] BOSH over HTTP, with custom HTTP stacks via the [`bosh::HttpClient`] trait
//! - [ ] StartTLS
//! - [ ] Websockets
//!
//! Supported authentication:
//! - [x] SASL PLAIN (BOSH)
//! - [x] XEP-0078 plain and digest (BOSH)
//!
//! Logging goes through the [`log`](https://docs.rs/log) facade; install any
//! logger to see the traffic.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod bosh;
pub mod connection;
pub mod ids;
pub mod ns;
pub mod stanza;
pub mod xmlstream;

/// Detailed error types
pub mod error;

#[doc(inline)]
/// Generic tokio_jabber Error
pub use crate::error::Error;

pub use crate::bosh::{AuthStrategy, BoshConfig, BoshSession, SessionSnapshot, SessionState};
pub use crate::connection::{Connection, KeepAlive, Payload, ResponseToken};
pub use crate::stanza::StanzaTree;

// Re-exports
pub use jid;
pub use minidom;
