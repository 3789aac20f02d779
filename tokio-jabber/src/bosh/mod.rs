//! # XMPP over BOSH
//!
//! [`BoshSession`] creates a session with a BOSH connection manager
//! (XEP-0124/XEP-0206), authenticates and binds a resource. Every request
//! is a complete `<body/>` document POSTed to the http-bind endpoint and
//! answered with another one.
//!
//! The handshake is one of two sequences, depending on the
//! [`AuthStrategy`]:
//!
//! - SASL: open the session, authenticate with PLAIN, restart the stream,
//!   bind the resource;
//! - legacy (XEP-0078): open the session, then send a `jabber:iq:auth`
//!   query carrying the password or its digest.
//!
//! Any failure is terminal: the session ends up in
//! [`SessionState::Failed`] and cannot be resumed.

use core::time::Duration;
use std::collections::BTreeSet;
use std::io;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Error, ProtocolError};
use crate::ids::Rid;
use crate::jid::Jid;
use crate::stanza::StanzaTree;

mod auth;
pub mod http;

pub use auth::AuthStrategy;
pub use http::{HttpClient, HttpResponse, ReqwestClient};


/// Connection manager endpoint and session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoshConfig {
    /// Host of the connection manager, also the `to` of the session
    pub domain: String,
    /// Talk to the endpoint over https, which needs the `tls-rust` feature
    pub https: bool,
    /// HTTP port
    pub port: u16,
    /// Path of the http-bind endpoint
    pub bind_uri: String,
    /// Authentication method
    pub auth: AuthStrategy,
    /// Longest time, in seconds, the manager may hold a request
    pub wait: u32,
    /// Number of requests the manager may hold
    pub hold: u32,
    /// Seed of the request id counter, random if unset
    pub initial_rid: Option<u64>,
}

impl Default for BoshConfig {
    fn default() -> Self {
        BoshConfig {
            domain: String::from("localhost"),
            https: false,
            port: 5280,
            bind_uri: String::from("/http-bind"),
            auth: AuthStrategy::Sasl,
            wait: 60,
            hold: 1,
            initial_rid: None,
        }
    }
}

impl BoshConfig {
    /// Use another connection manager host.
    pub fn with_domain<S: Into<String>>(mut self, domain: S) -> Self {
        self.domain = domain.into();
        self
    }

    /// Switch between `http://` and `https://`.
    pub fn with_https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    /// Use another port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use another http-bind path.
    pub fn with_bind_uri<S: Into<String>>(mut self, bind_uri: S) -> Self {
        self.bind_uri = bind_uri.into();
        self
    }

    /// Select the authentication method.
    pub fn with_auth(mut self, auth: AuthStrategy) -> Self {
        self.auth = auth;
        self
    }

    /// Start the request id counter after `rid`.
    pub fn with_initial_rid(mut self, rid: u64) -> Self {
        self.initial_rid = Some(rid);
        self
    }

    /// URL every request is POSTed to.
    pub fn url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.domain, self.port, self.bind_uri)
    }
}

/// Progress of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing sent yet
    Init,
    /// Session created, `sid` known
    StreamOpened,
    /// SASL authentication succeeded
    Authenticated,
    /// Stream restarted after authentication
    StreamRestarted,
    /// Resource bound, the session is usable
    Bound,
    /// A step failed
    Failed,
}

/// What a BOSH client needs to attach to an existing session, usually
/// handed to a browser as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// The JID the session authenticated as
    pub jid: Jid,
    /// Rid of the last request; the client continues with `rid + 1`
    pub rid: u64,
    /// Session id, `null` before the session was created
    pub sid: Option<String>,
}

/// An authenticated BOSH session.
pub struct BoshSession<C = ReqwestClient> {
    client: C,
    config: BoshConfig,
    rid: Rid,
    sid: Option<String>,
    stream_id: Option<String>,
    mechanisms: BTreeSet<String>,
    jid: Jid,
    bound_jid: Option<Jid>,
    state: SessionState,
}

impl BoshSession<ReqwestClient> {
    /// Create a session for `jid` over HTTP and authenticate it.
    pub async fn bind(jid: &str, password: &str, config: BoshConfig) -> Result<Self, Error> {
        let client = ReqwestClient::new(Duration::from_secs(u64::from(config.wait) + 10))?;
        Self::bind_with(client, jid, password, config).await
    }
}

impl<C: HttpClient> BoshSession<C> {
    /// Prepare a session without sending anything.
    pub fn new(client: C, jid: Jid, config: BoshConfig) -> Self {
        let rid = match config.initial_rid {
            Some(rid) => Rid::starting_at(rid),
            None => Rid::new(),
        };
        BoshSession {
            client,
            config,
            rid,
            sid: None,
            stream_id: None,
            mechanisms: BTreeSet::new(),
            jid,
            bound_jid: None,
            state: SessionState::Init,
        }
    }

    /// Create a session for `jid` through `client` and authenticate it.
    pub async fn bind_with(
        client: C,
        jid: &str,
        password: &str,
        config: BoshConfig,
    ) -> Result<Self, Error> {
        let jid = Jid::new(jid)?;
        let mut session = Self::new(client, jid, config);
        session.authenticate(password).await?;
        Ok(session)
    }

    /// Run the whole handshake.
    pub async fn authenticate(&mut self, password: &str) -> Result<(), Error> {
        if self.state != SessionState::Init {
            return Err(Error::InvalidArgument("session was already started"));
        }
        let result = match self.config.auth {
            AuthStrategy::Sasl => self.sasl_handshake(password).await,
            AuthStrategy::LegacyPlain => self.legacy_handshake(password, false).await,
            AuthStrategy::LegacyDigest => self.legacy_handshake(password, true).await,
        };
        match result {
            Ok(()) => {
                log::info!("BOSH session {:?} bound as {}", self.sid, self.jid);
                Ok(())
            }
            Err(e) => {
                log::warn!("BOSH handshake for {} failed in {:?}: {}", self.jid, self.state, e);
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn sasl_handshake(&mut self, password: &str) -> Result<(), Error> {
        self.open_stream().await?;
        self.sasl_auth(password).await?;
        self.restart_stream().await?;
        self.bind_resource().await
    }

    async fn legacy_handshake(&mut self, password: &str, digest: bool) -> Result<(), Error> {
        self.open_stream().await?;
        let stream_id = if digest { self.stream_id.as_deref() } else { None };
        let body = auth::legacy_auth_body(&self.jid, password, stream_id);
        let reply = self.post(body).await?;
        check_iq_result(&reply, "legacy authentication")?;
        self.state = SessionState::Bound;
        Ok(())
    }

    async fn open_stream(&mut self) -> Result<(), Error> {
        let sasl = self.is_sasl();
        let body = auth::open_body(&self.config.domain, self.config.wait, self.config.hold, sasl);
        let reply = self.post(body).await?;

        let sid = reply
            .attr("sid")
            .ok_or(ProtocolError::MalformedResponse("missing sid on session creation"))?;
        if sasl {
            self.mechanisms = reply
                .find(&["features", "mechanisms"])
                .map(|mechanisms| {
                    mechanisms
                        .children_named("mechanism")
                        .map(|m| m.text().trim().to_ascii_uppercase())
                        .collect()
                })
                .unwrap_or_default();
        } else {
            let authid = reply
                .attr("authid")
                .ok_or(ProtocolError::MalformedResponse("missing authid on session creation"))?;
            self.stream_id = Some(authid.to_owned());
        }
        self.sid = Some(sid.to_owned());
        self.state = SessionState::StreamOpened;
        log::debug!("opened BOSH session {}", sid);
        Ok(())
    }

    async fn sasl_auth(&mut self, password: &str) -> Result<(), Error> {
        if !self.mechanisms.contains("PLAIN") {
            return Err(AuthError::NoMechanism.into());
        }
        let reply = self
            .post(auth::sasl_auth_body(&self.jid, password))
            .await?;
        if reply.child("success").is_none() {
            return Err(AuthError::Failed("SASL authentication").into());
        }
        self.state = SessionState::Authenticated;
        Ok(())
    }

    async fn restart_stream(&mut self) -> Result<(), Error> {
        let body = auth::restart_body(self.jid.domain().as_str());
        let reply = self.post(body).await?;
        if reply.find(&["features", "bind"]).is_none() {
            return Err(AuthError::Failed("stream restart offered no resource binding").into());
        }
        self.state = SessionState::StreamRestarted;
        Ok(())
    }

    async fn bind_resource(&mut self) -> Result<(), Error> {
        let reply = self.post(auth::bind_body(&self.jid)).await?;
        let iq = check_iq_result(&reply, "resource binding")?;
        if let Some(jid) = iq.find(&["bind", "jid"]) {
            self.bound_jid = Some(Jid::new(jid.text().trim())?);
        }
        self.state = SessionState::Bound;
        Ok(())
    }

    /// Stamp `body` with the next rid and the sid, POST it and parse the
    /// reply.
    async fn post(&mut self, mut body: StanzaTree) -> Result<StanzaTree, Error> {
        let rid = self.rid.advance();
        body.set_attr("rid", rid);
        if let Some(sid) = &self.sid {
            body.set_attr("sid", sid);
        }
        let url = self.config.url();
        let body = body.to_string();
        log::debug!("POST {} (rid {}): {}", url, rid, body);

        let response = self.client.post(&url, body).await?;
        log::debug!("HTTP {} (rid {}): {}", response.status, rid, response.body);
        if !response.is_success() {
            return Err(Error::TransportRead(io::Error::new(
                io::ErrorKind::Other,
                format!("connection manager answered with HTTP {}", response.status),
            )));
        }
        Ok(StanzaTree::parse_document(&response.body)?)
    }

    /// Whether the handshake completed.
    pub fn is_alive(&self) -> bool {
        self.state == SessionState::Bound
    }

    /// Whether the session authenticates with SASL.
    pub fn is_sasl(&self) -> bool {
        self.config.auth.is_sasl()
    }

    /// Session id assigned by the connection manager.
    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    /// Rid of the last request.
    pub fn rid(&self) -> u64 {
        self.rid.value()
    }

    /// The JID the session authenticates as.
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    /// The full JID the server bound, if it told.
    pub fn bound_jid(&self) -> Option<&Jid> {
        self.bound_jid.as_ref()
    }

    /// Progress of the handshake.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// SASL mechanisms offered at session creation, upper-cased.
    pub fn mechanisms(&self) -> &BTreeSet<String> {
        &self.mechanisms
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &BoshConfig {
        &self.config
    }

    /// Current jid, rid and sid of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            jid: self.jid.clone(),
            rid: self.rid(),
            sid: self.sid.clone(),
        }
    }

    /// The [`SessionSnapshot`] as a JSON object.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.snapshot())
    }
}

/// The `<iq/>` of a reply, provided it is of type `result`.
fn check_iq_result<'a>(reply: &'a StanzaTree, step: &'static str) -> Result<&'a StanzaTree, Error> {
    let iq = reply
        .child("iq")
        .ok_or(ProtocolError::MalformedResponse("missing <iq/> in response"))?;
    if iq.attr("type") != Some("result") {
        return Err(AuthError::Failed(step).into());
    }
    Ok(iq)
}
