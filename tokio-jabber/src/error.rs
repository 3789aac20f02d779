use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

use crate::{jid, minidom, xmlstream::ReadError};

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Writing to the underlying transport failed
    TransportWrite(IoError),
    /// Reading from the underlying transport failed, or the peer answered
    /// with a non-success HTTP status
    TransportRead(IoError),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// Authentication error
    Auth(AuthError),
    /// Misuse of the API
    InvalidArgument(&'static str),
    /// Error parsing Jabber-Id
    JidParse(jid::Error),
    /// No reply arrived in time
    Timeout,
    /// Connection closed
    Disconnected,
}

impl Error {
    /// Whether the error is a response which misses a required attribute
    /// or element.
    pub fn is_malformed_response(&self) -> bool {
        matches!(self, Error::Protocol(ProtocolError::MalformedResponse(_)))
    }

    /// Whether the server refused the credentials or the mechanism.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::TransportWrite(e) => write!(fmt, "transport write error: {}", e),
            Error::TransportRead(e) => write!(fmt, "transport read error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::InvalidArgument(e) => write!(fmt, "invalid argument: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Timeout => write!(fmt, "timed out waiting for a reply"),
            Error::Disconnected => write!(fmt, "disconnected"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::TransportWrite(e) | Error::TransportRead(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Auth(e) => Some(e),
            Error::JidParse(e) => Some(e),
            Error::InvalidArgument(_) | Error::Timeout | Error::Disconnected => None,
        }
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e).into()
    }
}

impl From<ReadError> for Error {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Io(e) => Error::TransportRead(e),
            other => ProtocolError::Stream(other).into(),
        }
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// A required attribute or element is missing from a response
    MalformedResponse(&'static str),
    /// A complete document could not be parsed
    Parser(minidom::Error),
    /// The incoming XML stream broke
    Stream(ReadError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::MalformedResponse(e) => write!(fmt, "malformed response: {}", e),
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::Stream(e) => write!(fmt, "XML stream error: {}", e),
        }
    }
}

impl StdError for ProtocolError {}

impl From<minidom::Error> for ProtocolError {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e)
    }
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// The server does not offer the SASL mechanism we need
    NoMechanism,
    /// The server refused the credentials or the session step
    Failed(&'static str),
}

impl StdError for AuthError {}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "server SASL mechanisms do not include PLAIN"),
            AuthError::Failed(step) => write!(fmt, "failure from the server: {}", step),
        }
    }
}
