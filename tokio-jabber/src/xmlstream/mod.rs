//! # Incremental XML stream parsing
//!
//! A Jabber connection carries one long XML document: the root
//! `<stream:stream>` element is opened when the session starts and only
//! closed when it ends, and every stanza is a direct child of that root.
//! [`StreamParser`] turns the bytes of such a document into
//! [`StreamEvent`]s without ever buffering more than the stanza currently
//! being received:
//!
//! - the root's start tag is reported right away as
//!   [`StreamEvent::Header`], so that callers see stream attributes such as
//!   the stream id before any stanza arrives;
//! - each child of the root is accumulated with all its descendants and
//!   reported as [`StreamEvent::Stanza`] once its own end tag was read;
//! - the root's end tag is reported as [`StreamEvent::Footer`].

use core::future::poll_fn;
use core::pin::Pin;
use std::fmt;
use std::io;

use tokio::io::AsyncBufRead;

use rxml::Event;

use crate::stanza::StanzaTree;


/// Item produced by [`StreamParser::next`]
#[derive(Debug, PartialEq)]
pub enum StreamEvent {
    /// The start tag of the stream root, as a tree without children.
    Header(StanzaTree),

    /// One complete top-level element.
    Stanza(StanzaTree),

    /// The end tag of the stream root.
    Footer,
}

/// Failure while reading from an XML stream
///
/// All variants are fatal: once one has been returned, the parser only
/// returns [`ReadError::Finished`].
#[derive(Debug)]
pub enum ReadError {
    /// The data is not well-formed XML, or carries text outside of stanzas.
    Malformed(io::Error),

    /// The transport reached end-of-file before the stream footer.
    Truncated,

    /// The underlying I/O object failed.
    Io(io::Error),

    /// The stream already ended, with its footer or an error.
    Finished,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed XML stream: {e}"),
            Self::Truncated => f.write_str("end of file before the stream footer"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Finished => f.write_str("stream already finished"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) | Self::Io(e) => Some(e),
            Self::Truncated | Self::Finished => None,
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            // rxml reports well-formedness violations as InvalidData.
            io::ErrorKind::InvalidData => Self::Malformed(e),
            io::ErrorKind::UnexpectedEof => Self::Truncated,
            _ => Self::Io(e),
        }
    }
}

enum ParseState {
    /// Waiting for the root start tag.
    PreHeader,

    /// Inside the root. `open` holds the elements of the stanza currently
    /// being received, outermost first; it is empty between stanzas.
    InStream { open: Vec<StanzaTree> },

    /// Footer seen or error returned.
    Done,
}

/// Incremental parser for a Jabber XML stream
pub struct StreamParser<Io> {
    reader: rxml::AsyncReader<Io>,
    state: ParseState,
}

impl<Io: AsyncBufRead + Unpin> StreamParser<Io> {
    /// Parse the XML stream read from `io`.
    pub fn new(io: Io) -> Self {
        Self {
            reader: rxml::AsyncReader::wrap(io, rxml::Parser::default()),
            state: ParseState::PreHeader,
        }
    }

    async fn read_event(&mut self) -> io::Result<Option<Event>> {
        let reader = &mut self.reader;
        poll_fn(|cx| Pin::new(&mut *reader).poll_read(cx)).await
    }

    /// Read until the next [`StreamEvent`] is complete.
    pub async fn next(&mut self) -> Result<StreamEvent, ReadError> {
        if let ParseState::Done = self.state {
            return Err(ReadError::Finished);
        }
        loop {
            let ev = match self.read_event().await {
                Ok(Some(ev)) => ev,
                Ok(None) => {
                    self.state = ParseState::Done;
                    return Err(ReadError::Truncated);
                }
                Err(e) => {
                    self.state = ParseState::Done;
                    return Err(e.into());
                }
            };
            match self.advance(ev) {
                Ok(Some(item)) => return Ok(item),
                Ok(None) => (),
                Err(e) => {
                    self.state = ParseState::Done;
                    return Err(e);
                }
            }
        }
    }

    fn advance(&mut self, ev: Event) -> Result<Option<StreamEvent>, ReadError> {
        match &mut self.state {
            ParseState::PreHeader => match ev {
                Event::XmlDeclaration(_, _) => Ok(None),
                Event::StartElement(_, (ns, name), attrs) => {
                    let header = start_tree(ns.to_string(), name.to_string(), attrs);
                    self.state = ParseState::InStream { open: Vec::new() };
                    Ok(Some(StreamEvent::Header(header)))
                }
                Event::Text(_, _) | Event::EndElement(_) => Err(malformed(
                    "unexpected content before stream header",
                )),
            },
            ParseState::InStream { open } => match ev {
                Event::XmlDeclaration(_, _) => Err(malformed("misplaced XML declaration")),
                Event::StartElement(_, (ns, name), attrs) => {
                    open.push(start_tree(ns.to_string(), name.to_string(), attrs));
                    Ok(None)
                }
                Event::Text(_, data) => match open.last_mut() {
                    Some(current) => {
                        current.append_text(&data);
                        Ok(None)
                    }
                    // Whitespace keepalives between stanzas.
                    None if is_xml_whitespace(&data) => Ok(None),
                    None => Err(malformed("non-whitespace text between stanzas")),
                },
                Event::EndElement(_) => match open.pop() {
                    None => {
                        self.state = ParseState::Done;
                        Ok(Some(StreamEvent::Footer))
                    }
                    Some(done) => match open.last_mut() {
                        Some(parent) => {
                            parent.push_child(done);
                            Ok(None)
                        }
                        None => Ok(Some(StreamEvent::Stanza(done))),
                    },
                },
            },
            ParseState::Done => Err(ReadError::Finished),
        }
    }
}

fn start_tree<A, N, L, V>(ns: String, name: String, attrs: A) -> StanzaTree
where
    A: IntoIterator<Item = ((N, L), V)>,
    N: fmt::Display,
    L: fmt::Display,
    V: ToString,
{
    let mut tree = StanzaTree::new(name);
    if !ns.is_empty() {
        tree = tree.with_ns(ns);
    }
    for ((attr_ns, attr_name), value) in attrs {
        let attr_ns = attr_ns.to_string();
        let key = if attr_ns.is_empty() {
            attr_name.to_string()
        } else if attr_ns == XML_NS {
            format!("xml:{}", attr_name)
        } else {
            format!("{{{}}}{}", attr_ns, attr_name)
        };
        tree.set_attr(key, value);
    }
    tree
}

const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

fn is_xml_whitespace(data: &str) -> bool {
    data.bytes().all(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
}

fn malformed(msg: &'static str) -> ReadError {
    ReadError::Malformed(io::Error::new(io::ErrorKind::InvalidData, msg))
}
