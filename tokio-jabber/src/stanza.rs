//! In-memory XML elements as exchanged over Jabber streams.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;

use crate::minidom;

/// One XML element with its attributes, children and character data.
///
/// Trees are built incrementally by the [`StreamParser`][`crate::xmlstream::StreamParser`],
/// parsed from complete documents with [`StanzaTree::parse_document`] or
/// assembled by hand with the `with_*` builders. Their [`Display`][`fmt::Display`]
/// implementation produces compact XML suitable for the wire.
///
/// A tree also carries a *consumed* flag. Registrants of a
/// [`Connection`][`crate::connection::Connection`] set it through
/// [`StanzaTree::consume`] to claim the stanza; it is the only part of a
/// tree which changes once it has been dispatched.
#[derive(Debug, Clone)]
pub struct StanzaTree {
    name: String,
    ns: Option<String>,
    attrs: BTreeMap<String, String>,
    children: Vec<StanzaTree>,
    text: String,
    consumed: Cell<bool>,
}

impl StanzaTree {
    /// Create an empty element.
    pub fn new<N: Into<String>>(name: N) -> Self {
        StanzaTree {
            name: name.into(),
            ns: None,
            attrs: BTreeMap::new(),
            children: Vec::new(),
            text: String::new(),
            consumed: Cell::new(false),
        }
    }

    /// Parse a complete, self-contained XML document.
    pub fn parse_document(xml: &str) -> Result<StanzaTree, minidom::Error> {
        let root: minidom::Element = xml.parse()?;
        Ok(StanzaTree::from(&root))
    }

    /// Set the namespace.
    pub fn with_ns<S: Into<String>>(mut self, ns: S) -> Self {
        self.ns = Some(ns.into());
        self
    }

    /// Set an attribute.
    pub fn with_attr<K: Into<String>, V: ToString>(mut self, name: K, value: V) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Append a child element.
    pub fn with_child(mut self, child: StanzaTree) -> Self {
        self.children.push(child);
        self
    }

    /// Append character data.
    pub fn with_text<S: AsRef<str>>(mut self, text: S) -> Self {
        self.append_text(text.as_ref());
        self
    }

    /// Set an attribute, replacing a previous value.
    pub fn set_attr<K: Into<String>, V: ToString>(&mut self, name: K, value: V) {
        self.attrs.insert(name.into(), value.to_string());
    }

    pub(crate) fn push_child(&mut self, child: StanzaTree) {
        self.children.push(child);
    }

    pub(crate) fn append_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// Local name of the element.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of the element, if known.
    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    /// Whether the element has the given local name and namespace.
    pub fn is(&self, name: &str, ns: &str) -> bool {
        self.name == name && self.ns.as_deref() == Some(ns)
    }

    /// Value of the attribute `name`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// All attributes.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// First child named `name`.
    pub fn child(&self, name: &str) -> Option<&StanzaTree> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Children named `name`, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a StanzaTree> {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// All children, in document order.
    pub fn children(&self) -> impl Iterator<Item = &StanzaTree> {
        self.children.iter()
    }

    /// Follow a path of child names, e.g. `&["features", "bind"]`.
    pub fn find(&self, path: &[&str]) -> Option<&StanzaTree> {
        path.iter().try_fold(self, |node, name| node.child(name))
    }

    /// Character data directly inside this element.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Claim this element for the current registrant.
    pub fn consume(&self) {
        self.consumed.set(true);
    }

    /// Whether a registrant claimed this element.
    pub fn is_consumed(&self) -> bool {
        self.consumed.get()
    }

    fn write_to(&self, f: &mut fmt::Formatter, parent_ns: Option<&str>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        if let Some(ns) = self.ns.as_deref() {
            if parent_ns != Some(ns) && !self.attrs.contains_key("xmlns") {
                write!(f, " xmlns=\"{}\"", escape(ns))?;
            }
        }
        for (name, value) in &self.attrs {
            write!(f, " {}=\"{}\"", name, escape(value))?;
        }
        if self.children.is_empty() && self.text.is_empty() {
            return f.write_str("/>");
        }
        f.write_str(">")?;
        f.write_str(&escape(&self.text))?;
        let ns = self.ns.as_deref().or(parent_ns);
        for child in &self.children {
            child.write_to(f, ns)?;
        }
        write!(f, "</{}>", self.name)
    }
}

impl PartialEq for StanzaTree {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.ns == other.ns
            && self.attrs == other.attrs
            && self.text == other.text
            && self.children == other.children
    }
}

impl Eq for StanzaTree {}

impl fmt::Display for StanzaTree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.write_to(f, None)
    }
}

impl From<&minidom::Element> for StanzaTree {
    fn from(elem: &minidom::Element) -> Self {
        let ns = elem.ns();
        StanzaTree {
            name: elem.name().to_owned(),
            ns: if ns.is_empty() { None } else { Some(ns) },
            attrs: elem
                .attrs()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
            children: elem.children().map(StanzaTree::from).collect(),
            text: elem.text(),
            consumed: Cell::new(false),
        }
    }
}

/// Escape character data and attribute values.
pub(crate) fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}
