//! Minimal owned XML element tree for stream metadata (`<info>`/`<desc>`), spec §5.
//!
//! The original wraps `pugixml` and exposes a full DOM-style binding surface
//! (`lsl_xml_element_c.cpp`: first_child/next_sibling/append_child/...). That binding layer
//! and the external DOM dependency are both out of scope here; what survives is the shape
//! of the tree itself (named elements, optional single text child, ordered children) and
//! just enough of an API to build and query a stream's metadata and to parse/serialize the
//! `shortinfo`/`fullinfo` documents exchanged on the wire.

use std::fmt::Write as _;

/// An XML element: a name, an optional text value (as the original models text as a
/// degenerate "node_pcdata" child), and an ordered list of child elements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    text: Option<String>,
    children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Element { name: name.into(), text: None, children: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn set_value(&mut self, value: impl Into<String>) -> &mut Self {
        self.text = Some(value.into());
        self
    }

    /// Returns the text of the first child matching `name`, as `child_value(name)` does.
    pub fn child_value(&self, name: &str) -> &str {
        self.child(name).map(|c| c.value()).unwrap_or("")
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn append_child(&mut self, name: impl Into<String>) -> &mut Element {
        self.children.push(Element::new(name));
        self.children.last_mut().unwrap()
    }

    /// Append an already-constructed element as the last child.
    pub fn push_child(&mut self, child: Element) {
        self.children.push(child);
    }

    /// Append a leaf `<name>value</name>` child, mirroring `lsl_append_child_value`.
    pub fn append_child_value(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.append_child(name).set_value(value);
        self
    }

    /// Find-or-create semantics used throughout descriptor construction: reuse the first
    /// child with this name if present, otherwise append a fresh one.
    pub fn child_or_append(&mut self, name: &str) -> &mut Element {
        if self.children.iter().any(|c| c.name == name) {
            self.children.iter_mut().find(|c| c.name == name).unwrap()
        } else {
            self.append_child(name)
        }
    }

    pub fn remove_child(&mut self, name: &str) {
        self.children.retain(|c| c.name != name);
    }

    /// Serialize this element (without an XML declaration) to a compact string.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        let _ = write!(out, "<{}>", escape(&self.name));
        if let Some(text) = &self.text {
            out.push_str(&escape(text));
        }
        for child in &self.children {
            child.write_xml(out);
        }
        let _ = write!(out, "</{}>", escape(&self.name));
    }

    /// Parse a single root element from a well-formed document fragment.
    pub fn parse(input: &str) -> crate::error::Result<Element> {
        let mut chars = input.trim().char_indices().peekable();
        let elem = parse_element(input, &mut chars)?;
        Ok(elem)
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

type CharIter<'a> = std::iter::Peekable<std::str::CharIndices<'a>>;

fn skip_ws(input: &str, chars: &mut CharIter) {
    while let Some(&(_, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else {
            break;
        }
    }
    let _ = input;
}

fn parse_element(input: &str, chars: &mut CharIter) -> crate::error::Result<Element> {
    skip_ws(input, chars);
    expect(input, chars, '<')?;
    let name = take_until(input, chars, '>');
    let mut elem = Element::new(name.trim());

    loop {
        skip_ws(input, chars);
        match chars.peek() {
            None => {
                return Err(crate::error::LslError::argument("unexpected end of xml document"))
            }
            Some(&(_, '<')) => {
                // closing tag or nested element
                let save = chars.clone();
                chars.next(); // consume '<'
                if chars.peek().map(|&(_, c)| c) == Some('/') {
                    chars.next();
                    let _closing = take_until(input, chars, '>');
                    break;
                } else {
                    *chars = save;
                    let child = parse_element(input, chars)?;
                    elem.children.push(child);
                }
            }
            Some(_) => {
                let text = take_until(input, chars, '<');
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    elem.text = Some(unescape(trimmed));
                }
            }
        }
    }
    Ok(elem)
}

fn expect(input: &str, chars: &mut CharIter, want: char) -> crate::error::Result<()> {
    match chars.next() {
        Some((_, c)) if c == want => Ok(()),
        _ => {
            let _ = input;
            Err(crate::error::LslError::argument(format!(
                "expected '{want}' in xml document"
            )))
        }
    }
}

/// Consume characters up to (not including) the next occurrence of `stop`, returning them.
fn take_until(input: &str, chars: &mut CharIter, stop: char) -> String {
    let start = match chars.peek() {
        Some(&(i, _)) => i,
        None => return String::new(),
    };
    let mut end = input.len();
    while let Some(&(i, c)) = chars.peek() {
        if c == stop {
            end = i;
            break;
        }
        chars.next();
        end = i + c.len_utf8();
    }
    if chars.peek().map(|&(_, c)| c) == Some(stop) {
        chars.next();
    }
    input[start..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_serializes_nested_tree() {
        let mut root = Element::new("info");
        root.append_child_value("name", "TestStream");
        root.append_child_value("type", "EEG");
        let desc = root.append_child("desc");
        desc.append_child_value("manufacturer", "Acme & Co");
        let xml = root.to_xml();
        assert!(xml.contains("<name>TestStream</name>"));
        assert!(xml.contains("Acme &amp; Co"));
    }

    #[test]
    fn roundtrips_through_parse() {
        let mut root = Element::new("info");
        root.append_child_value("name", "Loopback<1>");
        root.append_child("channels").append_child("channel").append_child_value("label", "C3");
        let xml = root.to_xml();
        let parsed = Element::parse(&xml).unwrap();
        assert_eq!(parsed.name(), "info");
        assert_eq!(parsed.child_value("name"), "Loopback<1>");
        let channel = parsed.child("channels").unwrap().child("channel").unwrap();
        assert_eq!(channel.child_value("label"), "C3");
    }

    #[test]
    fn child_or_append_reuses_existing() {
        let mut root = Element::new("info");
        root.child_or_append("desc").append_child_value("a", "1");
        root.child_or_append("desc").append_child_value("b", "2");
        assert_eq!(root.children().iter().filter(|c| c.name() == "desc").count(), 1);
    }
}
