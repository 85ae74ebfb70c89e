//! Nested keyed structure the index is parsed into and built from.
//!
//! Only elements, attributes and text are kept; declarations, comments and
//! processing instructions are dropped. Whitespace between child elements is
//! discarded, text of leaf elements is preserved verbatim.

use crate::error::{Result, StoreError};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

/// Parse `bytes` into an element tree, refusing nesting deeper than `max_nesting`.
///
/// Anything that is not well-formed XML is a validation error.
pub fn parse(bytes: &[u8], max_nesting: usize) -> Result<Element> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut open: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|err| malformed(reader.buffer_position(), err))?
        {
            Event::Start(start) => {
                if open.len() >= max_nesting {
                    return Err(StoreError::validation(format!(
                        "elements nested deeper than {max_nesting} levels"
                    )));
                }
                open.push(element_from(&start, reader.buffer_position())?);
            }
            Event::Empty(start) => {
                let element = element_from(&start, reader.buffer_position())?;
                attach(&mut open, &mut root, element)?;
            }
            Event::End(_) => {
                let mut element = open
                    .pop()
                    .ok_or_else(|| StoreError::validation("closing tag without opening tag"))?;
                if !element.children.is_empty() {
                    element.text.clear();
                }
                attach(&mut open, &mut root, element)?;
            }
            Event::Text(text) => {
                if let Some(top) = open.last_mut() {
                    top.text.push_str(
                        &text
                            .unescape()
                            .map_err(|err| malformed(reader.buffer_position(), err))?,
                    );
                }
            }
            Event::CData(data) => {
                if let Some(top) = open.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(unclosed) = open.last() {
        return Err(StoreError::validation(format!(
            "element <{}> is never closed",
            unclosed.name
        )));
    }
    root.ok_or_else(|| StoreError::validation("document has no root element"))
}

fn malformed(position: usize, err: impl std::fmt::Display) -> StoreError {
    StoreError::validation(format!("malformed XML near byte {position}: {err}"))
}

fn element_from(start: &BytesStart<'_>, position: usize) -> Result<Element> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|err| malformed(position, err))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| malformed(position, err))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(open: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match open.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(StoreError::validation("document has more than one root element")),
    }
    Ok(())
}

/// Serialize an element tree; markup-significant characters are escaped here.
pub fn build(root: &Element) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_element(&mut writer, root)?;
    let mut out = writer.into_inner();
    out.push(b'\n');
    Ok(out)
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.children.is_empty() && element.text.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    if !element.text.is_empty() {
        writer.write_event(Event::Text(BytesText::new(&element.text)))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}
