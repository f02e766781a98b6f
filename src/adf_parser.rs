//! XXE-safe XML parsing into a small element tree.
//!
//! `quick-xml` never resolves entities beyond the five predefined ones, but a
//! document that *declares* a DTD is still refused outright rather than parsed
//! partially. Depth and element-count caps bound the work a hostile document
//! can cause.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::time::Duration;

use crate::errors::AppError;

pub const MAX_DEPTH: usize = 32;
pub const MAX_ELEMENTS: usize = 10_000;

/// One element of a parsed document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    /// Concatenated text and CDATA content, trimmed.
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.is(name))
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.is(name))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Element text, `None` when empty.
    pub fn text(&self) -> Option<&str> {
        let text = self.text.trim();
        (!text.is_empty()).then_some(text)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|c| c.text())
    }
}

/// True when the document carries a DOCTYPE or ENTITY declaration anywhere.
pub fn contains_dtd(input: &[u8]) -> bool {
    const NEEDLES: [&[u8]; 2] = [b"<!doctype", b"<!entity"];
    input.windows(9).any(|w| {
        NEEDLES
            .iter()
            .any(|needle| w[..needle.len()].eq_ignore_ascii_case(needle))
    })
}

fn malformed(detail: impl Into<String>) -> AppError {
    AppError::MalformedInput(detail.into())
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlNode, AppError> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|_| malformed("element name is not valid UTF-8"))?
        .to_string();

    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| malformed(format!("bad attribute on <{}>: {}", name, e)))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|_| malformed("attribute name is not valid UTF-8"))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| malformed(format!("bad attribute value on <{}>: {}", name, e)))?
            .into_owned();
        attributes.push((key, value));
    }

    Ok(XmlNode {
        name,
        attributes,
        ..XmlNode::default()
    })
}

fn attach(stack: &mut [XmlNode], root: &mut Option<XmlNode>, node: XmlNode) -> Result<(), AppError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(node);
            Ok(())
        }
        None => Err(malformed("document has more than one root element")),
    }
}

fn append_text(stack: &mut [XmlNode], text: &str) -> Result<(), AppError> {
    if text.trim().is_empty() {
        return Ok(());
    }
    match stack.last_mut() {
        Some(node) => {
            if !node.text.is_empty() {
                node.text.push(' ');
            }
            node.text.push_str(text.trim());
            Ok(())
        }
        None => Err(malformed("text outside the root element")),
    }
}

/// Parses `input` into an element tree. Performs no business validation.
pub fn parse_document(input: &[u8]) -> Result<XmlNode, AppError> {
    if contains_dtd(input) {
        return Err(malformed("DOCTYPE/ENTITY declarations are not allowed"));
    }

    let text = std::str::from_utf8(input).map_err(|_| malformed("document is not valid UTF-8"))?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;
    let mut elements = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| {
            malformed(format!(
                "XML error at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Start(start) => {
                elements += 1;
                if elements > MAX_ELEMENTS {
                    return Err(malformed("too many elements"));
                }
                if stack.len() >= MAX_DEPTH {
                    return Err(malformed("elements nested too deeply"));
                }
                if root.is_some() && stack.is_empty() {
                    return Err(malformed("document has more than one root element"));
                }
                stack.push(element_from(&start)?);
            }
            Event::Empty(start) => {
                elements += 1;
                if elements > MAX_ELEMENTS {
                    return Err(malformed("too many elements"));
                }
                let node = element_from(&start)?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| malformed("closing tag without an open element"))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(t) => {
                let unescaped = t
                    .unescape()
                    .map_err(|e| malformed(format!("bad text content: {}", e)))?;
                append_text(&mut stack, &unescaped)?;
            }
            Event::CData(c) => {
                let content =
                    std::str::from_utf8(&c).map_err(|_| malformed("CDATA is not valid UTF-8"))?;
                append_text(&mut stack, content)?;
            }
            Event::DocType(_) => {
                return Err(malformed("DOCTYPE declarations are not allowed"));
            }
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) => {}
            Event::Eof => break,
        }
    }

    if let Some(open) = stack.last() {
        return Err(malformed(format!("unclosed element <{}>", open.name)));
    }

    root.ok_or_else(|| malformed("document has no root element"))
}

/// Runs [`parse_document`] on the blocking pool, bounded by `timeout`.
pub async fn parse_with_timeout(input: Vec<u8>, timeout: Duration) -> Result<XmlNode, AppError> {
    run_bounded(timeout, move || parse_document(&input)).await
}

// A timed-out job keeps running on the blocking pool until it finishes;
// MAX_DEPTH and MAX_ELEMENTS bound how long that can be.
async fn run_bounded<F>(timeout: Duration, job: F) -> Result<XmlNode, AppError>
where
    F: FnOnce() -> Result<XmlNode, AppError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(job);

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(AppError::InternalError(format!(
            "XML parse task failed: {}",
            join_err
        ))),
        Err(_) => Err(malformed(format!(
            "XML parse exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}
