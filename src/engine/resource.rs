//! Reading resource content into a JSON tree.
//!
//! JSON content is parsed as-is. FHIR XML is converted to the JSON shape of
//! the same resource: the root element names the `resourceType`, `value`
//! attributes become primitives, repeated elements become arrays and nested
//! resources (such as `contained` entries) become objects carrying their own
//! `resourceType`. Narrative `div` content is kept as an opaque string.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::MediaType;

const XHTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

/// Deepest element nesting accepted in XML content, matching serde_json's recursion limit
pub const MAX_DEPTH: usize = 128;

/// Content that is not well-formed for its media type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ContentError {
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ContentError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    fn at(mut self, line: usize, column: usize) -> Self {
        self.line = u32::try_from(line).ok();
        self.column = u32::try_from(column).ok();
        self
    }
}

/// Check that content is well-formed JSON or XML without building a tree
pub fn check_well_formed(content: &[u8], media_type: MediaType) -> Result<(), ContentError> {
    match media_type {
        MediaType::Json => serde_json::from_slice::<serde::de::IgnoredAny>(content)
            .map(|_| ())
            .map_err(json_error),
        MediaType::Xml => scan_xml(content),
    }
}

/// Parse content into its JSON representation
pub fn parse(content: &[u8], media_type: MediaType) -> Result<Value, ContentError> {
    match media_type {
        MediaType::Json => serde_json::from_slice(content).map_err(json_error),
        MediaType::Xml => parse_xml(content),
    }
}

fn json_error(error: serde_json::Error) -> ContentError {
    ContentError::new(format!("Malformed JSON: {error}")).at(error.line(), error.column())
}

struct Frame {
    name: String,
    object: Map<String, Value>,
}

/// Narrative being skipped: element depth inside the `div` and the text seen so far
struct Narrative {
    depth: usize,
    text: String,
}

fn too_deep() -> ContentError {
    ContentError::new(format!("Malformed XML: nesting exceeds {MAX_DEPTH} levels"))
}

fn xml_reader(content: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);
    reader
}

fn read_xml_event<'b>(
    reader: &mut Reader<&[u8]>,
    content: &[u8],
    buf: &'b mut Vec<u8>,
) -> Result<Event<'b>, ContentError> {
    reader.read_event_into(buf).map_err(|e| {
        let (line, column) = line_and_column(content, reader.error_position() as usize);
        ContentError::new(format!("Malformed XML: {e}")).at(line, column)
    })
}

/// Walk the XML events under the same rules as [`parse_xml`], keeping only a depth counter
fn scan_xml(content: &[u8]) -> Result<(), ContentError> {
    let mut reader = xml_reader(content);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    // Element depth inside a narrative `div`
    let mut narrative: Option<usize> = None;
    let mut root_closed = false;

    loop {
        let event = read_xml_event(&mut reader, content, &mut buf)?;

        if let Some(div_depth) = narrative.as_mut() {
            match event {
                Event::Start(_) => *div_depth += 1,
                Event::Text(ref text) => {
                    text.unescape()
                        .map_err(|e| ContentError::new(format!("Malformed XML: {e}")))?;
                }
                Event::End(_) if *div_depth == 0 => narrative = None,
                Event::End(_) => *div_depth -= 1,
                Event::Eof => {
                    return Err(ContentError::new("Malformed XML: unterminated narrative"));
                }
                _ => {}
            }
            buf.clear();
            continue;
        }

        match event {
            Event::Start(ref e) => {
                if root_closed {
                    return Err(ContentError::new("Malformed XML: more than one root element"));
                }
                let name = local_name(e)?;
                if name == "div" && depth > 0 {
                    narrative = Some(0);
                } else {
                    open_frame(e, name)?;
                    depth += 1;
                    if depth > MAX_DEPTH {
                        return Err(too_deep());
                    }
                }
            }
            Event::Empty(ref e) => {
                if root_closed {
                    return Err(ContentError::new("Malformed XML: more than one root element"));
                }
                open_frame(e, local_name(e)?)?;
                if depth == 0 {
                    root_closed = true;
                } else if depth + 1 > MAX_DEPTH {
                    return Err(too_deep());
                }
            }
            Event::End(_) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ContentError::new("Malformed XML: unexpected end tag"))?;
                if depth == 0 {
                    root_closed = true;
                }
            }
            Event::Text(ref text) if depth > 0 => {
                let text = text
                    .unescape()
                    .map_err(|e| ContentError::new(format!("Malformed XML: {e}")))?;
                if !text.trim().is_empty() {
                    return Err(ContentError::new(format!(
                        "Malformed XML: unexpected text content '{}'",
                        text.trim()
                    )));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if depth > 0 {
        return Err(ContentError::new("Malformed XML: unexpected end of document"));
    }
    if !root_closed {
        return Err(ContentError::new("Malformed XML: no root element"));
    }
    Ok(())
}

fn parse_xml(content: &[u8]) -> Result<Value, ContentError> {
    let mut reader = xml_reader(content);
    let mut buf = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut narrative: Option<Narrative> = None;
    let mut root: Option<Value> = None;

    loop {
        let event = read_xml_event(&mut reader, content, &mut buf)?;

        if let Some(div) = narrative.as_mut() {
            match event {
                Event::Start(_) => div.depth += 1,
                Event::Text(ref text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| ContentError::new(format!("Malformed XML: {e}")))?;
                    if !div.text.is_empty() {
                        div.text.push(' ');
                    }
                    div.text.push_str(&text);
                }
                Event::End(_) if div.depth == 0 => {
                    let html = format!(
                        "<div xmlns=\"{XHTML_NAMESPACE}\">{}</div>",
                        std::mem::take(&mut div.text)
                    );
                    narrative = None;
                    if let Some(parent) = stack.last_mut() {
                        insert_child(&mut parent.object, "div", Value::String(html));
                    }
                }
                Event::End(_) => div.depth -= 1,
                Event::Eof => {
                    return Err(ContentError::new("Malformed XML: unterminated narrative"));
                }
                _ => {}
            }
            buf.clear();
            continue;
        }

        match event {
            Event::Start(ref e) => {
                if root.is_some() {
                    return Err(ContentError::new("Malformed XML: more than one root element"));
                }
                let name = local_name(e)?;
                if name == "div" && !stack.is_empty() {
                    narrative = Some(Narrative {
                        depth: 0,
                        text: String::new(),
                    });
                } else {
                    if stack.len() >= MAX_DEPTH {
                        return Err(too_deep());
                    }
                    stack.push(open_frame(e, name)?);
                }
            }
            Event::Empty(ref e) => {
                if root.is_some() {
                    return Err(ContentError::new("Malformed XML: more than one root element"));
                }
                if stack.len() >= MAX_DEPTH {
                    return Err(too_deep());
                }
                let name = local_name(e)?;
                let frame = open_frame(e, name)?;
                close_frame(frame, &mut stack, &mut root);
            }
            Event::End(_) => {
                let frame = stack
                    .pop()
                    .ok_or_else(|| ContentError::new("Malformed XML: unexpected end tag"))?;
                close_frame(frame, &mut stack, &mut root);
            }
            Event::Text(ref text) if !stack.is_empty() => {
                let text = text
                    .unescape()
                    .map_err(|e| ContentError::new(format!("Malformed XML: {e}")))?;
                if !text.trim().is_empty() {
                    return Err(ContentError::new(format!(
                        "Malformed XML: unexpected text content '{}'",
                        text.trim()
                    )));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(ContentError::new("Malformed XML: unexpected end of document"));
    }
    root.ok_or_else(|| ContentError::new("Malformed XML: no root element"))
}

fn local_name(e: &BytesStart<'_>) -> Result<String, ContentError> {
    std::str::from_utf8(e.local_name().as_ref())
        .map(str::to_string)
        .map_err(|e| ContentError::new(format!("Malformed XML: invalid element name: {e}")))
}

fn open_frame(e: &BytesStart<'_>, name: String) -> Result<Frame, ContentError> {
    let mut object = Map::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| ContentError::new(format!("Malformed XML: {e}")))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| ContentError::new(format!("Malformed XML: {e}")))?;
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value = attr
            .unescape_value()
            .map_err(|e| ContentError::new(format!("Malformed XML: {e}")))?;
        object.insert(key.to_string(), Value::String(value.into_owned()));
    }
    Ok(Frame { name, object })
}

fn close_frame(frame: Frame, stack: &mut [Frame], root: &mut Option<Value>) {
    let Some(parent) = stack.last_mut() else {
        let mut object = Map::new();
        object.insert("resourceType".to_string(), Value::String(frame.name));
        object.extend(frame.object);
        *root = Some(Value::Object(object));
        return;
    };

    // A nested resource replaces its wrapper element (`<contained><Patient>`)
    if is_resource_name(&frame.name) {
        parent
            .object
            .insert("resourceType".to_string(), Value::String(frame.name));
        parent.object.extend(frame.object);
        return;
    }

    let mut object = frame.object;
    match object.remove("value") {
        Some(value) => {
            insert_child(&mut parent.object, &frame.name, value);
            if !object.is_empty() {
                insert_child(
                    &mut parent.object,
                    &format!("_{}", frame.name),
                    Value::Object(object),
                );
            }
        }
        None => insert_child(&mut parent.object, &frame.name, Value::Object(object)),
    }
}

fn is_resource_name(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn insert_child(object: &mut Map<String, Value>, name: &str, value: Value) {
    match object.get_mut(name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            object.insert(name.to_string(), value);
        }
    }
}

fn line_and_column(content: &[u8], offset: usize) -> (usize, usize) {
    let prefix = &content[..offset.min(content.len())];
    let line = prefix.iter().filter(|b| **b == b'\n').count() + 1;
    let column = match prefix.iter().rposition(|b| *b == b'\n') {
        Some(newline) => prefix.len() - newline,
        None => prefix.len() + 1,
    };
    (line, column)
}

/// Iterate over a field that may hold a single value or an array of values
pub fn occurrences(value: Option<&Value>) -> Vec<&Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
    }
}
