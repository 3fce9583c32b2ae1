pub mod transactions;

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};

/// One element of a parsed document. Names are local (namespace prefix
/// stripped); `nil` reflects an `xsi:nil="1"` or `xsi:nil="true"` attribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub nil: bool,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut nil = false;
        for attr in start.attributes() {
            let attr = attr.map_err(|e| Error::Decode(format!("bad attribute on <{name}>: {e}")))?;
            if attr.key.local_name().as_ref() == b"nil" {
                nil = matches!(attr.value.as_ref(), b"1" | b"true");
            }
        }
        Ok(Self {
            name,
            nil,
            text: String::new(),
            children: Vec::new(),
        })
    }

    /// First direct child with the given local name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Depth-first search, including `self`.
    pub fn find(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// All descendants named `name` that are not themselves nested inside
    /// another match.
    pub fn find_outermost<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut out = Vec::new();
        for child in &self.children {
            child.collect_outermost(name, &mut out);
        }
        out
    }

    fn collect_outermost<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        if self.name == name {
            out.push(self);
            return;
        }
        for child in &self.children {
            child.collect_outermost(name, out);
        }
    }

    /// Text of a direct child, or `None` when it is absent, nil, or blank.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.child(name)
            .filter(|c| !c.nil)
            .map(|c| c.text.as_str())
            .filter(|t| !t.is_empty())
    }
}

/// Parse an XML document into its root element.
pub fn parse_document(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::Decode(format!("malformed XML at byte {}: {e}", reader.buffer_position())))?;
        match event {
            Event::Start(start) => stack.push(Element::from_start(&start)?),
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let mut element = stack
                    .pop()
                    .ok_or_else(|| Error::Decode("unexpected closing tag".into()))?;
                let trimmed = element.text.trim();
                if trimmed.len() != element.text.len() {
                    element.text = trimmed.to_string();
                }
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&unescape_fragment(&text)?);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::GeneralRef(reference) => {
                if let Some(current) = stack.last_mut() {
                    let entity = format!("&{};", String::from_utf8_lossy(&reference));
                    current.text.push_str(&unescape_fragment(entity.as_bytes())?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Error::Decode("unexpected end of document".into()));
    }
    root.ok_or_else(|| Error::Decode("document has no root element".into()))
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(Error::Decode("document has more than one root element".into())),
    }
    Ok(())
}

fn unescape_fragment(raw: &[u8]) -> Result<Cow<'static, str>> {
    let text = std::str::from_utf8(raw).map_err(|e| Error::Decode(format!("invalid UTF-8: {e}")))?;
    quick_xml::escape::unescape(text)
        .map(|s| Cow::Owned(s.into_owned()))
        .map_err(|e| Error::Decode(format!("bad entity: {e}")))
}

/// The `Body` element of a SOAP envelope.
pub fn body(root: &Element) -> Result<&Element> {
    root.find("Body")
        .ok_or_else(|| Error::Decode("response has no SOAP Body".into()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: String,
    pub message: String,
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Error::OperationFault {
            code: fault.code,
            message: fault.message,
        }
    }
}

pub fn find_fault(root: &Element) -> Option<Fault> {
    let fault = root.find("Fault")?;
    Some(Fault {
        code: fault.value("faultcode").unwrap_or("unknown").to_string(),
        message: fault
            .value("faultstring")
            .unwrap_or("no fault message")
            .to_string(),
    })
}

/// Fault carried by a raw response body, if the body parses and has one.
pub fn fault_in(xml: &str) -> Option<Fault> {
    if !xml.contains("Fault") {
        return None;
    }
    parse_document(xml).ok().as_ref().and_then(find_fault)
}

/// Extract the session token from a login response.
pub fn login_token(xml: &str) -> Result<String> {
    let root = parse_document(xml)
        .map_err(|e| Error::Authentication(format!("unreadable login response: {e}")))?;
    if let Some(fault) = find_fault(&root) {
        return Err(Error::Authentication(format!("{} ({})", fault.message, fault.code)));
    }
    first_result(&root)
        .map(str::to_string)
        .ok_or_else(|| Error::Authentication("login response carried no session token".into()))
}

fn first_result(element: &Element) -> Option<&str> {
    if element.name == "result" && !element.nil && !element.text.is_empty() {
        return Some(&element.text);
    }
    element.children.iter().find_map(first_result)
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub fn envelope(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"><soapenv:Body>{body}</soapenv:Body></soapenv:Envelope>"#
        )
    }

    pub fn login_ok(token: &str) -> String {
        envelope(&format!("<ns:loginResponse><result>{token}</result></ns:loginResponse>"))
    }

    pub fn fault(code: &str, message: &str) -> String {
        envelope(&format!(
            "<soapenv:Fault><faultcode>{code}</faultcode><faultstring>{message}</faultstring></soapenv:Fault>"
        ))
    }

    pub fn logout_ok() -> String {
        envelope("<ns:logoutResponse/>")
    }
}
