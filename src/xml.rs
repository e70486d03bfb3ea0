//! Structured fault-body parsing.
//!
//! Service faults arrive as a small XML document whose root carries
//! `Code`/`ErrorCode`, `Message`/`ErrorMessage`, `RequestId` and `HostId`
//! children; both element-name variants occur in the wild and both are
//! accepted here.

use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum XmlFaultError {
    #[error("malformed xml: {0}")]
    Parse(#[from] quick_xml::Error),
    #[error("invalid text content: {0}")]
    Text(String),
    #[error("document has no root element")]
    MissingRoot,
    #[error("document carries no error code or message")]
    NotAFault,
}

#[derive(Debug, Default)]
pub(crate) struct ErrorBody {
    pub(crate) code: Option<String>,
    pub(crate) message: Option<String>,
    pub(crate) request_id: Option<String>,
    pub(crate) host_id: Option<String>,
}

/// Parses a structured fault document. Unknown children are skipped; a
/// document without at least a code or a message is rejected so that HTML
/// error pages and truncated bodies fall through to the raw-text path.
pub(crate) fn parse_error_body(xml: &[u8]) -> Result<ErrorBody, XmlFaultError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event()? {
            Event::Start(_) => break,
            Event::Eof => return Err(XmlFaultError::MissingRoot),
            _ => {}
        }
    }

    let mut body = ErrorBody::default();
    loop {
        match reader.read_event()? {
            Event::Start(element) => {
                let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                let text = read_text_content(&mut reader)?;
                match name.as_str() {
                    "Code" | "ErrorCode" => body.code = Some(text),
                    "Message" | "ErrorMessage" => body.message = Some(text),
                    "RequestId" => body.request_id = Some(text),
                    "HostId" => body.host_id = Some(text),
                    _ => {}
                }
            }
            Event::End(_) | Event::Eof => break,
            _ => {}
        }
    }

    if body.code.is_none() && body.message.is_none() {
        return Err(XmlFaultError::NotAFault);
    }
    Ok(body)
}

/// Reads the text content of the current element through its matching end
/// tag, tolerating nested elements by concatenating their text.
fn read_text_content(reader: &mut Reader<&[u8]>) -> Result<String, XmlFaultError> {
    let mut text = String::new();
    let mut depth = 0_usize;
    loop {
        match reader.read_event()? {
            Event::Text(content) => {
                let decoded = content
                    .decode()
                    .map_err(|error| XmlFaultError::Text(error.to_string()))?;
                let unescaped = quick_xml::escape::unescape(&decoded)
                    .map_err(|error| XmlFaultError::Text(error.to_string()))?;
                text.push_str(&unescaped);
            }
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                if depth == 0 {
                    return Ok(text);
                }
                depth -= 1;
            }
            Event::Eof => return Err(XmlFaultError::Text("unexpected end of document".to_owned())),
            _ => {}
        }
    }
}
