use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{Method, Uri, header};

/// Everything needed to perform one exchange against the service: verb,
/// endpoint, resource path, headers, query parameters, sub-resource markers
/// and an optional body.
///
/// Sub-resources are tracked separately from ordinary query parameters
/// because they participate in signing differently; on the wire both end up
/// in the query string.
#[derive(Debug)]
pub struct ServiceRequest {
    method: Method,
    endpoint: Option<Uri>,
    resource_path: String,
    headers: http::HeaderMap,
    query_parameters: BTreeMap<String, String>,
    sub_resources: BTreeMap<String, Option<String>>,
    body: Option<RequestBody>,
    is_signed: bool,
}

impl ServiceRequest {
    pub fn new(method: Method, resource_path: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: None,
            resource_path: resource_path.into(),
            headers: http::HeaderMap::new(),
            query_parameters: BTreeMap::new(),
            sub_resources: BTreeMap::new(),
            body: None,
            is_signed: false,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn endpoint(&self) -> Option<&Uri> {
        self.endpoint.as_ref()
    }

    pub fn set_endpoint(&mut self, endpoint: Uri) {
        self.endpoint = Some(endpoint);
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    pub fn headers(&self) -> &http::HeaderMap {
        &self.headers
    }

    /// Inserts a header, replacing any previous value. Touching a header
    /// that participates in the canonical request invalidates an existing
    /// signature.
    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
        if participates_in_signing(&name) {
            self.is_signed = false;
        }
        self.headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: HeaderName) {
        if participates_in_signing(&name) {
            self.is_signed = false;
        }
        self.headers.remove(name);
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn add_query_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.query_parameters.insert(name.into(), value.into());
    }

    pub fn query_parameters(&self) -> &BTreeMap<String, String> {
        &self.query_parameters
    }

    pub fn add_sub_resource(&mut self, name: impl Into<String>, value: Option<String>) {
        self.sub_resources.insert(name.into(), value);
    }

    pub fn sub_resources(&self) -> &BTreeMap<String, Option<String>> {
        &self.sub_resources
    }

    pub fn set_body(&mut self, body: RequestBody) {
        self.body = Some(body);
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub fn body_mut(&mut self) -> Option<&mut RequestBody> {
        self.body.as_mut()
    }

    pub fn allows_request_body(&self) -> bool {
        matches!(self.method, Method::POST | Method::PUT)
    }

    pub fn is_signed(&self) -> bool {
        self.is_signed
    }

    pub(crate) fn mark_signed(&mut self) {
        self.is_signed = true;
    }
}

fn participates_in_signing(name: &HeaderName) -> bool {
    name == header::CONTENT_TYPE
        || name == header::DATE
        || name.as_str() == "content-md5"
        || name.as_str().starts_with(crate::CANONICAL_HEADER_PREFIX)
}

/// A request body is either an in-memory buffer or a streaming reader;
/// whether it can be replayed governs retry eligibility.
pub enum RequestBody {
    Buffered(Bytes),
    Streaming(StreamingBody),
}

impl RequestBody {
    pub fn is_replayable(&self) -> bool {
        match self {
            Self::Buffered(_) => true,
            Self::Streaming(body) => body.is_replayable(),
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        match self {
            Self::Buffered(bytes) => Some(bytes.len() as u64),
            Self::Streaming(body) => Some(body.content_length),
        }
    }

    /// Restores the body to its initial position so the next attempt resends
    /// the same payload. Fails for a non-seekable streaming body.
    pub fn rewind(&mut self) -> std::io::Result<()> {
        match self {
            Self::Buffered(_) => Ok(()),
            Self::Streaming(body) => body.rewind(),
        }
    }

    /// Drains the body into a buffer for the transport exchange. Buffered
    /// bodies are cheap clones; streaming bodies are consumed.
    pub fn to_bytes(&mut self) -> std::io::Result<Bytes> {
        match self {
            Self::Buffered(bytes) => Ok(bytes.clone()),
            Self::Streaming(body) => body.read_to_bytes(),
        }
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(bytes) => formatter
                .debug_tuple("Buffered")
                .field(&bytes.len())
                .finish(),
            Self::Streaming(body) => formatter.debug_tuple("Streaming").field(body).finish(),
        }
    }
}

trait SeekRead: Read + Seek + Send {}

impl<T: Read + Seek + Send> SeekRead for T {}

enum BodyReader {
    Plain(Box<dyn Read + Send>),
    Seekable {
        reader: Box<dyn SeekRead>,
        origin: u64,
    },
}

/// A streaming request body with a known content length. Seekable readers
/// record their origin position at attach time so retries can rewind.
pub struct StreamingBody {
    reader: BodyReader,
    content_length: u64,
}

impl StreamingBody {
    pub fn seekable(
        mut reader: impl Read + Seek + Send + 'static,
        content_length: u64,
    ) -> std::io::Result<Self> {
        let origin = reader.stream_position()?;
        Ok(Self {
            reader: BodyReader::Seekable {
                reader: Box::new(reader),
                origin,
            },
            content_length,
        })
    }

    pub fn unbuffered(reader: impl Read + Send + 'static, content_length: u64) -> Self {
        Self {
            reader: BodyReader::Plain(Box::new(reader)),
            content_length,
        }
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn is_replayable(&self) -> bool {
        matches!(self.reader, BodyReader::Seekable { .. })
    }

    fn rewind(&mut self) -> std::io::Result<()> {
        match &mut self.reader {
            BodyReader::Plain(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "request body reader is not replayable",
            )),
            BodyReader::Seekable { reader, origin } => {
                reader.seek(SeekFrom::Start(*origin))?;
                Ok(())
            }
        }
    }

    fn read_to_bytes(&mut self) -> std::io::Result<Bytes> {
        let mut buffer = Vec::with_capacity(usize::try_from(self.content_length).unwrap_or(0));
        match &mut self.reader {
            BodyReader::Plain(reader) => reader.read_to_end(&mut buffer)?,
            BodyReader::Seekable { reader, .. } => reader.read_to_end(&mut buffer)?,
        };
        Ok(Bytes::from(buffer))
    }
}

impl std::fmt::Debug for StreamingBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StreamingBody")
            .field("content_length", &self.content_length)
            .field("replayable", &self.is_replayable())
            .finish()
    }
}
