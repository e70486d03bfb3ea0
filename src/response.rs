use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// A fully-buffered exchange result as produced by the transport stage.
///
/// The unmarshaller (or, on the fault path, the error handler) takes this
/// out of the execution context and drops it once the typed result or fault
/// has been extracted, so the transport buffer never outlives that step.
#[derive(Clone, Debug)]
pub struct ResponseModel {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ResponseModel {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
