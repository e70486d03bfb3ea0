use http::StatusCode;
use thiserror::Error;

/// Sub-classification of a transport fault, assigned before any HTTP status
/// is known. The retry policy keys its transport decisions off this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Timeout,
    Read,
    Other,
}

impl TransportErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Timeout => "timeout",
            Self::Read => "read",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Closed fault classification used for handler dispatch.
///
/// `parent` walks the fixed hierarchy used by the fault-handler registry:
/// a specific transport kind falls back to the generic transport kind, then
/// to the HTTP-fault kind, then to the root. Every other kind falls back to
/// the root directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FaultKind {
    Transport(TransportErrorKind),
    TransportGeneric,
    Http,
    Marshalling,
    Configuration,
    Cancelled,
    Generic,
}

impl FaultKind {
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::Transport(_) => Some(Self::TransportGeneric),
            Self::TransportGeneric => Some(Self::Http),
            Self::Http | Self::Marshalling | Self::Configuration | Self::Cancelled => {
                Some(Self::Generic)
            }
            Self::Generic => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::TransportGeneric => "transport_generic",
            Self::Http => "http",
            Self::Marshalling => "marshalling",
            Self::Configuration => "configuration",
            Self::Cancelled => "cancelled",
            Self::Generic => "generic",
        }
    }
}

/// The typed service fault handed to callers once a structured error body
/// has been parsed (or a transport fault has been wrapped).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceError {
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub request_id: Option<String>,
    pub host_id: Option<String>,
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("service fault")?;
        if let Some(code) = &self.code {
            write!(formatter, " {code}")?;
        }
        if let Some(status) = self.status {
            write!(formatter, " (status {status})")?;
        }
        if let Some(message) = &self.message {
            write!(formatter, ": {message}")?;
        }
        if let Some(request_id) = &self.request_id {
            write!(formatter, " [request-id {request_id}]")?;
        }
        if let Some(host_id) = &self.host_id {
            write!(formatter, " [host-id {host_id}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MqError {
    #[error("transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    /// Raw non-2xx exchange, raised at the transport stage before the error
    /// handler has classified the fault body.
    #[error("http fault with status {status}")]
    HttpFault { status: StatusCode },
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// The service returned a fault whose body could not be parsed as a
    /// structured error document; the raw text is preserved.
    #[error("the service returned status {status} with an unreadable fault body: {body}")]
    Internal { status: StatusCode, body: String },
    #[error("marshalling error: {message}")]
    Marshalling { message: String },
    #[error("pipeline configuration error: {message}")]
    Configuration { message: String },
    #[error("the call was cancelled")]
    Cancelled,
}

impl MqError {
    pub(crate) fn marshalling(message: impl Into<String>) -> Self {
        Self::Marshalling {
            message: message.into(),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> FaultKind {
        match self {
            Self::Transport { kind, .. } => FaultKind::Transport(*kind),
            Self::HttpFault { .. } | Self::Service(_) | Self::Internal { .. } => FaultKind::Http,
            Self::Marshalling { .. } => FaultKind::Marshalling,
            Self::Configuration { .. } => FaultKind::Configuration,
            Self::Cancelled => FaultKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FaultKind, MqError, ServiceError, TransportErrorKind};

    #[test]
    fn transport_kind_walks_through_http_to_the_root() {
        let mut kind = FaultKind::Transport(TransportErrorKind::Connect);
        let mut walk = vec![kind];
        while let Some(parent) = kind.parent() {
            walk.push(parent);
            kind = parent;
        }
        assert_eq!(
            walk,
            vec![
                FaultKind::Transport(TransportErrorKind::Connect),
                FaultKind::TransportGeneric,
                FaultKind::Http,
                FaultKind::Generic,
            ]
        );
    }

    #[test]
    fn marshalling_faults_skip_the_transport_branch() {
        assert_eq!(FaultKind::Marshalling.parent(), Some(FaultKind::Generic));
        assert_eq!(FaultKind::Generic.parent(), None);
    }

    #[test]
    fn service_error_display_includes_identifiers() {
        let fault = ServiceError {
            status: Some(http::StatusCode::BAD_REQUEST),
            code: Some("InvalidTopic".to_owned()),
            message: Some("topic does not exist".to_owned()),
            request_id: Some("7E1C-4B2A".to_owned()),
            host_id: None,
        };
        let rendered = fault.to_string();
        assert!(rendered.contains("InvalidTopic"));
        assert!(rendered.contains("400"));
        assert!(rendered.contains("7E1C-4B2A"));
    }

    #[test]
    fn error_kind_matches_variant() {
        assert_eq!(
            MqError::Cancelled.kind().as_str(),
            FaultKind::Cancelled.as_str()
        );
        assert_eq!(
            MqError::marshalling("bad payload").kind(),
            FaultKind::Marshalling
        );
    }
}
