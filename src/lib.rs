//! `mqx` is the request-execution pipeline for message-queue HTTP SDKs: it
//! turns a typed API call into a signed, retried HTTP exchange and turns the
//! raw response (or transport fault) back into a typed result or a
//! classified error.
//!
//! The engine is an ordered chain of handlers (error classification,
//! marshalling, credential resolution, the retry loop, signing, and the
//! transport terminus) driven synchronously or asynchronously over a
//! per-call [`ExecutionContext`]. The chain can be restructured by role tag
//! before the first call.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use http::Method;
//! use mqx::prelude::*;
//!
//! struct PeekMessage;
//!
//! impl ServiceCall for PeekMessage {
//!     type Output = String;
//!
//!     fn marshal(&self) -> MqxResult<ServiceRequest> {
//!         let mut request = ServiceRequest::new(Method::GET, "/queues/demo/messages");
//!         request.add_sub_resource("peekonly", None);
//!         Ok(request)
//!     }
//!
//!     fn unmarshal(&self, response: &ResponseModel) -> MqxResult<String> {
//!         Ok(response.text_lossy())
//!     }
//! }
//!
//! fn main() -> MqxResult<()> {
//!     let pipeline = Pipeline::builder("https://mq.region.example.com")
//!         .client_name("demo-sdk")
//!         .credential_provider(Arc::new(StaticCredentialProvider::new(
//!             ServiceCredentials::new("AKID", "secret"),
//!         )))
//!         .retry_policy(RetryPolicy::standard().max_retries(3))
//!         .try_build()?;
//!
//!     let body = pipeline.invoke(&PeekMessage)?;
//!     println!("{body}");
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Use `RetryPolicy::standard()` for SDK traffic; only calls with
//!   replayable bodies are retried.
//! - Give every SDK its own `client_name` so the `User-Agent` identifies it.
//! - Session (STS) credentials attach the `security-token` header
//!   automatically.

pub(crate) const AUTH_SCHEME: &str = "MQ";
pub(crate) const CANONICAL_HEADER_PREFIX: &str = "x-mq-";
pub(crate) const SECURITY_TOKEN_HEADER: &str = "security-token";
pub(crate) const VERSION_HEADER: &str = "x-mq-version";
pub(crate) const SERVICE_VERSION: &str = "2015-06-06";
pub(crate) const DEFAULT_CONTENT_TYPE: &str = "text/xml";

mod context;
mod credentials;
mod error;
mod fault;
mod marshal;
mod pipeline;
mod request;
mod response;
mod retry;
mod sign;
mod transport;
mod xml;

pub use crate::context::ExecutionContext;
pub use crate::credentials::{
    CredentialProvider, CredentialsHandler, ServiceCredentials, StaticCredentialProvider,
};
pub use crate::error::{FaultKind, MqError, ServiceError, TransportErrorKind};
pub use crate::fault::{
    Disposition, ErrorHandler, FaultHandler, FaultHandlerRegistry, HttpFaultHandler,
    TransportFaultHandler,
};
pub use crate::marshal::{MarshallerHandler, ServiceCall, UnmarshallerHandler};
pub use crate::pipeline::{Chain, Handler, Pipeline, PipelineBuilder, roles};
pub use crate::request::{RequestBody, ServiceRequest, StreamingBody};
pub use crate::response::ResponseModel;
pub use crate::retry::{RetryHandler, RetryPolicy};
pub use crate::sign::{SignerHandler, sign_request};
pub use crate::transport::{HyperTransport, Transport, TransportHandler};

pub type MqxResult<T> = std::result::Result<T, MqError>;

pub mod prelude {
    pub use crate::{
        CredentialProvider, Disposition, ExecutionContext, FaultHandler, FaultHandlerRegistry,
        FaultKind, Handler, MqError, MqxResult, Pipeline, PipelineBuilder, RequestBody,
        ResponseModel, RetryPolicy, ServiceCall, ServiceCredentials, ServiceError, ServiceRequest,
        StaticCredentialProvider, StreamingBody, Transport, TransportErrorKind,
    };
}

#[cfg(test)]
mod tests;
