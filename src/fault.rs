use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use tracing::{debug, warn};

use crate::MqxResult;
use crate::context::ExecutionContext;
use crate::error::{FaultKind, MqError, ServiceError};
use crate::pipeline::{Chain, Handler, roles};
use crate::response::ResponseModel;
use crate::xml;

/// What a fault handler decided about the original error.
///
/// A handler that wants to replace the original with a classified error
/// returns `Err(converted)` instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Propagate the original error unchanged.
    RethrowOriginal,
    /// The fault was absorbed and the call completes successfully (the
    /// handler stored a result in the context).
    Swallowed,
}

/// Converts one kind of fault into a decision. The partially-read response,
/// already taken out of the context, is handed over and dropped when the
/// handler returns.
pub trait FaultHandler: Send + Sync {
    fn handle(
        &self,
        context: &mut ExecutionContext<'_>,
        response: Option<ResponseModel>,
        error: &MqError,
    ) -> MqxResult<Disposition>;
}

/// Kind-indexed fault handlers. Lookup starts at the error's most specific
/// kind and walks the fixed hierarchy upward until a handler is registered;
/// with none found by the root, the original error is rethrown unchanged.
pub struct FaultHandlerRegistry {
    handlers: BTreeMap<FaultKind, Arc<dyn FaultHandler>>,
}

impl FaultHandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(FaultKind::TransportGeneric, Arc::new(TransportFaultHandler));
        registry.register(FaultKind::Http, Arc::new(HttpFaultHandler));
        registry
    }

    pub fn register(&mut self, kind: FaultKind, handler: Arc<dyn FaultHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn unregister(&mut self, kind: FaultKind) {
        self.handlers.remove(&kind);
    }

    fn lookup(&self, kind: FaultKind) -> Option<&Arc<dyn FaultHandler>> {
        let mut cursor = Some(kind);
        while let Some(kind) = cursor {
            if let Some(handler) = self.handlers.get(&kind) {
                return Some(handler);
            }
            cursor = kind.parent();
        }
        None
    }

    pub(crate) fn dispatch(
        &self,
        context: &mut ExecutionContext<'_>,
        error: MqError,
    ) -> MqxResult<()> {
        // Take the response out of the context first; whatever happens next,
        // the partially-read body is released when dispatch returns.
        let response = context.take_response();
        match self.lookup(error.kind()) {
            Some(handler) => match handler.handle(context, response, &error)? {
                Disposition::Swallowed => Ok(()),
                Disposition::RethrowOriginal => Err(error),
            },
            None => Err(error),
        }
    }
}

impl Default for FaultHandlerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for FaultHandlerRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("FaultHandlerRegistry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Outermost pipeline stage: classifies anything raised further in and
/// decides what reaches the caller.
pub struct ErrorHandler {
    registry: FaultHandlerRegistry,
}

impl ErrorHandler {
    pub fn new(registry: FaultHandlerRegistry) -> Self {
        Self { registry }
    }
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ErrorHandler")
            .field("registry", &self.registry)
            .finish()
    }
}

#[async_trait(?Send)]
impl Handler for ErrorHandler {
    fn role(&self) -> &'static str {
        roles::ERROR
    }

    fn invoke(&self, chain: Chain<'_>, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        match chain.proceed(context) {
            Ok(()) => Ok(()),
            Err(error) => {
                debug!(kind = error.kind().as_str(), error = %error, "classifying pipeline fault");
                self.registry.dispatch(context, error)
            }
        }
    }

    async fn invoke_async(
        &self,
        chain: Chain<'_>,
        context: &mut ExecutionContext<'_>,
    ) -> MqxResult<()> {
        match chain.proceed_async(context).await {
            Ok(()) => Ok(()),
            Err(error) => {
                debug!(kind = error.kind().as_str(), error = %error, "classifying pipeline fault");
                self.registry.dispatch(context, error)
            }
        }
    }
}

/// Handles non-2xx exchanges: the opt-in suppressed-404 empty result first,
/// then the structured fault body, then a raw-text internal error so no
/// diagnostic information is lost.
#[derive(Debug, Default)]
pub struct HttpFaultHandler;

impl FaultHandler for HttpFaultHandler {
    fn handle(
        &self,
        context: &mut ExecutionContext<'_>,
        response: Option<ResponseModel>,
        _error: &MqError,
    ) -> MqxResult<Disposition> {
        let Some(response) = response else {
            return Ok(Disposition::RethrowOriginal);
        };
        let status = response.status();

        if status == StatusCode::NOT_FOUND && context.suppress_not_found() {
            match context.unmarshal_response(response.clone()) {
                Ok(()) => return Ok(Disposition::Swallowed),
                Err(parse_error) => warn!(
                    error = %parse_error,
                    "suppressed not-found response could not be read as an empty result; \
                     reporting the fault instead"
                ),
            }
        }

        match xml::parse_error_body(response.body()) {
            Ok(body) => Err(MqError::Service(ServiceError {
                status: Some(status),
                code: body.code,
                message: body.message,
                request_id: body.request_id,
                host_id: body.host_id,
            })),
            Err(parse_error) => {
                debug!(error = %parse_error, "fault body is not a structured error document");
                Err(MqError::Internal {
                    status,
                    body: response.text_lossy(),
                })
            }
        }
    }
}

/// Wraps a transport fault into a typed service error so callers see one
/// error shape for both transport and service failures.
#[derive(Debug, Default)]
pub struct TransportFaultHandler;

impl FaultHandler for TransportFaultHandler {
    fn handle(
        &self,
        _context: &mut ExecutionContext<'_>,
        _response: Option<ResponseModel>,
        error: &MqError,
    ) -> MqxResult<Disposition> {
        Err(MqError::Service(ServiceError {
            status: None,
            code: None,
            message: Some(error.to_string()),
            request_id: None,
            host_id: None,
        }))
    }
}
