use std::any::Any;

use tokio_util::sync::CancellationToken;

use crate::MqxResult;
use crate::credentials::ServiceCredentials;
use crate::error::MqError;
use crate::request::ServiceRequest;
use crate::response::ResponseModel;

/// Object-safe view of a typed call; the pipeline stores the unmarshalled
/// output behind `Any` and the invoke boundary downcasts it back.
pub(crate) trait ErasedCall: Send + Sync {
    fn marshal(&self) -> MqxResult<ServiceRequest>;
    fn unmarshal(&self, response: ResponseModel) -> MqxResult<Box<dyn Any + Send>>;
    fn suppress_not_found(&self) -> bool;
}

/// Per-call mutable state threaded through the handler chain.
///
/// All of it lives here rather than in the handler nodes, so independent
/// calls sharing one pipeline never interleave their state. The lifetime is
/// one logical call including every retry.
pub struct ExecutionContext<'call> {
    call: &'call dyn ErasedCall,
    request: Option<ServiceRequest>,
    credentials: Option<ServiceCredentials>,
    response: Option<ResponseModel>,
    result: Option<Box<dyn Any + Send>>,
    attempt: u32,
    cancellation: CancellationToken,
}

impl<'call> ExecutionContext<'call> {
    pub(crate) fn new(call: &'call dyn ErasedCall, cancellation: CancellationToken) -> Self {
        Self {
            call,
            request: None,
            credentials: None,
            response: None,
            result: None,
            attempt: 0,
            cancellation,
        }
    }

    /// Runs the typed call's marshal step.
    pub fn marshal_call(&self) -> MqxResult<ServiceRequest> {
        self.call.marshal()
    }

    /// Runs the typed call's unmarshal step over the given response and
    /// stores the result. The response is dropped afterwards.
    pub fn unmarshal_response(&mut self, response: ResponseModel) -> MqxResult<()> {
        self.result = Some(self.call.unmarshal(response)?);
        Ok(())
    }

    pub fn suppress_not_found(&self) -> bool {
        self.call.suppress_not_found()
    }

    pub fn request(&self) -> Option<&ServiceRequest> {
        self.request.as_ref()
    }

    /// The built request model; a configuration fault before the marshaller
    /// has run.
    pub fn request_mut(&mut self) -> MqxResult<&mut ServiceRequest> {
        self.request
            .as_mut()
            .ok_or_else(|| MqError::configuration("the marshaller stage has not built a request"))
    }

    pub fn set_request(&mut self, request: ServiceRequest) {
        self.request = Some(request);
    }

    pub fn credentials(&self) -> Option<&ServiceCredentials> {
        self.credentials.as_ref()
    }

    pub fn set_credentials(&mut self, credentials: ServiceCredentials) {
        self.credentials = Some(credentials);
    }

    pub fn response(&self) -> Option<&ResponseModel> {
        self.response.as_ref()
    }

    pub fn set_response(&mut self, response: ResponseModel) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<ResponseModel> {
        self.response.take()
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    pub(crate) fn take_result(&mut self) -> Option<Box<dyn Any + Send>> {
        self.result.take()
    }

    /// Completed retries so far; 0 on the first attempt. Incremented only
    /// by the retry stage.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn increment_attempt(&mut self) {
        self.attempt += 1;
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl std::fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ExecutionContext")
            .field("request", &self.request)
            .field("attempt", &self.attempt)
            .field("has_credentials", &self.credentials.is_some())
            .field("has_response", &self.response.is_some())
            .field("has_result", &self.result.is_some())
            .finish()
    }
}
