use std::any::Any;
use std::time::SystemTime;

use async_trait::async_trait;
use http::Uri;
use http::header::{self, HeaderName, HeaderValue};

use crate::MqxResult;
use crate::context::{ErasedCall, ExecutionContext};
use crate::error::MqError;
use crate::pipeline::{Chain, Handler, roles};
use crate::request::{RequestBody, ServiceRequest};
use crate::response::ResponseModel;

/// The marshal/unmarshal boundary of a typed API call.
///
/// `marshal` is a pure transform from the typed call into a request model;
/// `unmarshal` turns the buffered response into the typed output and must
/// tolerate an empty body (the suppressed-404 empty result re-uses it).
pub trait ServiceCall: Send + Sync {
    type Output: Send + 'static;

    fn marshal(&self) -> MqxResult<ServiceRequest>;

    fn unmarshal(&self, response: &ResponseModel) -> MqxResult<Self::Output>;

    /// Opt-in: treat an HTTP 404 as a valid empty result instead of a fault.
    fn suppress_not_found(&self) -> bool {
        false
    }
}

pub(crate) struct CallAdapter<'a, C: ServiceCall> {
    call: &'a C,
}

impl<'a, C: ServiceCall> CallAdapter<'a, C> {
    pub(crate) fn new(call: &'a C) -> Self {
        Self { call }
    }
}

impl<C: ServiceCall> ErasedCall for CallAdapter<'_, C> {
    fn marshal(&self) -> MqxResult<ServiceRequest> {
        self.call.marshal()
    }

    fn unmarshal(&self, response: ResponseModel) -> MqxResult<Box<dyn Any + Send>> {
        let output = self.call.unmarshal(&response)?;
        Ok(Box::new(output))
    }

    fn suppress_not_found(&self) -> bool {
        self.call.suppress_not_found()
    }
}

/// Pipeline stage that converts the typed call into a request model and
/// injects the protocol-required headers. Runs once per logical call; the
/// guard on the request slot makes a second invocation a no-op.
pub struct MarshallerHandler {
    endpoint: Uri,
    user_agent: HeaderValue,
}

impl MarshallerHandler {
    pub fn new(endpoint: Uri, user_agent: HeaderValue) -> Self {
        Self {
            endpoint,
            user_agent,
        }
    }

    fn prepare(&self, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        if context.request().is_some() {
            return Ok(());
        }

        let mut request = context.marshal_call()?;
        request.set_endpoint(self.endpoint.clone());
        self.inject_protocol_headers(&mut request)?;
        context.set_request(request);
        Ok(())
    }

    fn inject_protocol_headers(&self, request: &mut ServiceRequest) -> MqxResult<()> {
        let authority = self
            .endpoint
            .authority()
            .ok_or_else(|| MqError::configuration("endpoint has no authority"))?;
        let host = HeaderValue::from_str(authority.as_str())
            .map_err(|_| MqError::configuration("endpoint authority is not a valid host header"))?;
        request.insert_header(header::HOST, host);

        let date = httpdate::fmt_http_date(SystemTime::now());
        let date = HeaderValue::from_str(&date)
            .map_err(|_| MqError::marshalling("generated date header is invalid"))?;
        request.insert_header(header::DATE, date);

        if !request.headers().contains_key(header::CONTENT_TYPE) {
            request.insert_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static(crate::DEFAULT_CONTENT_TYPE),
            );
        }

        request.insert_header(header::USER_AGENT, self.user_agent.clone());
        request.insert_header(
            HeaderName::from_static(crate::VERSION_HEADER),
            HeaderValue::from_static(crate::SERVICE_VERSION),
        );

        if let Some(RequestBody::Streaming(body)) = request.body() {
            let content_length = HeaderValue::from(body.content_length());
            request.insert_header(header::CONTENT_LENGTH, content_length);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MarshallerHandler {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MarshallerHandler")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[async_trait(?Send)]
impl Handler for MarshallerHandler {
    fn role(&self) -> &'static str {
        roles::MARSHALLER
    }

    fn invoke(&self, chain: Chain<'_>, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        self.prepare(context)?;
        chain.proceed(context)
    }

    async fn invoke_async(
        &self,
        chain: Chain<'_>,
        context: &mut ExecutionContext<'_>,
    ) -> MqxResult<()> {
        self.prepare(context)?;
        chain.proceed_async(context).await
    }
}

/// Pipeline stage whose post-work turns the successful response into the
/// typed result. The response is taken out of the context so the transport
/// buffer is released as soon as the typed output exists.
#[derive(Debug, Default)]
pub struct UnmarshallerHandler;

impl UnmarshallerHandler {
    fn complete(context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        let response = context
            .take_response()
            .ok_or_else(|| MqError::configuration("the transport stage produced no response"))?;
        context.unmarshal_response(response)
    }
}

#[async_trait(?Send)]
impl Handler for UnmarshallerHandler {
    fn role(&self) -> &'static str {
        roles::UNMARSHALLER
    }

    fn invoke(&self, chain: Chain<'_>, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        chain.proceed(context)?;
        Self::complete(context)
    }

    async fn invoke_async(
        &self,
        chain: Chain<'_>,
        context: &mut ExecutionContext<'_>,
    ) -> MqxResult<()> {
        chain.proceed_async(context).await?;
        Self::complete(context)
    }
}
