use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Uri;
use http::header::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

use crate::MqxResult;
use crate::context::ExecutionContext;
use crate::credentials::{CredentialProvider, CredentialsHandler};
use crate::error::MqError;
use crate::fault::{ErrorHandler, FaultHandlerRegistry};
use crate::marshal::{CallAdapter, MarshallerHandler, ServiceCall, UnmarshallerHandler};
use crate::retry::{RetryHandler, RetryPolicy};
use crate::sign::SignerHandler;
use crate::transport::{HyperTransport, Transport, TransportHandler};

const DEFAULT_CLIENT_NAME: &str = "mqx";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Role tags of the standard chain, used to address stages for structural
/// mutation independent of their position.
pub mod roles {
    pub const ERROR: &str = "error";
    pub const MARSHALLER: &str = "marshaller";
    pub const UNMARSHALLER: &str = "unmarshaller";
    pub const CREDENTIALS: &str = "credentials";
    pub const RETRY: &str = "retry";
    pub const SIGNER: &str = "signer";
    pub const TRANSPORT: &str = "transport";
}

/// One stage of the handler chain.
///
/// The default behavior of both entry points is to delegate to the next
/// inner stage, which makes the innermost handler (the transport) the
/// natural terminus: delegating past it is a configuration fault. Handlers
/// hold only read-only configuration; all per-call state lives in the
/// [`ExecutionContext`].
#[async_trait(?Send)]
pub trait Handler: Send + Sync {
    fn role(&self) -> &'static str;

    fn invoke(&self, chain: Chain<'_>, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        chain.proceed(context)
    }

    async fn invoke_async(
        &self,
        chain: Chain<'_>,
        context: &mut ExecutionContext<'_>,
    ) -> MqxResult<()> {
        chain.proceed_async(context).await
    }
}

/// Cursor over the stages still ahead of the current one. `proceed` enters
/// the next inner stage; pre-work before the call and post-work after it is
/// how stages wrap the rest of the chain.
#[derive(Clone, Copy)]
pub struct Chain<'a> {
    remaining: &'a [Arc<dyn Handler>],
}

impl Chain<'_> {
    pub fn proceed(self, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        let Some((next, rest)) = self.remaining.split_first() else {
            return Err(MqError::configuration(
                "the pipeline has no inner handler past the current stage",
            ));
        };
        next.invoke(Chain { remaining: rest }, context)
    }

    pub async fn proceed_async(self, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        let Some((next, rest)) = self.remaining.split_first() else {
            return Err(MqError::configuration(
                "the pipeline has no inner handler past the current stage",
            ));
        };
        next.invoke_async(Chain { remaining: rest }, context).await
    }
}

/// The ordered handler chain and the entry points that drive it.
///
/// Stages are stored entry-first: index 0 is the outermost handler, the
/// last element is the transport-adjacent terminus. Keeping the chain in a
/// plain vector makes the "exactly one entry, exactly one terminus, no
/// cycle" invariant structural, and mutation a matter of validated splices.
///
/// Mutation requires `&mut self` and therefore cannot overlap an in-flight
/// invocation; construct the chain fully before sharing the pipeline.
pub struct Pipeline {
    stages: Vec<Arc<dyn Handler>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn builder(endpoint: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(endpoint)
    }

    /// Adds a stage at the inner end of the chain; the first appended
    /// handler is the entry point and the last one appended becomes the
    /// terminus.
    pub fn append(&mut self, handler: Arc<dyn Handler>) {
        self.stages.push(handler);
    }

    /// Splices a stage in on the outer side of the named role.
    pub fn insert_before(&mut self, role: &str, handler: Arc<dyn Handler>) -> MqxResult<()> {
        let index = self.position(role)?;
        self.stages.insert(index, handler);
        Ok(())
    }

    /// Splices a stage in on the inner side of the named role.
    pub fn insert_after(&mut self, role: &str, handler: Arc<dyn Handler>) -> MqxResult<()> {
        let index = self.position(role)?;
        self.stages.insert(index + 1, handler);
        Ok(())
    }

    /// Removes the named stage, re-linking its neighbors. Removing the last
    /// remaining stage is a configuration fault.
    pub fn remove(&mut self, role: &str) -> MqxResult<()> {
        let index = self.position(role)?;
        if self.stages.len() == 1 {
            return Err(MqError::configuration(format!(
                "removing handler `{role}` would leave the pipeline empty"
            )));
        }
        self.stages.remove(index);
        Ok(())
    }

    /// Swaps the named stage for a new handler, keeping its position.
    pub fn replace(&mut self, role: &str, handler: Arc<dyn Handler>) -> MqxResult<()> {
        let index = self.position(role)?;
        self.stages[index] = handler;
        Ok(())
    }

    fn position(&self, role: &str) -> MqxResult<usize> {
        self.stages
            .iter()
            .position(|stage| stage.role() == role)
            .ok_or_else(|| {
                MqError::configuration(format!("no handler with role `{role}` in the pipeline"))
            })
    }

    /// Role tags in traversal order, entry point first.
    pub fn roles(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.role()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Executes the call synchronously, blocking the calling thread through
    /// the exchange and any backoff sleeps.
    pub fn invoke<C: ServiceCall>(&self, call: &C) -> MqxResult<C::Output> {
        self.invoke_with(call, CancellationToken::new())
    }

    pub fn invoke_with<C: ServiceCall>(
        &self,
        call: &C,
        cancellation: CancellationToken,
    ) -> MqxResult<C::Output> {
        let adapter = CallAdapter::new(call);
        let mut context = ExecutionContext::new(&adapter, cancellation);
        let span = info_span!("mqx.call", stages = self.stages.len());
        {
            let _enter = span.enter();
            Chain {
                remaining: &self.stages,
            }
            .proceed(&mut context)?;
        }
        Self::take_result(&mut context)
    }

    /// Executes the call asynchronously. Each stage awaits its inner chain
    /// and performs its post-work inline, preserving the outer-to-inner /
    /// inner-to-outer order guarantee of the synchronous path.
    pub async fn invoke_async<C: ServiceCall>(&self, call: &C) -> MqxResult<C::Output> {
        self.invoke_async_with(call, CancellationToken::new()).await
    }

    pub async fn invoke_async_with<C: ServiceCall>(
        &self,
        call: &C,
        cancellation: CancellationToken,
    ) -> MqxResult<C::Output> {
        let adapter = CallAdapter::new(call);
        let mut context = ExecutionContext::new(&adapter, cancellation);
        let span = info_span!("mqx.call", stages = self.stages.len());
        Chain {
            remaining: &self.stages,
        }
        .proceed_async(&mut context)
        .instrument(span)
        .await?;
        Self::take_result(&mut context)
    }

    fn take_result<O: Send + 'static>(context: &mut ExecutionContext<'_>) -> MqxResult<O> {
        let result = context.take_result().ok_or_else(|| {
            MqError::configuration("the pipeline completed without producing a result")
        })?;
        match result.downcast::<O>() {
            Ok(output) => Ok(*output),
            Err(_) => Err(MqError::configuration(
                "the pipeline produced a result of an unexpected type",
            )),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Pipeline")
            .field("roles", &self.roles())
            .finish()
    }
}

/// Assembles the standard chain: error handling outermost, then marshal /
/// unmarshal, credential resolution, the retry loop, and signing plus the
/// transport inside it, so every retry refreshes the date header and the
/// signature without re-marshalling.
pub struct PipelineBuilder {
    endpoint: String,
    client_name: String,
    credential_provider: Option<Arc<dyn CredentialProvider>>,
    retry_policy: RetryPolicy,
    fault_handlers: FaultHandlerRegistry,
    transport: Option<Arc<dyn Transport>>,
    request_timeout: Duration,
}

impl PipelineBuilder {
    pub(crate) fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            credential_provider: None,
            retry_policy: RetryPolicy::standard(),
            fault_handlers: FaultHandlerRegistry::standard(),
            transport: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credential_provider = Some(provider);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn fault_handlers(mut self, fault_handlers: FaultHandlerRegistry) -> Self {
        self.fault_handlers = fault_handlers;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn try_build(self) -> MqxResult<Pipeline> {
        let endpoint: Uri = self.endpoint.parse().map_err(|_| {
            MqError::configuration(format!("invalid endpoint `{}`", self.endpoint))
        })?;
        if endpoint.authority().is_none() {
            return Err(MqError::configuration(format!(
                "endpoint `{}` has no authority",
                self.endpoint
            )));
        }

        let user_agent = format!("{}/{}", self.client_name, env!("CARGO_PKG_VERSION"));
        let user_agent = HeaderValue::from_str(&user_agent)
            .map_err(|_| MqError::configuration("client name is not a valid header value"))?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::with_timeout(self.request_timeout)?),
        };

        let mut pipeline = Pipeline::new();
        pipeline.append(Arc::new(ErrorHandler::new(self.fault_handlers)));
        pipeline.append(Arc::new(MarshallerHandler::new(endpoint, user_agent)));
        pipeline.append(Arc::new(UnmarshallerHandler));
        pipeline.append(Arc::new(CredentialsHandler::new(self.credential_provider)));
        pipeline.append(Arc::new(RetryHandler::new(self.retry_policy)));
        pipeline.append(Arc::new(SignerHandler));
        pipeline.append(Arc::new(TransportHandler::new(transport)));
        Ok(pipeline)
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PipelineBuilder")
            .field("endpoint", &self.endpoint)
            .field("client_name", &self.client_name)
            .field("has_credentials", &self.credential_provider.is_some())
            .finish()
    }
}
