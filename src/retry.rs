use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

use crate::MqxResult;
use crate::context::ExecutionContext;
use crate::error::{FaultKind, MqError, TransportErrorKind};
use crate::pipeline::{Chain, Handler, roles};
use crate::request::RequestBody;
use crate::xml;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const BASE_BACKOFF_MS: u64 = 100;
const BACKOFF_FACTOR: u64 = 4;
const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-attempt retry decisions: eligibility, the fault decision table, the
/// attempt ceiling and the capped exponential backoff. Stateless across
/// calls; the attempt counter lives in the execution context.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_retries: u32,
    max_backoff: Duration,
    retryable_transport_kinds: BTreeSet<TransportErrorKind>,
    retryable_error_codes: BTreeSet<String>,
    retryable_status_codes: BTreeSet<u16>,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_backoff: DEFAULT_MAX_BACKOFF,
            retryable_transport_kinds: default_retryable_transport_kinds(),
            retryable_error_codes: default_retryable_error_codes(),
            retryable_status_codes: default_retryable_status_codes(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(Duration::from_millis(1));
        self
    }

    pub fn retryable_transport_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retryable_error_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_error_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// A call is eligible for retry only when its body, if any, can be
    /// replayed unchanged.
    pub fn can_retry(&self, context: &ExecutionContext<'_>) -> bool {
        context
            .request()
            .and_then(|request| request.body())
            .is_none_or(RequestBody::is_replayable)
    }

    pub fn retry_limit_reached(&self, context: &ExecutionContext<'_>) -> bool {
        context.attempt() >= self.max_retries
    }

    pub fn should_retry(&self, context: &ExecutionContext<'_>, error: &MqError) -> bool {
        match error {
            MqError::Transport { kind, .. } => self.retryable_transport_kinds.contains(kind),
            MqError::HttpFault { status } => self.should_retry_status(context, status.as_u16()),
            MqError::Internal { status, .. } => self.should_retry_status(context, status.as_u16()),
            MqError::Service(fault) => fault
                .status
                .is_some_and(|status| self.should_retry_status(context, status.as_u16())),
            _ => false,
        }
    }

    fn should_retry_status(&self, context: &ExecutionContext<'_>, status: u16) -> bool {
        if status == 500 || status == 503 {
            return true;
        }
        if (status == 400 || status == 503) && self.fault_body_code_is_retryable(context) {
            return true;
        }
        self.retryable_status_codes.contains(&status)
    }

    /// Peeks at the buffered fault body for a known throttling/timeout
    /// error code. The body stays in the context for the error handler.
    fn fault_body_code_is_retryable(&self, context: &ExecutionContext<'_>) -> bool {
        let Some(response) = context.response() else {
            return false;
        };
        let Ok(body) = xml::parse_error_body(response.body()) else {
            return false;
        };
        body.code
            .is_some_and(|code| self.retryable_error_codes.contains(&code))
    }

    /// `min(100ms * 4^attempt, max_backoff)`; `attempt` is the zero-based
    /// retry count before the wait.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = BACKOFF_FACTOR.saturating_pow(attempt.min(16));
        Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(multiplier)).min(self.max_backoff)
    }

    /// Suspends for the backoff delay; a cancellation observed during the
    /// wait aborts the call with a cancellation fault.
    pub async fn wait_before_retry(&self, context: &ExecutionContext<'_>) -> MqxResult<()> {
        let delay = self.backoff_delay(context.attempt());
        tokio::select! {
            () = context.cancellation().cancelled() => Err(MqError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Blocking counterpart: sleeps in short slices so a cancellation is
    /// observed promptly.
    pub fn wait_before_retry_blocking(&self, context: &ExecutionContext<'_>) -> MqxResult<()> {
        let deadline = Instant::now() + self.backoff_delay(context.attempt());
        loop {
            if context.cancellation().is_cancelled() {
                return Err(MqError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(CANCELLATION_POLL_INTERVAL));
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_transport_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Dns,
        TransportErrorKind::Connect,
        TransportErrorKind::Tls,
        TransportErrorKind::Timeout,
        TransportErrorKind::Read,
        TransportErrorKind::Other,
    ]
    .into_iter()
    .collect()
}

fn default_retryable_error_codes() -> BTreeSet<String> {
    [
        "Throttling",
        "ThrottlingException",
        "RequestTimeout",
        "RequestTimeoutException",
        "ServiceUnavailable",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429_u16, 502, 504].into_iter().collect()
}

/// Pipeline stage that re-enters its inner chain (signer onward) until the
/// call succeeds, the policy declines, or the retry limit is reached. The
/// request body is rewound before each re-entry so the same payload goes
/// back out.
#[derive(Debug)]
pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    fn should_attempt(&self, context: &ExecutionContext<'_>, error: &MqError) -> bool {
        // Marshalling, configuration and cancellation faults never reach the
        // decision table.
        if matches!(
            error.kind(),
            FaultKind::Marshalling | FaultKind::Configuration | FaultKind::Cancelled
        ) {
            return false;
        }
        self.policy.can_retry(context)
            && !self.policy.retry_limit_reached(context)
            && self.policy.should_retry(context, error)
    }

    fn prepare_reentry(context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        context.increment_attempt();
        context.take_response();
        if let Some(body) = context.request_mut()?.body_mut() {
            body.rewind().map_err(|source| {
                MqError::marshalling(format!("failed to rewind request body for retry: {source}"))
            })?;
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Handler for RetryHandler {
    fn role(&self) -> &'static str {
        roles::RETRY
    }

    fn invoke(&self, chain: Chain<'_>, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        loop {
            let error = match chain.proceed(context) {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            if !self.should_attempt(context, &error) {
                return Err(error);
            }
            warn!(
                attempt = context.attempt(),
                delay_ms = self.policy.backoff_delay(context.attempt()).as_millis() as u64,
                error = %error,
                "retrying call after fault"
            );
            self.policy.wait_before_retry_blocking(context)?;
            Self::prepare_reentry(context)?;
        }
    }

    async fn invoke_async(
        &self,
        chain: Chain<'_>,
        context: &mut ExecutionContext<'_>,
    ) -> MqxResult<()> {
        loop {
            let error = match chain.proceed_async(context).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            if !self.should_attempt(context, &error) {
                return Err(error);
            }
            warn!(
                attempt = context.attempt(),
                delay_ms = self.policy.backoff_delay(context.attempt()).as_millis() as u64,
                error = %error,
                "retrying call after fault"
            );
            self.policy.wait_before_retry(context).await?;
            Self::prepare_reentry(context)?;
        }
    }
}
