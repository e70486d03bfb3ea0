use std::sync::Arc;

use async_trait::async_trait;

use crate::MqxResult;
use crate::context::ExecutionContext;
use crate::error::MqError;
use crate::pipeline::{Chain, Handler, roles};

/// An immutable access-key/secret-key/session-token snapshot, taken once
/// per logical call and reused across its retries.
#[derive(Clone)]
pub struct ServiceCredentials {
    access_key: String,
    secret_key: String,
    security_token: Option<String>,
}

impl ServiceCredentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            security_token: None,
        }
    }

    pub fn with_security_token(mut self, security_token: impl Into<String>) -> Self {
        self.security_token = Some(security_token.into());
        self
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    pub fn security_token(&self) -> Option<&str> {
        self.security_token.as_deref()
    }
}

impl std::fmt::Debug for ServiceCredentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ServiceCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("security_token", &self.security_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> MqxResult<ServiceCredentials>;
}

/// Serves a fixed credential snapshot; the common case for long-lived keys.
#[derive(Clone, Debug)]
pub struct StaticCredentialProvider {
    credentials: ServiceCredentials,
}

impl StaticCredentialProvider {
    pub fn new(credentials: ServiceCredentials) -> Self {
        Self { credentials }
    }

    /// Reads `MQ_ACCESS_KEY_ID` / `MQ_ACCESS_KEY_SECRET` and the optional
    /// `MQ_SECURITY_TOKEN` from the process environment.
    pub fn from_env() -> MqxResult<Self> {
        let access_key = std::env::var("MQ_ACCESS_KEY_ID")
            .map_err(|_| MqError::configuration("MQ_ACCESS_KEY_ID is not set"))?;
        let secret_key = std::env::var("MQ_ACCESS_KEY_SECRET")
            .map_err(|_| MqError::configuration("MQ_ACCESS_KEY_SECRET is not set"))?;
        let mut credentials = ServiceCredentials::new(access_key, secret_key);
        if let Ok(token) = std::env::var("MQ_SECURITY_TOKEN") {
            credentials = credentials.with_security_token(token);
        }
        Ok(Self { credentials })
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn credentials(&self) -> MqxResult<ServiceCredentials> {
        Ok(self.credentials.clone())
    }
}

/// Pipeline stage that resolves credentials once per logical call and
/// stores the snapshot in the execution context before the signer runs.
/// With no provider configured the context stays bare and the signer skips
/// signing.
pub struct CredentialsHandler {
    provider: Option<Arc<dyn CredentialProvider>>,
}

impl CredentialsHandler {
    pub fn new(provider: Option<Arc<dyn CredentialProvider>>) -> Self {
        Self { provider }
    }

    fn prepare(&self, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        if context.credentials().is_none()
            && let Some(provider) = &self.provider
        {
            context.set_credentials(provider.credentials()?);
        }
        Ok(())
    }
}

impl std::fmt::Debug for CredentialsHandler {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CredentialsHandler")
            .field("configured", &self.provider.is_some())
            .finish()
    }
}

#[async_trait(?Send)]
impl Handler for CredentialsHandler {
    fn role(&self) -> &'static str {
        roles::CREDENTIALS
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
