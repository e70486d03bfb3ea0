use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::debug;

use crate::MqxResult;
use crate::context::ExecutionContext;
use crate::error::{MqError, TransportErrorKind};
use crate::pipeline::{Chain, Handler, roles};
use crate::request::ServiceRequest;
use crate::response::ResponseModel;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The network seam of the pipeline. Implementations send the request model
/// and either hand back a buffered response (whatever its status) or report
/// a transport fault with a classified kind.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, request: &mut ServiceRequest) -> MqxResult<ResponseModel>;

    fn exchange_blocking(&self, request: &mut ServiceRequest) -> MqxResult<ResponseModel>;
}

/// Terminus of the handler chain. Never delegates inward; it performs the
/// exchange, stores the response in the context for the outer stages, and
/// raises a raw HTTP fault for non-2xx statuses.
pub struct TransportHandler {
    transport: Arc<dyn Transport>,
}

impl TransportHandler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn complete(context: &mut ExecutionContext<'_>, response: ResponseModel) -> MqxResult<()> {
        let status = response.status();
        context.set_response(response);
        if status.is_success() {
            Ok(())
        } else {
            Err(MqError::HttpFault { status })
        }
    }
}

impl std::fmt::Debug for TransportHandler {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("TransportHandler").finish()
    }
}

#[async_trait(?Send)]
impl Handler for TransportHandler {
    fn role(&self) -> &'static str {
        roles::TRANSPORT
    }

    fn invoke(&self, _chain: Chain<'_>, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        if context.cancellation().is_cancelled() {
            return Err(MqError::Cancelled);
        }
        let attempt = context.attempt();
        let request = context.request_mut()?;
        debug!(
            method = %request.method(),
            path = request.resource_path(),
            attempt,
            "dispatching request"
        );
        let response = self.transport.exchange_blocking(request)?;
        Self::complete(context, response)
    }

    async fn invoke_async(
        &self,
        _chain: Chain<'_>,
        context: &mut ExecutionContext<'_>,
    ) -> MqxResult<()> {
        let cancellation = context.cancellation().clone();
        if cancellation.is_cancelled() {
            return Err(MqError::Cancelled);
        }
        let attempt = context.attempt();
        let request = context.request_mut()?;
        debug!(
            method = %request.method(),
            path = request.resource_path(),
            attempt,
            "dispatching request"
        );
        let response = tokio::select! {
            () = cancellation.cancelled() => return Err(MqError::Cancelled),
            result = self.transport.exchange(request) => result?,
        };
        Self::complete(context, response)
    }
}

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Default transport: a hyper client over a rustls (ring) HTTPS connector.
///
/// The blocking exchange runs on a private current-thread runtime, created
/// lazily on first use, so a pipeline that only ever runs asynchronously
/// never owns one.
pub struct HyperTransport {
    client: HttpsClient,
    request_timeout: Duration,
    blocking_runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl HyperTransport {
    pub fn try_new() -> MqxResult<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(request_timeout: Duration) -> MqxResult<Self> {
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| {
                MqError::configuration(format!("failed to initialize tls backend: {source}"))
            })?
            .https_or_http()
            .enable_http1()
            .build();
        let client: HttpsClient = Client::builder(TokioExecutor::new()).build(https);
        Ok(Self {
            client,
            request_timeout: request_timeout.max(Duration::from_millis(1)),
            blocking_runtime: Mutex::new(None),
        })
    }

    async fn exchange_inner(&self, request: &mut ServiceRequest) -> MqxResult<ResponseModel> {
        let uri = request_uri(request)?;
        let body = match request.body_mut() {
            Some(body) => body.to_bytes().map_err(|source| {
                MqError::marshalling(format!("failed to read request body: {source}"))
            })?,
            None => Bytes::new(),
        };

        let mut builder = Request::builder().method(request.method().clone()).uri(uri);
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }
        let http_request = builder.body(Full::new(body)).map_err(|source| {
            MqError::marshalling(format!("failed to build http request: {source}"))
        })?;

        let response = match timeout(self.request_timeout, self.client.request(http_request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                return Err(MqError::Transport {
                    kind: classify_transport_error(&source),
                    message: source.to_string(),
                });
            }
            Err(_) => {
                return Err(MqError::Transport {
                    kind: TransportErrorKind::Timeout,
                    message: format!(
                        "transport exchange timed out after {}ms",
                        self.request_timeout.as_millis()
                    ),
                });
            }
        };

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|source| MqError::Transport {
                kind: TransportErrorKind::Read,
                message: format!("failed to read response body: {source}"),
            })?
            .to_bytes();
        Ok(ResponseModel::new(parts.status, parts.headers, body))
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn exchange(&self, request: &mut ServiceRequest) -> MqxResult<ResponseModel> {
        self.exchange_inner(request).await
    }

    fn exchange_blocking(&self, request: &mut ServiceRequest) -> MqxResult<ResponseModel> {
        let mut guard = lock_unpoisoned(&self.blocking_runtime);
        let runtime = match guard.as_mut() {
            Some(runtime) => runtime,
            None => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|source| {
                        MqError::configuration(format!(
                            "failed to start blocking transport runtime: {source}"
                        ))
                    })?;
                guard.insert(runtime)
            }
        };
        runtime.block_on(self.exchange_inner(request))
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Assembles the full request URI: endpoint authority + resource path +
/// the wire query string (sub-resource markers and percent-encoded query
/// parameters).
fn request_uri(request: &ServiceRequest) -> MqxResult<Uri> {
    let endpoint = request
        .endpoint()
        .ok_or_else(|| MqError::configuration("request has no endpoint"))?;
    let scheme = endpoint.scheme_str().unwrap_or("http");
    let authority = endpoint
        .authority()
        .ok_or_else(|| MqError::configuration("endpoint has no authority"))?;

    let mut path_and_query = if request.resource_path().starts_with('/') {
        request.resource_path().to_owned()
    } else {
        format!("/{}", request.resource_path())
    };
    let query = wire_query_string(request);
    if !query.is_empty() {
        path_and_query.push('?');
        path_and_query.push_str(&query);
    }

    Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|source| MqError::marshalling(format!("failed to assemble request uri: {source}")))
}

fn wire_query_string(request: &ServiceRequest) -> String {
    let mut parts = Vec::new();
    for (name, value) in request.sub_resources() {
        match value {
            Some(value) => parts.push(format!("{name}={value}")),
            None => parts.push(name.clone()),
        }
    }

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in request.query_parameters() {
        serializer.append_pair(name, value);
    }
    let encoded = serializer.finish();
    if !encoded.is_empty() {
        parts.push(encoded);
    }
    parts.join("&")
}

fn classify_transport_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    if error.is_connect() {
        let text = error.to_string().to_ascii_lowercase();
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    let text = error.to_string().to_ascii_lowercase();
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}
