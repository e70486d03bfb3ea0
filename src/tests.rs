use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::MqxResult;
use crate::context::ExecutionContext;
use crate::credentials::{ServiceCredentials, StaticCredentialProvider};
use crate::error::{MqError, TransportErrorKind};
use crate::fault::FaultHandlerRegistry;
use crate::marshal::{CallAdapter, ServiceCall};
use crate::pipeline::{Chain, Handler, Pipeline, roles};
use crate::request::{RequestBody, ServiceRequest, StreamingBody};
use crate::response::ResponseModel;
use crate::retry::RetryPolicy;
use crate::transport::Transport;

enum Scripted {
    Status(u16, &'static str),
    Fault(TransportErrorKind),
}

struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    exchanges: AtomicUsize,
    seen_headers: Mutex<Vec<HeaderMap>>,
    seen_bodies: Mutex<Vec<Bytes>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            exchanges: AtomicUsize::new(0),
            seen_headers: Mutex::new(Vec::new()),
            seen_bodies: Mutex::new(Vec::new()),
        })
    }

    fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    fn last_headers(&self) -> HeaderMap {
        self.seen_headers
            .lock()
            .expect("header log lock")
            .last()
            .cloned()
            .expect("at least one exchange should have happened")
    }

    fn bodies(&self) -> Vec<Bytes> {
        self.seen_bodies.lock().expect("body log lock").clone()
    }

    fn respond(&self, request: &mut ServiceRequest) -> MqxResult<ResponseModel> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        self.seen_headers
            .lock()
            .expect("header log lock")
            .push(request.headers().clone());
        let body = match request.body_mut() {
            Some(body) => body.to_bytes().expect("scripted transport reads the body"),
            None => Bytes::new(),
        };
        self.seen_bodies.lock().expect("body log lock").push(body);

        match self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .expect("script should not be exhausted")
        {
            Scripted::Status(status, body) => Ok(ResponseModel::new(
                StatusCode::from_u16(status).expect("scripted status is valid"),
                HeaderMap::new(),
                Bytes::from_static(body.as_bytes()),
            )),
            Scripted::Fault(kind) => Err(MqError::Transport {
                kind,
                message: "scripted transport fault".to_owned(),
            }),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn exchange(&self, request: &mut ServiceRequest) -> MqxResult<ResponseModel> {
        self.respond(request)
    }

    fn exchange_blocking(&self, request: &mut ServiceRequest) -> MqxResult<ResponseModel> {
        self.respond(request)
    }
}

struct TextCall;

impl ServiceCall for TextCall {
    type Output = String;

    fn marshal(&self) -> MqxResult<ServiceRequest> {
        let mut request = ServiceRequest::new(Method::GET, "/queues/demo/messages");
        request.add_query_parameter("numOfMessages", "16");
        Ok(request)
    }

    fn unmarshal(&self, response: &ResponseModel) -> MqxResult<String> {
        Ok(response.text_lossy())
    }
}

struct SuppressedCall;

impl ServiceCall for SuppressedCall {
    type Output = String;

    fn marshal(&self) -> MqxResult<ServiceRequest> {
        Ok(ServiceRequest::new(Method::GET, "/queues/demo/messages"))
    }

    fn unmarshal(&self, response: &ResponseModel) -> MqxResult<String> {
        Ok(response.text_lossy())
    }

    fn suppress_not_found(&self) -> bool {
        true
    }
}

struct FailingUnmarshalCall;

impl ServiceCall for FailingUnmarshalCall {
    type Output = String;

    fn marshal(&self) -> MqxResult<ServiceRequest> {
        Ok(ServiceRequest::new(Method::GET, "/queues/demo/messages"))
    }

    fn unmarshal(&self, _response: &ResponseModel) -> MqxResult<String> {
        Err(MqError::marshalling("response payload is malformed"))
    }
}

struct PublishCall {
    replayable: bool,
}

impl ServiceCall for PublishCall {
    type Output = String;

    fn marshal(&self) -> MqxResult<ServiceRequest> {
        let mut request = ServiceRequest::new(Method::POST, "/topics/demo/messages");
        let body = if self.replayable {
            RequestBody::Streaming(
                StreamingBody::seekable(Cursor::new(b"payload".to_vec()), 7)
                    .map_err(|source| MqError::marshalling(source.to_string()))?,
            )
        } else {
            RequestBody::Streaming(StreamingBody::unbuffered(Cursor::new(b"payload".to_vec()), 7))
        };
        request.set_body(body);
        Ok(request)
    }

    fn unmarshal(&self, response: &ResponseModel) -> MqxResult<String> {
        Ok(response.text_lossy())
    }
}

struct AttemptProbe {
    log: Arc<Mutex<Vec<u32>>>,
}

#[async_trait(?Send)]
impl Handler for AttemptProbe {
    fn role(&self) -> &'static str {
        "attempt-probe"
    }

    fn invoke(&self, chain: Chain<'_>, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        self.log.lock().expect("probe lock").push(context.attempt());
        chain.proceed(context)
    }

    async fn invoke_async(
        &self,
        chain: Chain<'_>,
        context: &mut ExecutionContext<'_>,
    ) -> MqxResult<()> {
        self.log.lock().expect("probe lock").push(context.attempt());
        chain.proceed_async(context).await
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy::standard().max_backoff(Duration::from_millis(1))
}

fn test_pipeline(transport: &Arc<ScriptedTransport>, policy: RetryPolicy) -> Pipeline {
    Pipeline::builder("http://mq.test.example.com")
        .credential_provider(Arc::new(StaticCredentialProvider::new(
            ServiceCredentials::new("AKID", "secret"),
        )))
        .retry_policy(policy)
        .transport(Arc::clone(transport) as Arc<dyn Transport>)
        .try_build()
        .expect("test pipeline should build")
}

const INTERNAL_FAULT: &str =
    "<Error><Code>InternalError</Code><Message>backend exploded</Message></Error>";

#[test]
fn two_server_errors_then_success_leaves_the_attempt_counter_at_two() {
    let transport = ScriptedTransport::new(vec![
        Scripted::Status(500, INTERNAL_FAULT),
        Scripted::Status(500, INTERNAL_FAULT),
        Scripted::Status(200, "ok"),
    ]);
    let mut pipeline = test_pipeline(&transport, fast_policy().max_retries(3));
    let attempts = Arc::new(Mutex::new(Vec::new()));
    pipeline
        .insert_before(
            roles::SIGNER,
            Arc::new(AttemptProbe {
                log: Arc::clone(&attempts),
            }),
        )
        .expect("signer role exists");

    let body = pipeline.invoke(&TextCall).expect("call should succeed");

    assert_eq!(body, "ok");
    assert_eq!(transport.exchanges(), 3);
    assert_eq!(*attempts.lock().expect("probe lock"), vec![0, 1, 2]);
}

#[tokio::test]
async fn the_async_path_retries_identically() {
    let transport = ScriptedTransport::new(vec![
        Scripted::Status(500, INTERNAL_FAULT),
        Scripted::Status(500, INTERNAL_FAULT),
        Scripted::Status(200, "ok"),
    ]);
    let mut pipeline = test_pipeline(&transport, fast_policy().max_retries(3));
    let attempts = Arc::new(Mutex::new(Vec::new()));
    pipeline
        .insert_before(
            roles::SIGNER,
            Arc::new(AttemptProbe {
                log: Arc::clone(&attempts),
            }),
        )
        .expect("signer role exists");

    let body = pipeline
        .invoke_async(&TextCall)
        .await
        .expect("call should succeed");

    assert_eq!(body, "ok");
    assert_eq!(transport.exchanges(), 3);
    assert_eq!(*attempts.lock().expect("probe lock"), vec![0, 1, 2]);
}

#[test]
fn a_rejected_call_is_classified_without_retrying() {
    let transport = ScriptedTransport::new(vec![Scripted::Status(
        400,
        "<Error><Code>InvalidParameter</Code><Message>numOfMessages out of range</Message>\
         <RequestId>77AB-10</RequestId><HostId>mq.test</HostId></Error>",
    )]);
    let pipeline = test_pipeline(&transport, fast_policy());

    let error = pipeline
        .invoke(&TextCall)
        .expect_err("a 400 with an unknown code must fail");

    assert_eq!(transport.exchanges(), 1);
    match error {
        MqError::Service(fault) => {
            assert_eq!(fault.status, Some(StatusCode::BAD_REQUEST));
            assert_eq!(fault.code.as_deref(), Some("InvalidParameter"));
            assert_eq!(fault.request_id.as_deref(), Some("77AB-10"));
            assert_eq!(fault.host_id.as_deref(), Some("mq.test"));
        }
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn a_throttled_call_is_retried() {
    let transport = ScriptedTransport::new(vec![
        Scripted::Status(
            400,
            "<Error><Code>Throttling</Code><Message>slow down</Message></Error>",
        ),
        Scripted::Status(200, "ok"),
    ]);
    let pipeline = test_pipeline(&transport, fast_policy());

    let body = pipeline.invoke(&TextCall).expect("throttled call should recover");
    assert_eq!(body, "ok");
    assert_eq!(transport.exchanges(), 2);
}

#[test]
fn an_exhausted_retry_surfaces_the_classified_fault() {
    let transport = ScriptedTransport::new(vec![
        Scripted::Status(503, ""),
        Scripted::Status(503, ""),
    ]);
    let pipeline = test_pipeline(&transport, fast_policy().max_retries(1));

    let error = pipeline
        .invoke(&TextCall)
        .expect_err("retries are exhausted");

    assert_eq!(transport.exchanges(), 2);
    // The empty fault body cannot be parsed, so the raw-text internal error
    // carries the status.
    match error {
        MqError::Internal { status, .. } => assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE),
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn an_unreadable_fault_body_keeps_its_raw_text() {
    let transport =
        ScriptedTransport::new(vec![Scripted::Status(400, "<html>bad gateway page</html>")]);
    let pipeline = test_pipeline(&transport, fast_policy());

    let error = pipeline.invoke(&TextCall).expect_err("the call must fail");
    match error {
        MqError::Internal { status, body } => {
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body.contains("bad gateway page"));
        }
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn a_suppressed_not_found_becomes_an_empty_result() {
    let transport = ScriptedTransport::new(vec![Scripted::Status(404, "")]);
    let pipeline = test_pipeline(&transport, fast_policy());

    let body = pipeline
        .invoke(&SuppressedCall)
        .expect("suppressed 404 should succeed");
    assert_eq!(body, "");
    assert_eq!(transport.exchanges(), 1);
}

#[test]
fn an_unsuppressed_not_found_stays_a_fault() {
    let transport = ScriptedTransport::new(vec![Scripted::Status(
        404,
        "<Error><Code>QueueNotExist</Code><Message>no such queue</Message></Error>",
    )]);
    let pipeline = test_pipeline(&transport, fast_policy());

    let error = pipeline.invoke(&TextCall).expect_err("404 must fail");
    match error {
        MqError::Service(fault) => assert_eq!(fault.code.as_deref(), Some("QueueNotExist")),
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn a_transport_fault_is_wrapped_into_a_service_error() {
    let transport =
        ScriptedTransport::new(vec![Scripted::Fault(TransportErrorKind::Connect)]);
    let pipeline = test_pipeline(&transport, RetryPolicy::disabled());

    let error = pipeline.invoke(&TextCall).expect_err("the call must fail");
    match error {
        MqError::Service(fault) => {
            assert!(fault.status.is_none());
            assert!(
                fault
                    .message
                    .as_deref()
                    .is_some_and(|message| message.contains("connect"))
            );
        }
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn a_registry_gap_propagates_the_original_error() {
    let transport =
        ScriptedTransport::new(vec![Scripted::Fault(TransportErrorKind::Connect)]);
    let pipeline = Pipeline::builder("http://mq.test.example.com")
        .retry_policy(RetryPolicy::disabled())
        .fault_handlers(FaultHandlerRegistry::empty())
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .try_build()
        .expect("pipeline should build");

    let error = pipeline.invoke(&TextCall).expect_err("the call must fail");
    match error {
        MqError::Transport { kind, .. } => assert_eq!(kind, TransportErrorKind::Connect),
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn a_non_replayable_body_is_never_retried() {
    let transport = ScriptedTransport::new(vec![Scripted::Status(500, INTERNAL_FAULT)]);
    let pipeline = test_pipeline(&transport, fast_policy());

    let error = pipeline
        .invoke(&PublishCall { replayable: false })
        .expect_err("the call must fail");
    assert_eq!(transport.exchanges(), 1);
    assert!(matches!(error, MqError::Service(_)));
}

#[test]
fn a_replayable_streaming_body_is_resent_unchanged() {
    let transport = ScriptedTransport::new(vec![
        Scripted::Status(500, INTERNAL_FAULT),
        Scripted::Status(201, "accepted"),
    ]);
    let pipeline = test_pipeline(&transport, fast_policy());

    let body = pipeline
        .invoke(&PublishCall { replayable: true })
        .expect("replayed call should succeed");
    assert_eq!(body, "accepted");
    assert_eq!(
        transport.bodies(),
        vec![Bytes::from("payload"), Bytes::from("payload")]
    );
}

#[test]
fn a_cancelled_call_never_reaches_the_transport() {
    let transport = ScriptedTransport::new(vec![Scripted::Status(200, "ok")]);
    let pipeline = test_pipeline(&transport, fast_policy());

    let cancellation = CancellationToken::new();
    cancellation.cancel();
    let error = pipeline
        .invoke_with(&TextCall, cancellation)
        .expect_err("a cancelled call must fail");

    assert!(matches!(error, MqError::Cancelled));
    assert_eq!(transport.exchanges(), 0);
}

#[test]
fn a_marshalling_fault_propagates_unchanged() {
    let transport = ScriptedTransport::new(vec![Scripted::Status(200, "ok")]);
    let pipeline = test_pipeline(&transport, fast_policy());

    let error = pipeline
        .invoke(&FailingUnmarshalCall)
        .expect_err("unmarshalling must fail");
    assert_eq!(transport.exchanges(), 1);
    assert!(matches!(error, MqError::Marshalling { .. }));
}

#[test]
fn the_signer_attaches_authorization_and_protocol_headers() {
    let transport = ScriptedTransport::new(vec![Scripted::Status(200, "ok")]);
    let pipeline = test_pipeline(&transport, fast_policy());

    pipeline.invoke(&TextCall).expect("call should succeed");
    let headers = transport.last_headers();

    let authorization = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .expect("authorization header should be present");
    assert!(authorization.starts_with("MQ AKID:"));
    assert_eq!(
        headers.get("host").and_then(|value| value.to_str().ok()),
        Some("mq.test.example.com")
    );
    assert_eq!(
        headers
            .get("x-mq-version")
            .and_then(|value| value.to_str().ok()),
        Some("2015-06-06")
    );
    assert_eq!(
        headers
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/xml")
    );
    assert!(headers.contains_key("date"));
    assert!(
        headers
            .get("user-agent")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("mqx/"))
    );
}

#[test]
fn session_credentials_attach_the_security_token_on_the_wire() {
    let transport = ScriptedTransport::new(vec![Scripted::Status(200, "ok")]);
    let pipeline = Pipeline::builder("http://mq.test.example.com")
        .credential_provider(Arc::new(StaticCredentialProvider::new(
            ServiceCredentials::new("AKID", "secret").with_security_token("STS-token"),
        )))
        .retry_policy(fast_policy())
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .try_build()
        .expect("pipeline should build");

    pipeline.invoke(&TextCall).expect("call should succeed");
    assert_eq!(
        transport
            .last_headers()
            .get("security-token")
            .and_then(|value| value.to_str().ok()),
        Some("STS-token")
    );
}

#[test]
fn an_unauthenticated_pipeline_sends_unsigned_requests() {
    let transport = ScriptedTransport::new(vec![Scripted::Status(200, "ok")]);
    let pipeline = Pipeline::builder("http://mq.test.example.com")
        .retry_policy(fast_policy())
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .try_build()
        .expect("pipeline should build");

    pipeline.invoke(&TextCall).expect("call should succeed");
    assert!(!transport.last_headers().contains_key("authorization"));
}

#[test]
fn the_standard_chain_has_the_documented_traversal_order() {
    let transport = ScriptedTransport::new(vec![]);
    let pipeline = test_pipeline(&transport, fast_policy());
    assert_eq!(
        pipeline.roles(),
        vec![
            roles::ERROR,
            roles::MARSHALLER,
            roles::UNMARSHALLER,
            roles::CREDENTIALS,
            roles::RETRY,
            roles::SIGNER,
            roles::TRANSPORT,
        ]
    );
}

#[test]
fn should_retry_follows_the_decision_table() {
    let policy = RetryPolicy::standard();
    let adapter = CallAdapter::new(&TextCall);
    let mut context = ExecutionContext::new(&adapter, CancellationToken::new());

    let http_fault = |status: u16| MqError::HttpFault {
        status: StatusCode::from_u16(status).expect("valid status"),
    };

    assert!(policy.should_retry(&context, &http_fault(500)));
    assert!(policy.should_retry(&context, &http_fault(503)));
    assert!(policy.should_retry(&context, &http_fault(502)));
    assert!(!policy.should_retry(&context, &http_fault(400)));
    assert!(!policy.should_retry(&context, &http_fault(403)));
    assert!(!policy.should_retry(&context, &MqError::Cancelled));
    assert!(!policy.should_retry(&context, &MqError::marshalling("broken")));
    assert!(policy.should_retry(
        &context,
        &MqError::Transport {
            kind: TransportErrorKind::Read,
            message: "reset".to_owned(),
        }
    ));

    // A 400 becomes retryable once the buffered fault body carries a known
    // throttling code.
    context.set_response(ResponseModel::new(
        StatusCode::BAD_REQUEST,
        HeaderMap::new(),
        Bytes::from_static(b"<Error><Code>Throttling</Code><Message>slow down</Message></Error>"),
    ));
    assert!(policy.should_retry(&context, &http_fault(400)));
}

#[test]
fn retry_limit_tracks_the_context_attempt_counter() {
    let policy = RetryPolicy::standard().max_retries(2);
    let adapter = CallAdapter::new(&TextCall);
    let mut context = ExecutionContext::new(&adapter, CancellationToken::new());

    assert!(!policy.retry_limit_reached(&context));
    context.increment_attempt();
    assert!(!policy.retry_limit_reached(&context));
    context.increment_attempt();
    assert!(policy.retry_limit_reached(&context));
}
