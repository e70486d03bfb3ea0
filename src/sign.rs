//! Canonical-request signing.
//!
//! The service authenticates requests with the legacy
//! `Base64(HMAC-SHA1(secret_key, string_to_sign))` scheme:
//!
//! ```text
//! StringToSign = HTTP-Verb + "\n" +
//!                Content-MD5 + "\n" +
//!                Content-Type + "\n" +
//!                Date + "\n" +
//!                CanonicalizedServiceHeaders +
//!                CanonicalizedResource
//! ```
//!
//! HMAC-SHA1 is a wire-compatibility requirement of the protocol; the
//! remote side rejects anything else.

use std::collections::BTreeMap;
use std::time::SystemTime;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, KeyInit, Mac};
use http::header::{self, HeaderName, HeaderValue};
use sha1::Sha1;

use crate::context::ExecutionContext;
use crate::credentials::ServiceCredentials;
use crate::error::MqError;
use crate::pipeline::{Chain, Handler, roles};
use crate::request::ServiceRequest;
use crate::{CANONICAL_HEADER_PREFIX, MqxResult};

type HmacSha1 = Hmac<Sha1>;

/// Signs the request in place: strips any previous `Authorization` header,
/// computes the canonical signature and attaches the `Authorization` (and,
/// for session credentials, `security-token`) header.
///
/// Deterministic: identical method, canonical headers, resource path,
/// parameters and `Date` value yield the same signature for the same
/// secret key.
pub fn sign_request(
    request: &mut ServiceRequest,
    credentials: &ServiceCredentials,
) -> MqxResult<()> {
    request.remove_header(header::AUTHORIZATION);

    let string_to_sign = string_to_sign(request)?;
    let signature = compute_signature(credentials.secret_key(), &string_to_sign);
    let authorization = format!(
        "{} {}:{signature}",
        crate::AUTH_SCHEME,
        credentials.access_key()
    );
    let authorization = HeaderValue::from_str(&authorization)
        .map_err(|_| MqError::marshalling("access key is not a valid header value"))?;
    request.insert_header(header::AUTHORIZATION, authorization);

    if let Some(token) = credentials.security_token() {
        let token = HeaderValue::from_str(token)
            .map_err(|_| MqError::marshalling("security token is not a valid header value"))?;
        request.insert_header(HeaderName::from_static(crate::SECURITY_TOKEN_HEADER), token);
    }

    request.mark_signed();
    Ok(())
}

fn compute_signature(secret_key: &str, string_to_sign: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret_key.as_bytes()).expect("HMAC can accept any key length");
    mac.update(string_to_sign.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn string_to_sign(request: &ServiceRequest) -> MqxResult<String> {
    let method = request.method().as_str();
    let content_md5 = request.header_str("content-md5").unwrap_or("");
    let content_type = request.header_str("content-type").unwrap_or("");
    let date = request.header_str("date").unwrap_or("");
    let headers = canonical_headers(request.headers());
    let parameters = canonical_parameters(request)?;
    let resource = canonical_resource(request.resource_path(), &canonical_query_string(&parameters));
    Ok(format!(
        "{method}\n{content_md5}\n{content_type}\n{date}\n{headers}{resource}"
    ))
}

/// Merges sub-resources and query parameters into the single map the
/// canonical query string is built from. A key present in both is a caller
/// error.
fn canonical_parameters(request: &ServiceRequest) -> MqxResult<BTreeMap<String, String>> {
    let mut merged = BTreeMap::new();
    for (name, value) in request.sub_resources() {
        merged.insert(name.clone(), value.clone().unwrap_or_default());
    }
    for (name, value) in request.query_parameters() {
        if merged.insert(name.clone(), value.clone()).is_some() {
            return Err(MqError::marshalling(format!(
                "parameter `{name}` is present as both a sub-resource and a query parameter"
            )));
        }
    }
    Ok(merged)
}

/// Keys sorted by ordinal byte comparison, joined as `key=value` (a bare
/// `key=` for an empty value) with `&`.
fn canonical_query_string(parameters: &BTreeMap<String, String>) -> String {
    parameters
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// The URL path with each non-empty segment re-emitted as `/segment`
/// (collapsing repeated slashes), a single trailing slash preserved, plus
/// `?` and the canonical query string when present.
fn canonical_resource(resource_path: &str, canonical_query: &str) -> String {
    let mut resource = String::new();
    for segment in resource_path.split('/').filter(|segment| !segment.is_empty()) {
        resource.push('/');
        resource.push_str(segment);
    }
    if resource.is_empty() {
        resource.push('/');
    } else if resource_path.ends_with('/') {
        resource.push('/');
    }
    if !canonical_query.is_empty() {
        resource.push('?');
        resource.push_str(canonical_query);
    }
    resource
}

/// Headers carrying the reserved service prefix, lowercased, value
/// whitespace collapsed to single spaces, sorted, one `key:value\n` line
/// each. Empty selection yields an empty block.
fn canonical_headers(headers: &http::HeaderMap) -> String {
    let mut selected = BTreeMap::new();
    for (name, value) in headers {
        let key = name.as_str().to_ascii_lowercase();
        if !key.starts_with(CANONICAL_HEADER_PREFIX) {
            continue;
        }
        let value = value.to_str().unwrap_or("");
        selected.insert(key, collapse_whitespace(value));
    }

    let mut block = String::new();
    for (key, value) in &selected {
        block.push_str(key);
        block.push(':');
        block.push_str(value);
        block.push('\n');
    }
    block
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Pipeline stage that refreshes the `Date` header and re-signs the request
/// on every attempt. Absent credentials mean the call goes out unsigned.
#[derive(Debug, Default)]
pub struct SignerHandler;

impl SignerHandler {
    fn prepare(context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        let credentials = context.credentials().cloned();
        let request = context.request_mut()?;

        let date = httpdate::fmt_http_date(SystemTime::now());
        let date = HeaderValue::from_str(&date)
            .map_err(|_| MqError::marshalling("generated date header is invalid"))?;
        request.insert_header(header::DATE, date);

        if let Some(credentials) = credentials {
            sign_request(request, &credentials)?;
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Handler for SignerHandler {
    fn role(&self) -> &'static str {
        roles::SIGNER
    }

    fn invoke(&self, chain: Chain<'_>, context: &mut ExecutionContext<'_>) -> MqxResult<()> {
        Self::prepare(context)?;
        chain.proceed(context)
    }

    async fn invoke_async(
        &self,
        chain: Chain<'_>,
        context: &mut ExecutionContext<'_>,
    ) -> MqxResult<()> {
        Self::prepare(context)?;
        chain.proceed_async(context).await
    }
}
