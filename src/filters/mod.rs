//! The filter surface exposed to the host proxy.
//!
//! Three filters are provided: `opaAuthorizeRequest` (allow/deny without
//! body), `opaAuthorizeRequestWithBody` (buffers the request body for the
//! policy input) and `opaServeResponse` (always serves the decision). The
//! host adapts its per-request objects into [`Request`]/[`FilterContext`]
//! and runs [`OpaFilter::request_filter`] before proxying and
//! [`OpaFilter::response_filter`] on the upstream response.

pub mod authorize;
pub mod serve;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use once_cell::sync::Lazy;
use opentelemetry::Context;
use pingora_error::Result;
use pingora_http::{RequestHeader, ResponseHeader};
use serde_json::{Map, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use crate::{
    authz::Decision,
    body::{body_upper_bound, BodyBudget, BoxBody, BufferedBodyReader},
    error::{OpaError, OpaResult},
    registry::Registry,
};

use authorize::OpaAuthorizeRequest;
use serve::OpaServeResponse;

pub const AUTHORIZE_REQUEST_FILTER: &str = "opaAuthorizeRequest";
pub const AUTHORIZE_REQUEST_WITH_BODY_FILTER: &str = "opaAuthorizeRequestWithBody";
pub const SERVE_RESPONSE_FILTER: &str = "opaServeResponse";

/// State-bag key under which an allowed decision's body is stored for
/// downstream filters.
pub const DECISION_BODY_STATE_KEY: &str = "open-policy-agent:decision-body";

/// State-bag key holding the decision's `response_headers_to_add`, applied
/// during the response phase.
pub const RESPONSE_HEADERS_STATE_KEY: &str = "open-policy-agent:response-headers";

/// The mutable request as seen by a filter.
pub struct Request {
    pub header: RequestHeader,
    pub body: Option<BoxBody>,
}

impl Request {
    pub fn new(header: RequestHeader) -> Self {
        Self { header, body: None }
    }

    pub fn with_body(header: RequestHeader, body: BoxBody) -> Self {
        Self {
            header,
            body: Some(body),
        }
    }

    /// Declared content length, when present and well-formed.
    pub fn content_length(&self) -> Option<u64> {
        self.header
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }
}

/// A response synthesized by a filter instead of proxying upstream.
pub struct ServedResponse {
    pub header: ResponseHeader,
    pub body: Option<Bytes>,
}

/// Per-request context: state bag, tracing parent, cancellation, and the
/// served response (when a filter decided to answer itself).
pub struct FilterContext {
    pub state: HashMap<String, JsonValue>,
    pub parent_span: Context,
    pub cancel: CancellationToken,
    response: Option<ServedResponse>,
}

impl Default for FilterContext {
    fn default() -> Self {
        Self {
            state: HashMap::new(),
            parent_span: Context::new(),
            cancel: CancellationToken::new(),
            response: None,
        }
    }
}

impl FilterContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the synthesized response the host must send downstream.
    pub fn serve(&mut self, response: ServedResponse) {
        self.response = Some(response);
    }

    pub fn response(&self) -> Option<&ServedResponse> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<ServedResponse> {
        self.response.take()
    }
}

/// One configured filter bound to a policy-engine instance.
#[async_trait]
pub trait OpaFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn bundle(&self) -> &str;

    /// Run the authorization decision for one request.
    ///
    /// Returns `Ok(true)` when a response was served (stored in the
    /// context) and the chain must stop, `Ok(false)` to continue proxying.
    /// Per-request failures never surface as errors; they are terminated by
    /// a synthesized response.
    async fn request_filter(&self, req: &mut Request, ctx: &mut FilterContext) -> Result<bool>;

    /// Response phase: apply decision response headers stashed in the
    /// state bag during the request phase.
    fn response_filter(
        &self,
        upstream_response: &mut ResponseHeader,
        ctx: &mut FilterContext,
    ) -> Result<()> {
        apply_stored_response_headers(upstream_response, ctx)
    }
}

#[derive(Clone, Copy)]
enum FilterKind {
    AuthorizeRequest,
    AuthorizeRequestWithBody,
    ServeResponse,
}

static FILTER_REGISTRY: Lazy<HashMap<&'static str, FilterKind>> = Lazy::new(|| {
    HashMap::from([
        (AUTHORIZE_REQUEST_FILTER, FilterKind::AuthorizeRequest),
        (
            AUTHORIZE_REQUEST_WITH_BODY_FILTER,
            FilterKind::AuthorizeRequestWithBody,
        ),
        (SERVE_RESPONSE_FILTER, FilterKind::ServeResponse),
    ])
});

/// Whether `name` designates one of this integration's filters.
pub fn is_opa_filter(name: &str) -> bool {
    FILTER_REGISTRY.contains_key(name)
}

/// Build a filter from its route arguments: the bundle name and an
/// optional key/value mapping of context extensions. Starts (or reuses)
/// the bundle's instance.
pub async fn build_filter(
    registry: &Arc<Registry>,
    name: &str,
    args: &[String],
) -> OpaResult<Arc<dyn OpaFilter>> {
    let kind = *FILTER_REGISTRY
        .get(name)
        .ok_or_else(|| OpaError::InvalidFilterParameters(format!("unknown filter '{name}'")))?;
    let (bundle, context_extensions) = parse_filter_args(args)?;
    let instance = registry.get_or_start(&bundle).await?;
    let metadata = registry.config().envoy_metadata.clone();
    Ok(match kind {
        FilterKind::AuthorizeRequest => Arc::new(OpaAuthorizeRequest::new(
            AUTHORIZE_REQUEST_FILTER,
            instance,
            Arc::clone(registry.body_budget()),
            context_extensions,
            metadata,
            false,
        )),
        FilterKind::AuthorizeRequestWithBody => Arc::new(OpaAuthorizeRequest::new(
            AUTHORIZE_REQUEST_WITH_BODY_FILTER,
            instance,
            Arc::clone(registry.body_budget()),
            context_extensions,
            metadata,
            true,
        )),
        FilterKind::ServeResponse => {
            Arc::new(OpaServeResponse::new(instance, context_extensions, metadata))
        }
    })
}

fn parse_filter_args(args: &[String]) -> OpaResult<(String, HashMap<String, String>)> {
    let (bundle, raw_extensions) = match args {
        [] => {
            return Err(OpaError::InvalidFilterParameters(
                "a bundle name is required".to_string(),
            ))
        }
        [bundle] => (bundle, None),
        [bundle, extensions] => (bundle, Some(extensions)),
        _ => {
            return Err(OpaError::InvalidFilterParameters(format!(
                "expected at most 2 arguments, got {}",
                args.len()
            )))
        }
    };
    if bundle.is_empty() {
        return Err(OpaError::InvalidFilterParameters(
            "the bundle name must not be empty".to_string(),
        ));
    }
    let context_extensions = match raw_extensions {
        Some(raw) if !raw.trim().is_empty() => serde_yaml::from_str::<HashMap<String, String>>(raw)
            .map_err(|e| {
                OpaError::InvalidFilterParameters(format!(
                    "context extensions must be a key/value mapping: {e}"
                ))
            })?,
        _ => HashMap::new(),
    };
    Ok((bundle.clone(), context_extensions))
}

/// Serve a bare status code with an empty body.
pub(crate) fn serve_simple(ctx: &mut FilterContext, status: StatusCode) -> Result<()> {
    let mut header = ResponseHeader::build(status, None)?;
    header.insert_header(http::header::CONTENT_LENGTH, "0")?;
    ctx.serve(ServedResponse { header, body: None });
    Ok(())
}

/// Serve a response synthesized from the decision's status, headers and
/// body, falling back to `default_status`.
pub(crate) fn serve_decision(
    ctx: &mut FilterContext,
    decision: &Decision,
    default_status: StatusCode,
) -> Result<()> {
    let status = decision.http_status.unwrap_or(default_status);
    let body = decision
        .body
        .as_ref()
        .map(|body| Bytes::copy_from_slice(body.as_bytes()));
    let mut header = ResponseHeader::build(status, None)?;
    header.insert_header(
        http::header::CONTENT_LENGTH,
        body.as_ref().map_or(0, Bytes::len).to_string(),
    )?;
    for (name, value) in &decision.headers {
        header.insert_header(name.clone(), value.clone())?;
    }
    ctx.serve(ServedResponse { header, body });
    Ok(())
}

/// Allow path: mutate the forwarded request and stash response-phase data
/// in the state bag.
pub(crate) fn allow_request(
    req: &mut Request,
    ctx: &mut FilterContext,
    decision: &Decision,
) -> Result<()> {
    if let Some(body) = &decision.body {
        ctx.state.insert(
            DECISION_BODY_STATE_KEY.to_string(),
            JsonValue::String(body.clone()),
        );
    }
    for (name, value) in &decision.headers {
        req.header.insert_header(name.clone(), value.clone())?;
    }
    for name in &decision.request_headers_to_remove {
        req.header.remove_header(name.as_str());
    }
    if !decision.response_headers_to_add.is_empty() {
        let mut map = Map::new();
        for (name, value) in &decision.response_headers_to_add {
            map.insert(
                name.as_str().to_string(),
                JsonValue::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            );
        }
        ctx.state
            .insert(RESPONSE_HEADERS_STATE_KEY.to_string(), JsonValue::Object(map));
    }
    Ok(())
}

pub(crate) fn apply_stored_response_headers(
    upstream_response: &mut ResponseHeader,
    ctx: &mut FilterContext,
) -> Result<()> {
    let Some(JsonValue::Object(headers)) = ctx.state.get(RESPONSE_HEADERS_STATE_KEY) else {
        return Ok(());
    };
    for (name, value) in headers.clone() {
        if let Some(value) = value.as_str() {
            upstream_response.insert_header(name, value)?;
        }
    }
    Ok(())
}

/// The buffered prefix of a request body.
pub(crate) struct BufferedBody {
    pub bytes: Bytes,
    pub truncated: bool,
}

/// Buffer a prefix of the request body for policy input while keeping the
/// full stream readable for the upstream.
///
/// Skipped (`Ok(None)`) when the request has no body or its declared
/// length exceeds the per-request cap. Budget exhaustion leaves the body
/// untouched and reports [`OpaError::BodyBudgetExceeded`].
pub(crate) async fn buffer_request_body(
    req: &mut Request,
    budget: &Arc<BodyBudget>,
    max_body_bytes: u64,
    read_chunk: usize,
) -> OpaResult<Option<BufferedBody>> {
    let content_length = req.content_length();
    if let Some(length) = content_length {
        if length > max_body_bytes {
            return Ok(None);
        }
    }
    let Some(body) = req.body.take() else {
        return Ok(None);
    };
    let want = body_upper_bound(content_length, max_body_bytes);
    let reservation = match budget.try_acquire(want) {
        Ok(reservation) => reservation,
        Err(e) => {
            req.body = Some(body);
            return Err(e);
        }
    };
    let mut reader = BufferedBodyReader::new(body, want as usize, read_chunk, Some(reservation));
    let bytes = reader
        .fill_buffer(content_length)
        .await
        .map_err(|e| OpaError::Internal(format!("failed to read request body: {e}")))?;
    let truncated = content_length.is_some_and(|length| (bytes.len() as u64) < length);
    req.body = Some(Box::new(reader));
    Ok(Some(BufferedBody { bytes, truncated }))
}
