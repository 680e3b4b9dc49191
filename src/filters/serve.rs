//! The `opaServeResponse` filter: the decision is the response.

use std::{collections::HashMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use http::StatusCode;
use opentelemetry::Context;
use pingora_error::Result;
use serde_json::Value as JsonValue;

use crate::{
    authz::AuthzRequest,
    error::OpaError,
    instance::Instance,
    metrics::{self, DECISION_ALLOW, DECISION_DENY, DECISION_ERR},
    trace,
};

use super::{serve_decision, serve_simple, FilterContext, OpaFilter, Request, SERVE_RESPONSE_FILTER};

/// Always synthesizes the response from the decision: allowed decisions
/// default to 200, denied ones to 403, both overridable by `http_status`.
pub struct OpaServeResponse {
    instance: Arc<Instance>,
    context_extensions: HashMap<String, String>,
    metadata: Option<JsonValue>,
}

impl OpaServeResponse {
    pub(crate) fn new(
        instance: Arc<Instance>,
        context_extensions: HashMap<String, String>,
        metadata: Option<JsonValue>,
    ) -> Self {
        Self {
            instance,
            context_extensions,
            metadata,
        }
    }

    async fn evaluate(
        &self,
        req: &mut Request,
        ctx: &mut FilterContext,
        cx: &Context,
    ) -> Result<bool> {
        let bundle = self.instance.bundle();
        let authz_req = AuthzRequest {
            header: &req.header,
            body: None,
            truncated_body: false,
            context_extensions: &self.context_extensions,
            metadata: self.metadata.as_ref(),
        };
        let started = Instant::now();
        let result = self.instance.eval(&ctx.cancel, cx, &authz_req).await;
        metrics::observe_eval_time(SERVE_RESPONSE_FILTER, bundle, started.elapsed());

        match result {
            Err(OpaError::BadRequest(msg)) => {
                metrics::incr_decision(SERVE_RESPONSE_FILTER, bundle, DECISION_ERR);
                trace::record_error(cx, &msg);
                serve_simple(ctx, StatusCode::BAD_REQUEST)?;
            }
            Err(e) => {
                metrics::incr_decision(SERVE_RESPONSE_FILTER, bundle, DECISION_ERR);
                trace::record_error(cx, &e.to_string());
                serve_simple(ctx, StatusCode::INTERNAL_SERVER_ERROR)?;
            }
            Ok(decision) => {
                let (outcome, default_status) = if decision.allowed {
                    (DECISION_ALLOW, StatusCode::OK)
                } else {
                    (DECISION_DENY, StatusCode::FORBIDDEN)
                };
                metrics::incr_decision(SERVE_RESPONSE_FILTER, bundle, outcome);
                serve_decision(ctx, &decision, default_status)?;
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl OpaFilter for OpaServeResponse {
    fn name(&self) -> &'static str {
        SERVE_RESPONSE_FILTER
    }

    fn bundle(&self) -> &str {
        self.instance.bundle()
    }

    async fn request_filter(&self, req: &mut Request, ctx: &mut FilterContext) -> Result<bool> {
        let cx = trace::eval_span(
            &ctx.parent_span,
            self.instance.bundle(),
            &self.instance.settings().labels,
        );
        let result = self.evaluate(req, ctx, &cx).await;
        trace::finish(&cx);
        result
    }
}
