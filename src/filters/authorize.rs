//! Request authorization filters (`opaAuthorizeRequest` and
//! `opaAuthorizeRequestWithBody`).

use std::{collections::HashMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use http::StatusCode;
use log::warn;
use opentelemetry::Context;
use pingora_error::Result;
use serde_json::Value as JsonValue;

use crate::{
    authz::AuthzRequest,
    body::BodyBudget,
    error::OpaError,
    instance::Instance,
    metrics::{self, DECISION_ALLOW, DECISION_DENY, DECISION_ERR},
    trace,
};

use super::{
    allow_request, buffer_request_body, serve_decision, serve_simple, BufferedBody,
    FilterContext, OpaFilter, Request,
};

/// Decide allow/deny for a request; on allow the request is forwarded with
/// the decision's header mutations, on deny the decision's response is
/// served. `with_body` additionally buffers the request body for the
/// policy input.
pub struct OpaAuthorizeRequest {
    name: &'static str,
    instance: Arc<Instance>,
    budget: Arc<BodyBudget>,
    context_extensions: HashMap<String, String>,
    metadata: Option<JsonValue>,
    with_body: bool,
}

impl OpaAuthorizeRequest {
    pub(crate) fn new(
        name: &'static str,
        instance: Arc<Instance>,
        budget: Arc<BodyBudget>,
        context_extensions: HashMap<String, String>,
        metadata: Option<JsonValue>,
        with_body: bool,
    ) -> Self {
        Self {
            name,
            instance,
            budget,
            context_extensions,
            metadata,
            with_body,
        }
    }

    async fn evaluate(
        &self,
        req: &mut Request,
        ctx: &mut FilterContext,
        cx: &Context,
    ) -> Result<bool> {
        let bundle = self.instance.bundle();
        let settings = self.instance.settings();

        let mut buffered: Option<BufferedBody> = None;
        if self.with_body && !settings.skip_request_body_parse {
            match buffer_request_body(
                req,
                &self.budget,
                self.instance.max_body_bytes(),
                self.instance.body_read_chunk(),
            )
            .await
            {
                Ok(prefix) => buffered = prefix,
                Err(OpaError::BodyBudgetExceeded) => {
                    warn!("request body buffering for bundle '{bundle}' hit the memory budget");
                    metrics::incr_decision(self.name, bundle, DECISION_ERR);
                    trace::record_error(cx, "body buffering budget exceeded");
                    serve_simple(ctx, StatusCode::INTERNAL_SERVER_ERROR)?;
                    return Ok(true);
                }
                Err(e) => {
                    metrics::incr_decision(self.name, bundle, DECISION_ERR);
                    trace::record_error(cx, &e.to_string());
                    serve_simple(ctx, StatusCode::INTERNAL_SERVER_ERROR)?;
                    return Ok(true);
                }
            }
        }

        let authz_req = AuthzRequest {
            header: &req.header,
            body: buffered.as_ref().map(|b| b.bytes.as_ref()),
            truncated_body: buffered.as_ref().is_some_and(|b| b.truncated),
            context_extensions: &self.context_extensions,
            metadata: self.metadata.as_ref(),
        };
        let started = Instant::now();
        let result = self.instance.eval(&ctx.cancel, cx, &authz_req).await;
        metrics::observe_eval_time(self.name, bundle, started.elapsed());

        match result {
            Err(OpaError::BadRequest(msg)) => {
                metrics::incr_decision(self.name, bundle, DECISION_ERR);
                trace::record_error(cx, &msg);
                serve_simple(ctx, StatusCode::BAD_REQUEST)?;
                Ok(true)
            }
            Err(e) => {
                metrics::incr_decision(self.name, bundle, DECISION_ERR);
                trace::record_error(cx, &e.to_string());
                serve_simple(ctx, StatusCode::INTERNAL_SERVER_ERROR)?;
                Ok(true)
            }
            Ok(_) if settings.dry_run => Ok(false),
            Ok(decision) if !decision.allowed => {
                metrics::incr_decision(self.name, bundle, DECISION_DENY);
                serve_decision(ctx, &decision, StatusCode::FORBIDDEN)?;
                Ok(true)
            }
            Ok(decision) => {
                metrics::incr_decision(self.name, bundle, DECISION_ALLOW);
                allow_request(req, ctx, &decision)?;
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl OpaFilter for OpaAuthorizeRequest {
    fn name(&self) -> &'static str {
        self.name
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
