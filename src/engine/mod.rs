//! Contract with the embedded policy engine.
//!
//! The engine itself (compiler, bundle plugin, decision-log uploader) lives
//! outside this crate. These traits pin down exactly what the integration
//! needs from it: lifecycle control of its plugin manager, out-of-band
//! triggers for the `discovery` and `bundle` plugins, prepared-query
//! compilation and evaluation, and a decision-log hook.

pub mod cache;

#[cfg(test)]
pub(crate) mod testing;

use std::{collections::HashMap, fmt, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use opentelemetry::Context;
use serde_json::Value as JsonValue;

use crate::trace::OutboundTracer;
use cache::InterQueryCache;

/// Name of the mandatory bundle plugin.
pub const BUNDLE_PLUGIN: &str = "bundle";

/// Name of the optional discovery plugin.
pub const DISCOVERY_PLUGIN: &str = "discovery";

/// Readiness of a single engine plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginStatus {
    pub ok: bool,
    pub message: String,
}

impl PluginStatus {
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: String::from("OK"),
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Errors produced by the engine and its control-plane client.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// The control plane answered with a non-success HTTP status.
    Http { status: u16, message: String },
    /// The client timed out waiting for response headers.
    HeaderTimeout(String),
    /// Connection-level transport failure.
    Transport(String),
    /// The surrounding context was cancelled mid-call.
    Canceled(String),
    /// Anything else the engine reports.
    Internal(String),
}

impl EngineError {
    /// Retry classification for control-plane errors: 429 and 5xx responses
    /// and header-read timeouts are worth retrying, everything else is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Http { status, .. } => *status == 429 || *status >= 500,
            EngineError::HeaderTimeout(_) => true,
            EngineError::Transport(_) | EngineError::Canceled(_) | EngineError::Internal(_) => {
                false
            }
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Http { status, message } => {
                write!(f, "control plane returned status {status}: {message}")
            }
            EngineError::HeaderTimeout(msg) => write!(f, "timeout awaiting response headers: {msg}"),
            EngineError::Transport(msg) => write!(f, "transport failure: {msg}"),
            EngineError::Canceled(msg) => write!(f, "cancelled: {msg}"),
            EngineError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<EngineError> for crate::error::OpaError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Canceled(msg) => crate::error::OpaError::EvalCanceled(msg),
            other => crate::error::OpaError::Engine(other.to_string()),
        }
    }
}

/// One record shipped to the engine's decision-log sink. Emitted exactly
/// once per evaluation, including failed and cancelled ones.
#[derive(Debug, Clone)]
pub struct DecisionLogEntry {
    pub decision_id: String,
    pub bundle: String,
    pub timestamp: SystemTime,
    pub labels: HashMap<String, String>,
    pub input: Option<JsonValue>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

/// Per-evaluation knobs handed to the prepared query.
pub struct EvalOptions<'a> {
    pub decision_id: &'a str,
    pub cache: &'a Arc<InterQueryCache>,
    pub trace: &'a Context,
}

/// A compiled, reusable form of the evaluation query. Valid for one
/// compiler generation; the instance discards it on every compiler update.
#[async_trait]
pub trait PreparedQuery: Send + Sync {
    async fn eval(&self, input: &JsonValue, opts: EvalOptions<'_>) -> Result<JsonValue, EngineError>;
}

/// A triggerable engine plugin (`discovery` or `bundle`).
#[async_trait]
pub trait EnginePlugin: Send + Sync {
    /// Ask the plugin to refresh its state now instead of waiting for its
    /// internal timer.
    async fn trigger(&self) -> Result<(), EngineError>;
}

/// Handle to one embedded policy engine bound to a single bundle.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Start the plugin manager. Readiness is observed separately through
    /// [`Engine::plugin_status`].
    async fn start(&self) -> Result<(), EngineError>;

    /// Stop the plugin manager. Callers bound this with a grace period.
    async fn stop(&self);

    /// Look up a plugin by name. `bundle` is mandatory for every usable
    /// engine configuration, `discovery` is optional.
    fn plugin(&self, name: &str) -> Option<Arc<dyn EnginePlugin>>;

    /// Current readiness of every managed plugin.
    fn plugin_status(&self) -> HashMap<String, PluginStatus>;

    /// Register a hook invoked after every compiler change (bundle
    /// activation). The integration uses it to invalidate prepared queries.
    fn on_compiler_update(&self, hook: Box<dyn Fn() + Send + Sync>);

    /// Compile `query` (e.g. `data.authz.allow`) against the current
    /// compiler generation.
    async fn prepare_query(&self, query: &str) -> Result<Arc<dyn PreparedQuery>, EngineError>;

    /// Hand one decision record to the configured decision-log sink.
    fn log_decision(&self, entry: DecisionLogEntry) -> Result<(), EngineError>;
}

/// Everything an engine needs at construction time.
pub struct EngineOptions {
    /// Bundle this engine is bound to.
    pub bundle: String,
    /// Fully resolved engine configuration (JSON bytes).
    pub config: Bytes,
    /// Wrapper the engine must call around each outbound HTTP request so
    /// bundle fetches and decision-log uploads show up in traces.
    pub outbound: Arc<OutboundTracer>,
}

/// Builds engines; the host wires in a concrete implementation.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn new_engine(&self, opts: EngineOptions) -> Result<Arc<dyn Engine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(EngineError::Http {
            status: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(EngineError::Http {
            status: 500,
            message: String::new()
        }
        .is_retryable());
        assert!(EngineError::Http {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(EngineError::HeaderTimeout(String::new()).is_retryable());

        assert!(!EngineError::Http {
            status: 404,
            message: String::new()
        }
        .is_retryable());
        assert!(!EngineError::Http {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!EngineError::Transport(String::new()).is_retryable());
        assert!(!EngineError::Canceled(String::new()).is_retryable());
    }

    #[test]
    fn canceled_maps_to_eval_canceled() {
        let err: crate::error::OpaError = EngineError::Canceled("gone".into()).into();
        assert!(matches!(err, crate::error::OpaError::EvalCanceled(_)));
    }
}
