//! Unified error handling for the OPA integration.
//!
//! Errors are grouped by where they surface: registry/startup errors reach
//! the route-activation path, per-request errors are always terminated by a
//! synthesized HTTP response inside the filters. Every variant is `Clone` so
//! that concurrent callers waiting on the same single-flight start observe
//! the same error value.

use std::fmt;

/// A plugin that failed its readiness check, with the message it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFailure {
    pub name: String,
    pub message: String,
}

impl fmt::Display for PluginFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Error type covering the whole integration.
#[derive(Debug, Clone)]
pub enum OpaError {
    /// The registry has been closed; no further instances may be created.
    RegistryClosed,

    /// An instance did not reach readiness within the startup timeout.
    StartupTimeout {
        bundle: String,
        plugins: Vec<PluginFailure>,
    },

    /// A non-retryable startup error (e.g. 404 for a required bundle).
    StartupFatal { bundle: String, cause: String },

    /// Retries with exponential backoff ran out of deadline.
    StartupRetryableExhausted { bundle: String, last: String },

    /// Template interpolation, engine configuration, or registry
    /// configuration is invalid.
    InvalidConfig(String),

    /// Filter arguments have the wrong shape.
    InvalidFilterParameters(String),

    /// The process-wide body-buffering budget is exhausted.
    BodyBudgetExceeded,

    /// The decision document has a type-incompatible field.
    DecisionInvalid(String),

    /// The request was cancelled before or during evaluation.
    EvalCanceled(String),

    /// The request could not be adapted to an evaluation input.
    BadRequest(String),

    /// Engine-reported evaluation or trigger failure.
    Engine(String),

    /// Catch-all for internal failures (body read errors and the like).
    Internal(String),
}

impl fmt::Display for OpaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpaError::RegistryClosed => write!(f, "open policy agent registry is already closed"),
            OpaError::StartupTimeout { bundle, plugins } => {
                write!(
                    f,
                    "instance for bundle '{bundle}' failed to become ready: [{}]",
                    plugins
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            }
            OpaError::StartupFatal { bundle, cause } => {
                write!(f, "instance startup for bundle '{bundle}' failed: {cause}")
            }
            OpaError::StartupRetryableExhausted { bundle, last } => {
                write!(
                    f,
                    "instance startup for bundle '{bundle}' exhausted retries: {last}"
                )
            }
            OpaError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            OpaError::InvalidFilterParameters(msg) => write!(f, "invalid filter parameters: {msg}"),
            OpaError::BodyBudgetExceeded => {
                write!(f, "request body exceeds the total body parsing budget")
            }
            OpaError::DecisionInvalid(msg) => write!(f, "invalid policy decision: {msg}"),
            OpaError::EvalCanceled(msg) => write!(f, "evaluation cancelled: {msg}"),
            OpaError::BadRequest(msg) => write!(f, "malformed request: {msg}"),
            OpaError::Engine(msg) => write!(f, "policy engine error: {msg}"),
            OpaError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for OpaError {}

impl From<OpaError> for Box<pingora_error::Error> {
    fn from(err: OpaError) -> Self {
        pingora_error::Error::explain(pingora_error::ErrorType::InternalError, err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type OpaResult<T> = std::result::Result<T, OpaError>;
