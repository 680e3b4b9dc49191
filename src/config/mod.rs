//! Registry configuration.
//!
//! One `OpaConfig` is built per registry, either programmatically or from
//! YAML. Validation happens up front, before any instance is started.

pub mod template;

use std::{fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use validator::{Validate, ValidationError};

use crate::error::{OpaError, OpaResult};

/// Tunables of the OPA integration, exposed to the host's CLI/config layer.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "OpaConfig::validate_limits"))]
#[serde(default)]
pub struct OpaConfig {
    /// Idle time before an unreferenced instance is eligible for cleanup.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reuse_duration: Duration,

    /// Period of the idle-instance cleaner.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub clean_interval: Duration,

    /// Deadline for instance startup and for each periodic trigger round.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub instance_startup_timeout: Duration,

    /// Per-request cap on buffered body bytes.
    pub max_request_body_bytes: u64,

    /// Chunk size used when filling the body buffer.
    pub body_read_buffer_size: usize,

    /// Process-wide cap on concurrently buffered body bytes.
    pub max_memory_body_parsing: u64,

    /// Replace the engine's built-in bundle polling with this crate's
    /// control loop (plugin triggers are forced to manual mode).
    pub enable_custom_control_loop: bool,

    /// Base period of the control loop.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub control_loop_interval: Duration,

    /// Maximum spread applied around the control-loop interval. Zero
    /// disables jitter.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub control_loop_max_jitter: Duration,

    /// Start all route-referenced instances in parallel on the first route
    /// activation.
    pub preloading_enabled: bool,

    /// Inline engine configuration template (see [`template`]).
    pub config_template: Option<String>,

    /// Path to the engine configuration template; mutually exclusive with
    /// `config_template`.
    pub config_template_path: Option<PathBuf>,

    /// Optional authorization metadata forwarded verbatim as
    /// `attributes.metadataContext` in every evaluation input.
    pub envoy_metadata: Option<JsonValue>,
}

impl Default for OpaConfig {
    fn default() -> Self {
        Self {
            reuse_duration: Duration::from_secs(30),
            clean_interval: Duration::from_secs(10),
            instance_startup_timeout: Duration::from_secs(30),
            max_request_body_bytes: 1 << 20,
            body_read_buffer_size: 8192,
            max_memory_body_parsing: 100 << 20,
            enable_custom_control_loop: false,
            control_loop_interval: Duration::from_secs(60),
            control_loop_max_jitter: Duration::from_secs(3),
            preloading_enabled: true,
            config_template: None,
            config_template_path: None,
            envoy_metadata: None,
        }
    }
}

impl OpaConfig {
    /// Parse a YAML document into a validated configuration.
    pub fn from_yaml(raw: &str) -> OpaResult<Self> {
        let config: OpaConfig = serde_yaml::from_str(raw)
            .map_err(|e| OpaError::InvalidConfig(format!("unable to parse yaml config: {e}")))?;
        config.validated()
    }

    /// Run validation and return the config by value.
    pub fn validated(self) -> OpaResult<Self> {
        self.validate()
            .map_err(|e| OpaError::InvalidConfig(e.to_string()))?;
        Ok(self)
    }

    /// Resolve the configured template source to its raw text. Exactly one
    /// of `config_template` / `config_template_path` must be set.
    pub fn template_text(&self) -> OpaResult<String> {
        match (&self.config_template, &self.config_template_path) {
            (Some(_), Some(_)) => Err(OpaError::InvalidConfig(
                "config_template and config_template_path are mutually exclusive".to_string(),
            )),
            (Some(inline), None) => Ok(inline.clone()),
            (None, Some(path)) => fs::read_to_string(path).map_err(|e| {
                OpaError::InvalidConfig(format!(
                    "unable to read config template from {}: {e}",
                    path.display()
                ))
            }),
            (None, None) => Err(OpaError::InvalidConfig(
                "an engine configuration template is required".to_string(),
            )),
        }
    }

    fn validate_limits(&self) -> Result<(), ValidationError> {
        if self.max_request_body_bytes == 0 {
            return Err(ValidationError::new("max_request_body_bytes_zero"));
        }
        if self.body_read_buffer_size == 0 {
            return Err(ValidationError::new("body_read_buffer_size_zero"));
        }
        if self.max_memory_body_parsing < self.max_request_body_bytes {
            return Err(ValidationError::new("body_budget_below_request_cap"));
        }
        if self.clean_interval.is_zero() {
            return Err(ValidationError::new("clean_interval_zero"));
        }
        if self.control_loop_interval.is_zero() {
            return Err(ValidationError::new("control_loop_interval_zero"));
        }
        if self.instance_startup_timeout.is_zero() {
            return Err(ValidationError::new("instance_startup_timeout_zero"));
        }
        Ok(())
    }
}
