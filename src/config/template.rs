//! Engine configuration templates.
//!
//! The template is a YAML/JSON document with two interpolation variables:
//! `{{bundlename}}` expands to the bundle the instance is bound to, and
//! `{{Env.NAME}}` expands to the process environment variable `NAME`. The
//! resolved document is handed to the engine verbatim; this module only
//! extracts the pieces the integration itself consumes (labels, the
//! decision path, the dry-run and body-parse flags) and, when the custom
//! control loop is enabled, rewrites the plugin trigger modes to `manual`.

use std::collections::HashMap;
use std::env;

use bytes::Bytes;
use serde_json::Value as JsonValue;

use crate::error::{OpaError, OpaResult};

/// Default decision path queried when the configuration names none.
pub const DEFAULT_DECISION_PATH: &str = "authz/allow";

/// Interpolate `{{bundlename}}` and `{{Env.NAME}}` occurrences.
///
/// Unknown variables are a configuration error, as is an unterminated
/// `{{`. A leading dot inside the braces is tolerated.
pub fn interpolate(template: &str, bundle: &str) -> OpaResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            OpaError::InvalidConfig("unterminated '{{' in config template".to_string())
        })?;
        let token = after[..end].trim().trim_start_matches('.');
        if token == "bundlename" {
            out.push_str(bundle);
        } else if let Some(name) = token.strip_prefix("Env.") {
            match env::var(name) {
                Ok(value) => out.push_str(&value),
                Err(_) => {
                    return Err(OpaError::InvalidConfig(format!(
                        "config template references unset environment variable '{name}'"
                    )))
                }
            }
        } else {
            return Err(OpaError::InvalidConfig(format!(
                "unknown config template variable '{token}'"
            )));
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// The parts of a resolved engine configuration the integration reads.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    raw: JsonValue,
    /// Engine labels, attached to spans and decision logs.
    pub labels: HashMap<String, String>,
    /// Evaluate but never enforce deny decisions.
    pub dry_run: bool,
    /// Never buffer request bodies for this instance.
    pub skip_request_body_parse: bool,
    decision_path: String,
}

impl EngineSettings {
    /// Parse a resolved template. With `force_manual_triggers` the
    /// discovery and bundle plugin configurations are switched to manual
    /// trigger mode before the engine ever sees them.
    pub fn parse(resolved: &str, force_manual_triggers: bool) -> OpaResult<Self> {
        let mut raw: JsonValue = serde_yaml::from_str(resolved)
            .map_err(|e| OpaError::InvalidConfig(format!("unable to parse engine config: {e}")))?;
        if !raw.is_object() {
            return Err(OpaError::InvalidConfig(
                "engine config must be a mapping".to_string(),
            ));
        }

        if force_manual_triggers {
            set_manual_triggers(&mut raw);
        }

        let labels = match raw.get("labels") {
            None => HashMap::new(),
            Some(JsonValue::Object(map)) => {
                let mut labels = HashMap::with_capacity(map.len());
                for (key, value) in map {
                    let value = value.as_str().ok_or_else(|| {
                        OpaError::InvalidConfig(format!("label '{key}' is not a string"))
                    })?;
                    labels.insert(key.clone(), value.to_string());
                }
                labels
            }
            Some(_) => {
                return Err(OpaError::InvalidConfig(
                    "'labels' must be a mapping of strings".to_string(),
                ))
            }
        };

        let authz = raw.pointer("/plugins/authz");
        let decision_path = match authz.and_then(|a| a.get("path")) {
            None => DEFAULT_DECISION_PATH.to_string(),
            Some(JsonValue::String(path)) => {
                let trimmed = path.trim_matches('/');
                if trimmed.is_empty() {
                    return Err(OpaError::InvalidConfig(
                        "'plugins.authz.path' must not be empty".to_string(),
                    ));
                }
                trimmed.to_string()
            }
            Some(_) => {
                return Err(OpaError::InvalidConfig(
                    "'plugins.authz.path' must be a string".to_string(),
                ))
            }
        };
        let dry_run = bool_field(authz, "dry-run")?;
        let skip_request_body_parse = bool_field(authz, "skip-request-body-parse")?;

        Ok(Self {
            raw,
            labels,
            dry_run,
            skip_request_body_parse,
            decision_path,
        })
    }

    /// The query compiled into the prepared query, e.g. `data.authz.allow`.
    pub fn query(&self) -> String {
        format!("data.{}", self.decision_path.replace('/', "."))
    }

    /// Slash-separated decision path.
    pub fn decision_path(&self) -> &str {
        &self.decision_path
    }

    /// The resolved configuration serialized for the engine.
    pub fn config_bytes(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(&self.raw).expect("engine config is always a json object"))
    }

    /// Access to the resolved configuration document.
    pub fn raw(&self) -> &JsonValue {
        &self.raw
    }
}

fn bool_field(section: Option<&JsonValue>, key: &str) -> OpaResult<bool> {
    match section.and_then(|s| s.get(key)) {
        None => Ok(false),
        Some(JsonValue::Bool(b)) => Ok(*b),
        Some(_) => Err(OpaError::InvalidConfig(format!(
            "'plugins.authz.{key}' must be a boolean"
        ))),
    }
}

fn set_manual_triggers(raw: &mut JsonValue) {
    if let Some(discovery) = raw.get_mut("discovery").and_then(JsonValue::as_object_mut) {
        discovery.insert("trigger".to_string(), JsonValue::String("manual".to_string()));
    }
    if let Some(bundles) = raw.get_mut("bundles").and_then(JsonValue::as_object_mut) {
        for bundle in bundles.values_mut() {
            if let Some(bundle) = bundle.as_object_mut() {
                bundle.insert("trigger".to_string(), JsonValue::String("manual".to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_bundle_name() {
        let out = interpolate("bundles:\n  {{bundlename}}:\n    resource: bundles/{{ bundlename }}", "pi").unwrap();
        assert_eq!(out, "bundles:\n  pi:\n    resource: bundles/pi");
    }

    #[test]
    fn interpolates_environment() {
        env::set_var("OPAGATE_TEST_TOKEN", "s3cret");
        let out = interpolate("token: {{Env.OPAGATE_TEST_TOKEN}}", "b").unwrap();
        assert_eq!(out, "token: s3cret");
    }

    #[test]
    fn unknown_variable_is_rejected() {
        assert!(matches!(
            interpolate("x: {{bogus}}", "b"),
            Err(OpaError::InvalidConfig(_))
        ));
        assert!(matches!(
            interpolate("x: {{bundlename", "b"),
            Err(OpaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn parses_labels_flags_and_path() {
        let settings = EngineSettings::parse(
            r#"
labels:
  environment: prod
  team: edge
plugins:
  authz:
    path: envoy/authz/allow
    dry-run: true
    skip-request-body-parse: true
"#,
            false,
        )
        .unwrap();
        assert_eq!(settings.labels["environment"], "prod");
        assert!(settings.dry_run);
        assert!(settings.skip_request_body_parse);
        assert_eq!(settings.decision_path(), "envoy/authz/allow");
        assert_eq!(settings.query(), "data.envoy.authz.allow");
    }

    #[test]
    fn defaults_without_authz_section() {
        let settings = EngineSettings::parse("services: {}", false).unwrap();
        assert!(!settings.dry_run);
        assert!(!settings.skip_request_body_parse);
        assert_eq!(settings.query(), "data.authz.allow");
        assert!(settings.labels.is_empty());
    }

    #[test]
    fn custom_control_loop_forces_manual_triggers() {
        let settings = EngineSettings::parse(
            r#"
discovery:
  resource: discovery/main
bundles:
  play:
    resource: bundles/play
  shadow:
    resource: bundles/shadow
"#,
            true,
        )
        .unwrap();
        assert_eq!(settings.raw()["discovery"]["trigger"], "manual");
        assert_eq!(settings.raw()["bundles"]["play"]["trigger"], "manual");
        assert_eq!(settings.raw()["bundles"]["shadow"]["trigger"], "manual");
    }
}
