//! Authorization adapter: request → evaluation input, raw result → decision.
//!
//! The input document follows the ext-authz shape policies are written
//! against: `attributes.request.http.*` plus the convenience fields
//! `parsed_path`, `parsed_query` and `parsed_body`.

use std::collections::HashMap;

use http::{header, HeaderName, HeaderValue, StatusCode};
use percent_encoding::percent_decode_str;
use pingora_http::RequestHeader;
use serde_json::{json, Map, Value as JsonValue};

use crate::error::{OpaError, OpaResult};

/// One request adapted for evaluation. Borrows from the live request; the
/// optional `body` is the prefix buffered by the evaluator.
pub struct AuthzRequest<'a> {
    pub header: &'a RequestHeader,
    pub body: Option<&'a [u8]>,
    /// The buffered prefix is shorter than the declared content length.
    pub truncated_body: bool,
    pub context_extensions: &'a HashMap<String, String>,
    pub metadata: Option<&'a JsonValue>,
}

/// Build the structured input document for one evaluation.
///
/// Percent-decoded path and query segments must be valid UTF-8; anything
/// else is a [`OpaError::BadRequest`] and surfaces as HTTP 400.
pub fn build_input(req: &AuthzRequest<'_>) -> OpaResult<JsonValue> {
    let uri = &req.header.uri;

    let parsed_path = uri
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(decode_component)
        .collect::<OpaResult<Vec<String>>>()?;

    let mut parsed_query = Map::new();
    if let Some(query) = uri.query() {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let name = decode_component(name)?;
            let value = decode_component(value)?;
            match parsed_query
                .entry(name)
                .or_insert_with(|| JsonValue::Array(Vec::new()))
            {
                JsonValue::Array(values) => values.push(JsonValue::String(value)),
                _ => unreachable!("query entries are always arrays"),
            }
        }
    }

    let mut headers = Map::new();
    for name in req.header.headers.keys() {
        let joined = req
            .header
            .headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(",");
        headers.insert(name.as_str().to_string(), JsonValue::String(joined));
    }

    let host = req
        .header
        .headers
        .get(header::HOST)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .or_else(|| uri.authority().map(ToString::to_string))
        .unwrap_or_default();

    let path = uri
        .path_and_query()
        .map(ToString::to_string)
        .unwrap_or_else(|| uri.path().to_string());

    let mut http = Map::new();
    http.insert("host".to_string(), JsonValue::String(host));
    http.insert(
        "method".to_string(),
        JsonValue::String(req.header.method.as_str().to_string()),
    );
    http.insert("path".to_string(), JsonValue::String(path));
    http.insert("headers".to_string(), JsonValue::Object(headers));

    let mut parsed_body = JsonValue::Null;
    if let Some(body) = req.body {
        http.insert(
            "body".to_string(),
            JsonValue::String(String::from_utf8_lossy(body).into_owned()),
        );
        if !req.truncated_body && is_json(req.header) && !body.is_empty() {
            parsed_body = serde_json::from_slice(body)
                .map_err(|e| OpaError::BadRequest(format!("invalid json body: {e}")))?;
        }
    }

    let mut attributes = Map::new();
    attributes.insert(
        "request".to_string(),
        json!({
            "http": JsonValue::Object(http),
        }),
    );
    if let Some(metadata) = req.metadata {
        attributes.insert("metadataContext".to_string(), metadata.clone());
    }
    if !req.context_extensions.is_empty() {
        attributes.insert(
            "contextExtensions".to_string(),
            JsonValue::Object(
                req.context_extensions
                    .iter()
                    .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                    .collect(),
            ),
        );
    }

    let mut input = Map::new();
    input.insert("attributes".to_string(), JsonValue::Object(attributes));
    input.insert("parsed_path".to_string(), json!(parsed_path));
    input.insert("parsed_query".to_string(), JsonValue::Object(parsed_query));
    if !parsed_body.is_null() {
        input.insert("parsed_body".to_string(), parsed_body);
    }
    if req.truncated_body {
        input.insert("truncated_body".to_string(), JsonValue::Bool(true));
    }
    Ok(JsonValue::Object(input))
}

fn decode_component(raw: &str) -> OpaResult<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| OpaError::BadRequest(format!("invalid utf-8 in request path: {e}")))
}

fn is_json(header: &RequestHeader) -> bool {
    header
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let mime = ct.split(';').next().unwrap_or("").trim();
            mime.eq_ignore_ascii_case("application/json")
        })
        .unwrap_or(false)
}

/// The interpreted decision document.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub allowed: bool,
    pub http_status: Option<StatusCode>,
    /// On deny these become response headers, on allow they are added to
    /// the forwarded request.
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Option<String>,
    pub request_headers_to_remove: Vec<String>,
    pub response_headers_to_add: Vec<(HeaderName, HeaderValue)>,
}

/// Interpret a raw query result. Either a bare boolean or an object with an
/// `allowed` field; every present field must have the documented type or
/// the decision is [`OpaError::DecisionInvalid`].
pub fn parse_decision(raw: &JsonValue) -> OpaResult<Decision> {
    match raw {
        JsonValue::Bool(allowed) => Ok(Decision {
            allowed: *allowed,
            ..Decision::default()
        }),
        JsonValue::Object(fields) => {
            let allowed = match fields.get("allowed") {
                Some(JsonValue::Bool(b)) => *b,
                Some(_) => {
                    return Err(OpaError::DecisionInvalid(
                        "'allowed' must be a boolean".to_string(),
                    ))
                }
                None => {
                    return Err(OpaError::DecisionInvalid(
                        "decision object without 'allowed' field".to_string(),
                    ))
                }
            };
            Ok(Decision {
                allowed,
                http_status: parse_status(fields.get("http_status"))?,
                headers: parse_header_map(fields.get("headers"), "headers")?,
                body: parse_body(fields.get("body"))?,
                request_headers_to_remove: parse_string_list(
                    fields.get("request_headers_to_remove"),
                    "request_headers_to_remove",
                )?,
                response_headers_to_add: parse_header_map(
                    fields.get("response_headers_to_add"),
                    "response_headers_to_add",
                )?,
            })
        }
        JsonValue::Null => Err(OpaError::DecisionInvalid(
            "query result is undefined".to_string(),
        )),
        other => Err(OpaError::DecisionInvalid(format!(
            "unsupported decision type: {other}"
        ))),
    }
}

fn parse_status(value: Option<&JsonValue>) -> OpaResult<Option<StatusCode>> {
    match value {
        None => Ok(None),
        Some(JsonValue::Number(n)) => {
            let code = n
                .as_u64()
                .and_then(|c| u16::try_from(c).ok())
                .and_then(|c| StatusCode::from_u16(c).ok())
                .ok_or_else(|| {
                    OpaError::DecisionInvalid(format!("'http_status' {n} is not a valid status"))
                })?;
            Ok(Some(code))
        }
        Some(_) => Err(OpaError::DecisionInvalid(
            "'http_status' must be a number".to_string(),
        )),
    }
}

fn parse_body(value: Option<&JsonValue>) -> OpaResult<Option<String>> {
    match value {
        None => Ok(None),
        Some(JsonValue::String(body)) => Ok(Some(body.clone())),
        Some(_) => Err(OpaError::DecisionInvalid(
            "'body' must be a string".to_string(),
        )),
    }
}

fn parse_string_list(value: Option<&JsonValue>, field: &str) -> OpaResult<Vec<String>> {
    match value {
        None => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| match item {
                JsonValue::String(s) => Ok(s.clone()),
                _ => Err(OpaError::DecisionInvalid(format!(
                    "'{field}' must contain only strings"
                ))),
            })
            .collect(),
        Some(_) => Err(OpaError::DecisionInvalid(format!(
            "'{field}' must be a list of strings"
        ))),
    }
}

fn parse_header_map(
    value: Option<&JsonValue>,
    field: &str,
) -> OpaResult<Vec<(HeaderName, HeaderValue)>> {
    let map = match value {
        None => return Ok(Vec::new()),
        Some(JsonValue::Object(map)) => map,
        Some(_) => {
            return Err(OpaError::DecisionInvalid(format!(
                "'{field}' must be a mapping of strings"
            )))
        }
    };
    let mut headers = Vec::with_capacity(map.len());
    for (name, value) in map {
        let value = value.as_str().ok_or_else(|| {
            OpaError::DecisionInvalid(format!("'{field}.{name}' must be a string"))
        })?;
        let name = HeaderName::try_from(name.as_str()).map_err(|e| {
            OpaError::DecisionInvalid(format!("'{field}' has invalid header name '{name}': {e}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            OpaError::DecisionInvalid(format!("'{field}.{name}' has an invalid value: {e}"))
        })?;
        headers.push((name, value));
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(method: &str, path: &str) -> RequestHeader {
        RequestHeader::build(method, path.as_bytes(), None).unwrap()
    }

    fn no_extensions() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn builds_basic_input() {
        let mut header = request("GET", "/allow/sub?mode=fast&mode=slow&flag");
        header.insert_header("host", "backend.example").unwrap();
        header.insert_header("x-request-id", "abc").unwrap();
        let extensions = no_extensions();
        let req = AuthzRequest {
            header: &header,
            body: None,
            truncated_body: false,
            context_extensions: &extensions,
            metadata: None,
        };
        let input = build_input(&req).unwrap();
        assert_eq!(input["attributes"]["request"]["http"]["method"], "GET");
        assert_eq!(
            input["attributes"]["request"]["http"]["host"],
            "backend.example"
        );
        assert_eq!(
            input["attributes"]["request"]["http"]["path"],
            "/allow/sub?mode=fast&mode=slow&flag"
        );
        assert_eq!(
            input["attributes"]["request"]["http"]["headers"]["x-request-id"],
            "abc"
        );
        assert_eq!(input["parsed_path"], json!(["allow", "sub"]));
        assert_eq!(input["parsed_query"]["mode"], json!(["fast", "slow"]));
        assert_eq!(input["parsed_query"]["flag"], json!([""]));
    }

    #[test]
    fn percent_decodes_path_segments() {
        let header = request("GET", "/allow%2Fme/caf%C3%A9");
        let extensions = no_extensions();
        let req = AuthzRequest {
            header: &header,
            body: None,
            truncated_body: false,
            context_extensions: &extensions,
            metadata: None,
        };
        let input = build_input(&req).unwrap();
        assert_eq!(input["parsed_path"], json!(["allow/me", "café"]));
    }

    #[test]
    fn invalid_utf8_path_is_a_bad_request() {
        let header = request("GET", "/allow/%c0%ae%c0%ae");
        let extensions = no_extensions();
        let req = AuthzRequest {
            header: &header,
            body: None,
            truncated_body: false,
            context_extensions: &extensions,
            metadata: None,
        };
        assert!(matches!(
            build_input(&req),
            Err(OpaError::BadRequest(_))
        ));
    }

    #[test]
    fn json_bodies_are_parsed() {
        let mut header = request("POST", "/allow_body");
        header
            .insert_header("content-type", "application/json")
            .unwrap();
        let extensions = no_extensions();
        let body = br#"{"target_id":"123456"}"#;
        let req = AuthzRequest {
            header: &header,
            body: Some(body),
            truncated_body: false,
            context_extensions: &extensions,
            metadata: None,
        };
        let input = build_input(&req).unwrap();
        assert_eq!(input["parsed_body"]["target_id"], "123456");
        assert_eq!(
            input["attributes"]["request"]["http"]["body"],
            r#"{"target_id":"123456"}"#
        );
    }

    #[test]
    fn truncated_bodies_skip_json_parsing() {
        let mut header = request("POST", "/allow_body");
        header
            .insert_header("content-type", "application/json")
            .unwrap();
        let extensions = no_extensions();
        let req = AuthzRequest {
            header: &header,
            body: Some(br#"{"target_id":"12"#),
            truncated_body: true,
            context_extensions: &extensions,
            metadata: None,
        };
        let input = build_input(&req).unwrap();
        assert_eq!(input["truncated_body"], true);
        assert!(input.get("parsed_body").is_none());
    }

    #[test]
    fn invalid_json_body_is_a_bad_request() {
        let mut header = request("POST", "/allow_body");
        header
            .insert_header("content-type", "application/json")
            .unwrap();
        let extensions = no_extensions();
        let req = AuthzRequest {
            header: &header,
            body: Some(b"{nope"),
            truncated_body: false,
            context_extensions: &extensions,
            metadata: None,
        };
        assert!(matches!(build_input(&req), Err(OpaError::BadRequest(_))));
    }

    #[test]
    fn context_extensions_and_metadata_are_attached() {
        let header = request("GET", "/allow");
        let extensions =
            HashMap::from([("com.mycompany.myprop".to_string(), "myvalue".to_string())]);
        let metadata = json!({"filter_metadata": {"envoy.filters.http.header_to_metadata": {}}});
        let req = AuthzRequest {
            header: &header,
            body: None,
            truncated_body: false,
            context_extensions: &extensions,
            metadata: Some(&metadata),
        };
        let input = build_input(&req).unwrap();
        assert_eq!(
            input["attributes"]["contextExtensions"]["com.mycompany.myprop"],
            "myvalue"
        );
        assert_eq!(input["attributes"]["metadataContext"], metadata);
    }

    #[test]
    fn bare_boolean_decisions() {
        assert!(parse_decision(&json!(true)).unwrap().allowed);
        assert!(!parse_decision(&json!(false)).unwrap().allowed);
    }

    #[test]
    fn structured_decision() {
        let decision = parse_decision(&json!({
            "allowed": true,
            "headers": {"x-consumer": "v"},
            "request_headers_to_remove": ["x-remove-me", "absent-header"],
            "response_headers_to_add": {"x-response-header": "a response header value"},
        }))
        .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.headers[0].0.as_str(), "x-consumer");
        assert_eq!(
            decision.request_headers_to_remove,
            vec!["x-remove-me", "absent-header"]
        );
        assert_eq!(
            decision.response_headers_to_add[0].1,
            "a response header value"
        );
    }

    #[test]
    fn deny_with_status_and_body() {
        let decision = parse_decision(&json!({
            "allowed": false,
            "http_status": 401,
            "body": "unauthorized",
        }))
        .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.http_status, Some(StatusCode::UNAUTHORIZED));
        assert_eq!(decision.body.as_deref(), Some("unauthorized"));
    }

    #[test]
    fn malformed_decisions_are_rejected() {
        for raw in [
            json!(null),
            json!(42),
            json!({"allowed": "yes"}),
            json!({}),
            json!({"allowed": true, "headers": ["not", "a", "map"]}),
            json!({"allowed": true, "headers": {"x": 1}}),
            json!({"allowed": false, "http_status": 99}),
            json!({"allowed": false, "http_status": "teapot"}),
            json!({"allowed": false, "body": {"nested": true}}),
            json!({"allowed": true, "request_headers_to_remove": [1]}),
        ] {
            assert!(
                matches!(parse_decision(&raw), Err(OpaError::DecisionInvalid(_))),
                "expected DecisionInvalid for {raw}"
            );
        }
    }
}
