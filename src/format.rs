//! Pure functions for merging, sanitizing, and formatting headers and bodies.
//!
//! Every function here is side-effect free (spec §4.2), which is what makes
//! them directly testable against the literal examples in spec §8.

use std::collections::HashMap;

use http::header::HeaderName;
use url::form_urlencoded;

use crate::error::ClientError;

/// One formatted "Name: Value" header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
}

/// Render a header map into wire-ready "Name: Value" lines.
///
/// Entries with an empty value are skipped. Names must be valid HTTP tokens
/// (RFC 7230 `token`); values must not contain CR, LF, or NUL and must stay
/// within visible ASCII plus the high-byte range.
pub fn format_headers(headers: &HashMap<String, String>) -> Result<Vec<HeaderLine>, ClientError> {
    let mut lines = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        validate_header_name(name)?;
        validate_header_value(value)?;
        lines.push(HeaderLine {
            name: name.clone(),
            value: value.to_string(),
        });
    }
    Ok(lines)
}

/// Validate a header name against the HTTP token grammar using the same
/// token rules `http::HeaderName` enforces.
pub fn validate_header_name(name: &str) -> Result<(), ClientError> {
    HeaderName::from_bytes(name.as_bytes())
        .map(|_| ())
        .map_err(|_| ClientError::InvalidInput(format!("invalid header name: {name:?}")))
}

/// Validate a header value: no CR, LF, or NUL, and only visible ASCII or the
/// high-byte range (obs-text, RFC 7230 §3.2.6).
pub fn validate_header_value(value: &str) -> Result<(), ClientError> {
    for byte in value.bytes() {
        if byte == b'\r' || byte == b'\n' || byte == 0 {
            return Err(ClientError::InvalidInput(format!(
                "header value contains CR/LF/NUL: {value:?}"
            )));
        }
        let printable_ascii = (0x20..=0x7e).contains(&byte);
        let obs_text = byte >= 0x80;
        if !printable_ascii && !obs_text {
            return Err(ClientError::InvalidInput(format!(
                "header value contains invalid byte 0x{byte:02x}"
            )));
        }
    }
    Ok(())
}

/// Case-insensitive lookup of the Content-Type header; defaults to form
/// encoding when absent, matching the HTML-form convention most HTTP
/// libraries assume.
pub fn get_content_type(headers: &HashMap<String, String>) -> String {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| "application/x-www-form-urlencoded".to_string())
}

/// A request body in its pre-serialization shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Null,
    Text(String),
    Json(serde_json::Value),
    /// Form fields rendered in insertion order.
    Form(Vec<(String, String)>),
}

/// Serialize a body according to the Content-Type header.
///
/// - `Null` passes through as `None`.
/// - `Text` passes through unchanged.
/// - Content-Type containing `json` JSON-encodes (UTF-8, slashes not escaped).
/// - Otherwise `Form` is URL-encoded as form fields.
pub fn format_params(body: &Body, headers: &HashMap<String, String>) -> Result<Option<String>, ClientError> {
    match body {
        Body::Null => Ok(None),
        Body::Text(text) => Ok(Some(text.clone())),
        Body::Json(value) => {
            let content_type = get_content_type(headers);
            if content_type.to_ascii_lowercase().contains("json") {
                serde_json::to_string(value)
                    .map(Some)
                    .map_err(|e| ClientError::InvalidInput(format!("failed to encode JSON body: {e}")))
            } else {
                // A structured value paired with a non-JSON content type still
                // round-trips through string-casting the scalar leaves, or
                // form-encoding an object's top-level fields.
                match value {
                    serde_json::Value::Object(map) => {
                        let pairs = map
                            .iter()
                            .map(|(k, v)| (k.clone(), scalar_to_string(v)))
                            .collect();
                        Ok(Some(encode_form(&pairs)))
                    }
                    other => Ok(Some(scalar_to_string(other))),
                }
            }
        }
        Body::Form(fields) => Ok(Some(encode_form(fields))),
    }
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn encode_form(fields: &[(String, String)]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in fields {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Case-insensitive union of two header maps where `custom` wins; the
/// surviving key keeps whichever side's casing last wrote it (i.e. `custom`'s
/// casing, since `custom` always wins on conflict).
pub fn merge_headers(
    custom: &HashMap<String, String>,
    defaults: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged: HashMap<String, String> = HashMap::new();
    let mut canonical_keys: HashMap<String, String> = HashMap::new();

    for (key, value) in defaults {
        let lower = key.to_ascii_lowercase();
        canonical_keys.insert(lower.clone(), key.clone());
        merged.insert(lower, value.clone());
    }
    for (key, value) in custom {
        let lower = key.to_ascii_lowercase();
        canonical_keys.insert(lower.clone(), key.clone());
        merged.insert(lower, value.clone());
    }

    merged
        .into_iter()
        .map(|(lower, value)| (canonical_keys.remove(&lower).unwrap_or(lower), value))
        .collect()
}

/// Resolve a request URL and optional query map into the absolute URL the
/// driver will see: prepend `base` when `url` is relative, and append the
/// query map (URL-encoded) after any existing query string.
pub fn build_url(
    base: &str,
    url: &str,
    query: &HashMap<String, String>,
) -> Result<String, ClientError> {
    let is_absolute = url.contains("://");
    let joined = if is_absolute || base.is_empty() {
        url.to_string()
    } else {
        format!("{}{}", base.trim_end_matches('/'), ensure_leading_slash(url))
    };

    if query.is_empty() {
        return Ok(joined);
    }

    let separator = if joined.contains('?') { '&' } else { '?' };
    let mut pairs: Vec<_> = query.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let encoded = {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in pairs {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    };

    Ok(format!("{joined}{separator}{encoded}"))
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn merge_headers_is_case_insensitive_custom_wins() {
        let merged = merge_headers(&map(&[("content-type", "a")]), &map(&[("Content-Type", "b")]));
        assert_eq!(merged.len(), 1);
        let (_, value) = merged.iter().next().unwrap();
        assert_eq!(value, "a");
    }

    #[test]
    fn format_headers_rejects_crlf_injection() {
        let headers = map(&[("X", "a\r\nY: b")]);
        assert!(format_headers(&headers).is_err());
    }

    #[test]
    fn format_headers_skips_empty_values() {
        let headers = map(&[("X-Empty", ""), ("X-Present", "v")]);
        let lines = format_headers(&headers).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].name, "X-Present");
    }

    #[test]
    fn json_body_round_trips() {
        let body = Body::Json(serde_json::json!({"a": 1, "b": "x"}));
        let headers = map(&[("content-type", "application/json")]);
        let serialized = format_params(&body, &headers).unwrap().unwrap();
        let decoded: serde_json::Value = serde_json::from_str(&serialized).unwrap();
        assert_eq!(decoded, serde_json::json!({"a": 1, "b": "x"}));
    }

    #[test]
    fn build_url_joins_base_and_relative_path() {
        let query = HashMap::new();
        let url = build_url("https://h", "/p", &query).unwrap();
        assert_eq!(url, "https://h/p");
    }

    #[test]
    fn build_url_passes_through_absolute_url() {
        let query = HashMap::new();
        let url = build_url("https://h", "http://other/x", &query).unwrap();
        assert_eq!(url, "http://other/x");
    }

    #[test]
    fn build_url_appends_query_after_existing_query() {
        let query = map(&[("new", "1")]);
        let url = build_url("https://h", "https://h/p?existing=1", &query).unwrap();
        assert_eq!(url, "https://h/p?existing=1&new=1");
    }
}
