//! The abstract "response" the core depends on (spec §1): status, headers,
//! and a readable body. Concrete HTTP response construction belongs to the
//! caller; the core only clones a prototype per completion and overwrites
//! status/body (spec §3, "Response prototype").

use bytes::Bytes;
use http::HeaderMap;
use serde::de::DeserializeOwned;

use crate::error::{ClientError, Result};

/// A completed HTTP response.
///
/// `headers` starts from whatever the constructor-supplied prototype
/// carried (spec §4.5: "clone the response prototype, set status from the
/// handle"); in practice the driver always replaces status and body, so the
/// prototype's only lasting contribution is its header defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// An empty response with no headers, status 0 — the default prototype
    /// passed to [`crate::Client::create`] when the caller has no header
    /// defaults to seed.
    pub fn empty() -> Self {
        Self {
            status: 0,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| ClientError::InvalidInput(format!("response body is not valid UTF-8: {e}")))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ClientError::InvalidInput(format!("failed to decode JSON response body: {e}")))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_decodes_utf8_body() {
        let response = Response {
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"hi"),
        };
        assert_eq!(response.text().unwrap(), "hi");
    }

    #[test]
    fn json_decodes_body() {
        let response = Response {
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"a":1}"#),
        };
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value, serde_json::json!({"a": 1}));
    }

    #[test]
    fn is_success_checks_2xx_range() {
        let mut response = Response::empty();
        response.status = 204;
        assert!(response.is_success());
        response.status = 404;
        assert!(!response.is_success());
    }
}
