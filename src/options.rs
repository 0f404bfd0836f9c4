//! Immutable per-client configuration.
//!
//! `Options` mirrors the teacher's `RequestContext`/`DaemonConfig` shape: a
//! plain struct with a `Default` impl and small constructor helpers, not a
//! fluent builder of its own — the fluent surface lives on [`crate::Client`],
//! whose `with*` methods each clone the current `Options` and replace one
//! field (spec §3 invariant: every `with*` produces a new value).

use std::collections::HashMap;
use std::time::Duration;

/// Immutable bag of per-client settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub verify_tls: bool,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    /// Default headers, case-insensitive by name; last writer wins.
    pub default_headers: HashMap<String, String>,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub retry_status_codes: Vec<u16>,
    pub http2_enabled: bool,
    pub tcp_keep_alive: bool,
    pub max_pool_size: usize,
    pub max_concurrent: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            max_redirects: 5,
            verify_tls: true,
            user_agent: None,
            proxy: None,
            default_headers: HashMap::new(),
            retry_attempts: 0,
            retry_delay: Duration::from_secs(1),
            retry_status_codes: vec![429, 502, 503, 504],
            http2_enabled: false,
            tcp_keep_alive: true,
            max_pool_size: 16,
            max_concurrent: 50,
        }
    }
}

impl Options {
    /// Insert (or overwrite, case-insensitively) a default header.
    ///
    /// Mutates `self` in place; callers that want the spec's immutability
    /// invariant go through `Client::with_headers`, which clones first.
    pub(crate) fn set_default_header(&mut self, name: &str, value: impl Into<String>) {
        // Remove any existing entry that differs only by case before inserting,
        // so the map never accumulates "Content-Type" and "content-type" both.
        if let Some(existing_key) = self
            .default_headers
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()
        {
            self.default_headers.remove(&existing_key);
        }
        self.default_headers.insert(name.to_string(), value.into());
    }

    /// The `User-Agent` header value to send when the caller hasn't set one.
    pub fn effective_user_agent(&self) -> String {
        self.user_agent.clone().unwrap_or_else(|| {
            format!(
                "promissory/{} (rust {})",
                env!("CARGO_PKG_VERSION"),
                rustc_version_hint()
            )
        })
    }
}

/// A coarse runtime identifier used only for the default User-Agent string;
/// the exact rustc version isn't embeddable without a build script, so this
/// reports the edition the crate was compiled against instead.
fn rustc_version_hint() -> &'static str {
    "2021"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let options = Options::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.retry_attempts, 0);
        assert_eq!(options.retry_status_codes, vec![429, 502, 503, 504]);
        assert!(options.follow_redirects);
        assert!(options.verify_tls);
    }

    #[test]
    fn set_default_header_is_case_insensitive_last_writer_wins() {
        let mut options = Options::default();
        options.set_default_header("Content-Type", "text/plain");
        options.set_default_header("content-type", "application/json");
        assert_eq!(options.default_headers.len(), 1);
        assert_eq!(
            options.default_headers.get("content-type"),
            Some(&"application/json".to_string())
        );
    }

    #[test]
    fn user_agent_defaults_to_library_identifier() {
        let options = Options::default();
        let ua = options.effective_user_agent();
        assert!(ua.contains("promissory"));
    }
}
