//! The public facade (spec §4.7, §6): per-verb request methods, fluent
//! `with*` configuration, and engine-control passthroughs.
//!
//! Generic over [`Driver`] the same way [`crate::engine::Engine`] is, so
//! tests build a `Client<MockDriver>` directly; production callers use the
//! `Client<CurlDriver>` default via [`Client::create`].

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::driver::{CurlDriver, Driver};
use crate::engine::{Engine, RequestDescriptor};
use crate::error::ClientError;
use crate::format::{self, Body};
use crate::metrics::MetricsSnapshot;
use crate::middleware::{self, Middleware};
use crate::options::Options;
use crate::promise::{self, Promise, TickFn};
use crate::response::Response;

const VALID_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS", "TRACE", "CONNECT",
];

/// One entry of a [`Client::concurrent`]/[`Client::race`] batch (spec §4.7).
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: String,
    pub url: String,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<Body>,
    pub query: Option<HashMap<String, String>>,
}

impl RequestSpec {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: None,
            body: None,
            query: None,
        }
    }
}

/// Per-client configuration and dispatch surface. `D` defaults to
/// [`CurlDriver`]; tests instantiate `Client<MockDriver>` directly via
/// [`Client::with_driver`].
pub struct Client<D: Driver + 'static = CurlDriver> {
    options: Options,
    middlewares: Rc<Vec<Rc<dyn Middleware<D>>>>,
    response_prototype: Response,
    url_validator: Option<Rc<dyn Fn(&str) -> bool>>,
    engine: Rc<Engine<D>>,
}

impl Client<CurlDriver> {
    /// `create(responsePrototype, options?, maxConcurrent?=50)` (spec §6),
    /// backed by the production [`CurlDriver`].
    pub fn create(response_prototype: Response, options: Option<Options>, max_concurrent: Option<usize>) -> Self {
        Self::with_driver(CurlDriver::new(), response_prototype, options, max_concurrent)
    }
}

impl<D: Driver + 'static> Client<D> {
    /// As [`Client::create`], but with an explicit driver — the entry point
    /// tests use to wire up a [`crate::driver::MockDriver`].
    pub fn with_driver(driver: D, response_prototype: Response, options: Option<Options>, max_concurrent: Option<usize>) -> Self {
        let mut options = options.unwrap_or_default();
        if let Some(max_concurrent) = max_concurrent {
            options.max_concurrent = max_concurrent;
        }
        let engine = Rc::new(Engine::new(
            driver,
            options.max_pool_size,
            options.max_concurrent,
            response_prototype.clone(),
        ));
        Self {
            options,
            middlewares: Rc::new(Vec::new()),
            response_prototype,
            url_validator: None,
            engine,
        }
    }

    /// Build a sibling client sharing this one's middlewares, response
    /// prototype, and URL validator, but carrying `options` and a freshly
    /// forked engine (spec §6: "clones share no mutable state with the
    /// original"; spec §8 property 1). See [`Driver::fork`]/`DESIGN.md`.
    fn derive(&self, options: Options) -> Self {
        let driver = self.engine.fork_driver();
        let engine = Rc::new(Engine::new(
            driver,
            options.max_pool_size,
            options.max_concurrent,
            self.response_prototype.clone(),
        ));
        Self {
            options,
            middlewares: self.middlewares.clone(),
            response_prototype: self.response_prototype.clone(),
            url_validator: self.url_validator.clone(),
            engine,
        }
    }

    pub fn get_options(&self) -> &Options {
        &self.options
    }

    // ------------------------------------------------------------------
    // Fluent configuration (spec §6). Each clones `self.options` and
    // changes exactly one field, per the Options invariant in spec §3.
    // ------------------------------------------------------------------

    pub fn with_base_url(&self, base_url: impl Into<String>) -> Self {
        let mut options = self.options.clone();
        options.base_url = base_url.into();
        self.derive(options)
    }

    /// Sets both the connect and read timeout to `seconds` — the public API
    /// exposes one timeout knob even though `Options` keeps them separate
    /// internally.
    pub fn with_timeout(&self, seconds: f64) -> Self {
        let mut options = self.options.clone();
        let timeout = Duration::from_secs_f64(seconds.max(0.0));
        options.connect_timeout = timeout;
        options.read_timeout = timeout;
        self.derive(options)
    }

    pub fn with_user_agent(&self, user_agent: impl Into<String>) -> Self {
        let mut options = self.options.clone();
        options.user_agent = Some(user_agent.into());
        self.derive(options)
    }

    /// Merges `headers` into the client's default headers (case-insensitive,
    /// last writer wins — spec §3).
    pub fn with_headers(&self, headers: HashMap<String, String>) -> Self {
        let mut options = self.options.clone();
        for (name, value) in headers {
            options.set_default_header(&name, value);
        }
        self.derive(options)
    }

    pub fn with_proxy(&self, proxy: impl Into<String>) -> Self {
        let mut options = self.options.clone();
        options.proxy = Some(proxy.into());
        self.derive(options)
    }

    pub fn without_tls_verification(&self) -> Self {
        let mut options = self.options.clone();
        options.verify_tls = false;
        self.derive(options)
    }

    pub fn with_bearer_token(&self, token: impl AsRef<str>) -> Self {
        let mut options = self.options.clone();
        options.set_default_header("Authorization", format!("Bearer {}", token.as_ref()));
        self.derive(options)
    }

    pub fn with_basic_auth(&self, username: impl AsRef<str>, password: impl AsRef<str>) -> Self {
        use base64::Engine as _;
        let credentials = format!("{}:{}", username.as_ref(), password.as_ref());
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        let mut options = self.options.clone();
        options.set_default_header("Authorization", format!("Basic {encoded}"));
        self.derive(options)
    }

    pub fn as_json(&self) -> Self {
        let mut options = self.options.clone();
        options.set_default_header("Content-Type", "application/json");
        self.derive(options)
    }

    pub fn as_form(&self) -> Self {
        let mut options = self.options.clone();
        options.set_default_header("Content-Type", "application/x-www-form-urlencoded");
        self.derive(options)
    }

    pub fn with_http2(&self, enabled: bool) -> Self {
        let mut options = self.options.clone();
        options.http2_enabled = enabled;
        self.derive(options)
    }

    pub fn with_tcp_keep_alive(&self, enabled: bool) -> Self {
        let mut options = self.options.clone();
        options.tcp_keep_alive = enabled;
        self.derive(options)
    }

    pub fn with_max_pool_size(&self, max_pool_size: usize) -> Self {
        let mut options = self.options.clone();
        options.max_pool_size = max_pool_size;
        self.derive(options)
    }

    pub fn with_max_concurrent(&self, max_concurrent: usize) -> Self {
        let mut options = self.options.clone();
        options.max_concurrent = max_concurrent;
        self.derive(options)
    }

    pub fn with_retry(&self, attempts: u32, delay_seconds: f64, status_codes: Vec<u16>) -> Self {
        let mut options = self.options.clone();
        options.retry_attempts = attempts;
        options.retry_delay = Duration::from_secs_f64(delay_seconds.max(0.0));
        options.retry_status_codes = status_codes;
        self.derive(options)
    }

    pub fn with_options(&self, options: Options) -> Self {
        self.derive(options)
    }

    pub fn with_middleware(&self, middleware: Rc<dyn Middleware<D>>) -> Self {
        let mut middlewares = (*self.middlewares).clone();
        middlewares.push(middleware);
        let mut clone = self.derive(self.options.clone());
        clone.middlewares = Rc::new(middlewares);
        clone
    }

    pub fn with_middlewares(&self, middlewares: Vec<Rc<dyn Middleware<D>>>) -> Self {
        let mut clone = self.derive(self.options.clone());
        clone.middlewares = Rc::new(middlewares);
        clone
    }

    /// Not part of the public surface named in spec §6 verbatim, but
    /// implements the "URL may be subjected to the pluggable predicate"
    /// hook from spec §4.7's Validation paragraph.
    pub fn with_url_validator(&self, validator: Rc<dyn Fn(&str) -> bool>) -> Self {
        let mut clone = self.derive(self.options.clone());
        clone.url_validator = Some(validator);
        clone
    }

    // ------------------------------------------------------------------
    // Request dispatch (spec §4.7).
    // ------------------------------------------------------------------

    /// `request(method, url, headers?, body?, query?) -> Promise<Response>`.
    ///
    /// Method and URL validation happen synchronously before anything is
    /// merged or queued (spec §4.7, §8 property 8); on failure this returns
    /// an already-rejected promise rather than panicking, so every caller —
    /// sync-looking or not — gets one uniform `Promise<Response>` surface.
    pub fn request(
        &self,
        method: &str,
        url: &str,
        headers: Option<HashMap<String, String>>,
        body: Option<Body>,
        query: Option<HashMap<String, String>>,
    ) -> Promise<Response> {
        let method = method.to_ascii_uppercase();
        if !VALID_METHODS.contains(&method.as_str()) {
            return Promise::rejected(ClientError::InvalidInput(format!("unsupported HTTP method: {method}")));
        }

        let absolute_url = match format::build_url(&self.options.base_url, url, &query.unwrap_or_default()) {
            Ok(url) => url,
            Err(e) => return Promise::rejected(e),
        };

        if let Some(validator) = &self.url_validator {
            if !validator(&absolute_url) {
                return Promise::rejected(ClientError::InvalidInput(format!("URL rejected by validator: {absolute_url}")));
            }
        }

        let mut merged_headers = format::merge_headers(&headers.unwrap_or_default(), &self.options.default_headers);
        if !has_header_ci(&merged_headers, "user-agent") {
            merged_headers.insert("User-Agent".to_string(), self.options.effective_user_agent());
        }

        let serialized_body = match format::format_params(&body.unwrap_or(Body::Null), &merged_headers) {
            Ok(body) => body,
            Err(e) => return Promise::rejected(e),
        };

        let descriptor = RequestDescriptor {
            method,
            absolute_url,
            headers: merged_headers,
            body: serialized_body,
            attempt: 1,
            options: self.options.clone(),
        };

        self.dispatch(descriptor)
    }

    fn dispatch(&self, descriptor: RequestDescriptor) -> Promise<Response> {
        let next = middleware::compose(&self.middlewares, self.engine.clone());
        next(descriptor)
    }

    // ------------------------------------------------------------------
    // Verb shorthands (spec §4.7, §6).
    // ------------------------------------------------------------------

    pub fn get(&self, url: &str, headers: Option<HashMap<String, String>>, query: Option<HashMap<String, String>>) -> Promise<Response> {
        self.request("GET", url, headers, None, query)
    }

    pub fn post(&self, url: &str, body: Option<Body>, headers: Option<HashMap<String, String>>) -> Promise<Response> {
        self.request("POST", url, headers, body, None)
    }

    pub fn put(&self, url: &str, body: Option<Body>, headers: Option<HashMap<String, String>>) -> Promise<Response> {
        self.request("PUT", url, headers, body, None)
    }

    pub fn patch(&self, url: &str, body: Option<Body>, headers: Option<HashMap<String, String>>) -> Promise<Response> {
        self.request("PATCH", url, headers, body, None)
    }

    pub fn delete(&self, url: &str, body: Option<Body>, headers: Option<HashMap<String, String>>) -> Promise<Response> {
        self.request("DELETE", url, headers, body, None)
    }

    pub fn head(&self, url: &str, headers: Option<HashMap<String, String>>) -> Promise<Response> {
        self.request("HEAD", url, headers, None, None)
    }

    pub fn options(&self, url: &str, headers: Option<HashMap<String, String>>) -> Promise<Response> {
        self.request("OPTIONS", url, headers, None, None)
    }

    /// `json(method, url, data, headers?)`: applies the JSON content-type
    /// preset on this one call only, without mutating the client (spec
    /// §4.7).
    pub fn json(&self, method: &str, url: &str, data: serde_json::Value, headers: Option<HashMap<String, String>>) -> Promise<Response> {
        let mut headers = headers.unwrap_or_default();
        if !has_header_ci(&headers, "content-type") {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        self.request(method, url, Some(headers), Some(Body::Json(data)), None)
    }

    // ------------------------------------------------------------------
    // Batch helpers (spec §4.7).
    // ------------------------------------------------------------------

    /// `concurrent(requestsMap) -> Promise<map<key, Response>>`, wired to
    /// this client's engine tick so `wait()` on the aggregate advances it.
    pub fn concurrent(&self, requests: HashMap<String, RequestSpec>) -> Promise<HashMap<String, Response>> {
        let promises = requests
            .into_iter()
            .map(|(key, spec)| (key, self.request(&spec.method, &spec.url, spec.headers, spec.body, spec.query)))
            .collect();
        promise::all(promises, Some(self.engine_tick()))
    }

    /// `race(requestsMap) -> Promise<Response>`.
    pub fn race(&self, requests: HashMap<String, RequestSpec>) -> Promise<Response> {
        let promises = requests
            .into_values()
            .map(|spec| self.request(&spec.method, &spec.url, spec.headers, spec.body, spec.query))
            .collect();
        promise::race(promises, Some(self.engine_tick()))
    }

    fn engine_tick(&self) -> TickFn {
        let engine = self.engine.clone();
        Rc::new(move || engine.tick())
    }

    // ------------------------------------------------------------------
    // Engine control passthroughs (spec §4.5, §6).
    // ------------------------------------------------------------------

    pub fn tick(&self) {
        self.engine.tick();
    }

    pub fn wait(&self, timeout: Option<Duration>) {
        self.engine.wait(timeout);
    }

    pub fn has_pending(&self) -> bool {
        self.engine.has_pending()
    }

    pub fn pending_count(&self) -> usize {
        self.engine.pending_count()
    }

    pub fn queued_count(&self) -> usize {
        self.engine.queued_count()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.engine.metrics()
    }
}

fn has_header_ci(headers: &HashMap<String, String>, name: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockDriver, MockOutcome};

    fn test_client() -> (Client<MockDriver>, MockDriver) {
        let driver = MockDriver::new();
        let client = Client::with_driver(driver.clone(), Response::empty(), None, None);
        (client, driver)
    }

    #[test]
    fn with_base_url_does_not_mutate_original() {
        let (client, _driver) = test_client();
        let derived = client.with_base_url("https://h");
        assert_eq!(client.get_options().base_url, "");
        assert_eq!(derived.get_options().base_url, "https://h");
    }

    #[test]
    fn unsupported_method_rejects_without_dispatch() {
        let (client, driver) = test_client();
        let promise = client.request("FOO", "http://t/x", None, None, None);
        assert!(promise.is_rejected());
        assert_eq!(driver.call_count(), 0);
    }

    #[test]
    fn lowercase_method_is_normalized_and_accepted() {
        let (client, driver) = test_client();
        driver.add_response(
            "GET",
            "http://t/ok",
            MockOutcome::Response(Response {
                status: 200,
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::new(),
            }),
        );
        let promise = client.request("get", "http://t/ok", None, None, None);
        client.wait(Some(Duration::from_secs(1)));
        let response = promise.wait(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(driver.calls()[0].method, "GET");
    }

    #[test]
    fn get_resolves_relative_url_against_base() {
        let (client, driver) = test_client();
        let client = client.with_base_url("https://h");
        driver.add_response("GET", "https://h/p", MockOutcome::Response(Response::empty()));
        client.get("/p", None, None);
        client.wait(Some(Duration::from_secs(1)));
        assert_eq!(driver.calls()[0].url, "https://h/p");
    }

    #[test]
    fn json_sets_content_type_without_mutating_client_headers() {
        let (client, driver) = test_client();
        driver.add_response("POST", "http://t/j", MockOutcome::Response(Response::empty()));
        client.json("POST", "http://t/j", serde_json::json!({"a": 1}), None);
        client.wait(Some(Duration::from_secs(1)));
        let call = &driver.calls()[0];
        assert_eq!(call.body.as_deref(), Some(r#"{"a":1}"#));
        assert!(client.get_options().default_headers.is_empty());
    }

    #[test]
    fn url_validator_rejects_before_dispatch() {
        let (client, driver) = test_client();
        let client = client.with_url_validator(Rc::new(|url: &str| url.starts_with("https://")));
        let promise = client.request("GET", "http://t/insecure", None, None, None);
        assert!(promise.is_rejected());
        assert_eq!(driver.call_count(), 0);
    }
}
