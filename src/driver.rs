//! The multiplexed transfer engine (spec §4.5 glossary: "Driver").
//!
//! The dispatch engine in [`crate::engine`] only depends on the [`Driver`]
//! trait: admit a prepared request, perform, wait for readiness, drain
//! completions. [`CurlDriver`] is the production implementation, built on
//! `curl::multi::Multi`/`Easy2` — SPEC_FULL §9 notes `add2`/`perform`/
//! `wait`/`messages` is a near-literal match for that contract.
//! [`MockDriver`] is the deterministic test double used throughout this
//! crate's tests and `tests/end_to_end.rs`, in the same spirit as the
//! teacher's `MockHttpClient` in `http.rs`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::ClientError;
use crate::format::HeaderLine;
use crate::response::Response;

/// Monotonically increasing identifier correlating a completion back to its
/// active entry (spec §9 design note "Handle identity for keying").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferToken(pub u64);

/// A fully-resolved request ready to hand to the driver.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<HeaderLine>,
    pub body: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub verify_tls: bool,
    pub proxy: Option<String>,
    pub http2: bool,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub tcp_keep_alive: bool,
}

/// What a completed transfer produced.
pub enum Outcome {
    Success(Response),
    Error(String),
}

/// A transfer the driver has finished with, paired with the handle it was
/// running on so the engine can release it to the pool.
pub struct Completion<H> {
    pub token: TransferToken,
    pub handle: H,
    pub outcome: Outcome,
}

/// The opaque transfer driver contract (spec glossary: "Driver"). Generic
/// over the handle type so [`crate::pool::Pool`] and the dispatch engine
/// stay agnostic to whether they're driving real sockets or a mock.
pub trait Driver {
    type Handle;

    /// Allocate a new idle handle (spec §3 "Idle handle").
    fn new_handle(&self) -> Self::Handle;

    /// Clear a handle's headers, auth, cookies, and body before reuse.
    fn reset_handle(&self, handle: &mut Self::Handle);

    /// Release a handle's underlying resources.
    fn close_handle(&self, handle: Self::Handle);

    /// Configure `handle` for `request` and admit it into the driver's
    /// active set, returning the token used to correlate its completion.
    fn admit(&mut self, handle: Self::Handle, request: &PreparedRequest) -> Result<TransferToken, ClientError>;

    /// Do one unit of work. Returns `true` if the driver has more immediate
    /// work to do and should be called again before moving on (spec §4.5
    /// tick step 2, "call again immediately" signal).
    fn perform(&mut self) -> Result<bool, ClientError>;

    /// Block up to `timeout` for socket readiness or a completion, bounded
    /// to a few milliseconds by callers (spec §4.5 `wait`, §5).
    fn wait_readiness(&mut self, timeout: Duration);

    /// Drain and return every transfer that has completed since the last
    /// drain.
    fn drain_completions(&mut self) -> Vec<Completion<Self::Handle>>;

    /// True if the driver currently has no transfers in flight.
    fn is_idle(&self) -> bool;

    /// Produce a fresh, independent driver of the same kind, with no
    /// in-flight transfers (spec §6: `Client::with*` methods "share no
    /// mutable state" with their origin). For [`CurlDriver`] this is a
    /// brand new `Multi` — client-owned transport state never leaks across
    /// a `with*` clone. [`MockDriver`] deliberately breaks this by sharing
    /// its canned-response backend (see its impl) so tests can configure
    /// responses once and reuse them across a `with*` chain, the same way
    /// multiple `reqwest::Client`s can point at one `wiremock` server.
    fn fork(&self) -> Self
    where
        Self: Sized;
}

// ============================================================================
// Production implementation: libcurl's multi interface
// ============================================================================

/// Buffers a transfer's response headers and body as curl streams them in.
struct Collector {
    status: u16,
    headers: http::HeaderMap,
    body: Vec<u8>,
}

impl Collector {
    fn new() -> Self {
        Self {
            status: 0,
            headers: http::HeaderMap::new(),
            body: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.status = 0;
        self.headers = http::HeaderMap::new();
        self.body.clear();
    }
}

impl curl::easy::Handler for Collector {
    fn header(&mut self, data: &[u8]) -> bool {
        if let Ok(line) = std::str::from_utf8(data) {
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some((name, value)) = line.split_once(':') {
                if let (Ok(name), Ok(value)) = (
                    http::header::HeaderName::from_bytes(name.trim().as_bytes()),
                    http::header::HeaderValue::from_str(value.trim()),
                ) {
                    self.headers.append(name, value);
                }
            }
        }
        true
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, curl::easy::WriteError> {
        self.body.extend_from_slice(data);
        Ok(data.len())
    }
}

/// A pooled, reusable curl easy handle plus the response buffer attached to
/// it (spec §3 "Idle handle").
pub struct CurlHandle {
    easy: curl::easy::Easy2<Collector>,
}

/// The production [`Driver`], wrapping `curl::multi::Multi`.
pub struct CurlDriver {
    multi: curl::multi::Multi,
    in_flight: HashMap<TransferToken, curl::multi::Easy2Handle<Collector>>,
    next_token: u64,
}

impl CurlDriver {
    pub fn new() -> Self {
        Self {
            multi: curl::multi::Multi::new(),
            in_flight: HashMap::new(),
            next_token: 1,
        }
    }

    fn next_token(&mut self) -> TransferToken {
        let token = TransferToken(self.next_token);
        self.next_token += 1;
        token
    }
}

/// Build a [`ClientError::Transport`] carrying `request`'s real url/method
/// (spec §7: `TransportKind` "Carries url, method, and the underlying text"),
/// rather than the blanks the `curl::Error`/`curl::MultiError` `From` impls
/// below produce when there's no request in scope to attach.
fn request_transport_err(request: &PreparedRequest, message: impl std::fmt::Display) -> ClientError {
    ClientError::Transport {
        url: request.url.clone(),
        method: request.method.clone(),
        message: message.to_string(),
    }
}

impl Default for CurlDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for CurlDriver {
    type Handle = CurlHandle;

    fn new_handle(&self) -> Self::Handle {
        CurlHandle {
            easy: curl::easy::Easy2::new(Collector::new()),
        }
    }

    fn reset_handle(&self, handle: &mut Self::Handle) {
        handle.easy.reset();
        handle.easy.get_mut().reset();
    }

    fn close_handle(&self, _handle: Self::Handle) {
        // Dropping the Easy2 releases its socket/session state.
    }

    fn admit(&mut self, mut handle: Self::Handle, request: &PreparedRequest) -> Result<TransferToken, ClientError> {
        // `?` on a bare `curl::Error`/`curl::MultiError` would go through the
        // blanket `From` impls below, which have no request to attach to and
        // leave `url`/`method` blank (spec §7 requires both on `TransportKind`).
        // `request.url`/`request.method` are in scope here, so attach them
        // directly instead.
        let transport_err = |e: &dyn std::fmt::Display| request_transport_err(request, e);

        let easy = &mut handle.easy;
        easy.url(&request.url).map_err(|e| transport_err(&e))?;
        easy.custom_request(&request.method).map_err(|e| transport_err(&e))?;
        easy.ssl_verify_peer(request.verify_tls).map_err(|e| transport_err(&e))?;
        easy.ssl_verify_host(request.verify_tls).map_err(|e| transport_err(&e))?;
        easy.connect_timeout(request.connect_timeout).map_err(|e| transport_err(&e))?;
        easy.timeout(request.read_timeout).map_err(|e| transport_err(&e))?;
        easy.http_version(if request.http2 {
            curl::easy::HttpVersion::V2
        } else {
            curl::easy::HttpVersion::V11
        })
        .map_err(|e| transport_err(&e))?;
        if let Some(proxy) = &request.proxy {
            easy.proxy(proxy).map_err(|e| transport_err(&e))?;
        }
        easy.follow_location(request.follow_redirects).map_err(|e| transport_err(&e))?;
        if request.follow_redirects {
            easy.max_redirections(request.max_redirects).map_err(|e| transport_err(&e))?;
        }
        easy.tcp_keepalive(request.tcp_keep_alive).map_err(|e| transport_err(&e))?;

        let mut header_list = curl::easy::List::new();
        for line in &request.headers {
            header_list
                .append(&format!("{}: {}", line.name, line.value))
                .map_err(|e| transport_err(&e))?;
        }
        easy.http_headers(header_list).map_err(|e| transport_err(&e))?;

        if let Some(body) = &request.body {
            easy.post(true).map_err(|e| transport_err(&e))?;
            easy.post_field_size(body.len() as u64).map_err(|e| transport_err(&e))?;
            easy.post_fields_copy(body.as_bytes()).map_err(|e| transport_err(&e))?;
        }

        let mut handle_in_multi = self.multi.add2(handle.easy).map_err(|e| transport_err(&e))?;
        let token = self.next_token();
        handle_in_multi
            .set_token(token.0 as usize)
            .map_err(|e| transport_err(&e))?;
        self.in_flight.insert(token, handle_in_multi);
        tracing::debug!(token = token.0, method = %request.method, url = %request.url, "admitted transfer");
        Ok(token)
    }

    fn perform(&mut self) -> Result<bool, ClientError> {
        let running = self.multi.perform()?;
        Ok(running as usize != self.in_flight.len())
    }

    fn wait_readiness(&mut self, timeout: Duration) {
        let _ = self.multi.wait(&mut [], timeout);
    }

    fn drain_completions(&mut self) -> Vec<Completion<Self::Handle>> {
        let mut finished_tokens = Vec::new();
        self.multi.messages(|message| {
            if let Ok(token) = message.token() {
                finished_tokens.push((TransferToken(token as u64), message.result()));
            }
        });

        let mut completions = Vec::new();
        for (token, result) in finished_tokens {
            let Some(mut multi_handle) = self.in_flight.remove(&token) else {
                tracing::error!(token = token.0, "completion for unknown token");
                continue;
            };
            let outcome = match result {
                Some(Ok(())) => {
                    let status = multi_handle.response_code().unwrap_or(0) as u16;
                    let collector = multi_handle.get_ref();
                    Outcome::Success(Response {
                        status,
                        headers: collector.headers.clone(),
                        body: bytes::Bytes::copy_from_slice(&collector.body),
                    })
                }
                Some(Err(e)) => Outcome::Error(e.to_string()),
                None => Outcome::Error("transfer did not complete".to_string()),
            };
            match self.multi.remove2(multi_handle) {
                Ok(easy) => completions.push(Completion {
                    token,
                    handle: CurlHandle { easy },
                    outcome,
                }),
                Err(e) => tracing::error!(token = token.0, error = %e, "failed to remove completed handle"),
            }
        }
        completions
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn fork(&self) -> Self {
        Self::new()
    }
}

// ============================================================================
// Test/Mock implementation
// ============================================================================

/// A mock idle handle. Carries no real connection state; `reset_count`
/// exists only so tests can assert the pool actually resets handles before
/// reuse.
#[derive(Debug, Clone, Copy)]
pub struct MockHandle {
    pub id: u64,
    pub reset_count: u32,
}

/// A canned outcome for one mock admission.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Response(Response),
    Error(String),
}

/// Record of one request the mock driver observed, for assertions in tests
/// (mirrors the teacher's `MockCall`/`get_calls` in `http.rs`).
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub url: String,
    pub body: Option<String>,
}

struct MockActive {
    key: String,
    admitted_at: Instant,
    delay: Duration,
}

struct MockState {
    next_handle_id: u64,
    next_token: u64,
    active: HashMap<TransferToken, MockActive>,
    responses: HashMap<String, VecDeque<MockOutcome>>,
    default_delay: Duration,
    calls: Vec<MockCall>,
}

/// A deterministic [`Driver`] double. Requests complete once their
/// configured delay (default: instant) has elapsed since admission, at which
/// point the next queued response for `"METHOD URL"` is served — or a
/// driver error if none was configured, matching the teacher's
/// "no mock response configured" fallback in `MockHttpClient::execute`.
#[derive(Clone)]
pub struct MockDriver {
    state: Rc<RefCell<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MockState {
                next_handle_id: 1,
                next_token: 1,
                active: HashMap::new(),
                responses: HashMap::new(),
                default_delay: Duration::ZERO,
                calls: Vec::new(),
            })),
        }
    }

    /// Queue a response for `"METHOD URL"`, FIFO per key.
    pub fn add_response(&self, method: &str, url: &str, outcome: MockOutcome) {
        let key = format!("{method} {url}");
        self.state
            .borrow_mut()
            .responses
            .entry(key)
            .or_default()
            .push_back(outcome);
    }

    /// Hold every subsequently admitted transfer active for `delay` before
    /// it is eligible to complete (used to exercise the concurrency cap).
    pub fn set_default_delay(&self, delay: Duration) {
        self.state.borrow_mut().default_delay = delay;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.borrow().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.borrow().calls.len()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MockDriver {
    type Handle = MockHandle;

    fn new_handle(&self) -> Self::Handle {
        let mut state = self.state.borrow_mut();
        let id = state.next_handle_id;
        state.next_handle_id += 1;
        MockHandle { id, reset_count: 0 }
    }

    fn reset_handle(&self, handle: &mut Self::Handle) {
        handle.reset_count += 1;
    }

    fn close_handle(&self, _handle: Self::Handle) {}

    fn admit(&mut self, _handle: Self::Handle, request: &PreparedRequest) -> Result<TransferToken, ClientError> {
        let mut state = self.state.borrow_mut();
        let token = TransferToken(state.next_token);
        state.next_token += 1;
        let key = format!("{} {}", request.method, request.url);
        let delay = state.default_delay;
        state.active.insert(
            token,
            MockActive {
                key,
                admitted_at: Instant::now(),
                delay,
            },
        );
        state.calls.push(MockCall {
            method: request.method.clone(),
            url: request.url.clone(),
            body: request.body.clone(),
        });
        Ok(token)
    }

    fn perform(&mut self) -> Result<bool, ClientError> {
        Ok(false)
    }

    fn wait_readiness(&mut self, timeout: Duration) {
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
    }

    fn drain_completions(&mut self) -> Vec<Completion<Self::Handle>> {
        let mut state = self.state.borrow_mut();
        let now = Instant::now();
        let ready: Vec<TransferToken> = state
            .active
            .iter()
            .filter(|(_, active)| now.duration_since(active.admitted_at) >= active.delay)
            .map(|(token, _)| *token)
            .collect();

        let mut completions = Vec::new();
        for token in ready {
            let active = state.active.remove(&token).expect("token just observed present");
            let outcome = match state.responses.get_mut(&active.key).and_then(VecDeque::pop_front) {
                Some(MockOutcome::Response(response)) => Outcome::Success(response),
                Some(MockOutcome::Error(message)) => Outcome::Error(message),
                None => Outcome::Error(format!("no mock response configured for {}", active.key)),
            };
            completions.push(Completion {
                token,
                handle: MockHandle { id: 0, reset_count: 0 },
                outcome,
            });
        }
        completions
    }

    fn is_idle(&self) -> bool {
        self.state.borrow().active.is_empty()
    }

    /// Deliberately shares `self.state` rather than building a fresh
    /// backend — see the trait doc comment and `DESIGN.md`.
    fn fork(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, url: &str) -> PreparedRequest {
        PreparedRequest {
            method: method.to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            verify_tls: true,
            proxy: None,
            http2: false,
            follow_redirects: true,
            max_redirects: 5,
            tcp_keep_alive: true,
        }
    }

    #[test]
    fn request_transport_err_carries_the_failing_requests_url_and_method() {
        let err = request_transport_err(&request("POST", "http://t/broken"), "connection refused");
        match err {
            ClientError::Transport { url, method, message } => {
                assert_eq!(url, "http://t/broken");
                assert_eq!(method, "POST");
                assert_eq!(message, "connection refused");
            }
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    #[test]
    fn mock_driver_completes_with_configured_response() {
        let driver = MockDriver::new();
        driver.add_response(
            "GET",
            "http://t/ok",
            MockOutcome::Response(Response {
                status: 200,
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::from_static(b"hi"),
            }),
        );
        let mut driver = driver;
        let handle = driver.new_handle();
        let token = driver.admit(handle, &request("GET", "http://t/ok")).unwrap();
        let completions = driver.drain_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].token, token);
        match &completions[0].outcome {
            Outcome::Success(response) => assert_eq!(response.status, 200),
            Outcome::Error(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn mock_driver_errors_with_no_configured_response() {
        let mut driver = MockDriver::new();
        let handle = driver.new_handle();
        driver.admit(handle, &request("GET", "http://t/missing")).unwrap();
        let completions = driver.drain_completions();
        assert!(matches!(completions[0].outcome, Outcome::Error(_)));
    }

    #[test]
    fn mock_driver_holds_transfers_for_configured_delay() {
        let mut driver = MockDriver::new();
        driver.set_default_delay(Duration::from_millis(20));
        driver.add_response(
            "GET",
            "http://t/slow",
            MockOutcome::Response(Response::empty()),
        );
        let handle = driver.new_handle();
        driver.admit(handle, &request("GET", "http://t/slow")).unwrap();
        assert!(driver.drain_completions().is_empty());
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(driver.drain_completions().len(), 1);
    }
}
