//! The dispatch engine (spec §4.5): admission queue, active set, completion
//! demux, retry scheduling.
//!
//! `tick()`'s four steps map onto the shape of the teacher's `Daemon::run`
//! loop body (claim → acquire permit → spawn → poll completions), collapsed
//! into one synchronous function since there's no executor to spawn onto —
//! the `JoinSet`-based "poll for completed tasks" step becomes
//! [`crate::driver::Driver::drain_completions`].

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::driver::{Completion, Driver, Outcome as DriverOutcome, PreparedRequest, TransferToken};
use crate::error::ClientError;
use crate::format::{self, HeaderLine};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::options::Options;
use crate::pool::Pool;
use crate::promise::{Deferred, Promise, TickFn};
use crate::response::Response;
use crate::retry;

/// A fully-merged, not-yet-admitted request, carrying everything the
/// engine needs across retries (spec §3 "Request descriptor").
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: String,
    pub absolute_url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    /// 1-based attempt counter (spec glossary "Attempt").
    pub attempt: u32,
    /// Cloned at request time so the retry policy sees the options in
    /// effect when the request was submitted, even many ticks later.
    pub options: Options,
}

struct ActiveEntry {
    deferred: Deferred<Response>,
    descriptor: RequestDescriptor,
}

struct QueuedEntry {
    deferred: Deferred<Response>,
    descriptor: RequestDescriptor,
    not_before: Instant,
}

/// Owns the active set, queue, connection pool, and driver for one client
/// (spec §3 "Ownership"). Never shared mutably across clients — see
/// `DESIGN.md` for how `Client::with*` methods treat this.
pub struct Engine<D: Driver> {
    driver: RefCell<D>,
    pool: Pool<D>,
    active: RefCell<HashMap<TransferToken, ActiveEntry>>,
    queue: RefCell<VecDeque<QueuedEntry>>,
    metrics: Metrics,
    max_concurrent: std::cell::Cell<usize>,
    response_prototype: Response,
}

impl<D: Driver> Engine<D> {
    pub fn new(driver: D, max_pool_size: usize, max_concurrent: usize, response_prototype: Response) -> Self {
        Self {
            driver: RefCell::new(driver),
            pool: Pool::new(max_pool_size),
            active: RefCell::new(HashMap::new()),
            queue: RefCell::new(VecDeque::new()),
            metrics: Metrics::new(),
            max_concurrent: std::cell::Cell::new(max_concurrent.max(1)),
            response_prototype,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.get()
    }

    pub fn set_max_concurrent(&self, n: usize) {
        self.max_concurrent.set(n.max(1));
    }

    pub fn set_max_pool_size(&self, n: usize) {
        self.pool.set_max_size(&self.driver.borrow(), n);
    }

    pub fn max_pool_size(&self) -> usize {
        self.pool.max_size()
    }

    /// Fork this engine's driver (spec §6 `with*` clone semantics; see
    /// [`crate::driver::Driver::fork`] and `DESIGN.md`).
    pub fn fork_driver(&self) -> D {
        self.driver.borrow().fork()
    }

    pub fn pending_count(&self) -> usize {
        self.active.borrow().len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0 || self.queued_count() > 0
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.pending_count(), self.queued_count())
    }

    /// Submit a prepared request for dispatch (spec §4.5 `submit`). The
    /// returned promise's blocking `wait` is bound to this engine's `tick`,
    /// so `promise.wait(..)` alone is enough to drive the request to
    /// completion without the caller separately calling `Client::wait`.
    #[tracing::instrument(skip(self, descriptor), fields(method = %descriptor.method, url = %descriptor.absolute_url))]
    pub fn submit(self: &Rc<Self>, descriptor: RequestDescriptor) -> Promise<Response> {
        let engine = self.clone();
        let tick: TickFn = Rc::new(move || engine.tick());
        let deferred: Deferred<Response> = Deferred::with_tick(Some(tick));
        let promise = deferred.promise();
        self.metrics.record_submission();

        if self.active.borrow().len() < self.max_concurrent.get() {
            tracing::debug!("admitting immediately");
            self.admit(descriptor, deferred);
        } else {
            tracing::debug!("active set full, queueing");
            self.queue.borrow_mut().push_back(QueuedEntry {
                deferred,
                descriptor,
                not_before: Instant::now(),
            });
        }
        promise
    }

    fn admit(&self, descriptor: RequestDescriptor, deferred: Deferred<Response>) {
        let header_lines: Vec<HeaderLine> = match format::format_headers(&descriptor.headers) {
            Ok(lines) => lines,
            Err(e) => {
                deferred.reject(e);
                return;
            }
        };

        let driver_ref = self.driver.borrow();
        let handle = self.pool.acquire(&driver_ref, &descriptor.absolute_url);
        let prepared = PreparedRequest {
            method: descriptor.method.clone(),
            url: descriptor.absolute_url.clone(),
            headers: header_lines,
            body: descriptor.body.clone(),
            connect_timeout: descriptor.options.connect_timeout,
            read_timeout: descriptor.options.read_timeout,
            verify_tls: descriptor.options.verify_tls,
            proxy: descriptor.options.proxy.clone(),
            http2: descriptor.options.http2_enabled,
            follow_redirects: descriptor.options.follow_redirects,
            max_redirects: descriptor.options.max_redirects,
            tcp_keep_alive: descriptor.options.tcp_keep_alive,
        };
        drop(driver_ref);

        match self.driver.borrow_mut().admit(handle, &prepared) {
            Ok(token) => {
                self.active.borrow_mut().insert(token, ActiveEntry { deferred, descriptor });
            }
            Err(e) => {
                tracing::error!(error = %e, "driver refused admission");
                deferred.reject(e);
            }
        }
    }

    /// One unit of forward progress (spec §4.5 `tick`).
    #[tracing::instrument(skip(self))]
    pub fn tick(&self) {
        self.admit_from_queue();

        for _ in 0..64 {
            match self.driver.borrow_mut().perform() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    tracing::error!(error = %e, "driver perform failed");
                    break;
                }
            }
        }

        self.drain_and_settle();
        self.admit_from_queue();
    }

    /// Admits queued entries while slots remain, scanning past any entry
    /// whose `not_before` hasn't elapsed yet (spec §4.5, §5: retries may
    /// reorder after later-arriving zero-delay requests).
    fn admit_from_queue(&self) {
        loop {
            let available = self
                .max_concurrent
                .get()
                .saturating_sub(self.active.borrow().len());
            if available == 0 {
                break;
            }
            let now = Instant::now();
            let ready_index = {
                let queue = self.queue.borrow();
                queue.iter().position(|entry| entry.not_before <= now)
            };
            let Some(index) = ready_index else {
                break;
            };
            let entry = self
                .queue
                .borrow_mut()
                .remove(index)
                .expect("index just located under the same borrow generation");
            self.admit(entry.descriptor, entry.deferred);
        }
    }

    fn drain_and_settle(&self) {
        let completions = self.driver.borrow_mut().drain_completions();
        for completion in completions {
            self.settle_one(completion);
        }
    }

    fn settle_one(&self, completion: Completion<D::Handle>) {
        let Some(entry) = self.active.borrow_mut().remove(&completion.token) else {
            tracing::error!(token = completion.token.0, "completion for unknown active entry");
            self.driver.borrow().close_handle(completion.handle);
            return;
        };
        let ActiveEntry { deferred, descriptor } = entry;
        let url = descriptor.absolute_url.clone();

        match completion.outcome {
            DriverOutcome::Success(response) => {
                let outcome = retry::Outcome::Response(response.status);
                match retry::decide(&descriptor.options, &descriptor.method, descriptor.attempt, &outcome) {
                    retry::Decision::Retry { delay } => {
                        tracing::warn!(url = %url, status = response.status, attempt = descriptor.attempt, "scheduling retry");
                        self.schedule_retry(descriptor, deferred, delay);
                    }
                    retry::Decision::GiveUp => {
                        tracing::debug!(url = %url, status = response.status, "request settled");
                        self.metrics.record_success();
                        deferred.resolve(self.materialize_response(response));
                    }
                }
            }
            DriverOutcome::Error(message) => {
                let outcome = retry::Outcome::TransportError;
                match retry::decide(&descriptor.options, &descriptor.method, descriptor.attempt, &outcome) {
                    retry::Decision::Retry { delay } => {
                        tracing::warn!(url = %url, error = %message, attempt = descriptor.attempt, "scheduling retry after transport error");
                        self.schedule_retry(descriptor, deferred, delay);
                    }
                    retry::Decision::GiveUp => {
                        tracing::error!(url = %url, error = %message, "request failed");
                        self.metrics.record_failure();
                        deferred.reject(ClientError::Transport {
                            url,
                            method: descriptor.method,
                            message,
                        });
                    }
                }
            }
        }

        self.pool.release(&self.driver.borrow(), completion.handle, &url);
    }

    /// Overlay a completed transfer's status/body onto the prototype's
    /// header defaults (spec §4.5: "clone the response prototype, set
    /// status... copy the body content").
    fn materialize_response(&self, completed: Response) -> Response {
        let mut response = self.response_prototype.clone();
        response.status = completed.status;
        response.body = completed.body;
        for (name, value) in completed.headers.iter() {
            response.headers.insert(name.clone(), value.clone());
        }
        response
    }

    fn schedule_retry(&self, mut descriptor: RequestDescriptor, deferred: Deferred<Response>, delay: Duration) {
        descriptor.attempt += 1;
        self.queue.borrow_mut().push_back(QueuedEntry {
            deferred,
            descriptor,
            not_before: Instant::now() + delay,
        });
    }

    /// Repeatedly ticks until both the active set and queue are empty, or
    /// `timeout` elapses (spec §4.5 `wait`). Between ticks, yields via the
    /// driver's bounded readiness wait rather than spinning.
    pub fn wait(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            self.tick();
            if !self.has_pending() {
                return;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return;
                }
            }
            if self.pending_count() > 0 {
                self.driver.borrow_mut().wait_readiness(Duration::from_millis(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockDriver, MockOutcome};

    fn descriptor(method: &str, url: &str, options: Options) -> RequestDescriptor {
        RequestDescriptor {
            method: method.to_string(),
            absolute_url: url.to_string(),
            headers: HashMap::new(),
            body: None,
            attempt: 1,
            options,
        }
    }

    #[test]
    fn single_success_settles_and_counts() {
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
        let engine = Rc::new(Engine::new(driver, 8, 50, Response::empty()));
        let promise = engine.submit(descriptor("GET", "http://t/ok", Options::default()));
        engine.wait(Some(Duration::from_secs(1)));
        let response = promise.wait(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(response.status, 200);
        let snapshot = engine.metrics();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.successful_requests, 1);
    }

    #[test]
    fn concurrency_cap_bounds_active_set() {
        let driver = MockDriver::new();
        driver.set_default_delay(Duration::from_millis(30));
        for _ in 0..5 {
            driver.add_response("GET", "http://t/slow", MockOutcome::Response(Response::empty()));
        }
        let engine = Rc::new(Engine::new(driver, 8, 2, Response::empty()));
        let mut promises = Vec::new();
        for _ in 0..5 {
            promises.push(engine.submit(descriptor("GET", "http://t/slow", Options::default())));
        }
        assert_eq!(engine.pending_count(), 2);
        assert_eq!(engine.queued_count(), 3);
        engine.wait(Some(Duration::from_secs(2)));
        for promise in promises {
            assert!(promise.is_fulfilled());
        }
    }

    #[test]
    fn post_is_never_retried_even_on_retryable_status() {
        let driver = MockDriver::new();
        driver.add_response(
            "POST",
            "http://t/p",
            MockOutcome::Response(Response {
                status: 500,
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::new(),
            }),
        );
        let options = Options {
            retry_attempts: 3,
            retry_status_codes: vec![500],
            retry_delay: Duration::from_millis(5),
            ..Options::default()
        };
        let driver_handle = driver.clone();
        let engine = Rc::new(Engine::new(driver, 8, 50, Response::empty()));
        let promise = engine.submit(descriptor("POST", "http://t/p", options));
        engine.wait(Some(Duration::from_secs(1)));
        let response = promise.wait(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(driver_handle.call_count(), 1);
    }

    #[test]
    fn retryable_status_is_retried_until_success() {
        let driver = MockDriver::new();
        driver.add_response(
            "GET",
            "http://t/r",
            MockOutcome::Response(Response {
                status: 503,
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::new(),
            }),
        );
        driver.add_response(
            "GET",
            "http://t/r",
            MockOutcome::Response(Response {
                status: 503,
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::new(),
            }),
        );
        driver.add_response(
            "GET",
            "http://t/r",
            MockOutcome::Response(Response {
                status: 200,
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::new(),
            }),
        );
        let options = Options {
            retry_attempts: 2,
            retry_status_codes: vec![503],
            retry_delay: Duration::from_millis(5),
            ..Options::default()
        };
        let driver_handle = driver.clone();
        let engine = Rc::new(Engine::new(driver, 8, 50, Response::empty()));
        let promise = engine.submit(descriptor("GET", "http://t/r", options));
        let response = promise.wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(driver_handle.call_count(), 3);
    }
}
