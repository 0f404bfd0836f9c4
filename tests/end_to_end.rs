//! End-to-end dispatch scenarios against [`MockDriver`], one per scenario in
//! spec §8 S1–S6. Fixtures follow the teacher's `rstest`-fixture style from
//! `storage/tests.rs`; nothing here needs `tokio-test` since the engine is
//! synchronous.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use rstest::{fixture, rstest};

use promissory::{Body, Client, MockDriver, MockOutcome, Response};

#[fixture]
fn driver() -> MockDriver {
    MockDriver::new()
}

fn response(status: u16, body: &'static str) -> Response {
    Response {
        status,
        headers: HeaderMap::new(),
        body: Bytes::from_static(body.as_bytes()),
    }
}

/// S1. Single GET success.
#[rstest]
fn single_get_success(driver: MockDriver) {
    driver.add_response("GET", "http://t/ok", MockOutcome::Response(response(200, "hi")));
    let client = Client::with_driver(driver, Response::empty(), None, None);

    let promise = client.get("http://t/ok", None, None);
    client.wait(Some(Duration::from_secs(1)));
    let settled = promise.wait(Some(Duration::from_millis(1))).unwrap();

    assert_eq!(settled.status, 200);
    assert_eq!(settled.text().unwrap(), "hi");

    let metrics = client.get_metrics();
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.successful_requests, 1);
    assert_eq!(metrics.failed_requests, 0);
}

/// S2. Retry on 503 with exponential backoff.
#[rstest]
fn retry_on_503_with_exponential_backoff(driver: MockDriver) {
    driver.add_response("GET", "http://t/r", MockOutcome::Response(response(503, "")));
    driver.add_response("GET", "http://t/r", MockOutcome::Response(response(503, "")));
    driver.add_response("GET", "http://t/r", MockOutcome::Response(response(200, "")));

    let client = Client::with_driver(driver.clone(), Response::empty(), None, None)
        .with_retry(2, 0.01, vec![503]);

    let start = std::time::Instant::now();
    let promise = client.get("http://t/r", None, None);
    let settled = promise.wait(Some(Duration::from_secs(2))).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(settled.status, 200);
    assert_eq!(driver.call_count(), 3);
    // Backoff is 0.01s then 0.02s: the whole exchange takes at least that long.
    assert!(elapsed >= Duration::from_millis(30), "elapsed was {elapsed:?}");

    let metrics = client.get_metrics();
    assert_eq!(metrics.successful_requests, 1);
}

/// S3. POST is never retried, even on a retryable status.
#[rstest]
fn post_never_retried(driver: MockDriver) {
    driver.add_response("POST", "http://t/p", MockOutcome::Response(response(500, "")));

    let client = Client::with_driver(driver.clone(), Response::empty(), None, None)
        .with_retry(3, 0.01, vec![500]);

    let promise = client.post("http://t/p", Some(Body::Json(serde_json::json!({"x": 1}))), None);
    let settled = promise.wait(Some(Duration::from_secs(1))).unwrap();

    assert_eq!(settled.status, 500);
    assert_eq!(driver.call_count(), 1);
}

/// S4. Concurrency cap bounds the active set; the rest wait in the queue.
#[rstest]
fn concurrency_cap_bounds_active_set(driver: MockDriver) {
    driver.set_default_delay(Duration::from_millis(50));
    for _ in 0..5 {
        driver.add_response("GET", "http://t/slow", MockOutcome::Response(Response::empty()));
    }

    let client = Client::with_driver(driver, Response::empty(), None, None).with_max_concurrent(2);

    let promises: Vec<_> = (0..5).map(|_| client.get("http://t/slow", None, None)).collect();

    assert_eq!(client.pending_count(), 2);
    assert_eq!(client.queued_count(), 3);

    client.wait(Some(Duration::from_secs(2)));
    for promise in promises {
        assert!(promise.is_fulfilled());
    }
}

/// S5. `all`/`allSettled` behavior over a resolved/rejected/resolved triple.
#[rstest]
fn all_and_all_settled_over_mixed_inputs() {
    use promissory::{all, all_settled, ClientError, Settled};

    let p1 = promissory::resolve("a".to_string());
    let p2: promissory::Promise<String> = promissory::reject(ClientError::rejection("boom"));
    let p3 = promissory::resolve("c".to_string());

    let mut inputs = HashMap::new();
    inputs.insert("p1".to_string(), p1.clone());
    inputs.insert("p2".to_string(), p2.clone());
    inputs.insert("p3".to_string(), p3.clone());
    let all_result = all(inputs, None).wait(None);
    assert!(all_result.is_err());

    let mut settled_inputs = HashMap::new();
    settled_inputs.insert("p1".to_string(), p1);
    settled_inputs.insert("p2".to_string(), p2);
    settled_inputs.insert("p3".to_string(), p3);
    let settled = all_settled(settled_inputs, None).wait(None).unwrap();

    assert!(matches!(settled.get("p1"), Some(Settled::Fulfilled(v)) if v == "a"));
    assert!(matches!(settled.get("p2"), Some(Settled::Rejected(_))));
    assert!(matches!(settled.get("p3"), Some(Settled::Fulfilled(v)) if v == "c"));
}

/// S6. Middlewares run in registration order and unwind in reverse.
#[rstest]
fn middleware_ordering(driver: MockDriver) {
    use promissory::{FnMiddleware, Middleware, ThenOutcome};

    driver.add_response("GET", "http://t/ok", MockOutcome::Response(response(200, "")));
    let log = Rc::new(std::cell::RefCell::new(Vec::new()));

    let logging_middleware = |name: &'static str, log: Rc<std::cell::RefCell<Vec<String>>>| {
        Rc::new(FnMiddleware(move |request, next: promissory::middleware::NextFn| {
            log.borrow_mut().push(format!("{name}-before"));
            let log = log.clone();
            next(request).then(
                Some(move |response: Response| {
                    log.borrow_mut().push(format!("{name}-after"));
                    ThenOutcome::Value(response)
                }),
                None::<fn(promissory::ClientError) -> ThenOutcome<Response>>,
            )
        })) as Rc<dyn Middleware<MockDriver>>
    };

    let client = Client::with_driver(driver, Response::empty(), None, None)
        .with_middleware(logging_middleware("m1", log.clone()))
        .with_middleware(logging_middleware("m2", log.clone()));

    let promise = client.get("http://t/ok", None, None);
    client.wait(Some(Duration::from_secs(1)));
    promise.wait(Some(Duration::from_millis(1))).unwrap();

    assert_eq!(*log.borrow(), vec!["m1-before", "m2-before", "m2-after", "m1-after"]);
}
