//! A single-threaded, multiplexed HTTP client with a Promise/Deferred API.
//!
//! Callers submit requests through a [`Client`] and get back a [`Promise`]
//! that settles with a [`Response`] or a [`ClientError`]. Under the hood one
//! [`Engine`](engine::Engine) multiplexes every in-flight request over a
//! single [`Driver`], reuses connections per host through a [`pool::Pool`], retries
//! a configurable subset of failures, and runs each request through an
//! ordered [`Middleware`] pipeline.
//!
//! # Concurrency model
//!
//! Nothing in this crate spawns a thread or relies on an async runtime.
//! Every `Client` is single-threaded-cooperative: state only changes when
//! the caller drives it, via [`Client::tick`], [`Client::wait`], or a
//! [`Promise::wait`] bound to this client's engine. `Promise`'s internal
//! state is `Rc`-based and therefore `!Send`/`!Sync` by construction — this
//! is deliberate, not an oversight. A program that wants several clients
//! running concurrently should give each its own thread (or async task) and
//! let them progress independently; one `Client` must never be driven from
//! more than one thread at a time.
//!
//! # Example
//! ```no_run
//! use promissory::{Client, Response};
//!
//! let client = Client::create(Response::empty(), None, None)
//!     .with_base_url("https://api.example.com")
//!     .with_timeout(10.0)
//!     .with_retry(2, 0.5, vec![502, 503, 504]);
//!
//! let promise = client.get("/v1/status", None, None);
//! let response = promise.wait(None).expect("request failed");
//! println!("status: {}", response.status);
//! ```

pub mod client;
pub mod driver;
pub mod engine;
pub mod error;
pub mod format;
pub mod metrics;
pub mod middleware;
pub mod options;
pub mod pool;
pub mod promise;
pub mod response;
pub mod retry;

pub use client::{Client, RequestSpec};
pub use driver::{CurlDriver, Driver, MockDriver, MockOutcome};
pub use error::{ClientError, Result};
pub use format::Body;
pub use metrics::{Metrics, MetricsSnapshot};
pub use middleware::{FnMiddleware, Middleware};
pub use options::Options;
pub use promise::{all, all_settled, any, race, reject, resolve, delay, try_fn, Deferred, Promise, Settled, State, ThenOutcome};
pub use response::Response;
