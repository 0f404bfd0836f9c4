//! A settable-once future with a handler chain and a blocking `wait`.
//!
//! `Promise`/`Deferred` are a plain (non-`std::future::Future`) pair (spec
//! §4.1, §9): the crate's progress model is "caller calls `tick`", not an
//! async runtime, so implementing `Future` would invite callers to poll it
//! outside `wait`/`tick`, where it would never advance. The inner shared
//! state is `Rc<RefCell<Inner<T>>>` rather than `Arc<Mutex<_>>` — every
//! `Client` is single-threaded-cooperative by construction (spec §5), the
//! same way the teacher reserves `Arc`/`parking_lot` for its genuinely
//! multi-threaded tokio daemon and plain owned state everywhere else.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::ClientError;

/// A function the promise invokes while `wait` blocks, to drive whatever
/// engine owns this promise forward by one step. `None` for promises created
/// standalone (e.g. via [`Promise::resolve`]), in which case `wait` falls
/// back to a short sleep loop (spec §4.1).
pub type TickFn = Rc<dyn Fn()>;

/// The three-state state machine from spec §3 ("Promise state").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

enum Settlement<T> {
    Pending,
    Fulfilled(T),
    Rejected(ClientError),
}

type FulfillHandler<T> = Box<dyn FnOnce(T)>;
type RejectHandler = Box<dyn FnOnce(ClientError)>;

struct Handler<T> {
    on_fulfilled: Option<FulfillHandler<T>>,
    on_rejected: Option<RejectHandler>,
}

struct Inner<T> {
    settlement: Settlement<T>,
    handlers: Vec<Handler<T>>,
}

/// A value that will later be supplied exactly once, as a success value or
/// an error (spec §4.1).
pub struct Promise<T: Clone + 'static> {
    inner: Rc<RefCell<Inner<T>>>,
    tick: Option<TickFn>,
}

impl<T: Clone + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            tick: self.tick.clone(),
        }
    }
}

/// An external resolver/rejecter for a [`Promise`] it owns (spec §4.1).
pub struct Deferred<T: Clone + 'static> {
    promise: Promise<T>,
}

impl<T: Clone + 'static> Deferred<T> {
    /// A fresh, pending promise with no bound driver tick.
    pub fn new() -> Self {
        Self::with_tick(None)
    }

    /// A fresh, pending promise bound to a driver tick function, invoked
    /// repeatedly while a caller blocks on `promise().wait(..)`.
    pub fn with_tick(tick: Option<TickFn>) -> Self {
        Self {
            promise: Promise {
                inner: Rc::new(RefCell::new(Inner {
                    settlement: Settlement::Pending,
                    handlers: Vec::new(),
                })),
                tick,
            },
        }
    }

    /// The caller-visible promise. Cheap to call repeatedly; it shares state
    /// with the deferred.
    pub fn promise(&self) -> Promise<T> {
        self.promise.clone()
    }

    /// Settle with a success value. A no-op if already settled (spec §3
    /// invariant (i), §8 property 2).
    pub fn resolve(&self, value: T) {
        self.promise.settle_fulfilled(value);
    }

    /// Settle with a failure reason. A no-op if already settled.
    pub fn reject(&self, reason: ClientError) {
        self.promise.settle_rejected(reason);
    }
}

impl<T: Clone + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Promise<T> {
    fn settle_fulfilled(&self, value: T) {
        let handlers = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.settlement, Settlement::Pending) {
                return;
            }
            inner.settlement = Settlement::Fulfilled(value.clone());
            std::mem::take(&mut inner.handlers)
        };
        for handler in handlers {
            if let Some(on_fulfilled) = handler.on_fulfilled {
                on_fulfilled(value.clone());
            }
        }
    }

    fn settle_rejected(&self, reason: ClientError) {
        let handlers = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.settlement, Settlement::Pending) {
                return;
            }
            inner.settlement = Settlement::Rejected(reason.clone());
            std::mem::take(&mut inner.handlers)
        };
        for handler in handlers {
            if let Some(on_rejected) = handler.on_rejected {
                on_rejected(reason.clone());
            }
        }
    }

    /// An already-fulfilled promise.
    pub fn fulfilled(value: T) -> Self {
        let deferred = Deferred::new();
        deferred.resolve(value);
        deferred.promise()
    }

    /// An already-rejected promise.
    pub fn rejected(reason: ClientError) -> Self {
        let deferred: Deferred<T> = Deferred::new();
        deferred.reject(reason);
        deferred.promise()
    }

    pub fn get_state(&self) -> State {
        match self.inner.borrow().settlement {
            Settlement::Pending => State::Pending,
            Settlement::Fulfilled(_) => State::Fulfilled,
            Settlement::Rejected(_) => State::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.get_state() == State::Pending
    }

    pub fn is_fulfilled(&self) -> bool {
        self.get_state() == State::Fulfilled
    }

    pub fn is_rejected(&self) -> bool {
        self.get_state() == State::Rejected
    }

    /// Register handlers and return a new promise derived from whichever
    /// handler runs. If settlement has already happened, the matching
    /// handler runs synchronously, during this call (spec §4.1 invariant
    /// (ii)); otherwise it runs later, in registration order, when this
    /// promise settles (invariant (iii)).
    ///
    /// Transparent unwrapping: if a handler returns a `Promise<T>`, the
    /// derived promise adopts that promise's eventual state instead of
    /// wrapping it (spec §4.1).
    pub fn then<F, G>(&self, on_fulfilled: Option<F>, on_rejected: Option<G>) -> Promise<T>
    where
        F: FnOnce(T) -> ThenOutcome<T> + 'static,
        G: FnOnce(ClientError) -> ThenOutcome<T> + 'static,
    {
        let downstream: Deferred<T> = Deferred::with_tick(self.tick.clone());
        let downstream_ok = downstream.promise();
        let downstream_err = downstream.promise();

        let fulfilled_handler: FulfillHandler<T> = match on_fulfilled {
            Some(handler) => Box::new(move |value: T| settle_from_outcome(&downstream_ok, handler(value))),
            None => Box::new(move |value: T| downstream_ok.settle_fulfilled(value)),
        };
        let rejected_handler: RejectHandler = match on_rejected {
            Some(handler) => Box::new(move |reason: ClientError| settle_from_outcome(&downstream_err, handler(reason))),
            None => Box::new(move |reason: ClientError| downstream_err.settle_rejected(reason)),
        };

        self.register(fulfilled_handler, rejected_handler);
        downstream.promise()
    }

    /// `catch(f)` is `then(None, Some(f))` (spec §4.1).
    pub fn catch<G>(&self, on_rejected: G) -> Promise<T>
    where
        G: FnOnce(ClientError) -> ThenOutcome<T> + 'static,
    {
        self.then(None::<fn(T) -> ThenOutcome<T>>, Some(on_rejected))
    }

    /// Runs `on_finally` on either settlement, then forwards the original
    /// outcome unchanged. An error raised by `on_finally` replaces the
    /// outcome with that error (spec §4.1).
    pub fn finally<F>(&self, on_finally: F) -> Promise<T>
    where
        F: Fn() -> Result<(), ClientError> + 'static,
    {
        let on_finally_ok = Rc::new(on_finally);
        let on_finally_err = on_finally_ok.clone();
        self.then(
            Some(move |value: T| match on_finally_ok() {
                Ok(()) => ThenOutcome::Value(value),
                Err(e) => ThenOutcome::Error(e),
            }),
            Some(move |reason: ClientError| match on_finally_err() {
                Ok(()) => ThenOutcome::Error(reason),
                Err(e) => ThenOutcome::Error(e),
            }),
        )
    }

    fn register(&self, on_fulfilled: FulfillHandler<T>, on_rejected: RejectHandler) {
        let settled = {
            let mut inner = self.inner.borrow_mut();
            match &inner.settlement {
                Settlement::Pending => {
                    inner.handlers.push(Handler {
                        on_fulfilled: Some(on_fulfilled),
                        on_rejected: Some(on_rejected),
                    });
                    None
                }
                Settlement::Fulfilled(value) => Some(Ok(value.clone())),
                Settlement::Rejected(reason) => Some(Err(reason.clone())),
            }
        };
        // Run outside the borrow: a synchronous handler might touch this
        // promise's own state (e.g. `get_state`) and must not re-enter the
        // RefCell while it's borrowed.
        match settled {
            Some(Ok(value)) => on_fulfilled(value),
            Some(Err(reason)) => on_rejected(reason),
            None => {}
        }
    }

    /// Blocks until settlement or `timeout` elapses. While waiting, pumps
    /// this promise's bound driver tick if it has one; otherwise spins on a
    /// short sleep (spec §4.1, §5).
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, ClientError> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            match self.inner.borrow().settlement {
                Settlement::Fulfilled(ref value) => return Ok(value.clone()),
                Settlement::Rejected(ref reason) => return Err(reason.clone()),
                Settlement::Pending => {}
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(ClientError::Timeout);
                }
            }
            match &self.tick {
                Some(tick) => tick(),
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}

/// What a `then`/`catch` handler produced: either a value (possibly adopted
/// from another `Promise`) or an error to reject with.
pub enum ThenOutcome<T> {
    Value(T),
    Adopt(Promise<T>),
    Error(ClientError),
}

fn settle_from_outcome<T: Clone + 'static>(downstream: &Promise<T>, outcome: ThenOutcome<T>) {
    match outcome {
        ThenOutcome::Value(value) => downstream.settle_fulfilled(value),
        ThenOutcome::Error(reason) => downstream.settle_rejected(reason),
        ThenOutcome::Adopt(upstream) => {
            let downstream_ok = downstream.clone();
            let downstream_err = downstream.clone();
            upstream.register(
                Box::new(move |value| downstream_ok.settle_fulfilled(value)),
                Box::new(move |reason| downstream_err.settle_rejected(reason)),
            );
        }
    }
}

/// The outcome of one input to [`all_settled`].
#[derive(Debug, Clone)]
pub enum Settled<T> {
    Fulfilled(T),
    Rejected(ClientError),
}

/// Resolves `v` if it's already a [`Promise`]; this generic form takes a
/// plain value, matching the spec's "else a fulfilled Promise" branch.
pub fn resolve<T: Clone + 'static>(value: T) -> Promise<T> {
    Promise::fulfilled(value)
}

pub fn reject<T: Clone + 'static>(reason: ClientError) -> Promise<T> {
    Promise::rejected(reason)
}

/// `Promise.try(fn)`: calls `f` immediately and wraps its outcome. A value
/// fulfills, a returned `Err` rejects, matching `then`'s transparent handling
/// of a handler that returns a plain value vs. one that throws (spec §6
/// static combinator list).
pub fn try_fn<T, F>(f: F) -> Promise<T>
where
    T: Clone + 'static,
    F: FnOnce() -> Result<T, ClientError>,
{
    match f() {
        Ok(value) => Promise::fulfilled(value),
        Err(reason) => Promise::rejected(reason),
    }
}

/// Fulfills with `value` after `duration` has elapsed. There is no
/// background timer thread — `Promise`'s `Rc`-based inner state is `!Send`
/// by design (spec §5's single-threaded-cooperative model), so the deadline
/// is instead checked by a tick function bound to the returned promise: each
/// time a caller blocks in `wait`, the bound tick re-checks the deadline and
/// resolves once it has passed. A `delay` promise that nobody ever waits on
/// (directly or via a combinator that shares its tick) never settles, same
/// as any other promise in this cooperative model without a driver.
pub fn delay<T: Clone + 'static>(duration: Duration, value: T) -> Promise<T> {
    let deadline = Instant::now() + duration;
    let deferred = Rc::new(Deferred::new());
    let resolver = deferred.clone();
    let tick: TickFn = Rc::new(move || {
        if Instant::now() >= deadline {
            resolver.resolve(value.clone());
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    });
    let mut promise = deferred.promise();
    promise.tick = Some(tick);
    promise
}

/// Fulfills with a `key -> value` map once every input fulfills; rejects
/// immediately on the first rejection (spec §4.1, property 4). An empty
/// input fulfills immediately with an empty map.
pub fn all<K, T>(inputs: HashMap<K, Promise<T>>, tick: Option<TickFn>) -> Promise<HashMap<K, T>>
where
    K: Eq + Hash + Clone + 'static,
    T: Clone + 'static,
{
    let deferred: Rc<Deferred<HashMap<K, T>>> = Rc::new(Deferred::with_tick(tick));
    let promise = deferred.promise();
    if inputs.is_empty() {
        deferred.resolve(HashMap::new());
        return promise;
    }

    let total = inputs.len();
    let values: Rc<RefCell<HashMap<K, T>>> = Rc::new(RefCell::new(HashMap::new()));
    let rejected = Rc::new(RefCell::new(false));

    for (key, input) in inputs {
        let deferred_ok = deferred.clone();
        let deferred_err = deferred.clone();
        let values = values.clone();
        let rejected_ok = rejected.clone();
        let rejected_err = rejected.clone();
        input.register(
            Box::new(move |value| {
                if *rejected_ok.borrow() {
                    return;
                }
                values.borrow_mut().insert(key, value);
                if values.borrow().len() == total {
                    let collected = std::mem::take(&mut *values.borrow_mut());
                    deferred_ok.resolve(collected);
                }
            }),
            Box::new(move |reason| {
                if !*rejected_err.borrow() {
                    *rejected_err.borrow_mut() = true;
                    deferred_err.reject(reason);
                }
            }),
        );
    }

    promise
}

/// Fulfills once every input settles, with a uniform [`Settled`] outcome per
/// input; never rejects (spec §4.1, property 5). An empty input fulfills
/// immediately with an empty map.
pub fn all_settled<K, T>(inputs: HashMap<K, Promise<T>>, tick: Option<TickFn>) -> Promise<HashMap<K, Settled<T>>>
where
    K: Eq + Hash + Clone + 'static,
    T: Clone + 'static,
{
    let deferred: Rc<Deferred<HashMap<K, Settled<T>>>> = Rc::new(Deferred::with_tick(tick));
    let promise = deferred.promise();
    if inputs.is_empty() {
        deferred.resolve(HashMap::new());
        return promise;
    }

    let total = inputs.len();
    let values: Rc<RefCell<HashMap<K, Settled<T>>>> = Rc::new(RefCell::new(HashMap::new()));

    for (key, input) in inputs {
        let deferred_ok = deferred.clone();
        let deferred_err = deferred.clone();
        let values_ok = values.clone();
        let values_err = values.clone();
        let key_err = key.clone();
        input.register(
            Box::new(move |value| {
                values_ok.borrow_mut().insert(key, Settled::Fulfilled(value));
                if values_ok.borrow().len() == total {
                    let collected = std::mem::take(&mut *values_ok.borrow_mut());
                    deferred_ok.resolve(collected);
                }
            }),
            Box::new(move |reason| {
                values_err.borrow_mut().insert(key_err, Settled::Rejected(reason));
                if values_err.borrow().len() == total {
                    let collected = std::mem::take(&mut *values_err.borrow_mut());
                    deferred_err.resolve(collected);
                }
            }),
        );
    }

    promise
}

/// Fulfills with the first fulfilled input; rejects only once every input
/// rejects, with [`ClientError::Aggregate`] (spec §4.1, property: "any").
/// Empty input rejects immediately with an empty aggregate.
pub fn any<T: Clone + 'static>(inputs: Vec<Promise<T>>, tick: Option<TickFn>) -> Promise<T> {
    let deferred: Rc<Deferred<T>> = Rc::new(Deferred::with_tick(tick));
    let promise = deferred.promise();
    if inputs.is_empty() {
        deferred.reject(ClientError::Aggregate(Vec::new()));
        return promise;
    }

    let total = inputs.len();
    let errors: Rc<RefCell<Vec<ClientError>>> = Rc::new(RefCell::new(Vec::new()));

    for input in inputs {
        let deferred_ok = deferred.clone();
        let deferred_err = deferred.clone();
        let errors = errors.clone();
        input.register(
            Box::new(move |value| deferred_ok.resolve(value)),
            Box::new(move |reason| {
                errors.borrow_mut().push(reason);
                if errors.borrow().len() == total {
                    let collected = std::mem::take(&mut *errors.borrow_mut());
                    deferred_err.reject(ClientError::Aggregate(collected));
                }
            }),
        );
    }

    promise
}

/// Settles with the first input to settle, fulfilled or rejected (spec
/// §4.1). Per the Open Question in spec §9, empty input is left pending
/// forever rather than rejecting with an aggregate error — the reference
/// behavior the spec leans toward.
pub fn race<T: Clone + 'static>(inputs: Vec<Promise<T>>, tick: Option<TickFn>) -> Promise<T> {
    let deferred: Rc<Deferred<T>> = Rc::new(Deferred::with_tick(tick));
    let promise = deferred.promise();

    for input in inputs {
        let deferred_ok = deferred.clone();
        let deferred_err = deferred.clone();
        input.register(
            Box::new(move |value| deferred_ok.resolve(value)),
            Box::new(move |reason| deferred_err.reject(reason)),
        );
    }

    promise
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_settles_once() {
        let deferred: Deferred<i32> = Deferred::new();
        deferred.resolve(1);
        deferred.resolve(2);
        assert_eq!(deferred.promise().wait(None).unwrap(), 1);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let deferred: Deferred<i32> = Deferred::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let log1 = log.clone();
        let log2 = log.clone();
        let promise = deferred.promise();
        promise.then(
            Some(move |v: i32| {
                log1.borrow_mut().push(format!("h1:{v}"));
                ThenOutcome::Value(v)
            }),
            None::<fn(ClientError) -> ThenOutcome<i32>>,
        );
        promise.then(
            Some(move |v: i32| {
                log2.borrow_mut().push(format!("h2:{v}"));
                ThenOutcome::Value(v)
            }),
            None::<fn(ClientError) -> ThenOutcome<i32>>,
        );
        deferred.resolve(7);
        assert_eq!(*log.borrow(), vec!["h1:7".to_string(), "h2:7".to_string()]);
    }

    #[test]
    fn try_fn_wraps_ok_and_err() {
        let ok: Promise<i32> = try_fn(|| Ok(3));
        assert_eq!(ok.wait(None).unwrap(), 3);
        let err: Promise<i32> = try_fn(|| Err(ClientError::InvalidInput("bad".to_string())));
        assert!(err.is_rejected());
    }

    #[test]
    fn wait_times_out_on_pending_promise() {
        let deferred: Deferred<i32> = Deferred::new();
        let err = deferred
            .promise()
            .wait(Some(Duration::from_millis(5)))
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
    }
}
