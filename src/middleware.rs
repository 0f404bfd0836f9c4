//! The interceptor pipeline (spec §4.6): middlewares compose as an onion
//! around [`crate::engine::Engine::submit`].
//!
//! A middleware's signature is `(request, next) -> Promise<Response>`, not a
//! before/after pair, so it can wrap the full asynchronous lifetime of a
//! request including retries (spec §9 design note). This mirrors how the
//! teacher layers `tower`'s `Service`/middleware stack on `axum` routes in
//! `dwctl`'s API, generalized to a plain trait since this crate has no
//! async executor to hang a `tower::Layer` off of.

use std::rc::Rc;

use crate::driver::Driver;
use crate::engine::{Engine, RequestDescriptor};
use crate::promise::Promise;
use crate::response::Response;

/// The `next` continuation passed to a middleware: calling it dispatches
/// (what remains of) the chain for `request`.
pub type NextFn = Rc<dyn Fn(RequestDescriptor) -> Promise<Response>>;

/// One interceptor in the pipeline.
pub trait Middleware<D: Driver> {
    /// Handle `request`, optionally mutating it before delegating to
    /// `next`, observing or transforming the returned promise, or
    /// short-circuiting by returning a promise of its own without calling
    /// `next` at all.
    fn call(&self, request: RequestDescriptor, next: NextFn) -> Promise<Response>;
}

/// Adapts a plain closure into a [`Middleware`], so callers can pass
/// `|request, next| { ... }` directly to `Client::with_middleware`.
pub struct FnMiddleware<F>(pub F);

impl<D, F> Middleware<D> for FnMiddleware<F>
where
    D: Driver,
    F: Fn(RequestDescriptor, NextFn) -> Promise<Response>,
{
    fn call(&self, request: RequestDescriptor, next: NextFn) -> Promise<Response> {
        (self.0)(request, next)
    }
}

/// Compose `middlewares` (in registration order) around `engine.submit`,
/// returning the outermost dispatcher (spec §4.6).
///
/// For middlewares `[m1, m2, ..., mk]`, the result is
/// `m1(R, r1 -> m2(r1, r2 -> ... mk(r_{k-1}, rk -> submit(rk))))` — built by
/// folding from the innermost stage (the engine) outward, so each earlier
/// middleware's `next` closure is the fully-wrapped remainder of the chain.
pub fn compose<D: Driver + 'static>(middlewares: &[Rc<dyn Middleware<D>>], engine: Rc<Engine<D>>) -> NextFn {
    let mut next: NextFn = Rc::new(move |descriptor: RequestDescriptor| engine.submit(descriptor));

    for middleware in middlewares.iter().rev() {
        let middleware = middleware.clone();
        let inner_next = next.clone();
        next = Rc::new(move |descriptor: RequestDescriptor| middleware.call(descriptor, inner_next.clone()));
    }

    next
}
