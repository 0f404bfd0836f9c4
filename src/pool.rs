//! Per-host connection pool (spec §4.3).
//!
//! Grounded on the same shape as the teacher's semaphore map in
//! `daemon/mod.rs` (a `HashMap` behind a lock, entries created lazily per
//! key) — here keyed by host instead of model, and holding a `Vec` used as a
//! stack of idle transfer handles instead of a `Semaphore`. `Client` is
//! single-threaded, so this uses a plain `RefCell`, not `parking_lot`.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::driver::Driver;

/// Per-host idle-handle cache (spec §3 "Idle handle", §4.3).
///
/// A pool size of 0 disables pooling: every release closes its handle
/// immediately instead of stashing it. Generic over the driver so the same
/// pool type works against [`crate::driver::CurlDriver`] in production and
/// [`crate::driver::MockDriver`] in tests.
pub struct Pool<D: Driver> {
    max_size: RefCell<usize>,
    idle: RefCell<HashMap<String, Vec<D::Handle>>>,
}

impl<D: Driver> Pool<D> {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: RefCell::new(max_size),
            idle: RefCell::new(HashMap::new()),
        }
    }

    /// Extract the host from `url`, pop an idle handle for it if one exists
    /// and reset it (headers/auth/cookies/body cleared), otherwise allocate
    /// a fresh one.
    pub fn acquire(&self, driver: &D, url: &str) -> D::Handle {
        let host = host_of(url);
        let popped = self.idle.borrow_mut().get_mut(&host).and_then(Vec::pop);
        match popped {
            Some(mut handle) => {
                driver.reset_handle(&mut handle);
                tracing::trace!(host = %host, "reused pooled handle");
                handle
            }
            None => {
                tracing::trace!(host = %host, "allocating new handle");
                driver.new_handle()
            }
        }
    }

    /// Push `handle` back onto the stack for `url`'s host, unless that
    /// stack is already at the cap, in which case the handle is closed.
    pub fn release(&self, driver: &D, handle: D::Handle, url: &str) {
        let max_size = *self.max_size.borrow();
        if max_size == 0 {
            tracing::trace!("pooling disabled, closing handle");
            driver.close_handle(handle);
            return;
        }
        let host = host_of(url);
        let mut idle = self.idle.borrow_mut();
        let stack = idle.entry(host.clone()).or_default();
        if stack.len() >= max_size {
            tracing::trace!(host = %host, "pool at cap, closing handle");
            drop(idle);
            driver.close_handle(handle);
        } else {
            stack.push(handle);
        }
    }

    /// Shrink every host's idle stack to at most `n` entries, closing the
    /// excess (spec §4.3, §8 property 12).
    pub fn set_max_size(&self, driver: &D, n: usize) {
        *self.max_size.borrow_mut() = n;
        let mut idle = self.idle.borrow_mut();
        for (host, stack) in idle.iter_mut() {
            while stack.len() > n {
                if let Some(handle) = stack.pop() {
                    tracing::debug!(host = %host, "closing excess pooled handle");
                    driver.close_handle(handle);
                }
            }
        }
    }

    pub fn max_size(&self) -> usize {
        *self.max_size.borrow()
    }

    /// Number of idle handles currently cached for `host`, for tests.
    pub fn idle_count(&self, host: &str) -> usize {
        self.idle.borrow().get(host).map(Vec::len).unwrap_or(0)
    }
}

/// Extracts `scheme://host[:port]` from a URL, falling back to the whole
/// string if it doesn't parse as a URL — pooling is best-effort and a
/// malformed URL will fail validation before it ever reaches the pool.
fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            let host = parsed.host_str()?.to_string();
            Some(match parsed.port() {
                Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
                None => format!("{}://{}", parsed.scheme(), host),
            })
        })
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;

    #[test]
    fn release_then_acquire_reuses_handle() {
        let driver = MockDriver::new();
        let pool: Pool<MockDriver> = Pool::new(4);
        let handle = pool.acquire(&driver, "https://a.example/p");
        let id = handle.id;
        pool.release(&driver, handle, "https://a.example/p");
        assert_eq!(pool.idle_count("https://a.example"), 1);
        let reused = pool.acquire(&driver, "https://a.example/p");
        assert_eq!(reused.id, id);
        assert_eq!(reused.reset_count, 1);
    }

    #[test]
    fn different_hosts_never_share_a_handle() {
        let driver = MockDriver::new();
        let pool: Pool<MockDriver> = Pool::new(4);
        let handle = pool.acquire(&driver, "https://a.example/p");
        pool.release(&driver, handle, "https://a.example/p");
        assert_eq!(pool.idle_count("https://b.example"), 0);
    }

    #[test]
    fn zero_size_pool_closes_every_release() {
        let driver = MockDriver::new();
        let pool: Pool<MockDriver> = Pool::new(0);
        let handle = pool.acquire(&driver, "https://a.example/p");
        pool.release(&driver, handle, "https://a.example/p");
        assert_eq!(pool.idle_count("https://a.example"), 0);
    }

    #[test]
    fn set_max_size_shrinks_existing_stacks() {
        let driver = MockDriver::new();
        let pool: Pool<MockDriver> = Pool::new(4);
        for _ in 0..3 {
            let handle = pool.acquire(&driver, "https://a.example/p");
            pool.release(&driver, handle, "https://a.example/p");
        }
        assert_eq!(pool.idle_count("https://a.example"), 1);
        pool.set_max_size(&driver, 1);
        assert_eq!(pool.idle_count("https://a.example"), 1);
    }
}
