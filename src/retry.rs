//! Stateless retry decision (spec §4.4).
//!
//! Driven entirely by [`crate::options::Options`]'s retry fields and the
//! outcome of one attempt — no state of its own, matching the teacher's
//! preference for plain functions over a type when a concern has no
//! lifetime of its own (`RequestContext::calculate_backoff` is the same
//! shape: pure function over a context plus one counter).

use std::time::Duration;

use crate::options::Options;

/// Methods the idempotency rule (spec §4.4) allows the scheduler to retry.
/// POST, PATCH, TRACE, and CONNECT never retry, regardless of status code
/// or transport outcome.
const IDEMPOTENT_METHODS: [&str; 5] = ["GET", "HEAD", "OPTIONS", "PUT", "DELETE"];

/// One attempt's outcome, as seen by the retry policy.
pub enum Outcome {
    /// The driver reported a transport-level failure.
    TransportError,
    /// A response came back with this status code.
    Response(u16),
}

/// What the scheduler should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Schedule another attempt, not before `delay` has elapsed.
    Retry { delay: Duration },
    /// Deliver this outcome to the caller; no more attempts.
    GiveUp,
}

/// Decide whether to retry `attempt` of a request with method `method`
/// given its `outcome`, per `options`'s retry configuration (spec §4.4).
pub fn decide(options: &Options, method: &str, attempt: u32, outcome: &Outcome) -> Decision {
    if !IDEMPOTENT_METHODS.contains(&method.to_ascii_uppercase().as_str()) {
        return Decision::GiveUp;
    }
    if attempt > options.retry_attempts {
        return Decision::GiveUp;
    }

    let should_retry = match outcome {
        Outcome::TransportError => true,
        Outcome::Response(status) => options.retry_status_codes.contains(status),
    };

    if !should_retry {
        return Decision::GiveUp;
    }

    Decision::Retry {
        delay: backoff_delay(options.retry_delay, attempt),
    }
}

/// Exponential backoff: `retry_delay * 2^(attempt-1)` (spec §4.4).
fn backoff_delay(retry_delay: Duration, attempt: u32) -> Duration {
    retry_delay * 2u32.pow(attempt.saturating_sub(1))
}
