use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

/// Cooperative cancellation primitive shared across clones.
///
/// # Why
/// Per-invocation state (deadlines, cancellation) is threaded through explicitly as
/// arguments rather than picked up from thread-local state, so that a worker thread
/// never leaks one connection's context into the next task it runs.
///
/// # How
/// A single atomic flag behind an `Arc`. `cancel` reports whether *this* call was the
/// one to flip it, so callers can distinguish "I triggered the cancellation" from
/// "someone already had".
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns `true` if this call transitioned the token from not-cancelled to
    /// cancelled; `false` if it was already cancelled.
    pub fn cancel(&self) -> bool {
        let transitioned = self
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if transitioned {
            debug!("cancellation token flipped");
        }
        transitioned
    }

    /// A derived token sharing the same underlying flag, for propagating cancellation
    /// into a child operation without letting the child cancel the parent.
    pub fn child(&self) -> Self {
        self.clone()
    }
}

/// An absolute point in time after which an operation should be treated as timed out.
///
/// Measured against [`Instant`] rather than wall-clock time so it is immune to clock
/// adjustments; this matters for `close(timeout)` and outbound connect timeouts.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub const fn none() -> Self {
        Self { at: None }
    }

    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.at, Some(at) if Instant::now() >= at)
    }

    /// Remaining time budget, or `None` if this deadline never expires.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

/// The explicit, argument-passed replacement for thread-local invocation context.
///
/// A `CallContext` is created once per logical operation (an `accept`, a `connect`, a
/// `close(timeout)`) and passed down by reference. It is never stored in task-local or
/// thread-local storage; a worker picking up the next task in its queue starts with a
/// fresh context.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    deadline: Deadline,
    cancellation: Cancellation,
}

impl CallContext {
    pub fn new(deadline: Deadline, cancellation: Cancellation) -> Self {
        Self {
            deadline,
            cancellation,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(Deadline::after(timeout), Cancellation::new())
    }

    pub fn unbounded() -> Self {
        Self::new(Deadline::none(), Cancellation::new())
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// A child context that inherits cancellation but may carry a tighter deadline.
    pub fn child(&self, deadline: Deadline) -> Self {
        Self {
            deadline,
            cancellation: self.cancellation.child(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reports_first_transition_only() {
        let token = Cancellation::new();
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn child_shares_cancellation_state() {
        let token = Cancellation::new();
        let child = token.child();
        token.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn deadline_none_never_expires() {
        assert!(!Deadline::none().is_expired());
    }

    #[test]
    fn deadline_after_zero_is_immediately_expired() {
        let deadline = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.is_expired());
    }
}
