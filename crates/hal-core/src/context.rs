//! Per-invocation measurement context.
//!
//! A [`MeasurementContext`] is the "owning context" of one measurement call. It carries
//! the caller-imposed deadline (e.g. an RPC budget), a shared [`CancellationToken`], and a
//! slot where the HAL records why it aborted so the hosting service can report it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tonic::Code;

/// Cooperative cancellation flag shared between a caller and the work it started.
///
/// Cloning shares the flag. Cancellation is advisory: work observes it at its next
/// check point.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`Self::cancel`] was called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Status recorded when the HAL aborts an operation on behalf of the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortStatus {
    /// Status code reported to the caller
    pub code: Code,
    /// Human-readable reason
    pub message: String,
}

#[derive(Debug)]
struct ContextInner {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    abort_status: Mutex<Option<AbortStatus>>,
}

/// Deadline, cancellation and abort status for one measurement invocation.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct MeasurementContext {
    inner: Arc<ContextInner>,
}

impl Default for MeasurementContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementContext {
    /// Context with no deadline and a fresh cancellation token.
    pub fn new() -> Self {
        Self::build(None, CancellationToken::new())
    }

    /// Context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline), CancellationToken::new())
    }

    /// Context that expires `budget` from now.
    pub fn with_timeout(budget: Duration) -> Self {
        Self::with_deadline(Instant::now() + budget)
    }

    /// Replace the cancellation token with one shared with the caller.
    pub fn with_cancellation(self, token: CancellationToken) -> Self {
        Self::build(self.inner.deadline, token)
    }

    fn build(deadline: Option<Instant>, cancellation: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                deadline,
                cancellation,
                abort_status: Mutex::new(None),
            }),
        }
    }

    /// Deadline propagated from the caller, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn is_deadline_exceeded(&self) -> bool {
        self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Token observed by waits inside the measurement.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Whether the measurement was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Record why the operation was aborted. The first recorded status wins.
    pub fn abort(&self, code: Code, message: impl Into<String>) {
        let mut status = self.inner.abort_status.lock();
        if status.is_none() {
            *status = Some(AbortStatus {
                code,
                message: message.into(),
            });
        }
    }

    /// Abort status recorded by the first observed cancellation.
    pub fn abort_status(&self) -> Option<AbortStatus> {
        self.inner.abort_status.lock().clone()
    }
}
