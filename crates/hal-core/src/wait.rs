//! Cancellable, deadline-aware event waiting.
//!
//! Sourcing drivers must block until the hardware reports that an output settled. A
//! single long blocking call would hide the caller's deadline and cancellation for the
//! whole settle time, so [`EventWaitArbiter`] polls the driver's wait primitive in short
//! quanta and checks, between polls and in this order:
//!
//! 1. cancellation: records `Cancelled` on the context
//! 2. the context deadline: records `DeadlineExceeded` on the context
//! 3. the operation's own timeout
//!
//! Cancellation is checked first and again after a successful poll, so a cancelled wait
//! never reports [`WaitOutcome::EventObserved`], even when the event fired in the same
//! quantum.
//!
//! A poll that ends in the driver's own timeout error means "not yet" and the loop
//! continues. Any other driver error ends the wait as [`HalError::HardwareFault`].

use crate::config::WaitConfig;
use crate::context::MeasurementContext;
use crate::error::{DriverError, HalError, HalResult};
use async_trait::async_trait;
use std::fmt;
use tokio::time::{Duration, Instant};
use tonic::Code;
use tracing::{debug, instrument, trace};

/// Default poll quantum.
pub const DEFAULT_POLL_QUANTUM: Duration = Duration::from_millis(100);

/// Polls are never shorter than this.
const MIN_POLL: Duration = Duration::from_millis(1);

/// Driver-side blocking wait primitive.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Event identifiers understood by this source.
    type Event: fmt::Debug + Copy + Send + Sync;

    /// Block for at most `timeout` waiting for `event`.
    ///
    /// Returns `Ok(())` once the event has fired. When `timeout` elapses first the
    /// driver returns its own timeout error.
    async fn wait_for_event(&self, event: Self::Event, timeout: Duration) -> Result<(), DriverError>;

    /// Whether `error` is the driver's "timed out, nothing happened yet" report.
    fn is_poll_timeout(&self, error: &DriverError) -> bool {
        error.is_timeout()
    }
}

/// Result of one [`EventWaitArbiter::wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The event fired.
    EventObserved,
    /// The operation's own timeout elapsed first.
    UserTimeoutExpired {
        /// Timeout that elapsed
        timeout: Duration,
    },
    /// The context deadline passed first.
    DeadlineExceeded,
    /// The context was cancelled.
    Cancelled,
}

impl WaitOutcome {
    /// `Ok` for [`WaitOutcome::EventObserved`], the matching error otherwise.
    pub fn into_result(self) -> HalResult<()> {
        match self {
            Self::EventObserved => Ok(()),
            Self::UserTimeoutExpired { timeout } => Err(HalError::UserTimeoutExpired(timeout)),
            Self::DeadlineExceeded => Err(HalError::DeadlineExceeded),
            Self::Cancelled => Err(HalError::Cancelled),
        }
    }
}

/// Polling loop racing a hardware event against timeout, deadline and cancellation.
#[derive(Debug, Clone, Copy)]
pub struct EventWaitArbiter {
    poll_quantum: Duration,
}

impl Default for EventWaitArbiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_QUANTUM)
    }
}

impl EventWaitArbiter {
    /// Arbiter that waits in slices of `poll_quantum`.
    pub fn new(poll_quantum: Duration) -> Self {
        Self {
            poll_quantum: poll_quantum.max(MIN_POLL),
        }
    }

    /// Arbiter configured from the `[wait]` section.
    pub fn from_config(config: &WaitConfig) -> Self {
        Self::new(config.poll_quantum())
    }

    /// Longest single driver wait between cancellation checks.
    pub fn poll_quantum(&self) -> Duration {
        self.poll_quantum
    }

    /// Wait for `event` on `source`.
    ///
    /// `user_timeout` is measured from the call. The context supplies the deadline and
    /// cancellation token, and receives the abort status when either fires.
    #[instrument(skip(self, source, context), fields(poll_quantum = ?self.poll_quantum))]
    pub async fn wait<E>(
        &self,
        source: &E,
        event: E::Event,
        user_timeout: Duration,
        context: &MeasurementContext,
    ) -> HalResult<WaitOutcome>
    where
        E: EventSource + ?Sized,
    {
        let started = Instant::now();
        let user_deadline = started.checked_add(user_timeout);
        let mut polls: u32 = 0;

        loop {
            if context.is_cancelled() {
                return Ok(Self::cancelled(context, polls));
            }
            if context.is_deadline_exceeded() {
                context.abort(Code::DeadlineExceeded, "Deadline exceeded.");
                debug!(polls, "Context deadline exceeded while waiting");
                return Ok(WaitOutcome::DeadlineExceeded);
            }

            let now = Instant::now();
            if user_deadline.is_some_and(|d| now >= d) {
                debug!(polls, "User timeout expired while waiting");
                return Ok(WaitOutcome::UserTimeoutExpired {
                    timeout: user_timeout,
                });
            }

            let mut quantum = self.poll_quantum;
            if let Some(d) = user_deadline {
                quantum = quantum.min(d - now);
            }
            if let Some(d) = context.deadline() {
                quantum = quantum.min(d.saturating_duration_since(now));
            }
            let quantum = quantum.max(MIN_POLL);

            polls += 1;
            match source.wait_for_event(event, quantum).await {
                Ok(()) => {
                    if context.is_cancelled() {
                        return Ok(Self::cancelled(context, polls));
                    }
                    debug!(polls, elapsed = ?started.elapsed(), "Event observed");
                    return Ok(WaitOutcome::EventObserved);
                }
                Err(err) if source.is_poll_timeout(&err) => {
                    trace!(polls, code = ?err.code, "Poll timed out, continuing");
                }
                Err(err) => return Err(HalError::HardwareFault(err)),
            }
        }
    }

    /// [`Self::wait`] followed by [`WaitOutcome::into_result`].
    pub async fn wait_for<E>(
        &self,
        source: &E,
        event: E::Event,
        user_timeout: Duration,
        context: &MeasurementContext,
    ) -> HalResult<()>
    where
        E: EventSource + ?Sized,
    {
        self.wait(source, event, user_timeout, context)
            .await?
            .into_result()
    }

    fn cancelled(context: &MeasurementContext, polls: u32) -> WaitOutcome {
        context.abort(Code::Cancelled, "Client requested cancellation.");
        debug!(polls, "Wait cancelled");
        WaitOutcome::Cancelled
    }
}
