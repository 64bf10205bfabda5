//! Deadlines and the watcher that turns them into cancellation.
//!
//! A [`Deadline`] is an absolute point in time. A [`DeadlineWatcher`] is owned
//! by a call: it holds the call's cancel signal and, when a deadline is set,
//! a timer task that fires the signal with
//! [`CancelReason::DeadlineExceeded`] once the deadline passes. Dropping the
//! watcher disarms the timer.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::status::{Failure, Status};

/// Absolute deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Creates a new deadline from now + timeout.
    pub fn new(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// Creates a deadline at the given instant.
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// Returns the instant at which the deadline expires.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Returns the remaining time until the deadline expires.
    ///
    /// Returns `None` if the deadline has already expired.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        if self.at > now {
            Some(self.at - now)
        } else {
            None
        }
    }

    /// Returns `true` if the deadline has expired.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// Returns the earlier of two optional deadlines.
    pub fn earliest(a: Option<Deadline>, b: Option<Deadline>) -> Option<Deadline> {
        match (a, b) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

/// Per-call cancellation context: the call's cancel signal plus the timer
/// that fires it when the deadline passes.
pub struct DeadlineWatcher {
    token: CancelToken,
    handle: CancelHandle,
    deadline: Option<Deadline>,
    timer: Option<JoinHandle<()>>,
}

impl DeadlineWatcher {
    /// Creates a watcher. The call's signal is a child of `parent` when one
    /// is given, so an external cancel reaches the call but cancelling the
    /// call never reaches the parent.
    ///
    /// Must be called from within a tokio runtime when `deadline` is set.
    pub fn new(parent: Option<&CancelToken>, deadline: Option<Deadline>) -> Self {
        let (token, handle) = match parent {
            Some(parent) => parent.child(),
            None => new_cancel_pair(),
        };
        let timer = deadline.map(|deadline| {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline.instant()).await;
                if handle.cancel(CancelReason::DeadlineExceeded) {
                    debug!("deadline elapsed, cancelling call");
                }
            })
        });
        Self {
            token,
            handle,
            deadline,
            timer,
        }
    }

    /// Watcher without a deadline or parent; only explicit cancel fires it.
    pub fn unbounded() -> Self {
        Self::new(None, None)
    }

    /// The call's cancel token.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// The handle that cancels this call.
    pub fn handle(&self) -> &CancelHandle {
        &self.handle
    }

    /// The call's deadline, if any.
    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    /// Checks the signal and the absolute deadline.
    ///
    /// The deadline comparison does not depend on the timer task having
    /// run: an expired deadline fires the signal here.
    pub fn check(&self) -> Result<(), Status> {
        check_call(&self.token, &self.handle, self.deadline)
    }

    /// A cloneable [`DeadlineCheck`] for this call.
    pub fn checker(&self) -> DeadlineCheck {
        DeadlineCheck {
            token: self.token.clone(),
            handle: self.handle.clone(),
            deadline: self.deadline,
        }
    }

    /// Runs `fut` unless the call is cancelled first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Status> {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.token.cancelled() => Err(Status::from(reason)),
            out = fut => Ok(out),
        }
    }

    /// Sleeps for `period`, waking early with the cancellation status if the
    /// call is cancelled meanwhile.
    pub async fn sleep(&self, period: Duration) -> Result<(), Status> {
        self.guard(tokio::time::sleep(period)).await
    }

    /// Stops the timer. Later expiry no longer fires the signal.
    pub fn disarm(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

/// The call's signal and absolute deadline, detached from the watcher's
/// timer. Lets the halves of a session check the call at their own
/// boundaries.
#[derive(Clone)]
pub struct DeadlineCheck {
    token: CancelToken,
    handle: CancelHandle,
    deadline: Option<Deadline>,
}

impl DeadlineCheck {
    /// Same as [`DeadlineWatcher::check`].
    pub fn check(&self) -> Result<(), Status> {
        check_call(&self.token, &self.handle, self.deadline)
    }

    /// The call's cancel token.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl std::fmt::Debug for DeadlineCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineCheck")
            .field("deadline", &self.deadline)
            .field("cancelled", &self.token.cancelled_reason())
            .finish()
    }
}

fn check_call(
    token: &CancelToken,
    handle: &CancelHandle,
    deadline: Option<Deadline>,
) -> Result<(), Status> {
    if let Some(reason) = token.cancelled_reason() {
        return Err(Status::from(reason));
    }
    if deadline.is_some_and(|d| d.is_expired()) {
        if handle.cancel(CancelReason::DeadlineExceeded) {
            debug!("deadline passed before the timer fired");
            return Err(Status::from(Failure::DeadlineElapsed));
        }
        // a concurrent explicit cancel may have won the race
        let reason = token
            .cancelled_reason()
            .unwrap_or(CancelReason::DeadlineExceeded);
        return Err(Status::from(reason));
    }
    Ok(())
}

impl Drop for DeadlineWatcher {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl std::fmt::Debug for DeadlineWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineWatcher")
            .field("deadline", &self.deadline)
            .field("cancelled", &self.token.cancelled_reason())
            .finish()
    }
}
