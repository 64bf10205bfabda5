//! Cooperative cancellation shared by the directions of a call.
//!
//! A cancel signal is level-triggered: once fired it stays fired, and the
//! first reason wins. Tokens can be awaited, and child tokens are cancelled
//! together with their parent but can also be cancelled on their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::Notify;

/// Reasons for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Explicit cancellation by the caller.
    #[default]
    UserRequested,
    /// The call's time budget elapsed.
    DeadlineExceeded,
    /// The client side of the stream went away.
    ClientDisconnected,
    /// The opposite direction of the session failed.
    DirectionFailed,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::ClientDisconnected => write!(f, "ClientDisconnected"),
            CancelReason::DirectionFailed => write!(f, "DirectionFailed"),
        }
    }
}

struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
    children: Mutex<Vec<Weak<CancelState>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CancelState {
    fn new(initial: Option<CancelReason>) -> Self {
        Self {
            cancelled: AtomicBool::new(initial.is_some()),
            reason: Mutex::new(initial),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    /// Returns `true` only for the call that actually fired the signal.
    fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut current = lock(&self.reason);
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();

        let children = std::mem::take(&mut *lock(&self.children));
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
        true
    }

    fn reason(&self) -> Option<CancelReason> {
        if !self.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        *lock(&self.reason)
    }

    fn child(&self) -> Arc<CancelState> {
        // Registration happens under the reason lock so a concurrent
        // `cancel` either sees the child or the child sees the reason.
        let reason = lock(&self.reason);
        let child = Arc::new(CancelState::new(*reason));
        if reason.is_none() {
            let mut children = lock(&self.children);
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        child
    }
}

/// A lightweight, cloneable cancellation token.
/// Multiple recipients can listen for cancellation.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        self.state.reason()
    }

    /// Waits until the token is cancelled and returns the reason.
    ///
    /// Resolves immediately if the token was cancelled before the call.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.state.notify.notified();
            if let Some(reason) = self.cancelled_reason() {
                return reason;
            }
            notified.await;
        }
    }

    /// Create a child token that is cancelled when the parent is cancelled,
    /// but can also be cancelled independently.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let state = self.state.child();
        (
            CancelToken {
                state: state.clone(),
            },
            CancelHandle { state },
        )
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.cancelled_reason())
            .finish()
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Trigger cancellation with the given reason.
    ///
    /// Returns `false` if the signal had already fired; the original reason
    /// is kept in that case.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.state.cancel(reason)
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns a token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: self.state.clone(),
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = Arc::new(CancelState::new(None));
    (
        CancelToken {
            state: state.clone(),
        },
        CancelHandle { state },
    )
}
