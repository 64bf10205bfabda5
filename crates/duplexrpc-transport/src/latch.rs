//! Counting completion latch.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Releases waiters once every tracked party has counted down.
///
/// Extra count-downs after release are ignored; the latch never re-arms.
#[derive(Debug)]
pub struct CompletionLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CompletionLatch {
    /// Creates a latch tracking `parties` participants.
    pub fn new(parties: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(parties),
            notify: Notify::new(),
        }
    }

    /// Records one participant as terminal. Returns the remaining count.
    pub fn count_down(&self) -> usize {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        let remaining = previous.saturating_sub(1);
        if previous == 1 {
            self.notify.notify_waiters();
        }
        remaining
    }

    /// Number of participants not yet terminal.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Returns `true` once all participants have counted down.
    pub fn is_released(&self) -> bool {
        self.remaining() == 0
    }

    /// Waits until the latch is released.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_released() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_latch_counts_down() {
        let latch = CompletionLatch::new(2);
        assert!(!latch.is_released());
        assert_eq!(latch.count_down(), 1);
        assert!(!latch.is_released());
        assert_eq!(latch.count_down(), 0);
        assert!(latch.is_released());
    }

    #[test]
    fn test_extra_count_down_ignored() {
        let latch = CompletionLatch::new(1);
        latch.count_down();
        assert_eq!(latch.count_down(), 0);
        assert_eq!(latch.remaining(), 0);
    }

    #[tokio::test]
    async fn test_zero_party_latch_released_immediately() {
        let latch = CompletionLatch::new(0);
        latch.wait().await;
    }

    #[tokio::test]
    async fn test_wait_blocks_until_all_parties() {
        let latch = Arc::new(CompletionLatch::new(2));
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        latch.count_down();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        latch.count_down();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("latch released")
            .expect("task joined");
    }
}
