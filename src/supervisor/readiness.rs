//! Worker readiness gating.
//!
//! The coordinator's boot prompt waits until every expected worker has
//! signalled ready. `confirm` is idempotent; the completion future resolves
//! once the confirmed set reaches the expected count.

use crate::ProcessId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug)]
struct Inner {
    expected: usize,
    confirmed: HashSet<ProcessId>,
}

#[derive(Debug, Clone)]
pub struct ReadinessTracker {
    inner: Arc<Mutex<Inner>>,
    complete_tx: Arc<watch::Sender<bool>>,
    complete_rx: watch::Receiver<bool>,
}

impl ReadinessTracker {
    pub fn new(expected: usize) -> Self {
        let (complete_tx, complete_rx) = watch::channel(expected == 0);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                expected,
                confirmed: HashSet::new(),
            })),
            complete_tx: Arc::new(complete_tx),
            complete_rx,
        }
    }

    /// Record one ready signal. Repeat confirmations for the same id are
    /// no-ops and never double-count.
    pub fn confirm(&self, process_id: &str) {
        let mut inner = self.inner.lock();
        if inner.confirmed.insert(process_id.to_string())
            && inner.confirmed.len() >= inner.expected
        {
            self.complete_tx.send(true).ok();
        }
    }

    pub fn confirmed_count(&self) -> usize {
        self.inner.lock().confirmed.len()
    }

    pub fn is_complete(&self) -> bool {
        *self.complete_rx.borrow()
    }

    /// Resolve once all expected confirmations have arrived.
    pub async fn wait_complete(&self) {
        let mut rx = self.complete_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_when_expected_count_reached() {
        let tracker = ReadinessTracker::new(2);
        assert!(!tracker.is_complete());

        tracker.confirm("WORKER.1");
        tracker.confirm("WORKER.1");
        assert_eq!(tracker.confirmed_count(), 1);
        assert!(!tracker.is_complete());

        tracker.confirm("WORKER.2");
        tokio::time::timeout(Duration::from_secs(1), tracker.wait_complete())
            .await
            .expect("completion should resolve");
        assert!(tracker.is_complete());
    }

    #[tokio::test]
    async fn zero_expected_is_immediately_complete() {
        let tracker = ReadinessTracker::new(0);
        tokio::time::timeout(Duration::from_secs(1), tracker.wait_complete())
            .await
            .expect("zero workers gate nothing");
    }

    #[tokio::test]
    async fn waiters_unblock_on_late_confirmation() {
        let tracker = ReadinessTracker::new(1);
        let waiter = tracker.clone();
        let handle = tokio::spawn(async move { waiter.wait_complete().await });
        tokio::task::yield_now().await;
        tracker.confirm("WORKER.1");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should resolve")
            .expect("task should join");
    }
}
