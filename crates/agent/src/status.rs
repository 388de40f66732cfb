use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Host-visible agent status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Externally paused; reported as `Busy`.
    pub busy: bool,
    pub healthy: bool,
    pub active_leases: usize,
    pub message: Option<String>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            busy: false,
            healthy: true,
            active_leases: 0,
            message: None,
        }
    }
}

/// Shared status slot. The manager reads it every round and wakes early
/// when `busy` or `healthy` change.
#[derive(Debug, Default)]
pub struct StatusSink {
    inner: Mutex<StatusSnapshot>,
    changed: Notify,
}

impl StatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().clone()
    }

    pub fn set_busy(&self, busy: bool) {
        let changed = {
            let mut s = self.lock();
            std::mem::replace(&mut s.busy, busy) != busy
        };
        if changed {
            self.changed.notify_one();
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        let changed = {
            let mut s = self.lock();
            std::mem::replace(&mut s.healthy, healthy) != healthy
        };
        if changed {
            self.changed.notify_one();
        }
    }

    pub fn set_message(&self, message: Option<String>) {
        self.lock().message = message;
    }

    pub fn set_active_leases(&self, count: usize) {
        self.lock().active_leases = count;
    }

    /// Resolves after the next `busy`/`healthy` change.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, StatusSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn defaults_to_healthy_and_idle() {
        let sink = StatusSink::new();
        let s = sink.snapshot();
        assert!(s.healthy);
        assert!(!s.busy);
        assert_eq!(s.active_leases, 0);
    }

    #[tokio::test]
    async fn busy_change_wakes_waiter() {
        let sink = StatusSink::new();
        sink.set_busy(true);
        tokio::time::timeout(Duration::from_secs(1), sink.changed())
            .await
            .unwrap();
        assert!(sink.snapshot().busy);
    }

    #[tokio::test]
    async fn unchanged_value_does_not_wake() {
        let sink = StatusSink::new();
        sink.set_healthy(true);
        let woke = tokio::time::timeout(Duration::from_millis(50), sink.changed()).await;
        assert!(woke.is_err());
    }
}
