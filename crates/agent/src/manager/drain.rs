use std::sync::Arc;
use std::time::Duration;

use crate::lease::LeaseHandler;
use crate::termination::TerminationSignal;

use super::LeaseManager;

impl LeaseManager {
    /// Cancels every outstanding lease and waits for all of them.
    ///
    /// Writes the termination signal first and gives running work up to the
    /// grace period to wind down on its own. Waits in waves so slow leases
    /// get logged instead of hanging silently.
    pub(super) async fn drain(&self, reason: &str) {
        let outstanding: Vec<Arc<LeaseHandler>> = {
            let set = self.shared.leases.lock().await;
            set.active
                .iter()
                .filter(|a| !a.handler.is_complete())
                .map(|a| Arc::clone(&a.handler))
                .collect()
        };

        if !outstanding.is_empty() {
            tracing::info!(count = outstanding.len(), reason = %reason, "draining leases");
            self.signal_termination(reason, &outstanding).await;

            for handler in &outstanding {
                handler.cancel(reason);
            }

            let wave = Duration::from_millis(self.config.drain_wave_timeout_ms);
            let mut remaining = outstanding;
            while !remaining.is_empty() {
                let _ = tokio::time::timeout(wave, wait_all(&remaining)).await;
                remaining.retain(|h| !h.is_complete());
                for handler in &remaining {
                    tracing::warn!(lease_id = %handler.id(), "still waiting for lease to finish");
                }
            }
            tracing::info!("all leases drained");
        }

        let mut set = self.shared.leases.lock().await;
        for active in set.active.drain(..) {
            tracing::debug!(lease_id = %active.lease.id, state = ?active.lease.state(), "releasing lease");
        }
        self.status.set_active_leases(0);
    }

    async fn signal_termination(&self, reason: &str, outstanding: &[Arc<LeaseHandler>]) {
        let grace = Duration::from_millis(self.config.termination_grace_ms);
        let path = self.termination_signal_path();
        let signal = TerminationSignal::new(grace, reason);

        if let Err(e) = signal.write_to(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to write termination signal");
            return;
        }
        tracing::info!(path = %path.display(), grace_ms = signal.ttl_ms, "wrote termination signal");

        // Leases that finish on their own end the grace period early.
        let _ = tokio::time::timeout(grace, wait_all(outstanding)).await;
    }
}

async fn wait_all(handlers: &[Arc<LeaseHandler>]) {
    for handler in handlers {
        handler.wait().await;
    }
}
