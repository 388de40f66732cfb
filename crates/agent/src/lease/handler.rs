use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use fleet_core::{Lease, LeaseId, LeaseOutcome, LeaseResult};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::session::Session;

/// Everything an executor gets to run one lease.
#[derive(Debug, Clone)]
pub struct LeaseContext {
    pub lease_id: LeaseId,
    pub payload_type: String,
    pub payload: Vec<u8>,
    pub session: Session,
    /// Cancelled when the server, the host, or a drain asks the lease to stop.
    pub cancel: CancellationToken,
}

/// Executes one kind of lease.
///
/// Implementations should watch `ctx.cancel` and return promptly once it
/// fires. Errors and panics are turned into a `Failed` result by the handler.
#[async_trait]
pub trait LeaseExecutor: Send + Sync {
    async fn execute(&self, ctx: LeaseContext) -> anyhow::Result<LeaseResult>;
}

type ResultSlot = watch::Sender<Option<LeaseResult>>;

/// Owns the execution of exactly one lease.
pub struct LeaseHandler {
    lease: Lease,
    executor: Arc<dyn LeaseExecutor>,
    cancel: CancellationToken,
    cancel_reason: OnceLock<String>,
    /// Taken by `start`; `None` afterwards.
    result_tx: Mutex<Option<ResultSlot>>,
    result_rx: watch::Receiver<Option<LeaseResult>>,
}

impl LeaseHandler {
    pub fn new(lease: Lease, executor: Arc<dyn LeaseExecutor>) -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            lease,
            executor,
            cancel: CancellationToken::new(),
            cancel_reason: OnceLock::new(),
            result_tx: Mutex::new(Some(tx)),
            result_rx: rx,
        }
    }

    pub fn id(&self) -> &LeaseId {
        &self.lease.id
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Spawns execution and returns immediately. May only be called once.
    pub fn start(&self, session: &Session) -> Result<()> {
        let tx = self
            .result_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| AgentError::AlreadyStarted(self.lease.id.clone()))?;

        let ctx = LeaseContext {
            lease_id: self.lease.id.clone(),
            payload_type: self.lease.payload_type.clone(),
            payload: self.lease.payload.clone(),
            session: session.clone(),
            cancel: self.cancel.clone(),
        };
        let executor = Arc::clone(&self.executor);
        let cancel = self.cancel.clone();
        let id = self.lease.id.clone();

        tracing::info!(lease_id = %id, payload_type = %ctx.payload_type, "starting lease");

        // Separate task so a panicking executor surfaces as a JoinError.
        let inner = tokio::spawn(async move { executor.execute(ctx).await });
        tokio::spawn(async move {
            let result = match inner.await {
                Ok(Ok(result)) if cancel.is_cancelled() && result.outcome == LeaseOutcome::Failed => {
                    LeaseResult {
                        outcome: LeaseOutcome::Cancelled,
                        ..result
                    }
                }
                Ok(Ok(result)) => result,
                Ok(Err(e)) if cancel.is_cancelled() => {
                    tracing::debug!(lease_id = %id, error = %format!("{e:#}"), "lease stopped after cancellation");
                    LeaseResult::cancelled()
                }
                Ok(Err(e)) => {
                    tracing::warn!(lease_id = %id, error = %format!("{e:#}"), "lease failed");
                    LeaseResult::failed()
                }
                Err(e) => {
                    tracing::error!(lease_id = %id, error = %e, "lease executor panicked");
                    LeaseResult::failed()
                }
            };
            tracing::info!(lease_id = %id, outcome = ?result.outcome, "lease finished");
            tx.send_replace(Some(result));
        });
        Ok(())
    }

    /// Requests cancellation. The first reason sticks; later calls only
    /// re-signal, which is a no-op once signalled.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.cancel_reason.set(reason.clone()).is_ok() {
            tracing::info!(lease_id = %self.lease.id, reason = %reason, "cancelling lease");
        }
        self.cancel.cancel();
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.get().map(String::as_str)
    }

    /// Waits for the result. Only resolves after `start`.
    pub async fn wait(&self) -> LeaseResult {
        let mut rx = self.result_rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or_else(LeaseResult::failed),
            // Result task went away without reporting (runtime shutdown).
            Err(_) => LeaseResult::failed(),
        };
        result
    }

    pub fn try_result(&self) -> Option<LeaseResult> {
        self.result_rx.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.result_rx.borrow().is_some()
    }
}

impl std::fmt::Debug for LeaseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHandler")
            .field("id", &self.lease.id)
            .field("payload_type", &self.lease.payload_type)
            .field("cancel_reason", &self.cancel_reason.get())
            .field("complete", &self.is_complete())
            .finish()
    }
}
