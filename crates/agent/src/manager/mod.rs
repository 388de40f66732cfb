//! Session reconciliation: long-polls the server for the desired lease set,
//! starts and cancels handlers to match, and drains on the way out.

mod drain;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_core::api::{LeaseAssignment, UpdateRequest, UpdateResponse};
use fleet_core::{
    AgentStatus, Lease, LeaseId, LeaseResult, LeaseState, SessionReason, SessionResult,
};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::LeaseManagerConfig;
use crate::error::{AgentError, Result};
use crate::lease::{HandlerRegistry, LeaseHandler};
use crate::retry::{Backoff, UpdateRateLimiter};
use crate::session::Session;
use crate::status::{StatusSink, StatusSnapshot};
use crate::telemetry::{
    self, CapabilitiesProvider, CapabilitySlot, HostCapabilities, HostMetricsProvider,
    SystemMetricsProvider,
};
use crate::termination;

/// Status message shown while update retries are failing.
pub const UNABLE_TO_CONNECT: &str = "unable to connect to server";

const RETIRED_LEASE_CAP: usize = 1024;

/// Drives one session: reconciles server-desired leases against local work.
pub struct LeaseManager {
    session: Session,
    registry: Arc<HandlerRegistry>,
    status: Arc<StatusSink>,
    config: LeaseManagerConfig,
    capabilities: Arc<dyn CapabilitiesProvider>,
    metrics: Arc<dyn SystemMetricsProvider>,
    capability_slot: Arc<CapabilitySlot>,
    shared: Arc<Shared>,
}

/// State touched by both the session loop and lease completion tasks.
struct Shared {
    leases: Mutex<LeaseSet>,
    /// Raised when local state changed and the server should hear about it.
    wake: Notify,
}

#[derive(Default)]
struct LeaseSet {
    active: Vec<ActiveLease>,
    /// Escalated by a lease; ends the session once the server stops it.
    session_result: Option<SessionResult>,
    /// Leases already finished and dropped; never restarted.
    retired: VecDeque<LeaseId>,
}

struct ActiveLease {
    lease: Lease,
    handler: Arc<LeaseHandler>,
    /// State carried by the last request the server answered.
    acknowledged: Option<LeaseState>,
    cancelled_by_server: bool,
}

impl ActiveLease {
    /// Still running as far as the lease set knows, even if the handler has
    /// already resolved and its completion is in flight.
    fn accepts_server_cancel(&self) -> bool {
        self.lease.state() == LeaseState::Active && !self.cancelled_by_server
    }
}

impl LeaseSet {
    fn find_mut(&mut self, id: &LeaseId) -> Option<&mut ActiveLease> {
        self.active.iter_mut().find(|a| &a.lease.id == id)
    }

    fn contains(&self, id: &LeaseId) -> bool {
        self.active.iter().any(|a| &a.lease.id == id)
    }

    fn is_retired(&self, id: &LeaseId) -> bool {
        self.retired.contains(id)
    }

    fn retire(&mut self, id: LeaseId) {
        if self.retired.len() >= RETIRED_LEASE_CAP {
            self.retired.pop_front();
        }
        self.retired.push_back(id);
    }
}

impl Shared {
    /// Completion continuation for one lease.
    async fn complete(&self, id: &LeaseId, result: LeaseResult) {
        {
            let mut set = self.leases.lock().await;
            if let Some(active) = set.find_mut(id) {
                let by_server = active.cancelled_by_server;
                if let Err(e) = active.lease.finish(&result, by_server) {
                    tracing::warn!(lease_id = %id, error = %e, "ignoring lease completion");
                }
            }
            if let Some(escalation) = result.session_result {
                if set.session_result.is_none() {
                    tracing::warn!(lease_id = %id, result = ?escalation, "lease requested end of session");
                    set.session_result = Some(escalation);
                }
            }
        }
        self.wake.notify_one();
    }
}

impl LeaseManager {
    pub fn new(
        session: Session,
        registry: Arc<HandlerRegistry>,
        status: Arc<StatusSink>,
        config: LeaseManagerConfig,
    ) -> Self {
        let metrics = HostMetricsProvider::for_path(session.working_dir());
        Self {
            session,
            registry,
            status,
            config,
            capabilities: Arc::new(HostCapabilities),
            metrics: Arc::new(metrics),
            capability_slot: Arc::new(CapabilitySlot::default()),
            shared: Arc::new(Shared {
                leases: Mutex::new(LeaseSet::default()),
                wake: Notify::new(),
            }),
        }
    }

    pub fn with_capabilities_provider(mut self, provider: Arc<dyn CapabilitiesProvider>) -> Self {
        self.capabilities = provider;
        self
    }

    pub fn with_metrics_provider(mut self, provider: Arc<dyn SystemMetricsProvider>) -> Self {
        self.metrics = provider;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn status(&self) -> &Arc<StatusSink> {
        &self.status
    }

    /// Ids of leases currently held, in start order.
    pub async fn active_lease_ids(&self) -> Vec<LeaseId> {
        let set = self.shared.leases.lock().await;
        set.active.iter().map(|a| a.lease.id.clone()).collect()
    }

    fn termination_signal_path(&self) -> PathBuf {
        self.config
            .termination_signal_path(self.session.working_dir())
    }

    /// Runs the session until the server stops it, a lease escalates, the
    /// update loop fails, or `cancel` fires. Always drains before returning.
    pub async fn run(&self, cancel: CancellationToken) -> SessionResult {
        tracing::info!(
            agent_id = %self.session.agent_id(),
            session_id = %self.session.session_id(),
            "session starting"
        );
        if let Err(e) = termination::clear_stale(&self.termination_signal_path()).await {
            tracing::warn!(error = %e, "failed to remove stale termination signal");
        }

        let background = cancel.child_token();
        let tasks = [
            telemetry::spawn_capability_refresh(
                Arc::clone(&self.capabilities),
                self.session.working_dir().to_path_buf(),
                Arc::clone(&self.capability_slot),
                Duration::from_millis(self.config.capabilities_interval_ms),
                background.clone(),
            ),
            telemetry::spawn_telemetry_upload(
                self.session.clone(),
                Arc::clone(&self.metrics),
                Duration::from_millis(self.config.telemetry_interval_ms),
                background.clone(),
            ),
        ];

        let result = match self.update_loop(&cancel).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "session update loop failed");
                SessionResult::failed()
            }
        };

        background.cancel();
        for task in tasks {
            let _ = task.await;
        }

        let reason = match result.reason {
            SessionReason::Cancelled => "agent is shutting down",
            SessionReason::Completed => "session completed",
            SessionReason::Failed => "session failed",
        };
        self.drain(reason).await;

        tracing::info!(result = ?result, "session finished");
        result
    }

    async fn update_loop(&self, cancel: &CancellationToken) -> Result<SessionResult> {
        let mut backoff = Backoff::from_config(&self.config);
        let mut limiter = UpdateRateLimiter::from_config(&self.config);

        loop {
            if cancel.is_cancelled() {
                return Ok(SessionResult::cancelled());
            }

            if let Some(delay) = limiter.record(Instant::now()) {
                tracing::warn!(delay_ms = delay.as_millis() as u64, "session updating too often; throttling");
                if sleep_or_cancel(delay, cancel).await {
                    return Ok(SessionResult::cancelled());
                }
            }

            let (request, sent) = self.build_request().await;
            let Some(response) = self.update_with_retry(&request, &mut backoff, cancel).await?
            else {
                // Unanswered; the server never saw these.
                if let Some(capabilities) = request.capabilities {
                    self.capability_slot.restore(capabilities);
                }
                continue;
            };

            if let Some(result) = self.reconcile(response, &sent).await? {
                return Ok(result);
            }
        }
    }

    async fn build_request(&self) -> (UpdateRequest, Vec<(LeaseId, LeaseState)>) {
        let snapshot = self.status.snapshot();
        let capabilities = self.capability_slot.take();
        let set = self.shared.leases.lock().await;

        let status = compute_status(&set, &snapshot);
        let leases: Vec<_> = set.active.iter().map(|a| a.lease.report()).collect();
        let sent = leases.iter().map(|l| (l.id.clone(), l.state)).collect();

        let request = UpdateRequest {
            agent_id: self.session.agent_id().clone(),
            session_id: self.session.session_id().clone(),
            status,
            leases,
            capabilities,
        };
        (request, sent)
    }

    /// Exchange with retry. `Ok(None)` means no server response this round.
    async fn update_with_retry(
        &self,
        request: &UpdateRequest,
        backoff: &mut Backoff,
        cancel: &CancellationToken,
    ) -> Result<Option<UpdateResponse>> {
        loop {
            match self.exchange(request, cancel).await {
                Ok(response) => {
                    if backoff.failures() > 0 {
                        tracing::info!("reconnected to server");
                        self.status.set_message(None);
                    }
                    backoff.reset();
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    let delay = backoff.record_failure();
                    let attempts = backoff.failures();
                    self.status.set_message(Some(UNABLE_TO_CONNECT.to_string()));
                    let Some(delay) = delay else {
                        return Err(AgentError::RetriesExhausted {
                            attempts,
                            source: Box::new(e),
                        });
                    };
                    tracing::warn!(
                        error = %e,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "session update failed; retrying"
                    );
                    if sleep_or_cancel(delay, cancel).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One long-poll round: send, then wait for the server or a local event.
    async fn exchange(
        &self,
        request: &UpdateRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<UpdateResponse>> {
        let mut stream = self
            .session
            .connection()
            .open_update_stream(self.session.session_id())
            .await?;
        stream.send(request.clone()).await?;

        let first = tokio::select! {
            response = stream.recv() => Some(response?),
            _ = self.shared.wake.notified() => None,
            _ = self.status.changed() => None,
            _ = cancel.cancelled() => None,
        };

        let mut latest = None;
        let mut ended = false;
        match first {
            Some(Some(response)) => latest = Some(response),
            Some(None) => ended = true,
            None => tracing::trace!("local event; closing update stream early"),
        }

        stream.close_send().await?;
        if cancel.is_cancelled() {
            return Ok(latest);
        }

        let final_timeout = Duration::from_millis(self.config.final_response_timeout_ms);
        while !ended {
            match tokio::time::timeout(final_timeout, stream.recv()).await {
                Ok(Ok(Some(response))) => latest = Some(response),
                Ok(Ok(None)) => ended = true,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::debug!("no final response after closing update stream");
                    ended = true;
                }
            }
        }
        Ok(latest)
    }

    /// Applies the server's desired state. Returns the session result once the
    /// server reports the session stopped.
    async fn reconcile(
        &self,
        response: UpdateResponse,
        sent: &[(LeaseId, LeaseState)],
    ) -> Result<Option<SessionResult>> {
        let mut set = self.shared.leases.lock().await;

        for (id, state) in sent {
            if let Some(active) = set.find_mut(id) {
                active.acknowledged = Some(*state);
            }
        }

        for assignment in &response.leases {
            match assignment.desired_state {
                LeaseState::Cancelled => {
                    if let Some(active) = set.find_mut(&assignment.id) {
                        if active.accepts_server_cancel() {
                            active.cancelled_by_server = true;
                            active.handler.cancel("cancelled by server");
                        }
                    }
                }
                LeaseState::Pending => {
                    if set.contains(&assignment.id) || set.is_retired(&assignment.id) {
                        continue;
                    }
                    if set.session_result.is_some() {
                        tracing::debug!(lease_id = %assignment.id, "session ending; not starting lease");
                        continue;
                    }
                    let active = self.start_lease(assignment)?;
                    set.active.push(active);
                }
                LeaseState::Active | LeaseState::Completed => {}
            }
        }

        let mut removed = Vec::new();
        set.active.retain(|a| {
            let drop = a.lease.state().is_terminal()
                && a.acknowledged.is_some_and(LeaseState::is_terminal)
                && !still_wanted(&response, &a.lease.id);
            if drop {
                removed.push(a.lease.id.clone());
            }
            !drop
        });
        for id in removed {
            tracing::info!(lease_id = %id, "removing completed lease");
            set.retire(id);
        }
        self.status.set_active_leases(set.active.len());

        if response.status == AgentStatus::Stopped {
            let result = set.session_result.unwrap_or_else(SessionResult::completed);
            tracing::info!(result = ?result, "server stopped the session");
            return Ok(Some(result));
        }
        Ok(None)
    }

    fn start_lease(&self, assignment: &LeaseAssignment) -> Result<ActiveLease> {
        let mut lease = Lease::new(
            assignment.id.clone(),
            assignment.payload_type.clone(),
            assignment.payload.clone(),
        );
        let handler = Arc::new(self.registry.create_handler(lease.clone()));
        lease.activate()?;
        handler.start(&self.session)?;

        let shared = Arc::clone(&self.shared);
        let watched = Arc::clone(&handler);
        tokio::spawn(async move {
            let result = watched.wait().await;
            shared.complete(watched.id(), result).await;
        });

        Ok(ActiveLease {
            lease,
            handler,
            acknowledged: None,
            cancelled_by_server: false,
        })
    }
}

fn still_wanted(response: &UpdateResponse, id: &LeaseId) -> bool {
    response.leases.iter().any(|l| {
        &l.id == id && matches!(l.desired_state, LeaseState::Pending | LeaseState::Active)
    })
}

fn compute_status(set: &LeaseSet, status: &StatusSnapshot) -> AgentStatus {
    if set.session_result.is_some() && set.active.iter().all(|a| a.lease.state().is_terminal()) {
        AgentStatus::Stopping
    } else if !status.healthy {
        AgentStatus::Unhealthy
    } else if status.busy {
        AgentStatus::Busy
    } else {
        AgentStatus::Ok
    }
}

/// Sleeps for `delay`; returns true if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = cancel.cancelled() => true,
    }
}
