//! In-memory server for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use fleet_agent::lease::{LeaseContext, LeaseExecutor, LeaseHandlerFactory};
use fleet_agent::{
    AgentError, HandlerRegistry, LeaseManager, LeaseManagerConfig, Result, ServerConnection,
    Session, StatusSink, UpdateStream,
};
use fleet_agent::telemetry::CapabilitiesProvider;
use fleet_core::api::{Capabilities, LeaseAssignment, SystemMetrics, UpdateRequest, UpdateResponse};
use fleet_core::{AgentId, AgentStatus, Lease, LeaseId, LeaseResult, LeaseState, SessionId, SessionResult};

#[derive(Default)]
struct State {
    desired: BTreeMap<LeaseId, LeaseAssignment>,
    requests: Vec<UpdateRequest>,
    /// Lease states and status from the last request that got an answer.
    last_answered: Option<(Vec<(LeaseId, LeaseState)>, AgentStatus)>,
    dirty: bool,
    fail_next: u32,
    fail_always: bool,
    stop_when_stopping: bool,
    stopped: bool,
    /// Answer nothing, not even closed requests.
    held: bool,
    /// Answer every request at once instead of long polling.
    eager: bool,
    /// Requests carrying capabilities that are dropped unanswered.
    drop_with_capabilities: u32,
    answers: usize,
    telemetry_uploads: usize,
}

/// Emulates the long-poll update endpoint.
///
/// A request is held until its lease states differ from the last answered
/// one, the test changes server state, or the agent closes the send side.
/// Terminal leases reported in an answered request are acknowledged and
/// dropped from the desired set.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn assign(&self, id: &str, payload_type: &str, payload: &[u8]) {
        self.with(|s| {
            s.desired.insert(
                id.into(),
                LeaseAssignment::pending(id, payload_type, payload.to_vec()),
            );
            s.dirty = true;
        });
    }

    pub fn cancel_lease(&self, id: &str) {
        self.with(|s| {
            if let Some(a) = s.desired.get_mut(&LeaseId::from(id)) {
                a.desired_state = LeaseState::Cancelled;
                s.dirty = true;
            }
        });
    }

    pub fn stop(&self) {
        self.with(|s| {
            s.stopped = true;
            s.dirty = true;
        });
    }

    /// Answers `Stopped` once the agent reports `Stopping`.
    pub fn stop_when_stopping(&self) {
        self.with(|s| s.stop_when_stopping = true);
    }

    /// While held, requests are recorded but never answered.
    pub fn hold(&self, held: bool) {
        self.with(|s| {
            s.held = held;
            s.dirty = true;
        });
    }

    pub fn answer_every_request(&self) {
        self.with(|s| s.eager = true);
    }

    /// Ends the next `n` exchanges that carry capabilities without an answer,
    /// like an abandoned long poll.
    pub fn drop_requests_with_capabilities(&self, n: u32) {
        self.with(|s| s.drop_with_capabilities = n);
    }

    pub fn answers(&self) -> usize {
        self.with(|s| s.answers)
    }

    pub fn requests_with_capabilities(&self) -> usize {
        self.with(|s| s.requests.iter().filter(|r| r.capabilities.is_some()).count())
    }

    pub fn fail_next(&self, n: u32) {
        self.with(|s| s.fail_next = n);
    }

    pub fn fail_always(&self) {
        self.with(|s| s.fail_always = true);
    }

    pub fn requests(&self) -> Vec<UpdateRequest> {
        self.with(|s| s.requests.clone())
    }

    pub fn is_desired(&self, id: &str) -> bool {
        self.with(|s| s.desired.contains_key(&LeaseId::from(id)))
    }

    pub fn telemetry_uploads(&self) -> usize {
        self.with(|s| s.telemetry_uploads)
    }

    /// Whether any request reported lease `id` in `state`.
    pub fn saw_lease_state(&self, id: &str, state: LeaseState) -> bool {
        self.with(|s| {
            s.requests
                .iter()
                .flat_map(|r| r.leases.iter())
                .any(|l| l.id.as_str() == id && l.state == state)
        })
    }

    pub fn saw_status(&self, status: AgentStatus) -> bool {
        self.with(|s| s.requests.iter().any(|r| r.status == status))
    }

    fn drops(&self, request: &UpdateRequest) -> bool {
        self.with(|s| {
            if request.capabilities.is_some() && s.drop_with_capabilities > 0 {
                s.drop_with_capabilities -= 1;
                return true;
            }
            false
        })
    }

    fn try_answer(&self, request: &UpdateRequest, closed: bool) -> Option<UpdateResponse> {
        self.with(|s| {
            let states: Vec<_> = request
                .leases
                .iter()
                .map(|l| (l.id.clone(), l.state))
                .collect();
            let changed = s
                .last_answered
                .as_ref()
                .map_or(true, |(last, status)| last != &states || *status != request.status);
            if s.held || !(closed || changed || s.dirty || s.eager) {
                return None;
            }

            for report in &request.leases {
                if report.state.is_terminal() {
                    s.desired.remove(&report.id);
                }
            }
            if s.stop_when_stopping && request.status == AgentStatus::Stopping {
                s.stopped = true;
            }
            s.last_answered = Some((states, request.status));
            s.dirty = false;
            s.answers += 1;

            Some(UpdateResponse {
                pool_ids: vec!["default".to_string()],
                status: if s.stopped {
                    AgentStatus::Stopped
                } else {
                    AgentStatus::Ok
                },
                leases: s.desired.values().cloned().collect(),
            })
        })
    }
}

#[async_trait]
impl ServerConnection for FakeServer {
    async fn open_update_stream(&self, _session_id: &SessionId) -> Result<Box<dyn UpdateStream>> {
        let fail = self.with(|s| {
            if s.fail_always {
                return true;
            }
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return true;
            }
            false
        });
        if fail {
            return Err(AgentError::Transport("connection refused".into()));
        }
        Ok(Box::new(FakeStream {
            server: self.clone(),
            request: None,
            closed: false,
            done: false,
        }))
    }

    async fn upload_telemetry(&self, _agent_id: &AgentId, _metrics: SystemMetrics) -> Result<()> {
        self.with(|s| s.telemetry_uploads += 1);
        Ok(())
    }
}

struct FakeStream {
    server: FakeServer,
    request: Option<UpdateRequest>,
    closed: bool,
    done: bool,
}

#[async_trait]
impl UpdateStream for FakeStream {
    async fn send(&mut self, request: UpdateRequest) -> Result<()> {
        self.server.with(|s| s.requests.push(request.clone()));
        self.request = Some(request);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<UpdateResponse>> {
        let Some(request) = self.request.clone() else {
            return Ok(None);
        };
        if self.done {
            return Ok(None);
        }
        if self.server.drops(&request) {
            self.done = true;
            return Ok(None);
        }
        loop {
            if let Some(response) = self.server.try_answer(&request, self.closed) {
                self.done = true;
                return Ok(Some(response));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn close_send(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Short timings so tests finish quickly.
pub fn test_config() -> LeaseManagerConfig {
    LeaseManagerConfig {
        backoff_base_ms: 5,
        backoff_max_ms: 20,
        max_update_retries: 3,
        rate_limit_window_ms: 1_000,
        rate_limit_max_updates: 10_000,
        rate_limit_delay_ms: 10,
        final_response_timeout_ms: 500,
        drain_wave_timeout_ms: 1_000,
        termination_grace_ms: 100,
        termination_signal_file: None,
        capabilities_interval_ms: 60_000,
        telemetry_interval_ms: 60_000,
    }
}

pub fn manager(server: &FakeServer, working_dir: &Path, registry: HandlerRegistry) -> Arc<LeaseManager> {
    Arc::new(build_manager(server, working_dir, registry, test_config()))
}

pub fn build_manager(
    server: &FakeServer,
    working_dir: &Path,
    registry: HandlerRegistry,
    config: LeaseManagerConfig,
) -> LeaseManager {
    let session = Session::new(
        "agent-1".into(),
        "session-1".into(),
        working_dir.to_path_buf(),
        Arc::new(server.clone()),
    );
    LeaseManager::new(
        session,
        Arc::new(registry),
        Arc::new(StatusSink::new()),
        config,
    )
}

/// Polls `check` until it holds; panics after five seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn finished<T>(handle: tokio::task::JoinHandle<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session did not finish")
        .expect("session task panicked")
}

/// Factory handing out one shared executor.
pub struct FixedFactory {
    payload_type: &'static str,
    executor: Arc<dyn LeaseExecutor>,
}

impl FixedFactory {
    pub fn new(payload_type: &'static str, executor: impl LeaseExecutor + 'static) -> Arc<Self> {
        Arc::new(Self {
            payload_type,
            executor: Arc::new(executor),
        })
    }
}

impl LeaseHandlerFactory for FixedFactory {
    fn payload_type(&self) -> &str {
        self.payload_type
    }

    fn create_executor(&self, _lease: &Lease) -> Arc<dyn LeaseExecutor> {
        Arc::clone(&self.executor)
    }
}

pub struct Succeeds;

#[async_trait]
impl LeaseExecutor for Succeeds {
    async fn execute(&self, _ctx: LeaseContext) -> anyhow::Result<LeaseResult> {
        Ok(LeaseResult::success().with_output(b"done".to_vec()))
    }
}

/// Runs until cancelled and counts how many leases saw the cancellation.
#[derive(Clone, Default)]
pub struct WaitForCancel {
    pub cancelled: Arc<AtomicUsize>,
}

impl WaitForCancel {
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseExecutor for WaitForCancel {
    async fn execute(&self, ctx: LeaseContext) -> anyhow::Result<LeaseResult> {
        ctx.cancel.cancelled().await;
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(LeaseResult::cancelled())
    }
}

/// Completes and asks for the session to end.
pub struct Escalates(pub SessionResult);

#[async_trait]
impl LeaseExecutor for Escalates {
    async fn execute(&self, _ctx: LeaseContext) -> anyhow::Result<LeaseResult> {
        Ok(LeaseResult::success().with_session_result(self.0))
    }
}

/// Succeeds and counts how many times it ran.
#[derive(Clone, Default)]
pub struct CountingSucceeds {
    pub runs: Arc<AtomicUsize>,
}

impl CountingSucceeds {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseExecutor for CountingSucceeds {
    async fn execute(&self, _ctx: LeaseContext) -> anyhow::Result<LeaseResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(LeaseResult::success())
    }
}

/// Succeeds once the test opens the gate.
#[derive(Clone, Default)]
pub struct Gated {
    pub gate: Arc<Notify>,
}

impl Gated {
    pub fn open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl LeaseExecutor for Gated {
    async fn execute(&self, _ctx: LeaseContext) -> anyhow::Result<LeaseResult> {
        self.gate.notified().await;
        Ok(LeaseResult::success())
    }
}

/// Keeps running for `linger` after cancellation.
#[derive(Clone)]
pub struct Lingers {
    pub linger: Duration,
    pub finished: Arc<AtomicUsize>,
}

impl Lingers {
    pub fn new(linger: Duration) -> Self {
        Self {
            linger,
            finished: Arc::default(),
        }
    }

    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseExecutor for Lingers {
    async fn execute(&self, ctx: LeaseContext) -> anyhow::Result<LeaseResult> {
        ctx.cancel.cancelled().await;
        tokio::time::sleep(self.linger).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(LeaseResult::cancelled())
    }
}

/// Fixed capabilities; counts refreshes.
#[derive(Clone, Default)]
pub struct FixedCapabilities {
    pub refreshes: Arc<AtomicUsize>,
}

impl FixedCapabilities {
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilitiesProvider for FixedCapabilities {
    async fn capabilities(&self, working_dir: &Path) -> anyhow::Result<Capabilities> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(Capabilities {
            hostname: "test-host".to_string(),
            working_dir: working_dir.display().to_string(),
            ..Capabilities::default()
        })
    }
}
