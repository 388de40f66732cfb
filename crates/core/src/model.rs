use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::LeaseId;

/// Lifecycle state of a lease.
///
/// Ordering follows the lifecycle: a lease only ever moves to a greater state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Assigned by the server, not yet started locally.
    Pending,
    /// Executing on this agent.
    Active,
    /// Finished on its own (successfully or not).
    Completed,
    /// Finished because it was cancelled.
    Cancelled,
}

impl LeaseState {
    /// True once the lease can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Outcome of a finished lease.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOutcome {
    /// Not finished yet.
    #[default]
    Unspecified,
    Success,
    Failed,
    Cancelled,
}

/// Attempted to move a lease backwards or skip a step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("lease {id}: invalid state transition {from:?} -> {to:?}")]
pub struct LeaseTransitionError {
    pub id: LeaseId,
    pub from: LeaseState,
    pub to: LeaseState,
}

/// A unit of work and its mutable state as seen by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    /// Selects the handler that interprets `payload`.
    pub payload_type: String,
    #[serde(with = "crate::bytes", default)]
    pub payload: Vec<u8>,
    state: LeaseState,
    #[serde(default)]
    outcome: LeaseOutcome,
    #[serde(with = "crate::bytes::option", default)]
    output: Option<Vec<u8>>,
}

impl Lease {
    /// New lease in the `Pending` state.
    pub fn new(id: LeaseId, payload_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id,
            payload_type: payload_type.into(),
            payload,
            state: LeaseState::Pending,
            outcome: LeaseOutcome::Unspecified,
            output: None,
        }
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// Outcome, available only once the lease has finished.
    pub fn outcome(&self) -> Option<LeaseOutcome> {
        self.state.is_terminal().then_some(self.outcome)
    }

    pub fn output(&self) -> Option<&[u8]> {
        self.output.as_deref()
    }

    /// Pending -> Active.
    pub fn activate(&mut self) -> Result<(), LeaseTransitionError> {
        self.transition(LeaseState::Active)
    }

    /// Active -> Completed/Cancelled, recording the handler's result.
    ///
    /// `cancelled_by_server` forces a Cancelled report whatever the handler
    /// returned.
    pub fn finish(
        &mut self,
        result: &LeaseResult,
        cancelled_by_server: bool,
    ) -> Result<(), LeaseTransitionError> {
        let (state, outcome) = if cancelled_by_server || result.outcome == LeaseOutcome::Cancelled
        {
            (LeaseState::Cancelled, LeaseOutcome::Cancelled)
        } else {
            (LeaseState::Completed, result.outcome)
        };
        self.transition(state)?;
        self.outcome = outcome;
        self.output = result.output.clone();
        Ok(())
    }

    fn transition(&mut self, to: LeaseState) -> Result<(), LeaseTransitionError> {
        let allowed = matches!(
            (self.state, to),
            (LeaseState::Pending, LeaseState::Active)
                | (LeaseState::Active, LeaseState::Completed)
                | (LeaseState::Active, LeaseState::Cancelled)
        );
        if !allowed {
            return Err(LeaseTransitionError {
                id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Snapshot of the fields reported back to the server.
    pub fn report(&self) -> LeaseReport {
        LeaseReport {
            id: self.id.clone(),
            state: self.state,
            outcome: self.outcome,
            output: self.output.clone(),
        }
    }
}

/// Lease state as reported in an update request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseReport {
    pub id: LeaseId,
    pub state: LeaseState,
    #[serde(default)]
    pub outcome: LeaseOutcome,
    #[serde(with = "crate::bytes::option", default)]
    pub output: Option<Vec<u8>>,
}

/// What a handler produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseResult {
    pub outcome: LeaseOutcome,
    #[serde(with = "crate::bytes::option", default)]
    pub output: Option<Vec<u8>>,
    /// When set, the whole session ends with this result.
    #[serde(default)]
    pub session_result: Option<SessionResult>,
}

impl LeaseResult {
    pub fn success() -> Self {
        Self::with_outcome(LeaseOutcome::Success)
    }

    pub fn failed() -> Self {
        Self::with_outcome(LeaseOutcome::Failed)
    }

    pub fn cancelled() -> Self {
        Self::with_outcome(LeaseOutcome::Cancelled)
    }

    fn with_outcome(outcome: LeaseOutcome) -> Self {
        Self {
            outcome,
            output: None,
            session_result: None,
        }
    }

    /// Attaches output bytes.
    pub fn with_output(mut self, output: Vec<u8>) -> Self {
        self.output = Some(output);
        self
    }

    /// Escalates to a session-wide result.
    pub fn with_session_result(mut self, session_result: SessionResult) -> Self {
        self.session_result = Some(session_result);
        self
    }
}

/// What the host should do after a session ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Stop the agent.
    Terminate,
    /// Wait, then start a new session.
    BackOff,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionReason {
    Completed,
    Cancelled,
    Failed,
}

/// Terminal result of a session loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionResult {
    pub outcome: SessionOutcome,
    pub reason: SessionReason,
}

impl SessionResult {
    pub fn new(outcome: SessionOutcome, reason: SessionReason) -> Self {
        Self { outcome, reason }
    }

    /// The host cancelled the session.
    pub fn cancelled() -> Self {
        Self::new(SessionOutcome::Terminate, SessionReason::Cancelled)
    }

    /// The server stopped the session without a pending local result.
    pub fn completed() -> Self {
        Self::new(SessionOutcome::Terminate, SessionReason::Completed)
    }

    /// The session loop failed; the host should retry later.
    pub fn failed() -> Self {
        Self::new(SessionOutcome::BackOff, SessionReason::Failed)
    }
}

/// Agent status exchanged with the server.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Ok,
    /// A session result is pending and no lease is still running.
    Stopping,
    Unhealthy,
    /// Externally paused; do not assign new work.
    Busy,
    /// Server-side only: the session is over.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease() -> Lease {
        Lease::new("lease-1".into(), "test.v1", b"payload".to_vec())
    }

    #[test]
    fn state_only_moves_forward() {
        let mut l = lease();
        assert_eq!(l.state(), LeaseState::Pending);
        l.activate().unwrap();
        assert_eq!(l.state(), LeaseState::Active);
        assert!(l.activate().is_err());

        l.finish(&LeaseResult::success(), false).unwrap();
        assert_eq!(l.state(), LeaseState::Completed);

        let err = l.finish(&LeaseResult::failed(), false).unwrap_err();
        assert_eq!(err.from, LeaseState::Completed);
        assert_eq!(l.outcome(), Some(LeaseOutcome::Success));
    }

    #[test]
    fn cannot_finish_pending_lease() {
        let mut l = lease();
        assert!(l.finish(&LeaseResult::success(), false).is_err());
        assert_eq!(l.state(), LeaseState::Pending);
    }

    #[test]
    fn outcome_hidden_until_terminal() {
        let mut l = lease();
        assert_eq!(l.outcome(), None);
        l.activate().unwrap();
        assert_eq!(l.outcome(), None);
        l.finish(&LeaseResult::failed().with_output(b"boom".to_vec()), false)
            .unwrap();
        assert_eq!(l.outcome(), Some(LeaseOutcome::Failed));
        assert_eq!(l.output(), Some(&b"boom"[..]));
    }

    #[test]
    fn server_cancel_overrides_handler_outcome() {
        let mut l = lease();
        l.activate().unwrap();
        l.finish(&LeaseResult::success(), true).unwrap();
        assert_eq!(l.state(), LeaseState::Cancelled);
        assert_eq!(l.outcome(), Some(LeaseOutcome::Cancelled));
    }

    #[test]
    fn cancelled_result_maps_to_cancelled_state() {
        let mut l = lease();
        l.activate().unwrap();
        l.finish(&LeaseResult::cancelled(), false).unwrap();
        assert_eq!(l.report().state, LeaseState::Cancelled);
    }

    #[test]
    fn state_order_matches_lifecycle() {
        assert!(LeaseState::Pending < LeaseState::Active);
        assert!(LeaseState::Active < LeaseState::Completed);
        assert!(LeaseState::Completed < LeaseState::Cancelled);
        assert!(!LeaseState::Active.is_terminal());
        assert!(LeaseState::Cancelled.is_terminal());
    }
}
