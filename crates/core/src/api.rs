use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, LeaseId, SessionId};
use crate::model::{AgentStatus, LeaseReport, LeaseState};

/// Session update sent by the agent on every long-poll round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRequest {
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub status: AgentStatus,
    /// Current state of every lease the agent still holds.
    pub leases: Vec<LeaseReport>,
    /// Attached when a capability refresh has happened since the last update.
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
}

/// The server's view of the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateResponse {
    #[serde(default)]
    pub pool_ids: Vec<String>,
    pub status: AgentStatus,
    /// Desired state of every lease assigned to this session.
    #[serde(default)]
    pub leases: Vec<LeaseAssignment>,
}

/// A lease as the server wants it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseAssignment {
    pub id: LeaseId,
    #[serde(default)]
    pub payload_type: String,
    #[serde(with = "crate::bytes", default)]
    pub payload: Vec<u8>,
    /// `Pending` means "run this", `Cancelled` means "stop this".
    pub desired_state: LeaseState,
}

impl LeaseAssignment {
    /// A lease the server wants started.
    pub fn pending(id: impl Into<LeaseId>, payload_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            payload_type: payload_type.into(),
            payload,
            desired_state: LeaseState::Pending,
        }
    }
}

/// One-way telemetry upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRequest {
    pub agent_id: AgentId,
    pub metrics: SystemMetrics,
}

/// Host description used by the server for lease placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub logical_cores: u32,
    pub working_dir: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Periodic host sample. Each section is absent when it could not be read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub sampled_at_ms: i64,
    pub cpu: Option<CpuMetrics>,
    pub memory: Option<MemoryMetrics>,
    pub disk: Option<DiskMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuMetrics {
    pub load_average: [f64; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryMetrics {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskMetrics {
    pub total_bytes: u64,
    pub free_bytes: u64,
}
