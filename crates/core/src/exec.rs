//! Payload model for `exec_block.v1` leases.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::LeaseId;

/// Payload type identifier for exec-block leases.
pub const EXEC_BLOCK_PAYLOAD_TYPE: &str = "exec_block.v1";

/// Execution block spec: multiple commands with structured args.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecBlockSpec {
    /// Working directory, relative to the session working directory unless absolute.
    #[serde(default)]
    pub workdir: Option<String>,

    /// Commands to run in order.
    pub commands: Vec<CommandSpec>,

    /// If true, stop on first non-zero exit.
    #[serde(default = "default_halt_on_error")]
    pub halt_on_error: bool,

    /// Environment variables applied to all commands (per-command env overrides apply after).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_halt_on_error() -> bool {
    true
}

/// Command spec: program + args. No implicit shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,

    /// Relative working directory under the block workdir.
    #[serde(default)]
    pub cwd: Option<String>,

    /// Extra env vars for this command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Kill the command after this many seconds.
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

/// Status of a single command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Result of executing an exec block. Serialized as the lease output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecBlockResult {
    pub lease_id: LeaseId,

    /// Directory holding per-command logs.
    pub bundle_root: String,

    pub started_at_ms: i64,
    pub finished_at_ms: i64,

    pub commands: Vec<CommandResult>,
    pub error: Option<String>,
}

/// Per-command result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub index: usize,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,

    pub started_at_ms: i64,
    pub finished_at_ms: i64,

    pub exit_code: Option<i32>,
    pub status: CommandStatus,

    /// Relative paths within bundle root.
    pub stdout_path: String,
    pub stderr_path: String,

    /// Spawn/runtime error string, if any.
    pub error: Option<String>,
}
