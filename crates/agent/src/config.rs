use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Agent configuration, loaded from TOML. Every field has a default.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Server base URL, e.g. http://127.0.0.1:3000
    pub server_url: String,
    /// Stable agent id. A random UUID is used when absent.
    pub agent_id: Option<String>,
    /// Root for lease bundles and the termination signal.
    pub working_dir: PathBuf,
    /// Host-side delay before restarting a session that ended with BackOff.
    pub session_restart_delay_ms: u64,
    /// Upper bound for a single HTTP call, long polls included.
    pub request_timeout_ms: u64,
    pub lease_manager: LeaseManagerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".to_string(),
            agent_id: None,
            working_dir: PathBuf::from(".fleet"),
            session_restart_delay_ms: 5_000,
            request_timeout_ms: 120_000,
            lease_manager: LeaseManagerConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: AgentConfig =
            toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn session_restart_delay(&self) -> Duration {
        Duration::from_millis(self.session_restart_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Tuning for the update loop, retries and draining.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeaseManagerConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive transport failures tolerated before the session fails.
    pub max_update_retries: u32,

    pub rate_limit_window_ms: u64,
    pub rate_limit_max_updates: usize,
    pub rate_limit_delay_ms: u64,

    /// How long to wait for the server's last response after closing the send side.
    pub final_response_timeout_ms: u64,
    /// Per-wave wait while draining; slow leases are logged between waves.
    pub drain_wave_timeout_ms: u64,
    /// Pause between writing the termination signal and cancelling leases.
    pub termination_grace_ms: u64,
    /// Defaults to `<working_dir>/.fleet-termination-signal`.
    pub termination_signal_file: Option<PathBuf>,

    pub capabilities_interval_ms: u64,
    pub telemetry_interval_ms: u64,
}

impl Default for LeaseManagerConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_max_ms: 20_000,
            max_update_retries: 10,
            rate_limit_window_ms: 60_000,
            rate_limit_max_updates: 60,
            rate_limit_delay_ms: 5_000,
            final_response_timeout_ms: 10_000,
            drain_wave_timeout_ms: 30_000,
            termination_grace_ms: 5_000,
            termination_signal_file: None,
            capabilities_interval_ms: 5 * 60 * 1_000,
            telemetry_interval_ms: 30_000,
        }
    }
}

impl LeaseManagerConfig {
    pub fn termination_signal_path(&self, working_dir: &Path) -> PathBuf {
        self.termination_signal_file
            .clone()
            .unwrap_or_else(|| working_dir.join(TERMINATION_SIGNAL_FILE_NAME))
    }
}

pub const TERMINATION_SIGNAL_FILE_NAME: &str = ".fleet-termination-signal";
