//! The "termination imminent" marker written while draining.
//!
//! Plain text, one field per line:
//! format version, time-to-live (ms), absolute deadline (epoch ms), reason.

use std::path::Path;
use std::time::Duration;

use fleet_core::now_ms;

use crate::error::{AgentError, Result};

pub const TERMINATION_SIGNAL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationSignal {
    pub ttl_ms: u64,
    pub deadline_ms: i64,
    pub reason: String,
}

impl TerminationSignal {
    /// Signal expiring `ttl` from now.
    pub fn new(ttl: Duration, reason: impl Into<String>) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self {
            ttl_ms,
            deadline_ms: now_ms().saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX)),
            reason: reason.into(),
        }
    }

    pub fn render(&self) -> String {
        // Reason stays on one line so readers can split on newlines.
        let reason = self.reason.replace(['\r', '\n'], " ");
        format!(
            "{TERMINATION_SIGNAL_VERSION}\n{}\n{}\n{reason}\n",
            self.ttl_ms, self.deadline_ms
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let mut field = |name: &str| {
            lines
                .next()
                .ok_or_else(|| AgentError::Protocol(format!("termination signal missing {name}")))
        };

        let version = field("version")?;
        if version.trim() != TERMINATION_SIGNAL_VERSION.to_string() {
            return Err(AgentError::Protocol(format!(
                "unsupported termination signal version {version}"
            )));
        }
        let ttl_ms = field("ttl")?
            .trim()
            .parse()
            .map_err(|e| AgentError::Protocol(format!("bad ttl: {e}")))?;
        let deadline_ms = field("deadline")?
            .trim()
            .parse()
            .map_err(|e| AgentError::Protocol(format!("bad deadline: {e}")))?;
        let reason = field("reason").unwrap_or_default().to_string();

        Ok(Self {
            ttl_ms,
            deadline_ms,
            reason,
        })
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.render()).await?;
        Ok(())
    }

    pub async fn read_from(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }
}

/// Removes a marker left by a previous session. Missing file is fine.
pub async fn clear_stale(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
