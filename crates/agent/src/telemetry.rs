//! Periodic capability refresh and system metrics upload.
//!
//! Both loops run next to the session loop and stop with it. Failures are
//! logged and otherwise ignored. Host figures come from `sysinfo`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::api::{Capabilities, CpuMetrics, DiskMetrics, MemoryMetrics, SystemMetrics};
use fleet_core::now_ms;
use sysinfo::{Disks, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::session::Session;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[async_trait]
pub trait CapabilitiesProvider: Send + Sync {
    async fn capabilities(&self, working_dir: &Path) -> anyhow::Result<Capabilities>;
}

pub trait SystemMetricsProvider: Send + Sync {
    fn cpu(&self) -> Option<CpuMetrics>;
    fn memory(&self) -> Option<MemoryMetrics>;
    fn disk(&self) -> Option<DiskMetrics>;

    fn sample(&self) -> SystemMetrics {
        SystemMetrics {
            sampled_at_ms: now_ms(),
            cpu: self.cpu(),
            memory: self.memory(),
            disk: self.disk(),
        }
    }
}

/// Latest capabilities, waiting to ride along on the next update request.
#[derive(Debug, Default)]
pub struct CapabilitySlot(Mutex<Option<Capabilities>>);

impl CapabilitySlot {
    pub fn put(&self, capabilities: Capabilities) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(capabilities);
    }

    /// Puts back capabilities that never reached the server, unless a newer
    /// refresh already filled the slot.
    pub fn restore(&self, capabilities: Capabilities) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(capabilities);
    }

    pub fn take(&self) -> Option<Capabilities> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Describes the local host.
#[derive(Debug, Default)]
pub struct HostCapabilities;

#[async_trait]
impl CapabilitiesProvider for HostCapabilities {
    async fn capabilities(&self, working_dir: &Path) -> anyhow::Result<Capabilities> {
        let mut system = System::new();
        system.refresh_cpu();
        let logical_cores = u32::try_from(system.cpus().len()).unwrap_or(u32::MAX).max(1);

        Ok(Capabilities {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            logical_cores,
            working_dir: working_dir.display().to_string(),
            properties: Default::default(),
        })
    }
}

/// Samples load, memory and disk space through `sysinfo`.
///
/// Disk figures come from the filesystem holding `disk_path` when one is
/// set, otherwise from all mounted disks together.
pub struct HostMetricsProvider {
    system: Mutex<System>,
    disk_path: Option<PathBuf>,
}

impl Default for HostMetricsProvider {
    fn default() -> Self {
        Self {
            system: Mutex::new(System::new()),
            disk_path: None,
        }
    }
}

impl std::fmt::Debug for HostMetricsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMetricsProvider")
            .field("disk_path", &self.disk_path)
            .finish_non_exhaustive()
    }
}

impl HostMetricsProvider {
    pub fn for_path(path: &Path) -> Self {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self {
            disk_path: Some(path),
            ..Self::default()
        }
    }
}

impl SystemMetricsProvider for HostMetricsProvider {
    fn cpu(&self) -> Option<CpuMetrics> {
        let load = System::load_average();
        Some(CpuMetrics {
            load_average: [load.one, load.five, load.fifteen],
        })
    }

    fn memory(&self) -> Option<MemoryMetrics> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        let total_bytes = system.total_memory();
        (total_bytes > 0).then(|| MemoryMetrics {
            total_bytes,
            available_bytes: system.available_memory(),
        })
    }

    fn disk(&self) -> Option<DiskMetrics> {
        let disks = Disks::new_with_refreshed_list();
        let mounts: Vec<Mount> = disks
            .list()
            .iter()
            .map(|d| Mount {
                mount_point: d.mount_point().to_path_buf(),
                total_bytes: d.total_space(),
                free_bytes: d.available_space(),
            })
            .collect();
        select_disk(&mounts, self.disk_path.as_deref())
    }
}

struct Mount {
    mount_point: PathBuf,
    total_bytes: u64,
    free_bytes: u64,
}

fn select_disk(mounts: &[Mount], path: Option<&Path>) -> Option<DiskMetrics> {
    let holding = path.and_then(|path| {
        mounts
            .iter()
            .filter(|m| path.starts_with(&m.mount_point))
            .max_by_key(|m| m.mount_point.components().count())
    });
    if let Some(mount) = holding {
        return Some(DiskMetrics {
            total_bytes: mount.total_bytes,
            free_bytes: mount.free_bytes,
        });
    }
    if mounts.is_empty() {
        return None;
    }
    Some(DiskMetrics {
        total_bytes: mounts.iter().map(|m| m.total_bytes).sum(),
        free_bytes: mounts.iter().map(|m| m.free_bytes).sum(),
    })
}

pub(crate) fn spawn_capability_refresh(
    provider: Arc<dyn CapabilitiesProvider>,
    working_dir: PathBuf,
    slot: Arc<CapabilitySlot>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(MIN_INTERVAL));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match provider.capabilities(&working_dir).await {
                Ok(capabilities) => slot.put(capabilities),
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "capability refresh failed"),
            }
        }
    })
}

pub(crate) fn spawn_telemetry_upload(
    session: Session,
    provider: Arc<dyn SystemMetricsProvider>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(MIN_INTERVAL));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let metrics = provider.sample();
            let upload = session
                .connection()
                .upload_telemetry(session.agent_id(), metrics);
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = upload => {
                    if let Err(e) = res {
                        tracing::warn!(error = %e, "telemetry upload failed");
                    }
                }
            }
        }
    })
}
