//! Managed process domain models.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ProcessStatus
// ============================================================================

/// Lifecycle state of a managed service instance.
///
/// ```text
/// starting -> running -> stopping -> stopped
///     |          |           |
///     +----------+-----------+------> error
/// ```
///
/// `stopped` and `error` are terminal: restarting a service creates a new
/// instance with a new identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ProcessStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Stopped | ProcessStatus::Error)
    }

    /// Whether moving from `self` to `next` is a valid state machine edge.
    pub fn can_transition_to(&self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;

        match self {
            Starting => matches!(next, Running | Stopping | Stopped | Error),
            Running => matches!(next, Stopping | Stopped | Error),
            Stopping => matches!(next, Stopped | Error),
            Stopped | Error => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ResourceSample
// ============================================================================

/// One resource usage reading for a process.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    /// Resident set size in megabytes, rounded to two decimals.
    pub memory_mb: f64,
    /// CPU usage in percent. Zero when the platform could not sample it.
    pub cpu_percent: f32,
}

impl ResourceSample {
    /// Build a sample from a resident set size in bytes.
    pub fn from_bytes(rss_bytes: u64, cpu_percent: f32) -> Self {
        let mb = rss_bytes as f64 / (1024.0 * 1024.0);
        Self {
            memory_mb: (mb * 100.0).round() / 100.0,
            cpu_percent: if cpu_percent.is_finite() {
                cpu_percent.max(0.0)
            } else {
                0.0
            },
        }
    }
}

// ============================================================================
// StreamKind
// ============================================================================

/// Origin of a `service-output` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Annotation generated by the supervisor itself, not by the service.
    Error,
}

// ============================================================================
// ProcessSnapshot
// ============================================================================

/// Point-in-time copy of a registry entry.
///
/// Snapshots are the only view of a managed process handed across
/// concurrency boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    /// OS process identifier of the spawned service.
    pub process_id: u32,
    /// Identifier of this particular instance; never reused.
    pub instance_id: Uuid,
    pub command: String,
    pub working_directory: PathBuf,
    pub start_time: DateTime<Utc>,
    pub status: ProcessStatus,
    #[serde(rename = "memory")]
    pub memory_mb: f64,
    #[serde(rename = "cpu")]
    pub cpu_percent: f32,
    #[serde(rename = "ports")]
    pub bound_ports: BTreeSet<u16>,
}

impl ProcessSnapshot {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}
