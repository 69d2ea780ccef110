//! Port occupancy and conflict domain models.

use serde::{Deserialize, Serialize};

// ============================================================================
// PortOccupant
// ============================================================================

/// A process observed listening on a TCP port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortOccupant {
    /// The port number (e.g., 3000, 8080).
    pub port: u16,
    /// Process ID of the listener.
    pub pid: u32,
    /// Short process name, best effort.
    pub process_name: String,
    /// Network address the port is bound to.
    pub address: String,
    /// Full command line, or the process name when unavailable.
    pub command: String,
}

impl PortOccupant {
    pub fn new(
        port: u16,
        pid: u32,
        process_name: impl Into<String>,
        address: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            port,
            pid,
            process_name: process_name.into(),
            address: address.into(),
            command: command.into(),
        }
    }
}

impl std::fmt::Display for PortOccupant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} (PID: {}, Process: {})",
            self.address, self.port, self.pid, self.process_name
        )
    }
}

// ============================================================================
// PortConflict
// ============================================================================

/// A candidate port already held by a process this tool does not manage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConflict {
    pub port: u16,
    pub pid: u32,
    #[serde(default)]
    pub process_name: String,
}

impl PortConflict {
    pub fn new(port: u16, pid: u32, process_name: impl Into<String>) -> Self {
        Self {
            port,
            pid,
            process_name: process_name.into(),
        }
    }
}

impl From<&PortOccupant> for PortConflict {
    fn from(occupant: &PortOccupant) -> Self {
        Self::new(occupant.port, occupant.pid, occupant.process_name.clone())
    }
}

// ============================================================================
// Resolution results
// ============================================================================

/// Outcome of freeing a single conflicting port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortResolution {
    pub port: u16,
    pub pid: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PortResolution {
    pub fn resolved(port: u16, pid: u32) -> Self {
        Self {
            port,
            pid,
            success: true,
            error: None,
        }
    }

    pub fn failed(port: u16, pid: u32, error: impl Into<String>) -> Self {
        Self {
            port,
            pid,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Per-port report produced by conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveReport {
    pub all_resolved: bool,
    pub results: Vec<PortResolution>,
}

impl ResolveReport {
    pub fn from_results(results: Vec<PortResolution>) -> Self {
        Self {
            all_resolved: results.iter().all(|r| r.success),
            results,
        }
    }

    /// Ports that are still occupied or could not be freed.
    pub fn failed_ports(&self) -> Vec<u16> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.port)
            .collect()
    }
}
