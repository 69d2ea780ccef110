//! Error types for the servicedeck-core library.

use thiserror::Error;

use crate::domain::PortConflict;

/// Result type alias for servicedeck operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while supervising services and resolving port conflicts.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller supplied something unusable (empty command, port 0, pid 0, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// One or more candidate ports are held by unmanaged processes.
    #[error("Port conflict on {}", format_conflict_ports(.0))]
    PortConflict(Vec<PortConflict>),

    /// The pid is unknown to the registry or no longer exists.
    #[error("Process not found: {0}")]
    ProcessNotFound(u32),

    /// The project store has no record with this identifier.
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    /// Refused to terminate a protected operating system process.
    #[error("Cannot kill critical system process: {name} (PID: {pid})")]
    CriticalProcessProtected { pid: u32, name: String },

    /// A kill was issued but the process is still alive after the timeout.
    #[error("Process {pid} still running after kill attempt")]
    TerminationVerificationFailed { pid: u32 },

    /// A single port/process table query failed.
    #[error("Transient query failure: {0}")]
    TransientQuery(String),

    /// Failed to execute a system command.
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    /// Failed to parse command output.
    #[error("Failed to parse output: {0}")]
    ParseError(String),

    /// The service process could not be spawned.
    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    /// Failed to deliver a signal to a process.
    #[error("Failed to kill process {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },

    /// Permission denied for an operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Platform not supported.
    #[error("Platform not supported: {0}")]
    UnsupportedPlatform(String),
}

impl Error {
    /// Stable machine-readable code used in boundary payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::PortConflict(_) => "PORT_CONFLICT",
            Error::ProcessNotFound(_) => "PROCESS_NOT_FOUND",
            Error::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            Error::CriticalProcessProtected { .. } => "CRITICAL_PROCESS_PROTECTED",
            Error::TerminationVerificationFailed { .. } => "TERMINATION_VERIFICATION_FAILED",
            Error::TransientQuery(_) => "TRANSIENT_QUERY_FAILURE",
            _ => "INTERNAL",
        }
    }
}

fn format_conflict_ports(conflicts: &[PortConflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} ({} pid {})", c.port, c.process_name, c.pid))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::PortConflict(Vec::new()).code(), "PORT_CONFLICT");
        assert_eq!(Error::ProcessNotFound(1).code(), "PROCESS_NOT_FOUND");
        assert_eq!(
            Error::CommandFailed("x".to_string()).code(),
            "INTERNAL"
        );
    }

    #[test]
    fn test_conflict_display() {
        let err = Error::PortConflict(vec![PortConflict::new(3000, 555, "node")]);
        assert_eq!(err.to_string(), "Port conflict on 3000 (node pid 555)");
    }

    #[test]
    fn test_critical_display() {
        let err = Error::CriticalProcessProtected {
            pid: 4,
            name: "System".to_string(),
        };
        assert!(err.to_string().contains("System"));
        assert!(err.to_string().contains('4'));
    }
}
