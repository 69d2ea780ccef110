//! Process terminator port (interface).

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How a process should be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateOptions {
    /// Terminate descendants (bottom-up) before the process itself.
    pub include_children: bool,
    /// Request cooperative shutdown first, escalating after a timeout.
    pub graceful: bool,
}

impl TerminateOptions {
    /// Graceful shutdown of the whole process tree.
    pub fn tree() -> Self {
        Self {
            include_children: true,
            graceful: true,
        }
    }

    /// Immediate kill of the single process.
    pub fn force() -> Self {
        Self {
            include_children: false,
            graceful: false,
        }
    }
}

impl Default for TerminateOptions {
    fn default() -> Self {
        Self::tree()
    }
}

/// Successful termination result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminationOutcome {
    /// The process was alive and is now verified gone.
    Terminated,
    /// The process did not exist when termination was requested.
    AlreadyExited,
}

/// Port for killing processes.
///
/// Implementations must refuse to touch critical processes and must verify
/// that the target is gone before reporting success.
pub trait ProcessTerminatorPort: Send + Sync {
    /// Terminate `pid`. Terminating a process that is already gone succeeds.
    fn terminate(
        &self,
        pid: u32,
        options: TerminateOptions,
    ) -> impl Future<Output = Result<TerminationOutcome>> + Send;

    /// Check if a process is still running.
    fn is_running(&self, pid: u32) -> impl Future<Output = bool> + Send;
}
