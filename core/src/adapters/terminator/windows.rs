//! Windows termination via taskkill.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use super::{Delivery, StopSignal};
use crate::error::{Error, Result};

/// taskkill exit code when no process matched the filter.
const TASKKILL_NOT_FOUND: i32 = 128;

pub(super) async fn send_signal(pid: u32, signal: StopSignal) -> Result<Delivery> {
    let mut command = Command::new("taskkill");
    command.args(["/PID", &pid.to_string()]);
    if signal == StopSignal::Kill {
        command.arg("/F");
    }

    let output = command
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::CommandFailed(format!("Failed to run taskkill: {}", e)))?;

    if output.status.success() {
        return Ok(Delivery::Sent);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if output.status.code() == Some(TASKKILL_NOT_FOUND) || stderr.contains("not found") {
        return Ok(Delivery::NotFound);
    }
    if stderr.contains("Access is denied") {
        return Err(Error::PermissionDenied(format!("taskkill refused pid {}", pid)));
    }

    // Console processes often reject a non-forced taskkill; escalation handles them.
    if signal == StopSignal::Terminate {
        debug!(pid, stderr = %stderr.trim(), "Graceful taskkill rejected");
        return Ok(Delivery::Sent);
    }

    Err(Error::KillFailed {
        pid,
        reason: stderr.trim().to_string(),
    })
}
