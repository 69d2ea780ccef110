//! Unix signal delivery via nix.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::{Delivery, StopSignal};
use crate::error::{Error, Result};

pub(super) async fn send_signal(pid: u32, signal: StopSignal) -> Result<Delivery> {
    let raw = i32::try_from(pid)
        .map_err(|_| Error::InvalidInput(format!("pid {} out of range", pid)))?;

    let signal = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };

    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(Delivery::Sent),
        Err(Errno::ESRCH) => Ok(Delivery::NotFound),
        Err(Errno::EPERM) => Err(Error::PermissionDenied(format!(
            "not allowed to send {} to pid {}",
            signal, pid
        ))),
        Err(e) => Err(Error::KillFailed {
            pid,
            reason: e.to_string(),
        }),
    }
}
