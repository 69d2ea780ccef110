//! Process termination with critical-process protection and verification.
//!
//! # Termination pattern
//!
//! 1. Refuse critical processes before any signal is sent
//! 2. Collect descendants (deepest first) when the tree is requested
//! 3. Send a cooperative stop request (SIGTERM / `taskkill`) bottom-up
//! 4. Wait up to the graceful timeout, then force-kill survivors
//! 5. Poll until the target is gone or the verify timeout expires

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

#[cfg(unix)]
use self::unix as platform;

#[cfg(windows)]
use self::windows as platform;

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::domain::CriticalProcessSet;
use crate::error::{Error, Result};
use crate::ports::{ProcessTablePort, ProcessTerminatorPort, TerminateOptions, TerminationOutcome};

/// Default time a process gets to exit after a cooperative stop request.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time to wait for a killed process to disappear.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Signal kinds understood by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopSignal {
    /// SIGTERM, or `taskkill` without `/F`.
    Terminate,
    /// SIGKILL, or `taskkill /F`.
    Kill,
}

/// Outcome of delivering one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    NotFound,
}

/// Terminates processes through the OS, consulting a process table.
pub struct ProcessTerminator<P> {
    table: P,
    critical: CriticalProcessSet,
    graceful_timeout: Duration,
    verify_timeout: Duration,
}

impl<P: ProcessTablePort> ProcessTerminator<P> {
    pub fn new(table: P, critical: CriticalProcessSet) -> Self {
        Self {
            table,
            critical,
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, graceful: Duration, verify: Duration) -> Self {
        self.graceful_timeout = graceful;
        self.verify_timeout = verify;
        self
    }

    pub fn critical(&self) -> &CriticalProcessSet {
        &self.critical
    }

    /// Descendants of `pid` that may be signalled, deepest first.
    async fn killable_descendants(&self, pid: u32) -> Vec<u32> {
        let mut killable = Vec::new();
        for child in self.table.descendants(pid).await {
            let Some(name) = self.table.process_name(child).await else {
                continue;
            };
            if self.critical.protects(child, &name) {
                warn!(pid = child, name = %name, parent = pid, "Skipping critical descendant");
                continue;
            }
            killable.push(child);
        }
        killable
    }

    /// Send `signal` to every target. Only a failure on `root` is fatal.
    async fn signal_all(&self, targets: &[u32], root: u32, signal: StopSignal) -> Result<()> {
        for &target in targets {
            match platform::send_signal(target, signal).await {
                Ok(Delivery::Sent) => debug!(pid = target, ?signal, "Signal sent"),
                Ok(Delivery::NotFound) => debug!(pid = target, "Process already gone"),
                Err(e) if target == root => return Err(e),
                Err(e) => warn!(pid = target, error = %e, "Failed to signal descendant"),
            }
        }
        Ok(())
    }

    async fn alive_among(&self, targets: &[u32]) -> Vec<u32> {
        let mut alive = Vec::new();
        for &target in targets {
            if self.table.is_alive(target).await {
                alive.push(target);
            }
        }
        alive
    }

    /// Poll until none of `targets` is alive or `limit` elapses. Returns survivors.
    async fn wait_for_exit(&self, targets: &[u32], limit: Duration) -> Vec<u32> {
        let deadline = Instant::now() + limit;
        loop {
            let alive = self.alive_among(targets).await;
            if alive.is_empty() || Instant::now() >= deadline {
                return alive;
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

impl<P: ProcessTablePort> ProcessTerminatorPort for ProcessTerminator<P> {
    async fn terminate(&self, pid: u32, options: TerminateOptions) -> Result<TerminationOutcome> {
        if pid == 0 {
            return Err(Error::InvalidInput("pid 0 cannot be terminated".to_string()));
        }
        if pid == std::process::id() {
            return Err(Error::InvalidInput(format!("refusing to terminate own pid {}", pid)));
        }

        let Some(name) = self.table.process_name(pid).await else {
            debug!(pid, "Process not found, nothing to terminate");
            return Ok(TerminationOutcome::AlreadyExited);
        };

        if self.critical.protects(pid, &name) {
            warn!(pid, name = %name, "Refusing to terminate critical process");
            return Err(Error::CriticalProcessProtected { pid, name });
        }

        let mut targets = if options.include_children {
            self.killable_descendants(pid).await
        } else {
            Vec::new()
        };
        targets.push(pid);

        info!(pid, name = %name, tree = targets.len(), graceful = options.graceful, "Terminating process");

        let survivors = if options.graceful {
            self.signal_all(&targets, pid, StopSignal::Terminate).await?;
            self.wait_for_exit(&targets, self.graceful_timeout).await
        } else {
            targets
        };

        if !survivors.is_empty() {
            if options.graceful {
                debug!(pid, survivors = ?survivors, "Escalating to force kill");
            }
            self.signal_all(&survivors, pid, StopSignal::Kill).await?;
        }

        let remaining = self.wait_for_exit(&survivors, self.verify_timeout).await;
        if remaining.contains(&pid) {
            warn!(pid, "Process still alive after kill");
            return Err(Error::TerminationVerificationFailed { pid });
        }
        if !remaining.is_empty() {
            warn!(pid, survivors = ?remaining, "Some descendants survived termination");
        }

        info!(pid, "Process terminated");
        Ok(TerminationOutcome::Terminated)
    }

    async fn is_running(&self, pid: u32) -> bool {
        self.table.is_alive(pid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResourceSample;
    use std::collections::HashMap;

    /// Table with fixed names. Every named pid reports as alive.
    struct MockTable {
        names: HashMap<u32, String>,
    }

    impl MockTable {
        fn with(entries: &[(u32, &str)]) -> Self {
            Self {
                names: entries
                    .iter()
                    .map(|(pid, name)| (*pid, name.to_string()))
                    .collect(),
            }
        }
    }

    impl ProcessTablePort for MockTable {
        async fn is_alive(&self, pid: u32) -> bool {
            self.names.contains_key(&pid)
        }

        async fn process_name(&self, pid: u32) -> Option<String> {
            self.names.get(&pid).cloned()
        }

        async fn descendants(&self, _pid: u32) -> Vec<u32> {
            Vec::new()
        }

        async fn sample(&self, _pid: u32) -> Option<ResourceSample> {
            None
        }
    }

    #[tokio::test]
    async fn test_pid_zero_is_invalid() {
        let terminator = ProcessTerminator::new(MockTable::with(&[]), CriticalProcessSet::builtin());
        let err = terminator.terminate(0, TerminateOptions::tree()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_missing_process_already_exited() {
        let terminator = ProcessTerminator::new(MockTable::with(&[]), CriticalProcessSet::builtin());
        let outcome = terminator
            .terminate(3_999_999, TerminateOptions::tree())
            .await
            .unwrap();
        assert_eq!(outcome, TerminationOutcome::AlreadyExited);
    }

    #[tokio::test]
    async fn test_critical_process_refused() {
        // Mock pid so no real process is ever signalled.
        let table = MockTable::with(&[(3_999_998, "systemd")]);
        let terminator = ProcessTerminator::new(table, CriticalProcessSet::builtin());

        let err = terminator
            .terminate(3_999_998, TerminateOptions::force())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CriticalProcessProtected { pid: 3_999_998, ref name } if name == "systemd"
        ));
    }

    #[tokio::test]
    async fn test_extra_critical_names_refused() {
        let table = MockTable::with(&[(3_999_997, "postgres")]);
        let terminator = ProcessTerminator::new(table, CriticalProcessSet::with_extra(["postgres"]));

        let err = terminator
            .terminate(3_999_997, TerminateOptions::tree())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CRITICAL_PROCESS_PROTECTED");
    }

    #[cfg(unix)]
    mod unix_processes {
        use super::super::*;
        use crate::adapters::ProcessTable;
        use std::process::{Command, Stdio};

        fn spawn(script: &str) -> std::process::Child {
            Command::new("sh")
                .args(["-c", script])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .unwrap()
        }

        fn terminator() -> ProcessTerminator<ProcessTable> {
            ProcessTerminator::new(ProcessTable::new(), CriticalProcessSet::builtin())
                .with_timeouts(Duration::from_millis(500), Duration::from_secs(2))
        }

        #[tokio::test]
        async fn test_terminates_cooperative_process() {
            let mut child = spawn("exec sleep 30");
            let pid = child.id();
            let terminator = terminator();

            assert!(terminator.is_running(pid).await);
            let outcome = terminator.terminate(pid, TerminateOptions::tree()).await.unwrap();
            assert_eq!(outcome, TerminationOutcome::Terminated);
            let _ = child.wait();
            assert!(!terminator.is_running(pid).await);
        }

        #[tokio::test]
        async fn test_escalates_when_term_is_ignored() {
            let mut child = spawn("trap '' TERM; sleep 30 & wait");
            let pid = child.id();
            tokio::time::sleep(Duration::from_millis(200)).await;
            let terminator = terminator();

            let outcome = terminator.terminate(pid, TerminateOptions::tree()).await.unwrap();
            assert_eq!(outcome, TerminationOutcome::Terminated);
            let _ = child.wait();
        }

        #[tokio::test]
        async fn test_terminating_twice_is_idempotent() {
            let mut child = spawn("exec sleep 30");
            let pid = child.id();
            let terminator = terminator();

            terminator.terminate(pid, TerminateOptions::force()).await.unwrap();
            let _ = child.wait();
            let outcome = terminator.terminate(pid, TerminateOptions::force()).await.unwrap();
            assert_eq!(outcome, TerminationOutcome::AlreadyExited);
        }
    }
}
