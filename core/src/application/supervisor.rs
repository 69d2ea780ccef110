//! Registry and lifecycle supervision of spawned services.
//!
//! Every managed process lives in a registry entry guarded by its own mutex.
//! Status transitions happen under that lock and emit their `process-status`
//! event before releasing it, so listeners see each process's transitions in
//! order. Removal from the registry is what cancels further monitoring: every
//! sampling result is discarded unless its entry is still registered.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::{ConflictResolver, StatusBroadcaster};
use crate::config::{Readiness, SupervisorSettings};
use crate::domain::{candidate_ports, ProcessSnapshot, ProcessStatus, ResourceSample, StreamKind};
use crate::error::{Error, Result};
use crate::ports::{
    PortInspectorPort, ProcessTablePort, ProcessTerminatorPort, TerminateOptions,
};

/// How long reader tasks may keep draining output after the process exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Grace given to the exit waiter before the monitor declares a vanished process stopped.
const VANISH_GRACE: Duration = Duration::from_millis(200);

/// Longest output line forwarded as one event; longer runs are split.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Consecutive read errors after which a pipe is abandoned.
const MAX_READ_ERRORS: u32 = 3;

/// Floor for the monitoring period and the per-process sampling timeout.
const MIN_SUPERVISOR_TIMING: Duration = Duration::from_millis(10);

/// A request to launch a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartRequest {
    pub command: String,
    pub working_directory: PathBuf,
    /// Ports the service is declared to need.
    pub ports: Vec<u16>,
    /// Environment layered over the configured global environment.
    pub environment: HashMap<String, String>,
}

impl StartRequest {
    pub fn new(command: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_directory: working_directory.into(),
            ..Default::default()
        }
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    pub fn with_env(mut self, environment: HashMap<String, String>) -> Self {
        self.environment.extend(environment);
        self
    }
}

struct Entry {
    snapshot: ProcessSnapshot,
    /// Set by the exit waiter once the OS has reported the exit.
    exited: bool,
}

type EntryRef = Arc<Mutex<Entry>>;

/// How a registered process left.
enum Exit {
    Status(ExitStatus),
    WaitFailed(String),
    Vanished,
}

impl Exit {
    fn code(&self) -> Option<i32> {
        match self {
            Exit::Status(status) => status.code(),
            _ => None,
        }
    }

    fn is_clean(&self) -> bool {
        match self {
            Exit::Status(status) => status.success(),
            Exit::WaitFailed(_) => false,
            Exit::Vanished => true,
        }
    }
}

struct Inner<I, T, P> {
    resolver: ConflictResolver<I, T>,
    table: P,
    broadcaster: StatusBroadcaster,
    settings: SupervisorSettings,
    registry: RwLock<HashMap<u32, EntryRef>>,
    /// Serializes the conflict check with the spawn it guards.
    start_lock: tokio::sync::Mutex<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Supervises services spawned by this tool.
///
/// Cloning is cheap and every clone shares one registry.
pub struct ServiceSupervisor<I, T, P> {
    inner: Arc<Inner<I, T, P>>,
}

impl<I, T, P> Clone for ServiceSupervisor<I, T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, T, P> ServiceSupervisor<I, T, P>
where
    I: PortInspectorPort + 'static,
    T: ProcessTerminatorPort + 'static,
    P: ProcessTablePort + 'static,
{
    /// Timings below a small floor are raised to it.
    pub fn new(
        resolver: ConflictResolver<I, T>,
        table: P,
        broadcaster: StatusBroadcaster,
        mut settings: SupervisorSettings,
    ) -> Self {
        for (name, value) in [
            ("monitor_interval", &mut settings.monitor_interval),
            ("query_timeout", &mut settings.query_timeout),
        ] {
            if *value < MIN_SUPERVISOR_TIMING {
                warn!(
                    setting = name,
                    requested_ms = value.as_millis() as u64,
                    "Raising supervisor timing to minimum"
                );
                *value = MIN_SUPERVISOR_TIMING;
            }
        }

        Self {
            inner: Arc::new(Inner {
                resolver,
                table,
                broadcaster,
                settings,
                registry: RwLock::new(HashMap::new()),
                start_lock: tokio::sync::Mutex::new(()),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn resolver(&self) -> &ConflictResolver<I, T> {
        &self.inner.resolver
    }

    pub fn table(&self) -> &P {
        &self.inner.table
    }

    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.inner.broadcaster
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Check ports and spawn the service.
    ///
    /// Returns as soon as the process is spawned, in `starting`. Fails with
    /// [`Error::PortConflict`] without spawning anything when a candidate port
    /// is held by an unmanaged process.
    pub async fn start(&self, request: StartRequest) -> Result<ProcessSnapshot> {
        let command = request.command.trim();
        if command.is_empty() {
            return Err(Error::InvalidInput("command is empty".to_string()));
        }
        if !request.working_directory.is_dir() {
            return Err(Error::InvalidInput(format!(
                "working directory {} does not exist",
                request.working_directory.display()
            )));
        }

        let _guard = self.inner.start_lock.lock().await;

        let settings = &self.inner.settings;
        let candidates = candidate_ports(
            &request.ports,
            command,
            settings.port_policy,
            &settings.fallback_ports,
        );
        let managed = self.managed_pids().await;
        let conflicts = self.inner.resolver.check_conflicts(&candidates, &managed).await;
        if !conflicts.is_empty() {
            info!(command, count = conflicts.len(), "Start refused, ports occupied");
            self.inner.broadcaster.emit_conflicts(command, &conflicts);
            return Err(Error::PortConflict(conflicts));
        }

        let mut child = shell_command(command)
            .current_dir(&request.working_directory)
            .envs(&settings.environment)
            .envs(&request.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_failed(command, e.to_string()))?;

        let Some(pid) = child.id() else {
            let reason = "process exited before its pid was known".to_string();
            return Err(self.spawn_failed(command, reason));
        };

        let snapshot = ProcessSnapshot {
            process_id: pid,
            instance_id: Uuid::new_v4(),
            command: command.to_string(),
            working_directory: request.working_directory.clone(),
            start_time: Utc::now(),
            status: ProcessStatus::Starting,
            memory_mb: 0.0,
            cpu_percent: 0.0,
            bound_ports: BTreeSet::new(),
        };
        let entry: EntryRef = Arc::new(Mutex::new(Entry {
            snapshot: snapshot.clone(),
            exited: false,
        }));

        {
            // Registered and announced before any output can promote it.
            let guard = entry.lock();
            self.inner.registry.write().insert(pid, Arc::clone(&entry));
            self.inner.broadcaster.emit_status(&guard.snapshot);
        }
        info!(pid, command, instance = %snapshot.instance_id, "Service started");

        let readers = self.spawn_readers(&mut child, pid, &entry);
        self.spawn_waiter(child, pid, entry, readers);
        self.ensure_monitor();

        Ok(snapshot)
    }

    /// Stop a managed service and its process tree.
    ///
    /// A pid that is not registered, or that already finished, is treated as
    /// stopped. On termination failure the entry moves to `error` and stays
    /// queryable until [`purge`](Self::purge)d.
    pub async fn stop(&self, pid: u32) -> Result<()> {
        let Some(entry) = self.entry(pid) else {
            debug!(pid, "Stop requested for unmanaged pid");
            return Ok(());
        };

        let (instance_id, retry_failed) = {
            let mut guard = entry.lock();
            let instance_id = guard.snapshot.instance_id;
            match guard.snapshot.status {
                ProcessStatus::Stopping | ProcessStatus::Stopped => {
                    debug!(pid, "Stop already in progress or complete");
                    return Ok(());
                }
                ProcessStatus::Error => (instance_id, true),
                ProcessStatus::Starting | ProcessStatus::Running => {
                    self.inner.transition(&mut guard, ProcessStatus::Stopping);
                    (instance_id, false)
                }
            }
        };

        let result = self
            .inner
            .resolver
            .terminator()
            .terminate(pid, TerminateOptions::tree())
            .await;

        match result {
            Ok(outcome) => {
                if !retry_failed {
                    self.inner.transition(&mut entry.lock(), ProcessStatus::Stopped);
                }
                self.inner.remove(pid, &entry);
                self.inner.broadcaster.emit_stopped(pid, instance_id, None);
                info!(pid, ?outcome, "Service stopped");
                Ok(())
            }
            Err(e) => {
                warn!(pid, error = %e, "Failed to stop service");
                if !retry_failed {
                    self.inner.transition(&mut entry.lock(), ProcessStatus::Error);
                }
                self.inner.broadcaster.emit_output(
                    pid,
                    StreamKind::Error,
                    format!("Failed to stop process: {}", e),
                );
                Err(e)
            }
        }
    }

    /// Drop an entry left in `error` by a failed stop.
    pub fn purge(&self, pid: u32) -> Result<()> {
        let entry = self.entry(pid).ok_or(Error::ProcessNotFound(pid))?;
        let (status, instance_id) = {
            let guard = entry.lock();
            (guard.snapshot.status, guard.snapshot.instance_id)
        };
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "process {} is still {}",
                pid, status
            )));
        }
        self.inner.remove(pid, &entry);
        self.inner.broadcaster.emit_stopped(pid, instance_id, None);
        Ok(())
    }

    /// Snapshot of one registry entry.
    pub fn snapshot(&self, pid: u32) -> Option<ProcessSnapshot> {
        self.entry(pid).map(|e| e.lock().snapshot.clone())
    }

    /// Snapshots of every registry entry, oldest first.
    pub fn list(&self) -> Vec<ProcessSnapshot> {
        let entries: Vec<EntryRef> = self.inner.registry.read().values().cloned().collect();
        let mut snapshots: Vec<ProcessSnapshot> =
            entries.iter().map(|e| e.lock().snapshot.clone()).collect();
        snapshots.sort_by_key(|s| s.start_time);
        snapshots
    }

    pub fn is_managed(&self, pid: u32) -> bool {
        self.inner.registry.read().contains_key(&pid)
    }

    /// Registered pids plus their live descendants.
    pub async fn managed_pids(&self) -> HashSet<u32> {
        let roots: Vec<u32> = self.inner.registry.read().keys().copied().collect();
        let mut pids: HashSet<u32> = roots.iter().copied().collect();
        for pid in roots {
            pids.extend(self.inner.table.descendants(pid).await);
        }
        pids
    }

    /// Stop every managed service and the monitoring task.
    pub async fn shutdown(&self) {
        let pids: Vec<u32> = self.inner.registry.read().keys().copied().collect();
        info!(count = pids.len(), "Shutting down supervisor");

        let mut tasks = JoinSet::new();
        for pid in pids {
            let supervisor = self.clone();
            tasks.spawn(async move { (pid, supervisor.stop(pid).await) });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((pid, Err(e))) => warn!(pid, error = %e, "Service did not stop cleanly"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Stop task failed"),
            }
        }

        if let Some(handle) = self.inner.monitor.lock().take() {
            handle.abort();
        }
    }

    fn spawn_failed(&self, command: &str, reason: String) -> Error {
        warn!(command, reason = %reason, "Failed to spawn service");
        self.inner.broadcaster.emit_spawn_failure(command, &reason);
        Error::SpawnFailed {
            command: command.to_string(),
            reason,
        }
    }

    fn entry(&self, pid: u32) -> Option<EntryRef> {
        self.inner.registry.read().get(&pid).cloned()
    }

    fn spawn_readers(&self, child: &mut Child, pid: u32, entry: &EntryRef) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_stream(
                Arc::clone(&self.inner),
                stdout,
                pid,
                Arc::clone(entry),
                StreamKind::Stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stream(
                Arc::clone(&self.inner),
                stderr,
                pid,
                Arc::clone(entry),
                StreamKind::Stderr,
            )));
        }
        readers
    }

    fn spawn_waiter(&self, mut child: Child, pid: u32, entry: EntryRef, readers: Vec<JoinHandle<()>>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => Exit::Status(status),
                Err(e) => Exit::WaitFailed(e.to_string()),
            };
            entry.lock().exited = true;
            for reader in readers {
                if timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                    debug!(pid, "Output still open after exit, detaching reader");
                }
            }
            inner.finish(pid, &entry, exit);
        });
    }

    fn ensure_monitor(&self) {
        let mut slot = self.inner.monitor.lock();
        if slot.is_none() {
            let weak = Arc::downgrade(&self.inner);
            *slot = Some(tokio::spawn(monitor_loop(weak, self.inner.settings.monitor_interval)));
        }
    }
}

impl<I, T, P> Inner<I, T, P>
where
    I: PortInspectorPort + 'static,
    T: ProcessTerminatorPort + 'static,
    P: ProcessTablePort + 'static,
{
    /// Apply a state machine edge and announce it. Invalid edges are ignored.
    fn transition(&self, entry: &mut Entry, next: ProcessStatus) -> bool {
        let current = entry.snapshot.status;
        if !current.can_transition_to(next) {
            debug!(pid = entry.snapshot.process_id, from = %current, to = %next, "Ignoring invalid transition");
            return false;
        }
        entry.snapshot.status = next;
        debug!(pid = entry.snapshot.process_id, from = %current, to = %next, "Status changed");
        self.broadcaster.emit_status(&entry.snapshot);
        true
    }

    fn is_registered(&self, pid: u32, entry: &EntryRef) -> bool {
        self.registry
            .read()
            .get(&pid)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    fn remove(&self, pid: u32, entry: &EntryRef) {
        let mut registry = self.registry.write();
        if registry.get(&pid).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            registry.remove(&pid);
        }
    }

    fn promote(&self, entry: &EntryRef) {
        let mut guard = entry.lock();
        if guard.snapshot.status == ProcessStatus::Starting {
            self.transition(&mut guard, ProcessStatus::Running);
        }
    }

    /// Handle an exit not caused by an explicit stop.
    fn finish(&self, pid: u32, entry: &EntryRef, exit: Exit) {
        if !self.is_registered(pid, entry) {
            return;
        }

        let instance_id = {
            let mut guard = entry.lock();
            match guard.snapshot.status {
                // Explicit stop owns the rest of the lifecycle.
                ProcessStatus::Stopping => return,
                status if status.is_terminal() => return,
                _ => {}
            }
            let next = if exit.is_clean() {
                ProcessStatus::Stopped
            } else {
                ProcessStatus::Error
            };
            self.transition(&mut guard, next);
            guard.snapshot.instance_id
        };

        match &exit {
            Exit::Status(status) if !status.success() => {
                let detail = match status.code() {
                    Some(code) => format!("Process exited with code {}", code),
                    None => "Process terminated by signal".to_string(),
                };
                self.broadcaster.emit_output(pid, StreamKind::Error, detail);
            }
            Exit::WaitFailed(reason) => {
                self.broadcaster
                    .emit_output(pid, StreamKind::Error, format!("Lost track of process: {}", reason));
            }
            _ => {}
        }

        self.remove(pid, entry);
        self.broadcaster.emit_stopped(pid, instance_id, exit.code());
        info!(pid, code = ?exit.code(), "Service exited");
    }

    /// Sample one entry and publish the result if it is still registered.
    async fn sample(&self, pid: u32, entry: EntryRef) {
        if !self.table.is_alive(pid).await {
            sleep(VANISH_GRACE).await;
            if entry.lock().exited {
                // The exit waiter reports the real exit status.
                return;
            }
            debug!(pid, "Process vanished outside of our control");
            self.finish(pid, &entry, Exit::Vanished);
            return;
        }

        let usage = self.table.sample(pid).await;

        let mut tree: HashSet<u32> = self.table.descendants(pid).await.into_iter().collect();
        tree.insert(pid);
        let ports = match self.resolver.inspector().bound_ports(&tree).await {
            Ok(ports) => Some(ports),
            Err(e) => {
                warn!(pid, error = %e, "Port sampling failed this tick");
                None
            }
        };

        let mut guard = entry.lock();
        if !self.is_registered(pid, &entry) {
            return;
        }
        let status = guard.snapshot.status;
        if status.is_terminal() || status == ProcessStatus::Stopping {
            return;
        }

        let ResourceSample {
            memory_mb,
            cpu_percent,
        } = usage.unwrap_or_default();
        guard.snapshot.memory_mb = memory_mb;
        guard.snapshot.cpu_percent = cpu_percent;
        if let Some(ports) = ports {
            guard.snapshot.bound_ports = ports;
        }

        let port_ready = self.settings.readiness == Readiness::PortBound
            && status == ProcessStatus::Starting
            && !guard.snapshot.bound_ports.is_empty();
        if !(port_ready && self.transition(&mut guard, ProcessStatus::Running)) {
            self.broadcaster.emit_status(&guard.snapshot);
        }
    }
}

/// Newline-delimited output that need not be UTF-8.
struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    fn new(stream: R) -> Self {
        Self {
            reader: BufReader::new(stream),
            buf: Vec::new(),
        }
    }

    /// Next line with invalid bytes replaced, or `None` at end of stream.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let read = (&mut self.reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }

        let mut line = self.buf.as_slice();
        if let Some(rest) = line.strip_suffix(b"\n") {
            line = rest;
        }
        if let Some(rest) = line.strip_suffix(b"\r") {
            line = rest;
        }
        Ok(Some(String::from_utf8_lossy(line).into_owned()))
    }
}

/// Stream one pipe line by line into `service-output` events.
///
/// The pipe is read until end of stream so the service never writes into a
/// closed pipe.
async fn read_stream<I, T, P, R>(
    inner: Arc<Inner<I, T, P>>,
    stream: R,
    pid: u32,
    entry: EntryRef,
    kind: StreamKind,
) where
    I: PortInspectorPort + 'static,
    T: ProcessTerminatorPort + 'static,
    P: ProcessTablePort + 'static,
    R: AsyncRead + Unpin,
{
    let mut lines = OutputLines::new(stream);
    let mut errors = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                errors = 0;
                if kind == StreamKind::Stdout && inner.settings.readiness == Readiness::FirstOutput {
                    inner.promote(&entry);
                }
                inner.broadcaster.emit_output(pid, kind, line);
            }
            Ok(None) => break,
            Err(e) => {
                errors += 1;
                inner.broadcaster.emit_output(
                    pid,
                    StreamKind::Error,
                    format!("Failed to read {:?} output: {}", kind, e),
                );
                if errors >= MAX_READ_ERRORS {
                    warn!(pid, stream = ?kind, error = %e, "Giving up on output pipe");
                    break;
                }
            }
        }
    }
}

/// Periodic sampling of every registered process until the registry drains.
async fn monitor_loop<I, T, P>(inner: Weak<Inner<I, T, P>>, period: Duration)
where
    I: PortInspectorPort + 'static,
    T: ProcessTerminatorPort + 'static,
    P: ProcessTablePort + 'static,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let entries: Vec<(u32, EntryRef)> = {
            let mut slot = inner.monitor.lock();
            let registry = inner.registry.read();
            if registry.is_empty() {
                *slot = None;
                debug!("Registry empty, monitor exiting");
                break;
            }
            registry.iter().map(|(pid, e)| (*pid, Arc::clone(e))).collect()
        };

        let limit = inner.settings.query_timeout;
        let mut tasks = JoinSet::new();
        for (pid, entry) in entries {
            let status = entry.lock().snapshot.status;
            if status.is_terminal() || status == ProcessStatus::Stopping {
                continue;
            }
            let inner = Arc::clone(&inner);
            tasks.spawn(async move {
                if timeout(limit, inner.sample(pid, entry)).await.is_err() {
                    warn!(pid, timeout_ms = limit.as_millis() as u64, "Sampling timed out");
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Sampling task failed");
            }
        }
    }
}

/// Run `command` through the platform shell.
#[cfg(unix)]
pub(crate) fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).process_group(0);
    cmd
}

#[cfg(windows)]
pub(crate) fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::broadcaster::StatusEvent;
    use crate::domain::{PortConflict, PortOccupant};
    use crate::ports::TerminationOutcome;
    use std::collections::BTreeMap;
    use tokio::sync::broadcast;

    /// Inspector backed by a fixed occupant table.
    #[derive(Clone, Default)]
    struct MockInspector {
        occupants: Arc<Mutex<Vec<PortOccupant>>>,
    }

    impl PortInspectorPort for MockInspector {
        async fn find_occupant(&self, port: u16) -> Option<PortOccupant> {
            self.occupants.lock().iter().find(|o| o.port == port).cloned()
        }

        async fn list_occupants(&self, ports: &BTreeSet<u16>) -> BTreeMap<u16, Vec<PortOccupant>> {
            let occupants = self.occupants.lock();
            ports
                .iter()
                .map(|p| (*p, occupants.iter().filter(|o| o.port == *p).cloned().collect()))
                .collect()
        }

        async fn bound_ports(&self, pids: &HashSet<u32>) -> Result<BTreeSet<u16>> {
            Ok(self
                .occupants
                .lock()
                .iter()
                .filter(|o| pids.contains(&o.pid))
                .map(|o| o.port)
                .collect())
        }

        async fn listening(&self) -> Result<Vec<PortOccupant>> {
            Ok(self.occupants.lock().clone())
        }
    }

    /// Terminator that records calls and can be told to fail.
    #[derive(Clone, Default)]
    struct MockTerminator {
        calls: Arc<Mutex<Vec<u32>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl ProcessTerminatorPort for MockTerminator {
        async fn terminate(&self, pid: u32, _options: TerminateOptions) -> Result<TerminationOutcome> {
            self.calls.lock().push(pid);
            if *self.fail.lock() {
                return Err(Error::TerminationVerificationFailed { pid });
            }
            Ok(TerminationOutcome::Terminated)
        }

        async fn is_running(&self, _pid: u32) -> bool {
            false
        }
    }

    /// Table where every pid is alive and childless unless marked otherwise.
    #[derive(Clone, Default)]
    struct MockTable {
        dead: Arc<Mutex<HashSet<u32>>>,
        stuck: Arc<Mutex<HashSet<u32>>>,
    }

    impl ProcessTablePort for MockTable {
        async fn is_alive(&self, pid: u32) -> bool {
            !self.dead.lock().contains(&pid)
        }

        async fn process_name(&self, _pid: u32) -> Option<String> {
            Some("mock".to_string())
        }

        async fn descendants(&self, _pid: u32) -> Vec<u32> {
            Vec::new()
        }

        async fn sample(&self, pid: u32) -> Option<ResourceSample> {
            if self.stuck.lock().contains(&pid) {
                std::future::pending::<()>().await;
            }
            Some(ResourceSample::from_bytes(10 * 1024 * 1024, 1.5))
        }
    }

    type MockSupervisor = ServiceSupervisor<MockInspector, MockTerminator, MockTable>;

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            monitor_interval: Duration::from_millis(100),
            ..SupervisorSettings::default()
        }
    }

    fn mock_supervisor(
        occupants: Vec<PortOccupant>,
        settings: SupervisorSettings,
    ) -> (MockSupervisor, MockTerminator) {
        let terminator = MockTerminator::default();
        let inspector = MockInspector {
            occupants: Arc::new(Mutex::new(occupants)),
        };
        let supervisor = ServiceSupervisor::new(
            ConflictResolver::new(inspector, terminator.clone()),
            MockTable::default(),
            StatusBroadcaster::new(64),
            settings,
        );
        (supervisor, terminator)
    }

    fn tmp() -> PathBuf {
        std::env::temp_dir()
    }

    #[tokio::test]
    async fn test_empty_command_is_invalid() {
        let (supervisor, _) = mock_supervisor(Vec::new(), settings());
        let err = supervisor.start(StartRequest::new("   ", tmp())).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_missing_directory_is_invalid() {
        let (supervisor, _) = mock_supervisor(Vec::new(), settings());
        let request = StartRequest::new("echo hi", "/definitely/not/a/dir");
        let err = supervisor.start(request).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_conflict_prevents_spawn() {
        let occupant = PortOccupant::new(3000, 555, "node", "*", "node server.js");
        let (supervisor, _) = mock_supervisor(vec![occupant], settings());
        let mut rx = supervisor.broadcaster().subscribe();

        let request = StartRequest::new("npm start", tmp()).with_ports([3000]);
        let err = supervisor.start(request).await.unwrap_err();

        match err {
            Error::PortConflict(conflicts) => {
                assert_eq!(conflicts, vec![PortConflict::new(3000, 555, "node")]);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert!(supervisor.list().is_empty());

        match rx.try_recv() {
            Ok(StatusEvent::PortConflict(event)) => assert_eq!(event.conflicts.len(), 1),
            other => panic!("expected port-conflict event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heuristic_ports_are_checked() {
        let occupant = PortOccupant::new(5173, 555, "node", "*", "node");
        let (supervisor, _) = mock_supervisor(vec![occupant], settings());

        let err = supervisor
            .start(StartRequest::new("vite --port 5173", tmp()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PORT_CONFLICT");
    }

    #[tokio::test]
    async fn test_stop_unknown_pid_is_success() {
        let (supervisor, terminator) = mock_supervisor(Vec::new(), settings());
        supervisor.stop(4_000_001).await.unwrap();
        assert!(terminator.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_purge_unknown_pid() {
        let (supervisor, _) = mock_supervisor(Vec::new(), settings());
        assert_eq!(supervisor.purge(4_000_001).unwrap_err().code(), "PROCESS_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_zero_timings_are_raised() {
        let settings = SupervisorSettings {
            monitor_interval: Duration::ZERO,
            query_timeout: Duration::ZERO,
            ..SupervisorSettings::default()
        };
        let (supervisor, _) = mock_supervisor(Vec::new(), settings);
        assert_eq!(supervisor.settings().monitor_interval, MIN_SUPERVISOR_TIMING);
        assert_eq!(supervisor.settings().query_timeout, MIN_SUPERVISOR_TIMING);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_announced() {
        let (supervisor, _) = mock_supervisor(Vec::new(), settings());
        let mut rx = supervisor.broadcaster().subscribe();

        // A NUL byte in the environment makes the spawn itself fail.
        let environment = HashMap::from([("BROKEN".to_string(), "a\0b".to_string())]);
        let request = StartRequest::new("echo hi", tmp()).with_env(environment);
        let err = supervisor.start(request).await.unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }), "got {:?}", err);
        assert!(supervisor.list().is_empty());

        match rx.try_recv() {
            Ok(StatusEvent::ServiceOutput(e)) => {
                assert_eq!(e.process_id, None);
                assert_eq!(e.stream, StreamKind::Error);
                assert!(e.data.contains("echo hi"));
            }
            other => panic!("expected spawn failure output, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_output_lines_tolerate_invalid_utf8() {
        let raw: &[u8] = b"caf\xe9\nplain\r\n\xff\xfe\nlast";
        let mut lines = OutputLines::new(raw);

        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("caf\u{fffd}"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("plain"));
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("\u{fffd}\u{fffd}")
        );
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_output_lines_split_overlong_lines() {
        let mut raw = vec![b'x'; MAX_LINE_BYTES + 10];
        raw.extend_from_slice(b"\nnext\n");
        let mut lines = OutputLines::new(raw.as_slice());

        assert_eq!(lines.next_line().await.unwrap().map(|l| l.len()), Some(MAX_LINE_BYTES));
        assert_eq!(lines.next_line().await.unwrap().map(|l| l.len()), Some(10));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("next"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    async fn next_status(rx: &mut broadcast::Receiver<StatusEvent>, pid: u32) -> ProcessStatus {
        loop {
            match timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(StatusEvent::ProcessStatus(e))) if e.process_id == pid => return e.status,
                Ok(Ok(_)) => continue,
                other => panic!("no status event: {:?}", other),
            }
        }
    }

    async fn wait_stopped_event(rx: &mut broadcast::Receiver<StatusEvent>, pid: u32) -> Option<i32> {
        loop {
            match timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(StatusEvent::ServiceStopped(e))) if e.process_id == pid => return e.exit_code,
                Ok(Ok(_)) => continue,
                other => panic!("no service-stopped event: {:?}", other),
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_first_output_promotes_to_running() {
        let (supervisor, _) = mock_supervisor(Vec::new(), settings());
        let mut rx = supervisor.broadcaster().subscribe();

        let snapshot = supervisor
            .start(StartRequest::new("echo ready; sleep 30", tmp()).with_ports([3000]))
            .await
            .unwrap();
        let pid = snapshot.process_id;
        assert_eq!(snapshot.status, ProcessStatus::Starting);

        assert_eq!(next_status(&mut rx, pid).await, ProcessStatus::Starting);
        let mut status = ProcessStatus::Starting;
        while status == ProcessStatus::Starting {
            status = next_status(&mut rx, pid).await;
        }
        assert_eq!(status, ProcessStatus::Running);

        supervisor.stop(pid).await.unwrap();
        assert!(!supervisor.is_managed(pid));
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_explicit_stop_emits_stopping_then_stopped() {
        let (supervisor, terminator) = mock_supervisor(Vec::new(), settings());
        let mut rx = supervisor.broadcaster().subscribe();

        let pid = supervisor
            .start(StartRequest::new("sleep 30", tmp()))
            .await
            .unwrap()
            .process_id;
        supervisor.stop(pid).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StatusEvent::ProcessStatus(e) = event {
                if !seen.contains(&e.status) {
                    seen.push(e.status);
                }
            }
        }
        assert_eq!(seen, vec![ProcessStatus::Starting, ProcessStatus::Stopping, ProcessStatus::Stopped]);
        assert_eq!(*terminator.calls.lock(), vec![pid]);
        assert!(supervisor.snapshot(pid).is_none());

        // The mock terminator did not kill anything.
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_stop_leaves_error_entry() {
        let (supervisor, terminator) = mock_supervisor(Vec::new(), settings());
        *terminator.fail.lock() = true;

        let pid = supervisor
            .start(StartRequest::new("sleep 30", tmp()))
            .await
            .unwrap()
            .process_id;

        let err = supervisor.stop(pid).await.unwrap_err();
        assert_eq!(err.code(), "TERMINATION_VERIFICATION_FAILED");
        assert_eq!(supervisor.snapshot(pid).unwrap().status, ProcessStatus::Error);

        supervisor.purge(pid).unwrap();
        assert!(supervisor.snapshot(pid).is_none());

        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_is_stopped_and_removed() {
        let (supervisor, terminator) = mock_supervisor(Vec::new(), settings());
        let mut rx = supervisor.broadcaster().subscribe();

        let pid = supervisor
            .start(StartRequest::new("echo done", tmp()))
            .await
            .unwrap()
            .process_id;

        assert_eq!(wait_stopped_event(&mut rx, pid).await, Some(0));
        assert!(supervisor.snapshot(pid).is_none());
        assert!(terminator.calls.lock().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_exit_is_error() {
        let (supervisor, _) = mock_supervisor(Vec::new(), settings());
        let mut rx = supervisor.broadcaster().subscribe();

        let pid = supervisor
            .start(StartRequest::new("exit 3", tmp()))
            .await
            .unwrap()
            .process_id;

        let mut statuses = Vec::new();
        let mut annotated = false;
        loop {
            match timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(StatusEvent::ProcessStatus(e))) if e.process_id == pid => statuses.push(e.status),
                Ok(Ok(StatusEvent::ServiceOutput(e))) if e.stream == StreamKind::Error => {
                    annotated = e.data.contains('3');
                }
                Ok(Ok(StatusEvent::ServiceStopped(e))) if e.process_id == pid => {
                    assert_eq!(e.exit_code, Some(3));
                    break;
                }
                Ok(Ok(_)) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(statuses.last(), Some(&ProcessStatus::Error));
        assert!(annotated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_bound_readiness() {
        let mut settings = settings();
        settings.readiness = Readiness::PortBound;
        let (supervisor, _) = mock_supervisor(Vec::new(), settings);
        let mut rx = supervisor.broadcaster().subscribe();

        let pid = supervisor
            .start(StartRequest::new("echo hi; sleep 30", tmp()))
            .await
            .unwrap()
            .process_id;

        // Output alone does not promote; the mock inspector reports no ports.
        sleep(Duration::from_millis(350)).await;
        assert_eq!(supervisor.snapshot(pid).unwrap().status, ProcessStatus::Starting);

        // Bind a port for this pid and the next tick promotes it.
        supervisor
            .resolver()
            .inspector()
            .occupants
            .lock()
            .push(PortOccupant::new(4321, pid, "sh", "*", "sh"));
        loop {
            if next_status(&mut rx, pid).await == ProcessStatus::Running {
                break;
            }
        }
        let snapshot = supervisor.snapshot(pid).unwrap();
        assert!(snapshot.bound_ports.contains(&4321));
        assert!(snapshot.memory_mb > 0.0);

        supervisor.stop(pid).await.unwrap();
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_managed_listener_is_not_a_conflict() {
        let (supervisor, _) = mock_supervisor(Vec::new(), settings());
        let pid = supervisor
            .start(StartRequest::new("sleep 30", tmp()))
            .await
            .unwrap()
            .process_id;

        supervisor
            .resolver()
            .inspector()
            .occupants
            .lock()
            .push(PortOccupant::new(3000, pid, "sh", "*", "sh"));

        let managed = supervisor.managed_pids().await;
        let ports: BTreeSet<u16> = [3000].into_iter().collect();
        assert!(supervisor.resolver().check_conflicts(&ports, &managed).await.is_empty());

        supervisor.shutdown().await;
        assert!(supervisor.list().is_empty());
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
    }

    #[cfg(unix)]
    fn kill_leftover(pid: u32) {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_service_alive() {
        let (supervisor, _) = mock_supervisor(Vec::new(), settings());
        let mut rx = supervisor.broadcaster().subscribe();

        let pid = supervisor
            .start(StartRequest::new(
                "printf 'caf\\351\\n'; sleep 0.3; echo after; sleep 0.3",
                tmp(),
            ))
            .await
            .unwrap()
            .process_id;

        let mut lines = Vec::new();
        let exit_code = loop {
            match timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(StatusEvent::ServiceOutput(e))) if e.process_id == Some(pid) => {
                    lines.push((e.stream, e.data));
                }
                Ok(Ok(StatusEvent::ServiceStopped(e))) if e.process_id == pid => break e.exit_code,
                Ok(Ok(_)) => continue,
                other => panic!("unexpected {:?}", other),
            }
        };

        assert_eq!(exit_code, Some(0));
        assert_eq!(
            lines,
            vec![
                (StreamKind::Stdout, "caf\u{fffd}".to_string()),
                (StreamKind::Stdout, "after".to_string()),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_vanished_process_is_stopped() {
        let (supervisor, _) = mock_supervisor(Vec::new(), settings());
        let mut rx = supervisor.broadcaster().subscribe();

        let pid = supervisor
            .start(StartRequest::new("sleep 30", tmp()))
            .await
            .unwrap()
            .process_id;
        assert_eq!(next_status(&mut rx, pid).await, ProcessStatus::Starting);

        // The table loses the process while its waiter has seen no exit.
        supervisor.table().dead.lock().insert(pid);

        let mut statuses = Vec::new();
        let exit_code = loop {
            match timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(StatusEvent::ProcessStatus(e))) if e.process_id == pid => statuses.push(e.status),
                Ok(Ok(StatusEvent::ServiceStopped(e))) if e.process_id == pid => break e.exit_code,
                Ok(Ok(_)) => continue,
                other => panic!("unexpected {:?}", other),
            }
        };

        assert_eq!(exit_code, None);
        assert_eq!(statuses.last(), Some(&ProcessStatus::Stopped));
        assert!(supervisor.snapshot(pid).is_none());
        kill_leftover(pid);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stuck_sample_does_not_starve_other_entries() {
        let mut settings = settings();
        settings.query_timeout = Duration::from_millis(200);
        let (supervisor, _) = mock_supervisor(Vec::new(), settings);
        let mut rx = supervisor.broadcaster().subscribe();

        let stuck = supervisor
            .start(StartRequest::new("sleep 30", tmp()))
            .await
            .unwrap()
            .process_id;
        supervisor.table().stuck.lock().insert(stuck);
        let healthy = supervisor
            .start(StartRequest::new("sleep 30", tmp()))
            .await
            .unwrap()
            .process_id;

        // The announcement, then at least three sampled ticks.
        for _ in 0..4 {
            assert_eq!(next_status(&mut rx, healthy).await, ProcessStatus::Starting);
        }

        let healthy_snapshot = supervisor.snapshot(healthy).unwrap();
        assert!(healthy_snapshot.memory_mb > 0.0);
        let stuck_snapshot = supervisor.snapshot(stuck).unwrap();
        assert_eq!(stuck_snapshot.status, ProcessStatus::Starting);
        assert_eq!(stuck_snapshot.memory_mb, 0.0);

        supervisor.shutdown().await;
        kill_leftover(stuck);
        kill_leftover(healthy);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zero_interval_monitor_still_ticks() {
        let settings = SupervisorSettings {
            monitor_interval: Duration::ZERO,
            ..SupervisorSettings::default()
        };
        let (supervisor, _) = mock_supervisor(Vec::new(), settings);
        let mut rx = supervisor.broadcaster().subscribe();

        let pid = supervisor
            .start(StartRequest::new("sleep 30", tmp()))
            .await
            .unwrap()
            .process_id;

        assert_eq!(next_status(&mut rx, pid).await, ProcessStatus::Starting);
        assert_eq!(next_status(&mut rx, pid).await, ProcessStatus::Starting);

        supervisor.shutdown().await;
        kill_leftover(pid);
    }
}
