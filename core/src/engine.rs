//! ServiceDeck engine - boundary facade over the supervisor.
//!
//! Wires the OS adapters to the application services from a [`Config`] and
//! exposes the request/response operations a UI layer calls. Every response
//! type serializes to the camelCase payloads the UI expects; failures convert
//! to [`ErrorPayload`].

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{InMemoryProjectStore, PortInspector, ProcessTable, ProcessTerminator};
use crate::application::{
    shell_command, ConflictResolver, ServiceSupervisor, StartRequest, StatusBroadcaster,
    StatusEvent,
};
use crate::config::Config;
use crate::domain::{
    PortConflict, PortOccupant, PortResolution, ProcessSnapshot, ProcessStatus, Project,
};
use crate::error::{Error, Result};
use crate::ports::{PortInspectorPort, ProcessTablePort, ProjectStore};

type Terminator = ProcessTerminator<ProcessTable>;
type Supervisor = ServiceSupervisor<PortInspector, Terminator, ProcessTable>;

// ============================================================================
// Boundary payloads
// ============================================================================

/// Response to a successful start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedService {
    pub process_id: u32,
    pub instance_id: Uuid,
}

impl From<&ProcessSnapshot> for StartedService {
    fn from(snapshot: &ProcessSnapshot) -> Self {
        Self {
            process_id: snapshot.process_id,
            instance_id: snapshot.instance_id,
        }
    }
}

/// Detailed view of one managed process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDetails {
    pub running: bool,
    pub pid: u32,
    pub instance_id: Uuid,
    pub status: ProcessStatus,
    pub memory: f64,
    pub cpu: f32,
    pub ports: BTreeSet<u16>,
    pub start_time: DateTime<Utc>,
    pub command: String,
    pub working_directory: PathBuf,
    /// Live descendant pids, deepest first.
    pub children: Vec<u32>,
}

/// A process listening on a checked port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortProcess {
    pub pid: u32,
    pub name: String,
    pub command: String,
}

/// Every listener found on one checked port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortUsage {
    pub port: u16,
    pub processes: Vec<PortProcess>,
}

/// Result of `kill_port_processes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-port outcome.
    pub results: Vec<PortResolution>,
}

/// Structured failure handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<PortConflict>>,
}

impl From<&Error> for ErrorPayload {
    fn from(error: &Error) -> Self {
        let (message, conflicts) = match error {
            Error::PortConflict(conflicts) => ("PORT_CONFLICT".to_string(), Some(conflicts.clone())),
            Error::ProcessNotFound(_) => ("Process not found".to_string(), None),
            other => (other.to_string(), None),
        };
        Self {
            error: message,
            code: error.code(),
            conflicts,
        }
    }
}

// ============================================================================
// ServiceDeck
// ============================================================================

/// The process lifecycle and port-conflict engine.
///
/// All operations are async and safe to call concurrently; the underlying
/// registry is shared by clones of the supervisor.
pub struct ServiceDeck<S = InMemoryProjectStore> {
    supervisor: Supervisor,
    projects: S,
    graceful_timeout: Duration,
    /// Instances launched through `start_project`, keyed by project id.
    launched: Mutex<HashMap<String, (u32, Uuid)>>,
}

impl ServiceDeck<InMemoryProjectStore> {
    /// Create an engine whose project store is seeded from `config.projects`.
    pub fn new(config: &Config) -> Result<Self> {
        let store = InMemoryProjectStore::seeded(config.projects.iter().cloned());
        Self::with_store(config, store)
    }
}

impl<S: ProjectStore> ServiceDeck<S> {
    /// Create an engine over a caller-provided project store.
    pub fn with_store(config: &Config, projects: S) -> Result<Self> {
        config.validate()?;

        let table = ProcessTable::new();
        let inspector = PortInspector::with_timeout(config.query_timeout());
        let terminator = ProcessTerminator::new(table.clone(), config.critical_set())
            .with_timeouts(config.graceful_timeout(), config.verify_timeout());
        let resolver = ConflictResolver::new(inspector, terminator)
            .with_verify_timeout(config.verify_timeout());
        let broadcaster = StatusBroadcaster::new(config.event_capacity);

        debug!(
            monitor_interval_ms = config.monitor_interval_ms,
            projects = config.projects.len(),
            "Engine created"
        );

        Ok(Self {
            supervisor: ServiceSupervisor::new(
                resolver,
                table,
                broadcaster,
                config.supervisor_settings(),
            ),
            projects,
            graceful_timeout: config.graceful_timeout(),
            launched: Mutex::new(HashMap::new()),
        })
    }

    pub fn projects(&self) -> &S {
        &self.projects
    }

    /// Attach a listener. Events emitted before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.supervisor.broadcaster().subscribe()
    }

    // MARK: - Services

    /// Start `command` in `working_directory` after a conflict check.
    pub async fn start_service(
        &self,
        command: &str,
        working_directory: impl Into<PathBuf>,
    ) -> Result<StartedService> {
        self.start(StartRequest::new(command, working_directory)).await
    }

    /// Start with explicit ports and environment.
    pub async fn start(&self, request: StartRequest) -> Result<StartedService> {
        let snapshot = self.supervisor.start(request).await?;
        Ok(StartedService::from(&snapshot))
    }

    /// Stop a managed service. Unknown pids count as already stopped.
    pub async fn stop_service(&self, pid: u32) -> Result<()> {
        if pid == 0 {
            return Err(Error::InvalidInput("Invalid PID".to_string()));
        }
        self.supervisor.stop(pid).await
    }

    /// Remove an entry left in `error` after a failed stop.
    pub fn purge(&self, pid: u32) -> Result<()> {
        self.supervisor.purge(pid)
    }

    /// Snapshots of every managed process, oldest first.
    pub fn list_processes(&self) -> Vec<ProcessSnapshot> {
        self.supervisor.list()
    }

    pub async fn get_process_details(&self, pid: u32) -> Result<ProcessDetails> {
        if pid == 0 {
            return Err(Error::InvalidInput("Invalid PID".to_string()));
        }
        let snapshot = self
            .supervisor
            .snapshot(pid)
            .ok_or(Error::ProcessNotFound(pid))?;

        let table = self.supervisor.table();
        let running = snapshot.is_active() && table.is_alive(pid).await;
        let children = if running {
            table.descendants(pid).await
        } else {
            Vec::new()
        };

        Ok(ProcessDetails {
            running,
            pid,
            instance_id: snapshot.instance_id,
            status: snapshot.status,
            memory: snapshot.memory_mb,
            cpu: snapshot.cpu_percent,
            ports: snapshot.bound_ports,
            start_time: snapshot.start_time,
            command: snapshot.command,
            working_directory: snapshot.working_directory,
            children,
        })
    }

    // MARK: - Projects

    /// Launch a project through the same conflict-checked path as `start_service`.
    pub async fn start_project(&self, id: &str) -> Result<StartedService> {
        let project = self.projects.get(id).await?;
        let request = StartRequest::new(project.start_command.clone(), project.working_directory.clone())
            .with_ports(project.ports.iter().copied())
            .with_env(project.environment.clone());

        let started = self.start(request).await?;
        self.launched
            .lock()
            .insert(project.id.clone(), (started.process_id, started.instance_id));
        info!(project = %project.name, pid = started.process_id, "Project started");
        Ok(started)
    }

    /// Run the project's stop command, if any, then stop its running instance.
    pub async fn stop_project(&self, id: &str) -> Result<()> {
        let project = self.projects.get(id).await?;

        if let Some(stop_command) = project.stop_command.as_deref() {
            self.run_stop_command(&project, stop_command).await;
        }

        let launched = self.launched.lock().remove(&project.id);
        let Some((pid, instance_id)) = launched else {
            debug!(project = %project.name, "Project has no running instance");
            return Ok(());
        };

        // The pid may have been reused by a later instance.
        match self.supervisor.snapshot(pid) {
            Some(snapshot) if snapshot.instance_id == instance_id => self.stop_service(pid).await,
            _ => Ok(()),
        }
    }

    async fn run_stop_command(&self, project: &Project, stop_command: &str) {
        let mut command = shell_command(stop_command);
        command
            .current_dir(&project.working_directory)
            .envs(&self.supervisor.settings().environment)
            .envs(&project.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match timeout(self.graceful_timeout, command.status()).await {
            Ok(Ok(status)) if status.success() => {
                debug!(project = %project.name, "Stop command finished")
            }
            Ok(Ok(status)) => {
                warn!(project = %project.name, code = ?status.code(), "Stop command failed")
            }
            Ok(Err(e)) => warn!(project = %project.name, error = %e, "Stop command could not run"),
            Err(_) => warn!(project = %project.name, "Stop command timed out"),
        }
    }

    // MARK: - Ports

    /// Report every listener on each of `ports`. Free ports are omitted.
    pub async fn check_port_conflicts(&self, ports: &[u16]) -> Result<Vec<PortUsage>> {
        if ports.contains(&0) {
            return Err(Error::InvalidInput("port 0 cannot be checked".to_string()));
        }
        let ports: BTreeSet<u16> = ports.iter().copied().collect();

        Ok(self
            .supervisor
            .resolver()
            .occupants(&ports)
            .await
            .into_iter()
            .filter(|(_, occupants)| !occupants.is_empty())
            .map(|(port, occupants)| PortUsage {
                port,
                processes: occupants
                    .into_iter()
                    .map(|o| PortProcess {
                        pid: o.pid,
                        name: o.process_name,
                        command: o.command,
                    })
                    .collect(),
            })
            .collect())
    }

    /// Terminate the given occupants and verify their ports are released.
    pub async fn kill_port_processes(&self, conflicts: &[PortConflict]) -> KillResponse {
        if conflicts.is_empty() {
            return KillResponse {
                success: true,
                error: None,
                results: Vec::new(),
            };
        }

        let report = self.supervisor.resolver().resolve_conflicts(conflicts).await;
        let error = (!report.all_resolved).then(|| {
            let failed: Vec<String> = report
                .results
                .iter()
                .filter_map(|r| r.error.as_deref().map(|e| format!("{}: {}", r.port, e)))
                .collect();
            format!("Some ports are still in use ({})", failed.join("; "))
        });

        KillResponse {
            success: report.all_resolved,
            error,
            results: report.results,
        }
    }

    /// Sorted, distinct listening ports system-wide.
    pub async fn get_active_ports(&self) -> Result<Vec<u16>> {
        let ports: BTreeSet<u16> = self
            .get_active_listeners()
            .await?
            .into_iter()
            .map(|o| o.port)
            .collect();
        Ok(ports.into_iter().collect())
    }

    /// Every listening socket with its owning process.
    pub async fn get_active_listeners(&self) -> Result<Vec<PortOccupant>> {
        self.supervisor.resolver().inspector().listening().await
    }

    // MARK: - Lifecycle

    /// Stop every managed service and the monitoring task.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        self.launched.lock().clear();
    }
}
