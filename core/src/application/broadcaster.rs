//! Typed event channel towards the presentation layer.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::domain::{PortConflict, ProcessSnapshot, ProcessStatus, StreamKind};

/// Default number of events buffered per subscriber before the oldest are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// `process-status`: a managed process changed state or was re-sampled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatusEvent {
    pub process_id: u32,
    pub instance_id: Uuid,
    pub status: ProcessStatus,
    pub memory: f64,
    pub cpu: f32,
    pub ports: BTreeSet<u16>,
    pub start_time: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl From<&ProcessSnapshot> for ProcessStatusEvent {
    fn from(snapshot: &ProcessSnapshot) -> Self {
        Self {
            process_id: snapshot.process_id,
            instance_id: snapshot.instance_id,
            status: snapshot.status,
            memory: snapshot.memory_mb,
            cpu: snapshot.cpu_percent,
            ports: snapshot.bound_ports.clone(),
            start_time: snapshot.start_time,
            timestamp: Utc::now(),
        }
    }
}

/// `service-output`: one line of output, or a supervisor annotation.
///
/// `process_id` is absent only for annotations about a service that never
/// got a pid, such as a failed spawn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOutputEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(rename = "type")]
    pub stream: StreamKind,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

/// `service-stopped`: the instance left the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStoppedEvent {
    pub process_id: u32,
    pub instance_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// `port-conflict`: a start was refused because ports are occupied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConflictEvent {
    pub command: String,
    pub conflicts: Vec<PortConflict>,
}

/// Events delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum StatusEvent {
    ProcessStatus(ProcessStatusEvent),
    ServiceOutput(ServiceOutputEvent),
    ServiceStopped(ServiceStoppedEvent),
    PortConflict(PortConflictEvent),
}

impl StatusEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StatusEvent::ProcessStatus(_) => "process-status",
            StatusEvent::ServiceOutput(_) => "service-output",
            StatusEvent::ServiceStopped(_) => "service-stopped",
            StatusEvent::PortConflict(_) => "port-conflict",
        }
    }

    /// The process the event concerns, if any.
    pub fn process_id(&self) -> Option<u32> {
        match self {
            StatusEvent::ProcessStatus(e) => Some(e.process_id),
            StatusEvent::ServiceOutput(e) => e.process_id,
            StatusEvent::ServiceStopped(e) => Some(e.process_id),
            StatusEvent::PortConflict(_) => None,
        }
    }
}

/// Fire-and-forget fan-out of [`StatusEvent`]s.
///
/// Events emitted while nobody is subscribed are dropped. Slow subscribers
/// lose the oldest events (`RecvError::Lagged`) rather than blocking emitters.
#[derive(Clone)]
pub struct StatusBroadcaster {
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, event: StatusEvent) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            trace!(kind, "No listeners, event dropped");
        }
    }

    pub fn emit_status(&self, snapshot: &ProcessSnapshot) {
        self.emit(StatusEvent::ProcessStatus(snapshot.into()));
    }

    pub fn emit_output(&self, process_id: u32, stream: StreamKind, data: impl Into<String>) {
        self.emit(StatusEvent::ServiceOutput(ServiceOutputEvent {
            process_id: Some(process_id),
            stream,
            data: data.into(),
            timestamp: Utc::now(),
        }));
    }

    /// Error annotation for a service that could not be spawned.
    pub fn emit_spawn_failure(&self, command: &str, reason: &str) {
        self.emit(StatusEvent::ServiceOutput(ServiceOutputEvent {
            process_id: None,
            stream: StreamKind::Error,
            data: format!("Failed to start '{}': {}", command, reason),
            timestamp: Utc::now(),
        }));
    }

    pub fn emit_stopped(&self, process_id: u32, instance_id: Uuid, exit_code: Option<i32>) {
        self.emit(StatusEvent::ServiceStopped(ServiceStoppedEvent {
            process_id,
            instance_id,
            exit_code,
        }));
    }

    pub fn emit_conflicts(&self, command: &str, conflicts: &[PortConflict]) {
        self.emit(StatusEvent::PortConflict(PortConflictEvent {
            command: command.to_string(),
            conflicts: conflicts.to_vec(),
        }));
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
