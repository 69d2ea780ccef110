//! ServiceDeck Core Library
//!
//! Process lifecycle and port-conflict engine for developer services.
//! Provides functionality to:
//! - Launch shell commands and supervise them through a status state machine
//! - Detect listeners on the ports a service is about to bind
//! - Terminate conflicting processes without touching critical OS processes
//! - Stream status, output and conflict events to a UI layer
//!
//! # Architecture
//! This library follows hexagonal architecture (ports & adapters):
//! - `domain`: Pure business logic and data models
//! - `ports`: Trait definitions (interfaces)
//! - `adapters`: External system implementations
//! - `application`: Use case services
//! - `engine`: The [`ServiceDeck`] facade wiring everything together
//!
//! # Platform Support
//! - macOS: Uses `lsof` and `ps` commands
//! - Linux: Uses `ss` and `ps` commands
//! - Windows: Uses `netstat`, `tasklist` and `taskkill`

// Hexagonal architecture layers
pub mod adapters;
pub mod application;
pub mod domain;
pub mod ports;

pub mod config;
pub mod engine;
pub mod error;

// Re-export domain types (primary API)
pub use domain::{
    PortConflict, PortOccupant, PortPolicy, PortResolution, ProcessSnapshot, ProcessStatus,
    Project, ResolveReport, StreamKind,
};

// Re-export other commonly used types
pub use application::{StartRequest, StatusEvent};
pub use config::{Config, ConfigStore, Readiness};
pub use engine::{
    ErrorPayload, KillResponse, PortProcess, PortUsage, ProcessDetails, ServiceDeck,
    StartedService,
};
pub use error::{Error, Result};
