//! Application layer - Use case services.
//!
//! This module contains application services that orchestrate
//! domain logic and adapter interactions.
//!
//! Services are thin orchestrators that:
//! - Accept domain types as inputs
//! - Use ports (traits) for external dependencies
//! - Return domain types or snapshots as outputs

pub mod broadcaster;
mod conflict_resolver;
mod supervisor;

pub use broadcaster::{
    PortConflictEvent, ProcessStatusEvent, ServiceOutputEvent, ServiceStoppedEvent,
    StatusBroadcaster, StatusEvent,
};
pub use conflict_resolver::ConflictResolver;
pub use supervisor::{ServiceSupervisor, StartRequest};

pub(crate) use supervisor::shell_command;
