//! Domain layer - Pure business logic and data models.
//!
//! This module contains domain entities that represent core business concepts.
//! These types have no I/O dependencies and can be tested in isolation.

mod conflict;
mod critical;
mod port_hints;
mod process;
mod project;

// Re-export all domain types
pub use conflict::{PortConflict, PortOccupant, PortResolution, ResolveReport};
pub use critical::CriticalProcessSet;
pub use port_hints::{candidate_ports, extract_ports, PortPolicy};
pub use process::{ProcessSnapshot, ProcessStatus, ResourceSample, StreamKind};
pub use project::Project;
