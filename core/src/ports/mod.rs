//! Ports layer - Trait definitions (interfaces).
//!
//! This module defines the interfaces that the application layer uses
//! to interact with external systems. Implementations live in `adapters`.

mod inspector;
mod process_table;
mod project_store;
mod terminator;

pub use inspector::PortInspectorPort;
pub use process_table::ProcessTablePort;
pub use project_store::ProjectStore;
pub use terminator::{ProcessTerminatorPort, TerminateOptions, TerminationOutcome};
