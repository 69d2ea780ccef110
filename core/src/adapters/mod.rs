//! Adapters layer - External system implementations.
//!
//! This module contains implementations of the port traits defined in `ports`.
//! Each adapter talks to the operating system or holds external state.

pub mod inspector;
pub mod process_table;
pub mod project_store;
pub mod terminator;

// Re-export main types for convenience
pub use inspector::PortInspector;
pub use process_table::ProcessTable;
pub use project_store::InMemoryProjectStore;
pub use terminator::ProcessTerminator;
