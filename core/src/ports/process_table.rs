//! Process table port (interface).

use std::future::Future;

use crate::domain::ResourceSample;

/// Port for reading the operating system process table.
pub trait ProcessTablePort: Send + Sync {
    /// Whether `pid` refers to a live (non-zombie) process.
    fn is_alive(&self, pid: u32) -> impl Future<Output = bool> + Send;

    /// Short name of the process, or `None` when it does not exist.
    fn process_name(&self, pid: u32) -> impl Future<Output = Option<String>> + Send;

    /// All live descendants of `pid`, deepest first.
    fn descendants(&self, pid: u32) -> impl Future<Output = Vec<u32>> + Send;

    /// Current memory and CPU usage, or `None` when the process is gone.
    fn sample(&self, pid: u32) -> impl Future<Output = Option<ResourceSample>> + Send;
}
