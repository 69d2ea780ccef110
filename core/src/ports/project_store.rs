//! Project store port (interface).

use std::future::Future;

use crate::domain::Project;
use crate::error::Result;

/// Port for the external store of project definitions.
///
/// Identifiers are opaque; the store assigns them on `create`.
pub trait ProjectStore: Send + Sync {
    fn get(&self, id: &str) -> impl Future<Output = Result<Project>> + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<Project>>> + Send;

    fn create(&self, project: Project) -> impl Future<Output = Result<Project>> + Send;

    fn update(&self, project: Project) -> impl Future<Output = Result<Project>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<()>> + Send;
}
