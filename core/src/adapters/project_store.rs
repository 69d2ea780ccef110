//! In-memory project store.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::Project;
use crate::error::{Error, Result};
use crate::ports::ProjectStore;

/// Project store held in memory, typically seeded from the config file.
#[derive(Clone, Default)]
pub struct InMemoryProjectStore {
    projects: Arc<RwLock<BTreeMap<String, Project>>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from existing records. Records without an id get one.
    pub fn seeded(projects: impl IntoIterator<Item = Project>) -> Self {
        let projects = projects
            .into_iter()
            .map(|mut p| {
                if p.id.is_empty() {
                    p.id = Uuid::new_v4().to_string();
                }
                (p.id.clone(), p)
            })
            .collect();
        Self {
            projects: Arc::new(RwLock::new(projects)),
        }
    }
}

fn validate(project: &Project) -> Result<()> {
    if project.name.trim().is_empty() {
        return Err(Error::InvalidInput("project name is empty".to_string()));
    }
    if project.start_command.trim().is_empty() {
        return Err(Error::InvalidInput(format!(
            "project '{}' has no start command",
            project.name
        )));
    }
    Ok(())
}

impl ProjectStore for InMemoryProjectStore {
    async fn get(&self, id: &str) -> Result<Project> {
        self.projects
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Project>> {
        Ok(self.projects.read().values().cloned().collect())
    }

    async fn create(&self, mut project: Project) -> Result<Project> {
        validate(&project)?;
        if project.id.is_empty() {
            project.id = Uuid::new_v4().to_string();
        }

        let mut projects = self.projects.write();
        if projects.contains_key(&project.id) {
            return Err(Error::InvalidInput(format!(
                "project id '{}' already exists",
                project.id
            )));
        }
        projects.insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn update(&self, project: Project) -> Result<Project> {
        validate(&project)?;
        let mut projects = self.projects.write();
        match projects.get_mut(&project.id) {
            Some(existing) => {
                *existing = project.clone();
                Ok(project)
            }
            None => Err(Error::ProjectNotFound(project.id)),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.projects
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))
    }
}
