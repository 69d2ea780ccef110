//! Project record consumed from the external project store.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A developer service definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Opaque identifier assigned by the store.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub working_directory: PathBuf,
    pub start_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_command: Option<String>,
    /// Ports the service is declared to listen on.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Extra environment variables for the service.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl Project {
    /// Create a project with a fresh identifier.
    pub fn new(
        name: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        start_command: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            working_directory: working_directory.into(),
            start_command: start_command.into(),
            stop_command: None,
            ports: Vec::new(),
            environment: HashMap::new(),
        }
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_stop_command(mut self, command: impl Into<String>) -> Self {
        self.stop_command = Some(command.into());
        self
    }
}

impl std::fmt::Display for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.start_command)
    }
}
