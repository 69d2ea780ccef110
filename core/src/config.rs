//! Configuration management for supervision timings, port policy and projects.
//!
//! Stores configuration in JSON format at `~/.servicedeck/config.json`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::domain::{CriticalProcessSet, PortPolicy, Project};
use crate::error::{Error, Result};

/// When a starting service is considered running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Readiness {
    /// The first line on stdout.
    #[default]
    FirstOutput,
    /// The first monitoring tick that sees a bound port.
    PortBound,
}

/// Configuration data stored in JSON format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Interval between monitoring ticks in milliseconds.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,

    /// Time a process gets to exit after SIGTERM before it is killed.
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout_ms: u64,

    /// Time to wait for a killed process or freed port to disappear.
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_ms: u64,

    /// Upper bound for a single port or process table query.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    #[serde(default)]
    pub readiness: Readiness,

    #[serde(default)]
    pub port_policy: PortPolicy,

    /// Ports checked when a command has neither declared nor detectable ports.
    #[serde(default)]
    pub fallback_ports: Vec<u16>,

    /// Process names protected in addition to the built-in set.
    #[serde(default)]
    pub critical_processes: Vec<String>,

    /// Events buffered per listener.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Environment added to every spawned service.
    #[serde(default = "default_environment")]
    pub environment: HashMap<String, String>,

    /// Project definitions made available to `project` launches.
    #[serde(default)]
    pub projects: Vec<Project>,
}

fn default_monitor_interval() -> u64 {
    1000
}

fn default_graceful_timeout() -> u64 {
    2000
}

fn default_verify_timeout() -> u64 {
    2000
}

fn default_query_timeout() -> u64 {
    3000
}

fn default_event_capacity() -> usize {
    256
}

fn default_environment() -> HashMap<String, String> {
    HashMap::from([("FORCE_COLOR".to_string(), "1".to_string())])
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval(),
            graceful_timeout_ms: default_graceful_timeout(),
            verify_timeout_ms: default_verify_timeout(),
            query_timeout_ms: default_query_timeout(),
            readiness: Readiness::default(),
            port_policy: PortPolicy::default(),
            fallback_ports: Vec::new(),
            critical_processes: Vec::new(),
            event_capacity: default_event_capacity(),
            environment: default_environment(),
            projects: Vec::new(),
        }
    }
}

impl Config {
    /// Reject values that would stall or spin the supervisor.
    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval_ms == 0 {
            return Err(Error::Config("monitorIntervalMs must be positive".to_string()));
        }
        if self.query_timeout_ms == 0 {
            return Err(Error::Config("queryTimeoutMs must be positive".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("eventCapacity must be positive".to_string()));
        }
        if self.fallback_ports.contains(&0) {
            return Err(Error::Config("fallbackPorts cannot contain 0".to_string()));
        }
        Ok(())
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Built-in critical names plus `criticalProcesses`.
    pub fn critical_set(&self) -> CriticalProcessSet {
        CriticalProcessSet::with_extra(&self.critical_processes)
    }

    /// Runtime view consumed by the supervisor.
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            query_timeout: self.query_timeout(),
            readiness: self.readiness,
            port_policy: self.port_policy,
            fallback_ports: self.fallback_ports.clone(),
            environment: self.environment.clone(),
        }
    }
}

/// Supervisor settings with resolved durations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub monitor_interval: Duration,
    /// Bound for one process's sampling within a tick.
    pub query_timeout: Duration,
    pub readiness: Readiness,
    pub port_policy: PortPolicy,
    pub fallback_ports: Vec<u16>,
    pub environment: HashMap<String, String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Config::default().supervisor_settings()
    }
}

/// Configuration store for reading and writing `config.json`.
pub struct ConfigStore {
    /// Path to the configuration file.
    config_path: PathBuf,
}

impl ConfigStore {
    /// Create a new config store with the default path.
    ///
    /// Default path: `~/.servicedeck/config.json`
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

        Ok(Self {
            config_path: home.join(".servicedeck").join("config.json"),
        })
    }

    /// Create a config store with a custom path (for testing).
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Load configuration from disk.
    ///
    /// Returns default config if the file doesn't exist.
    pub async fn load(&self) -> Result<Config> {
        if !fs::try_exists(&self.config_path).await.unwrap_or(false) {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    ///
    /// Creates the config directory if it doesn't exist.
    pub async fn save(&self, config: &Config) -> Result<()> {
        config.validate()?;

        if let Some(config_dir) = self.config_path.parent() {
            fs::create_dir_all(config_dir)
                .await
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        // Write atomically by writing to temp file then renaming
        let temp_path = self.config_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to create temp config file: {}", e)))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        file.sync_all()
            .await
            .map_err(|e| Error::Config(format!("Failed to sync config: {}", e)))?;

        fs::rename(&temp_path, &self.config_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to rename config file: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (ConfigStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        (ConfigStore::with_path(path), dir)
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _dir) = test_store();
        let config = store.load().await.unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.environment["FORCE_COLOR"], "1");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _dir) = test_store();

        let config = Config {
            readiness: Readiness::PortBound,
            port_policy: PortPolicy::Merge,
            fallback_ports: vec![3000, 8080],
            critical_processes: vec!["postgres".to_string()],
            projects: vec![Project::new("web", "/srv/web", "npm start").with_ports([3000])],
            ..Config::default()
        };

        store.save(&config).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, config);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let (store, _dir) = test_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"monitorIntervalMs": 250, "readiness": "portBound"}"#,
        )
        .unwrap();

        let config = store.load().await.unwrap();
        assert_eq!(config.monitor_interval_ms, 250);
        assert_eq!(config.readiness, Readiness::PortBound);
        assert_eq!(config.graceful_timeout_ms, 2000);
        assert_eq!(config.port_policy, PortPolicy::DeclaredFirst);
    }

    #[tokio::test]
    async fn test_invalid_values_rejected() {
        let (store, _dir) = test_store();
        let config = Config {
            monitor_interval_ms: 0,
            ..Config::default()
        };
        let err = store.save(&config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_supervisor_settings() {
        let settings = Config::default().supervisor_settings();
        assert_eq!(settings.monitor_interval, Duration::from_secs(1));
        assert_eq!(settings.query_timeout, Duration::from_secs(3));
        assert_eq!(settings.readiness, Readiness::FirstOutput);
        assert!(settings.fallback_ports.is_empty());
    }

    #[test]
    fn test_critical_set_includes_extra_names() {
        let config = Config {
            critical_processes: vec!["postgres".to_string()],
            ..Config::default()
        };
        let critical = config.critical_set();
        assert!(critical.is_critical("postgres"));
        assert!(critical.is_critical("sshd"));
        assert!(!Config::default().critical_set().is_critical("postgres"));
    }
}
