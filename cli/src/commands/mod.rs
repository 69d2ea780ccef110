//! Subcommand implementations.

pub mod config;
pub mod ports;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use servicedeck_core::{Config, ConfigStore, ServiceDeck};

/// Global options shared by every subcommand.
pub struct Context {
    pub json: bool,
    store: ConfigStore,
}

impl Context {
    pub fn new(json: bool, config_path: Option<PathBuf>) -> Result<Self> {
        let store = match config_path {
            Some(path) => ConfigStore::with_path(path),
            None => ConfigStore::new().context("Failed to locate configuration")?,
        };
        Ok(Self { json, store })
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub async fn config(&self) -> Result<Config> {
        self.store
            .load()
            .await
            .with_context(|| format!("Failed to load {}", self.store.path().display()))
    }

    pub async fn deck(&self) -> Result<ServiceDeck> {
        let config = self.config().await?;
        ServiceDeck::new(&config).context("Failed to initialize engine")
    }

    /// Print `value` as pretty JSON on stdout.
    pub fn print_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

/// Shorten `s` to at most `max` characters.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}
