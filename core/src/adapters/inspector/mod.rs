//! Port inspector adapters.
//!
//! Platform-specific implementations of listening-socket enumeration behind
//! the single [`PortInspectorPort`] interface.

#[cfg(target_os = "macos")]
mod darwin;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "windows")]
mod windows;

mod utils;

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
compile_error!("Unsupported platform: only macOS, Linux and Windows are supported");

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::domain::PortOccupant;
use crate::error::{Error, Result};
use crate::ports::PortInspectorPort;

/// Default bound for a single OS query.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

#[cfg(target_os = "macos")]
type PlatformScanner = darwin::DarwinScanner;

#[cfg(target_os = "linux")]
type PlatformScanner = linux::LinuxScanner;

#[cfg(target_os = "windows")]
type PlatformScanner = windows::WindowsScanner;

/// The main port inspector that uses platform-specific implementations.
#[derive(Clone)]
pub struct PortInspector {
    inner: Arc<PlatformScanner>,
    query_timeout: Duration,
}

impl PortInspector {
    /// Create a new port inspector for the current platform.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_QUERY_TIMEOUT)
    }

    /// Create an inspector whose individual OS queries give up after `query_timeout`.
    pub fn with_timeout(query_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PlatformScanner::new()),
            query_timeout,
        }
    }

    async fn scan_all(&self) -> Result<Vec<PortOccupant>> {
        match timeout(self.query_timeout, self.inner.scan()).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransientQuery(format!(
                "port table scan timed out after {:?}",
                self.query_timeout
            ))),
        }
    }
}

impl Default for PortInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl PortInspectorPort for PortInspector {
    async fn find_occupant(&self, port: u16) -> Option<PortOccupant> {
        query_port(self.inner.as_ref(), port, self.query_timeout)
            .await
            .into_iter()
            .next()
    }

    async fn list_occupants(&self, ports: &BTreeSet<u16>) -> BTreeMap<u16, Vec<PortOccupant>> {
        query_ports(&self.inner, ports, self.query_timeout).await
    }

    async fn bound_ports(&self, pids: &HashSet<u32>) -> Result<BTreeSet<u16>> {
        if pids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let listeners = self.scan_all().await?;
        Ok(listeners
            .into_iter()
            .filter(|o| pids.contains(&o.pid))
            .map(|o| o.port)
            .collect())
    }

    async fn listening(&self) -> Result<Vec<PortOccupant>> {
        self.scan_all().await
    }
}

/// Look up one port, degrading any failure to "no occupant".
async fn query_port<S: Scanner>(scanner: &S, port: u16, limit: Duration) -> Vec<PortOccupant> {
    match timeout(limit, scanner.scan_port(port)).await {
        Ok(Ok(occupants)) => occupants,
        Ok(Err(e)) => {
            warn!(port, error = %e, "Port query failed, treating port as free");
            Vec::new()
        }
        Err(_) => {
            warn!(port, timeout_ms = limit.as_millis() as u64, "Port query timed out");
            Vec::new()
        }
    }
}

/// Query every port in its own task so a slow port cannot stall the others.
async fn query_ports<S: Scanner + 'static>(
    scanner: &Arc<S>,
    ports: &BTreeSet<u16>,
    limit: Duration,
) -> BTreeMap<u16, Vec<PortOccupant>> {
    let mut result: BTreeMap<u16, Vec<PortOccupant>> =
        ports.iter().map(|p| (*p, Vec::new())).collect();

    let mut tasks = JoinSet::new();
    for &port in ports {
        let scanner = Arc::clone(scanner);
        tasks.spawn(async move { (port, query_port(scanner.as_ref(), port, limit).await) });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((port, occupants)) => {
                debug!(port, count = occupants.len(), "Port query finished");
                result.insert(port, occupants);
            }
            Err(e) => warn!(error = %e, "Port query task failed"),
        }
    }

    result
}

/// Internal trait for platform-specific implementations.
trait Scanner: Send + Sync {
    /// Scan all listening TCP sockets.
    fn scan(&self) -> impl Future<Output = Result<Vec<PortOccupant>>> + Send;

    /// Listening sockets bound to a single port.
    fn scan_port(&self, port: u16) -> impl Future<Output = Result<Vec<PortOccupant>>> + Send;
}
