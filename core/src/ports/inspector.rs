//! Port inspector port (interface).

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;

use crate::domain::PortOccupant;
use crate::error::Result;

/// Port for querying which processes are bound to which TCP ports.
///
/// Implementations handle platform-specific details (ss, lsof, netstat).
/// A failed lookup for one port never aborts lookups for other ports; it
/// degrades to "no occupant" and is logged.
pub trait PortInspectorPort: Send + Sync {
    /// The process listening on `port`, if any.
    fn find_occupant(&self, port: u16) -> impl Future<Output = Option<PortOccupant>> + Send;

    /// Every listener for each requested port. Ports without listeners map
    /// to an empty list.
    fn list_occupants(
        &self,
        ports: &BTreeSet<u16>,
    ) -> impl Future<Output = BTreeMap<u16, Vec<PortOccupant>>> + Send;

    /// All ports currently bound by any of `pids`.
    fn bound_ports(&self, pids: &HashSet<u32>) -> impl Future<Output = Result<BTreeSet<u16>>> + Send;

    /// Every listening TCP socket on the machine.
    fn listening(&self) -> impl Future<Output = Result<Vec<PortOccupant>>> + Send;

    /// All ports currently bound by a single process.
    fn bound_ports_of(&self, pid: u32) -> impl Future<Output = Result<BTreeSet<u16>>> + Send {
        async move { self.bound_ports(&HashSet::from([pid])).await }
    }
}
