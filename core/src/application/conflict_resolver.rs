//! Port conflict detection and resolution.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::domain::{PortConflict, PortOccupant, PortResolution, ResolveReport};
use crate::ports::{PortInspectorPort, ProcessTerminatorPort, TerminateOptions};

/// Default time to wait for a freed port to show up as unbound.
pub const DEFAULT_PORT_VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Application service that finds and frees occupied ports.
pub struct ConflictResolver<I, T> {
    inspector: I,
    terminator: T,
    verify_timeout: Duration,
}

impl<I: PortInspectorPort, T: ProcessTerminatorPort> ConflictResolver<I, T> {
    pub fn new(inspector: I, terminator: T) -> Self {
        Self {
            inspector,
            terminator,
            verify_timeout: DEFAULT_PORT_VERIFY_TIMEOUT,
        }
    }

    pub fn with_verify_timeout(mut self, verify_timeout: Duration) -> Self {
        self.verify_timeout = verify_timeout;
        self
    }

    pub fn inspector(&self) -> &I {
        &self.inspector
    }

    pub fn terminator(&self) -> &T {
        &self.terminator
    }

    /// Every listener on each of `ports`, including managed processes.
    pub async fn occupants(&self, ports: &BTreeSet<u16>) -> BTreeMap<u16, Vec<PortOccupant>> {
        self.inspector.list_occupants(ports).await
    }

    /// Occupied candidate ports, ignoring listeners in `managed`.
    ///
    /// Ports without an occupant produce nothing; port 0 is never checked.
    pub async fn check_conflicts(
        &self,
        ports: &BTreeSet<u16>,
        managed: &HashSet<u32>,
    ) -> Vec<PortConflict> {
        let ports: BTreeSet<u16> = ports.iter().copied().filter(|p| *p != 0).collect();
        if ports.is_empty() {
            return Vec::new();
        }

        let conflicts: Vec<PortConflict> = self
            .inspector
            .list_occupants(&ports)
            .await
            .values()
            .flatten()
            .filter(|o| !managed.contains(&o.pid))
            .map(PortConflict::from)
            .collect();

        if !conflicts.is_empty() {
            debug!(count = conflicts.len(), "Port conflicts detected");
        }
        conflicts
    }

    /// Terminate the occupant of every conflict and verify each port is free.
    ///
    /// Each pid is terminated once even when it holds several ports. A failure
    /// for one pid or port is reported in its own result and never aborts the
    /// others.
    pub async fn resolve_conflicts(&self, conflicts: &[PortConflict]) -> ResolveReport {
        let mut kill_errors: BTreeMap<u32, String> = BTreeMap::new();
        let mut attempted: HashSet<u32> = HashSet::new();

        for conflict in conflicts {
            if !attempted.insert(conflict.pid) {
                continue;
            }
            info!(
                pid = conflict.pid,
                port = conflict.port,
                name = %conflict.process_name,
                "Terminating port occupant"
            );
            if let Err(e) = self
                .terminator
                .terminate(conflict.pid, TerminateOptions::tree())
                .await
            {
                warn!(pid = conflict.pid, error = %e, "Failed to terminate port occupant");
                kill_errors.insert(conflict.pid, e.to_string());
            }
        }

        let mut results = Vec::with_capacity(conflicts.len());
        let mut verified: HashSet<u16> = HashSet::new();
        for conflict in conflicts {
            if !verified.insert(conflict.port) {
                continue;
            }
            if let Some(error) = kill_errors.get(&conflict.pid) {
                results.push(PortResolution::failed(conflict.port, conflict.pid, error.clone()));
                continue;
            }
            match self.wait_port_free(conflict.port).await {
                None => results.push(PortResolution::resolved(conflict.port, conflict.pid)),
                Some(holder) => {
                    warn!(port = conflict.port, holder = %holder, "Port still occupied after termination");
                    results.push(PortResolution::failed(
                        conflict.port,
                        conflict.pid,
                        format!("port {} still in use by {} (pid {})", conflict.port, holder.process_name, holder.pid),
                    ));
                }
            }
        }

        ResolveReport::from_results(results)
    }

    /// Poll until `port` has no listener. Returns the remaining occupant on timeout.
    async fn wait_port_free(&self, port: u16) -> Option<PortOccupant> {
        let deadline = Instant::now() + self.verify_timeout;
        loop {
            let occupant = self.inspector.find_occupant(port).await?;
            if Instant::now() >= deadline {
                return Some(occupant);
            }
            sleep(PORT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CriticalProcessSet;
    use crate::error::{Error, Result};
    use crate::ports::TerminationOutcome;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Port table shared between the mock inspector and mock terminator.
    type Table = Arc<Mutex<HashMap<u16, Vec<PortOccupant>>>>;

    struct MockInspector {
        table: Table,
    }

    impl PortInspectorPort for MockInspector {
        async fn find_occupant(&self, port: u16) -> Option<PortOccupant> {
            self.table.lock().get(&port).and_then(|o| o.first().cloned())
        }

        async fn list_occupants(&self, ports: &BTreeSet<u16>) -> BTreeMap<u16, Vec<PortOccupant>> {
            let table = self.table.lock();
            ports
                .iter()
                .map(|p| (*p, table.get(p).cloned().unwrap_or_default()))
                .collect()
        }

        async fn bound_ports(&self, pids: &HashSet<u32>) -> Result<BTreeSet<u16>> {
            Ok(self
                .table
                .lock()
                .iter()
                .filter(|(_, occupants)| occupants.iter().any(|o| pids.contains(&o.pid)))
                .map(|(port, _)| *port)
                .collect())
        }

        async fn listening(&self) -> Result<Vec<PortOccupant>> {
            Ok(self.table.lock().values().flatten().cloned().collect())
        }
    }

    /// Terminator that frees the ports of killed pids unless told to ignore them.
    struct MockTerminator {
        table: Table,
        critical: CriticalProcessSet,
        stubborn: HashSet<u32>,
        calls: Arc<Mutex<Vec<u32>>>,
    }

    impl ProcessTerminatorPort for MockTerminator {
        async fn terminate(&self, pid: u32, _options: TerminateOptions) -> Result<TerminationOutcome> {
            let name = self
                .table
                .lock()
                .values()
                .flatten()
                .find(|o| o.pid == pid)
                .map(|o| o.process_name.clone());
            let Some(name) = name else {
                return Ok(TerminationOutcome::AlreadyExited);
            };
            if self.critical.protects(pid, &name) {
                return Err(Error::CriticalProcessProtected { pid, name });
            }
            self.calls.lock().push(pid);
            if !self.stubborn.contains(&pid) {
                for occupants in self.table.lock().values_mut() {
                    occupants.retain(|o| o.pid != pid);
                }
            }
            Ok(TerminationOutcome::Terminated)
        }

        async fn is_running(&self, pid: u32) -> bool {
            self.table.lock().values().flatten().any(|o| o.pid == pid)
        }
    }

    struct Fixture {
        resolver: ConflictResolver<MockInspector, MockTerminator>,
        calls: Arc<Mutex<Vec<u32>>>,
    }

    fn fixture(occupants: &[(u16, u32, &str)], stubborn: &[u32]) -> Fixture {
        let mut map: HashMap<u16, Vec<PortOccupant>> = HashMap::new();
        for (port, pid, name) in occupants {
            map.entry(*port)
                .or_default()
                .push(PortOccupant::new(*port, *pid, *name, "*", *name));
        }
        let table: Table = Arc::new(Mutex::new(map));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let resolver = ConflictResolver::new(
            MockInspector {
                table: Arc::clone(&table),
            },
            MockTerminator {
                table,
                critical: CriticalProcessSet::builtin(),
                stubborn: stubborn.iter().copied().collect(),
                calls: Arc::clone(&calls),
            },
        )
        .with_verify_timeout(Duration::from_millis(300));

        Fixture { resolver, calls }
    }

    fn ports(list: &[u16]) -> BTreeSet<u16> {
        list.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_free_port_has_no_conflict() {
        let f = fixture(&[], &[]);
        let conflicts = f.resolver.check_conflicts(&ports(&[3000]), &HashSet::new()).await;
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_occupied_port_reports_conflict() {
        let f = fixture(&[(3000, 555, "node")], &[]);
        let conflicts = f.resolver.check_conflicts(&ports(&[3000, 4000]), &HashSet::new()).await;
        assert_eq!(conflicts, vec![PortConflict::new(3000, 555, "node")]);
    }

    #[tokio::test]
    async fn test_managed_processes_are_not_conflicts() {
        let f = fixture(&[(3000, 555, "node")], &[]);
        let managed = HashSet::from([555]);
        assert!(f.resolver.check_conflicts(&ports(&[3000]), &managed).await.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_kills_each_pid_once() {
        let f = fixture(&[(3000, 555, "node"), (3001, 555, "node")], &[]);
        let conflicts = f.resolver.check_conflicts(&ports(&[3000, 3001]), &HashSet::new()).await;
        assert_eq!(conflicts.len(), 2);

        let report = f.resolver.resolve_conflicts(&conflicts).await;
        assert!(report.all_resolved);
        assert_eq!(report.results.len(), 2);
        assert_eq!(*f.calls.lock(), vec![555]);

        // Round trip: nothing left to resolve.
        assert!(f
            .resolver
            .check_conflicts(&ports(&[3000, 3001]), &HashSet::new())
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_critical_occupant_is_refused() {
        let f = fixture(&[(22, 777, "sshd"), (3000, 555, "node")], &[]);
        let conflicts = f.resolver.check_conflicts(&ports(&[22, 3000]), &HashSet::new()).await;

        let report = f.resolver.resolve_conflicts(&conflicts).await;
        assert!(!report.all_resolved);
        assert_eq!(report.failed_ports(), vec![22]);

        let failed = &report.results[0];
        assert!(failed.error.as_deref().unwrap_or_default().contains("critical"));
        // The other conflict was still resolved.
        assert!(report.results[1].success);
        assert_eq!(f.resolver.inspector().find_occupant(22).await.unwrap().pid, 777);
    }

    #[tokio::test]
    async fn test_port_still_bound_is_unresolved() {
        let f = fixture(&[(8080, 900, "java")], &[900]);
        let conflicts = vec![PortConflict::new(8080, 900, "java")];

        let report = f.resolver.resolve_conflicts(&conflicts).await;
        assert!(!report.all_resolved);
        assert!(report.results[0].error.as_deref().unwrap_or_default().contains("still in use"));
    }
}
