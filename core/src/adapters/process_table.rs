//! Process table adapter backed by sysinfo.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus as OsProcessStatus, ProcessesToUpdate, System,
};
use tokio::task;
use tracing::warn;

use crate::domain::ResourceSample;
use crate::ports::ProcessTablePort;

/// Longest a resource sample waits for the shared `System` before giving up.
const SAMPLE_LOCK_WAIT: Duration = Duration::from_millis(250);

/// Reads the OS process table.
///
/// Liveness, names and descendants are read from a fresh `System` per call,
/// so those lookups never queue behind each other. Resource samples share one
/// `System` so CPU usage is computed over the interval since the previous
/// sample of the same process.
#[derive(Clone)]
pub struct ProcessTable {
    system: Arc<Mutex<System>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Run `f` against a fresh `System` on the blocking pool.
    async fn with_fresh<F, R>(&self, default: R, f: F) -> R
    where
        F: FnOnce(&mut System) -> R + Send + 'static,
        R: Send + 'static,
    {
        blocking(default, move || f(&mut System::new())).await
    }

    /// Run `f` against the shared `System`, or return `default` if it stays busy.
    async fn with_shared<F, R>(&self, default: R, f: F) -> R
    where
        F: FnOnce(&mut System) -> R + Send + 'static,
        R: Send + 'static,
    {
        let system = Arc::clone(&self.system);
        let run = move || match system.try_lock_for(SAMPLE_LOCK_WAIT) {
            Some(mut sys) => Some(f(&mut sys)),
            None => {
                warn!(wait_ms = SAMPLE_LOCK_WAIT.as_millis() as u64, "Process table busy, skipping");
                None
            }
        };
        blocking(None, run).await.unwrap_or(default)
    }
}

async fn blocking<F, R>(default: R, f: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Process table query panicked");
            default
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

fn is_live(process: &Process) -> bool {
    process.thread_kind().is_none() && !matches!(process.status(), OsProcessStatus::Zombie | OsProcessStatus::Dead)
}

fn refresh_one(system: &mut System, pid: u32, kind: ProcessRefreshKind) -> Option<&Process> {
    let pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, kind);
    system.process(pid).filter(|p| is_live(p))
}

/// Breadth-first walk of the parent map, returned deepest first.
fn collect_descendants(root: u32, parents: &HashMap<u32, u32>) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (&child, &parent) in parents {
        if child != parent {
            children.entry(parent).or_default().push(child);
        }
    }

    let mut order = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !order.contains(&kid) {
                    order.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }

    order.reverse();
    order
}

impl ProcessTablePort for ProcessTable {
    async fn is_alive(&self, pid: u32) -> bool {
        self.with_fresh(false, move |sys| {
            refresh_one(sys, pid, ProcessRefreshKind::nothing()).is_some()
        })
        .await
    }

    async fn process_name(&self, pid: u32) -> Option<String> {
        self.with_fresh(None, move |sys| {
            refresh_one(sys, pid, ProcessRefreshKind::nothing())
                .map(|p| p.name().to_string_lossy().into_owned())
        })
        .await
    }

    async fn descendants(&self, pid: u32) -> Vec<u32> {
        self.with_fresh(Vec::new(), move |sys| {
            sys.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing(),
            );
            let parents: HashMap<u32, u32> = sys
                .processes()
                .values()
                .filter(|p| is_live(p))
                .filter_map(|p| p.parent().map(|parent| (p.pid().as_u32(), parent.as_u32())))
                .collect();
            collect_descendants(pid, &parents)
        })
        .await
    }

    async fn sample(&self, pid: u32) -> Option<ResourceSample> {
        self.with_shared(None, move |sys| {
            let kind = ProcessRefreshKind::nothing().with_memory().with_cpu();
            refresh_one(sys, pid, kind).map(|p| ResourceSample::from_bytes(p.memory(), p.cpu_usage()))
        })
        .await
    }
}
