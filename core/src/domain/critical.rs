//! Allow-list of processes that must never be terminated.

use std::collections::HashSet;

/// Built-in names of operating system processes that are never killed.
const BUILTIN_CRITICAL: &[&str] = &[
    // Windows
    "system", "registry", "ntoskrnl", "wininit", "winlogon", "csrss", "smss",
    "services", "lsass", "svchost", "explorer", "dwm",
    // macOS
    "launchd", "kernel_task", "loginwindow", "windowserver", "opendirectoryd",
    // Linux
    "init", "systemd", "kthreadd", "dbus-daemon", "sshd",
];

/// Immutable set of process names protected from termination.
///
/// Names are compared case-insensitively on their base name with any
/// `.exe` suffix removed, so `C:\Windows\System32\csrss.exe`, `CSRSS.EXE`
/// and `csrss` all match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalProcessSet {
    names: HashSet<String>,
}

impl CriticalProcessSet {
    /// The built-in set.
    pub fn builtin() -> Self {
        Self::with_extra(std::iter::empty::<&str>())
    }

    /// The built-in set plus additional names.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = BUILTIN_CRITICAL
            .iter()
            .map(|n| normalize(n))
            .chain(extra.into_iter().map(|n| normalize(n.as_ref())))
            .filter(|n| !n.is_empty())
            .collect();
        Self { names }
    }

    /// Whether a process with this name is protected.
    pub fn is_critical(&self, process_name: &str) -> bool {
        self.names.contains(&normalize(process_name))
    }

    /// Whether the pid/name pair must not be killed. PID 1 is always protected.
    pub fn protects(&self, pid: u32, process_name: &str) -> bool {
        pid == 1 || self.is_critical(process_name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for CriticalProcessSet {
    fn default() -> Self {
        Self::builtin()
    }
}

fn normalize(name: &str) -> String {
    let base = name
        .trim()
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    match base.strip_suffix(".exe") {
        Some(stripped) => stripped.to_string(),
        None => base,
    }
}
