//! Heuristic discovery of the ports a command is likely to bind.
//!
//! Extraction from free text is lossy: it can miss ports set in config files
//! and can pick up numbers that are not ports. Results are advisory.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Lowest port considered by the heuristic; below this are mostly system ports.
const MIN_HINT_PORT: u32 = 1000;

/// How declared and heuristic ports are combined into the candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortPolicy {
    /// Declared ports win; the heuristic is only used when none are declared.
    #[default]
    DeclaredFirst,
    /// Union of declared and heuristic ports.
    Merge,
}

fn hint_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // -p 3000, -p=3000, --port 3000, --port=3000
            Regex::new(r"(?:^|\s)(?:-p|--port)(?:\s+|=)(\d{1,5})\b").unwrap(),
            // port=3000, PORT=3000, port: 3000
            Regex::new(r"(?i)\bport\s*[=:]\s*(\d{1,5})\b").unwrap(),
            // localhost:3000, 0.0.0.0:8080, -p 8080:80
            Regex::new(r":(\d{4,5})\b").unwrap(),
        ]
    })
}

/// Extract likely ports (1000-65535) from a command line.
pub fn extract_ports(command: &str) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();

    for pattern in hint_patterns() {
        for caps in pattern.captures_iter(command) {
            let Ok(value) = caps[1].parse::<u32>() else {
                continue;
            };
            if (MIN_HINT_PORT..=u16::MAX as u32).contains(&value) {
                ports.insert(value as u16);
            }
        }
    }

    ports
}

/// Build the set of ports to check before launching `command`.
///
/// Falls back to `fallback` when neither declared nor heuristic ports exist.
pub fn candidate_ports(
    declared: &[u16],
    command: &str,
    policy: PortPolicy,
    fallback: &[u16],
) -> BTreeSet<u16> {
    let declared: BTreeSet<u16> = declared.iter().copied().filter(|p| *p != 0).collect();

    let mut ports = match policy {
        PortPolicy::DeclaredFirst if !declared.is_empty() => declared,
        PortPolicy::DeclaredFirst => extract_ports(command),
        PortPolicy::Merge => {
            let mut merged = declared;
            merged.extend(extract_ports(command));
            merged
        }
    };

    if ports.is_empty() {
        ports.extend(fallback.iter().copied().filter(|p| *p != 0));
    }

    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ports: &[u16]) -> BTreeSet<u16> {
        ports.iter().copied().collect()
    }

    #[test]
    fn test_extract_flag_forms() {
        assert_eq!(extract_ports("vite -p 3000"), set(&[3000]));
        assert_eq!(extract_ports("serve --port=8080"), set(&[8080]));
        assert_eq!(extract_ports("serve --port 5173 --host"), set(&[5173]));
    }

    #[test]
    fn test_extract_env_and_address_forms() {
        assert_eq!(extract_ports("PORT=4000 npm start"), set(&[4000]));
        assert_eq!(extract_ports("python -m http.server --bind 0.0.0.0:8000"), set(&[8000]));
        assert_eq!(extract_ports("docker run -p 8080:80 nginx"), set(&[8080]));
    }

    #[test]
    fn test_extract_ignores_out_of_range() {
        assert!(extract_ports("npm start").is_empty());
        assert!(extract_ports("serve -p 80").is_empty());
        assert!(extract_ports("serve -p 99999").is_empty());
    }

    #[test]
    fn test_declared_first_policy() {
        let ports = candidate_ports(&[3000], "vite -p 5173", PortPolicy::DeclaredFirst, &[]);
        assert_eq!(ports, set(&[3000]));

        let ports = candidate_ports(&[], "vite -p 5173", PortPolicy::DeclaredFirst, &[]);
        assert_eq!(ports, set(&[5173]));
    }

    #[test]
    fn test_merge_policy() {
        let ports = candidate_ports(&[3000], "vite -p 5173", PortPolicy::Merge, &[]);
        assert_eq!(ports, set(&[3000, 5173]));
    }

    #[test]
    fn test_fallback_ports() {
        let ports = candidate_ports(&[], "npm start", PortPolicy::DeclaredFirst, &[3000, 8080]);
        assert_eq!(ports, set(&[3000, 8080]));

        let ports = candidate_ports(&[4000], "npm start", PortPolicy::DeclaredFirst, &[3000]);
        assert_eq!(ports, set(&[4000]));
    }
}
