//! Windows port inspector implementation using netstat and tasklist.

use std::collections::{HashMap, HashSet};

use crate::domain::PortOccupant;
use crate::error::{Error, Result};

use super::utils::{parse_address, query_command};
use super::Scanner;

/// Windows-specific scanner.
pub struct WindowsScanner;

impl WindowsScanner {
    pub fn new() -> Self {
        Self
    }

    async fn process_names(&self) -> HashMap<u32, String> {
        let output = match query_command("tasklist")
            .args(["/FO", "CSV", "/NH"])
            .output()
            .await
        {
            Ok(output) => output,
            Err(_) => return HashMap::new(),
        };

        parse_tasklist_output(&String::from_utf8_lossy(&output.stdout))
    }
}

impl Default for WindowsScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner for WindowsScanner {
    async fn scan(&self) -> Result<Vec<PortOccupant>> {
        let output = query_command("netstat")
            .args(["-ano", "-p", "TCP"])
            .output()
            .await
            .map_err(|e| Error::CommandFailed(format!("Failed to run netstat: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let names = self.process_names().await;
        Ok(parse_netstat_output(&stdout, &names))
    }

    async fn scan_port(&self, port: u16) -> Result<Vec<PortOccupant>> {
        let occupants = self.scan().await?;
        Ok(occupants.into_iter().filter(|o| o.port == port).collect())
    }
}

fn parse_netstat_output(output: &str, names: &HashMap<u32, String>) -> Vec<PortOccupant> {
    let mut occupants = Vec::new();
    let mut seen: HashSet<(u16, u32)> = HashSet::new();

    for line in output.lines() {
        let components: Vec<&str> = line.split_whitespace().collect();
        if components.len() < 5 || components[0] != "TCP" || components[3] != "LISTENING" {
            continue;
        }

        let Some((address, port)) = parse_address(components[1]) else {
            continue;
        };
        let Ok(pid) = components[4].parse::<u32>() else {
            continue;
        };
        // PID 0 is the idle pseudo-process.
        if pid == 0 || !seen.insert((port, pid)) {
            continue;
        }

        let name = names
            .get(&pid)
            .cloned()
            .unwrap_or_else(|| format!("PID {}", pid));
        occupants.push(PortOccupant::new(port, pid, name.clone(), address, name));
    }

    occupants.sort_by_key(|o| (o.port, o.pid));
    occupants
}

fn parse_tasklist_output(output: &str) -> HashMap<u32, String> {
    let mut names = HashMap::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.trim().trim_matches('"').split("\",\"").collect();
        if fields.len() < 2 {
            continue;
        }
        if let Ok(pid) = fields[1].parse::<u32>() {
            names.insert(pid, fields[0].to_string());
        }
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_netstat_output() {
        let output = r#"
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1000
  TCP    0.0.0.0:3000           0.0.0.0:0              LISTENING       4242
  TCP    [::]:3000              [::]:0                 LISTENING       4242
  TCP    127.0.0.1:50000        127.0.0.1:3000         ESTABLISHED     7777
"#;
        let names = parse_tasklist_output(
            "\"svchost.exe\",\"1000\",\"Services\",\"0\",\"10,000 K\"\n\"node.exe\",\"4242\",\"Console\",\"1\",\"50,000 K\"\n",
        );

        let occupants = parse_netstat_output(output, &names);
        assert_eq!(occupants.len(), 2);
        assert_eq!(occupants[0].port, 135);
        assert_eq!(occupants[0].process_name, "svchost.exe");
        assert_eq!(occupants[1].port, 3000);
        assert_eq!(occupants[1].process_name, "node.exe");
    }
}
