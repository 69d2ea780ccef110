//! macOS port inspector implementation using lsof and ps.

use std::collections::{HashMap, HashSet};

use crate::domain::PortOccupant;
use crate::error::{Error, Result};

use super::utils::{parse_address, query_command, truncate_command};
use super::Scanner;

const MAX_COMMAND_LEN: usize = 200;

/// macOS-specific scanner using lsof.
pub struct DarwinScanner;

impl DarwinScanner {
    /// Create a new macOS scanner.
    pub fn new() -> Self {
        Self
    }

    async fn run_lsof(&self, selector: &str) -> Result<String> {
        let output = query_command("/usr/sbin/lsof")
            .args([selector, "-sTCP:LISTEN", "-P", "-n", "+c", "0"])
            .output()
            .await
            .map_err(|e| Error::CommandFailed(format!("Failed to run lsof: {}", e)))?;

        // lsof exits with 1 when nothing matched.
        if !output.status.success() && output.stdout.is_empty() {
            return Ok(String::new());
        }

        String::from_utf8(output.stdout)
            .map_err(|e| Error::ParseError(format!("Invalid UTF-8 in lsof output: {}", e)))
    }

    /// Get full command information for the given pids using ps.
    async fn get_process_commands(&self, pids: &HashSet<u32>) -> HashMap<u32, String> {
        if pids.is_empty() {
            return HashMap::new();
        }

        let pid_list = pids
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let output = match query_command("/bin/ps")
            .args(["-o", "pid=,command=", "-p", &pid_list])
            .output()
            .await
        {
            Ok(output) => output,
            Err(_) => return HashMap::new(),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut commands = HashMap::new();

        for line in stdout.lines() {
            let mut parts = line.trim().splitn(2, char::is_whitespace);
            let (Some(pid_str), Some(command)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(pid) = pid_str.parse::<u32>() else {
                continue;
            };
            commands.insert(pid, truncate_command(command.trim(), MAX_COMMAND_LEN));
        }

        commands
    }

    async fn scan_selector(&self, selector: &str) -> Result<Vec<PortOccupant>> {
        let stdout = self.run_lsof(selector).await?;
        let mut occupants = parse_lsof_output(&stdout);

        let pids: HashSet<u32> = occupants.iter().map(|o| o.pid).collect();
        let commands = self.get_process_commands(&pids).await;
        for occupant in &mut occupants {
            if let Some(command) = commands.get(&occupant.pid) {
                occupant.command = command.clone();
            }
        }

        Ok(occupants)
    }
}

impl Default for DarwinScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner for DarwinScanner {
    async fn scan(&self) -> Result<Vec<PortOccupant>> {
        self.scan_selector("-iTCP").await
    }

    async fn scan_port(&self, port: u16) -> Result<Vec<PortOccupant>> {
        let occupants = self.scan_selector(&format!("-iTCP:{}", port)).await?;
        Ok(occupants.into_iter().filter(|o| o.port == port).collect())
    }
}

/// Parse lsof output into occupants, one per (port, pid).
fn parse_lsof_output(output: &str) -> Vec<PortOccupant> {
    let mut occupants = Vec::new();
    let mut seen: HashSet<(u16, u32)> = HashSet::new();

    for line in output.lines().skip(1) {
        let components: Vec<&str> = line.split_whitespace().collect();
        if components.len() < 9 {
            continue;
        }

        let process_name = components[0].replace("\\x20", " ").replace("\\x2f", "/");

        let Ok(pid) = components[1].parse::<u32>() else {
            continue;
        };

        let Some(address_part) = components[8..]
            .iter()
            .rev()
            .find(|c| c.contains(':') && !c.starts_with("0x") && !c.starts_with("0t"))
        else {
            continue;
        };

        let Some((address, port)) = parse_address(address_part) else {
            continue;
        };

        if !seen.insert((port, pid)) {
            continue;
        }

        occupants.push(PortOccupant::new(
            port,
            pid,
            process_name.clone(),
            address,
            process_name,
        ));
    }

    occupants.sort_by_key(|o| (o.port, o.pid));
    occupants
}
