//! Linux port inspector implementation using ss and ps.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::domain::PortOccupant;
use crate::error::{Error, Result};

use super::utils::{parse_address, query_command, truncate_command};
use super::Scanner;

const MAX_COMMAND_LEN: usize = 200;

/// Linux-specific scanner.
pub struct LinuxScanner;

fn users_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"\("([^"]+)",pid=(\d+),fd=(\d+)\)"#).unwrap())
}

impl LinuxScanner {
    pub fn new() -> Self {
        Self
    }

    async fn run_ss(&self, filter: &[&str]) -> Result<String> {
        let output = query_command("ss")
            .arg("-Htlnp")
            .args(filter)
            .output()
            .await
            .map_err(|e| Error::CommandFailed(format!("Failed to run ss: {}", e)))?;

        String::from_utf8(output.stdout)
            .map_err(|e| Error::ParseError(format!("Invalid UTF-8 in ss output: {}", e)))
    }

    /// Full command lines for the given pids.
    async fn get_process_commands(&self, pids: &HashSet<u32>) -> HashMap<u32, String> {
        if pids.is_empty() {
            return HashMap::new();
        }

        let pid_list = pids
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let output = match query_command("ps")
            .args(["-o", "pid=,args=", "-p", &pid_list])
            .output()
            .await
        {
            Ok(output) => output,
            Err(_) => return HashMap::new(),
        };

        parse_ps_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn scan_with_filter(&self, filter: &[&str]) -> Result<Vec<PortOccupant>> {
        let stdout = self.run_ss(filter).await?;
        let mut occupants = parse_ss_output(&stdout);

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

impl Default for LinuxScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner for LinuxScanner {
    async fn scan(&self) -> Result<Vec<PortOccupant>> {
        self.scan_with_filter(&[]).await
    }

    async fn scan_port(&self, port: u16) -> Result<Vec<PortOccupant>> {
        let sport = format!(":{}", port);
        let occupants = self.scan_with_filter(&["sport", "=", &sport]).await?;
        Ok(occupants.into_iter().filter(|o| o.port == port).collect())
    }
}

/// Parse `ss -Htlnp` lines. Sockets without visible process info are skipped.
fn parse_ss_output(output: &str) -> Vec<PortOccupant> {
    let mut occupants = Vec::new();
    let mut seen: HashSet<(u16, u32)> = HashSet::new();

    for line in output.lines() {
        let components: Vec<&str> = line.split_whitespace().collect();
        if components.len() < 6 {
            continue;
        }

        let Some((address, port)) = parse_address(components[3]) else {
            continue;
        };

        let users = components[5..].join(" ");
        for caps in users_pattern().captures_iter(&users) {
            let Ok(pid) = caps[2].parse::<u32>() else {
                continue;
            };
            if !seen.insert((port, pid)) {
                continue;
            }
            let name = caps[1].to_string();
            occupants.push(PortOccupant::new(port, pid, name.clone(), address.clone(), name));
        }
    }

    occupants.sort_by_key(|o| (o.port, o.pid));
    occupants
}

fn parse_ps_output(output: &str) -> HashMap<u32, String> {
    let mut commands = HashMap::new();

    for line in output.lines() {
        let trimmed = line.trim();
        let Some((pid_str, command)) = trimmed.split_once(char::is_whitespace) else {
            continue;
        };
        let Ok(pid) = pid_str.parse::<u32>() else {
            continue;
        };
        let command = command.trim();
        if !command.is_empty() {
            commands.insert(pid, truncate_command(command, MAX_COMMAND_LEN));
        }
    }

    commands
}
