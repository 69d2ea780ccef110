use std::ffi::OsStr;
use std::process::Stdio;

use tokio::process::Command;

/// A query tool invocation with captured stdout.
///
/// The child is killed when its future is dropped, so a timed-out query
/// does not leave the tool running.
pub(super) fn query_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

/// Parse an address:port string.
///
/// Handles multiple address formats:
/// - IPv4: "127.0.0.1:3000" or "*:8080"
/// - IPv6: "\[::1]:3000" or "\[fe80::1%lo0]:8080"
/// - ss IPv4-mapped: "\[::ffff:127.0.0.1]:3000"
pub(super) fn parse_address(address: &str) -> Option<(String, u16)> {
    if address.starts_with('[') {
        let bracket_end = address.find(']')?;
        let port_str = address[bracket_end + 1..].strip_prefix(':')?;
        let port: u16 = port_str.parse().ok()?;
        Some((address[..=bracket_end].to_string(), port))
    } else {
        let (addr, port_str) = address.rsplit_once(':')?;
        let port: u16 = port_str.parse().ok()?;
        let addr = if addr.is_empty() { "*" } else { addr };
        Some((addr.to_string(), port))
    }
}

/// Truncate a command line for display, keeping it on a char boundary.
pub(super) fn truncate_command(command: &str, max: usize) -> String {
    match command.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &command[..idx]),
        None => command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_address() {
        assert_eq!(
            parse_address("127.0.0.1:3000"),
            Some(("127.0.0.1".to_string(), 3000))
        );
        assert_eq!(parse_address("*:8080"), Some(("*".to_string(), 8080)));
        assert_eq!(parse_address(":9000"), Some(("*".to_string(), 9000)));
    }

    #[test]
    fn test_parse_ipv6_address() {
        assert_eq!(parse_address("[::1]:3000"), Some(("[::1]".to_string(), 3000)));
        assert_eq!(
            parse_address("[::ffff:127.0.0.1]:63342"),
            Some(("[::ffff:127.0.0.1]".to_string(), 63342))
        );
    }

    #[test]
    fn test_parse_rejects_wildcard_port() {
        assert_eq!(parse_address("0.0.0.0:*"), None);
        assert_eq!(parse_address("[::]"), None);
    }

    #[test]
    fn test_truncate_command() {
        assert_eq!(truncate_command("node", 10), "node");
        assert_eq!(truncate_command("abcdef", 3), "abc...");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_query_kills_its_child() {
        use crate::adapters::ProcessTable;
        use crate::ports::ProcessTablePort;
        use std::time::Duration;

        let child = query_command("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let table = ProcessTable::new();
        assert!(table.is_alive(pid).await);

        drop(child);

        let mut alive = true;
        for _ in 0..40 {
            if !table.is_alive(pid).await {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "query child {} survived its handle", pid);
    }
}
