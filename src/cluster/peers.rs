//! Peers File Loader
//!
//! Parses the cluster peers file: one `<address> <port> <name>` per line,
//! `#` comment lines. Bad lines are reported and skipped, never fatal.

use std::path::Path;

use super::membership::{Admission, PeerNode};
use super::state::ClusterState;
use crate::error::{Error, Result};

/// Parse one line. `Ok(None)` for comments and blank lines.
pub fn parse_line(line: &str, line_number: usize) -> Result<Option<PeerNode>> {
    if line.starts_with('#') || line.trim().is_empty() {
        return Ok(None);
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [address, port, name] = tokens.as_slice() else {
        return Err(Error::PeersFile {
            line: line_number,
            reason: format!("expected `<address> <port> <name>`, found {} fields", tokens.len()),
        });
    };

    let client_port: u16 = port.parse().map_err(|_| Error::PeersFile {
        line: line_number,
        reason: format!("invalid port `{}`", port),
    })?;
    if client_port == 0 || client_port.checked_add(super::BUS_PORT_OFFSET).is_none() {
        return Err(Error::PeersFile {
            line: line_number,
            reason: format!("port {} leaves no room for the bus port", client_port),
        });
    }

    Ok(Some(PeerNode::new(*name, *address, client_port)))
}

/// Parse peers file content, skipping malformed lines
pub fn parse_peers(content: &str) -> Vec<PeerNode> {
    let mut peers = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line_number = idx + 1;
        match parse_line(line, line_number) {
            Ok(Some(node)) => {
                tracing::debug!(
                    "[CFG] Line {}: address {} port {} name {}",
                    line_number,
                    node.address,
                    node.client_port,
                    node.name
                );
                peers.push(node);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Skipping peers file entry: {}", e),
        }
    }

    peers
}

/// Read a peers file from disk
pub fn load_peers_file(path: &Path) -> Result<Vec<PeerNode>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read peers file {}: {}", path.display(), e))
    })?;
    Ok(parse_peers(&content))
}

/// Add parsed peers to the membership in file order. Returns how many were admitted.
pub async fn populate(state: &ClusterState, peers: Vec<PeerNode>) -> usize {
    let mut admitted = 0;
    let mut self_listed = false;

    for node in peers {
        let label = format!("{} ({}:{})", node.name, node.address, node.client_port);
        match state.add_node(node).await {
            Ok(Admission::Added(_)) => admitted += 1,
            Ok(Admission::SelfPlaced(_)) => {
                self_listed = true;
                admitted += 1;
            }
            Err(e) => tracing::warn!("Ignoring peer {}: {}", label, e),
        }
    }

    if !self_listed {
        let local = state.local();
        tracing::warn!(
            "Local node {}:{} is not listed in the peers file; partition order may differ between nodes",
            local.address,
            local.client_port
        );
    }

    admitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::Reachability;
    use crate::cluster::state::LocalIdentity;
    use std::io::Write;

    #[test]
    fn test_parse_valid_line() {
        let node = parse_line("10.0.0.2 6380 B", 1).unwrap().unwrap();
        assert_eq!(node.address, "10.0.0.2");
        assert_eq!(node.client_port, 6380);
        assert_eq!(node.bus_port(), 6480);
        assert_eq!(node.name, "B");
        assert_eq!(node.reachability, Reachability::Unreachable);
        assert!(!node.is_self);
    }

    #[test]
    fn test_comment_and_short_lines_skipped() {
        assert!(parse_line("# comment", 1).unwrap().is_none());
        assert!(matches!(
            parse_line("10.0.0.2 6380", 2),
            Err(Error::PeersFile { line: 2, .. })
        ));
        assert!(matches!(
            parse_line("10.0.0.2 63x0 B", 3),
            Err(Error::PeersFile { line: 3, .. })
        ));
    }

    #[test]
    fn test_parse_peers_keeps_order() {
        let content = "# cluster\n10.0.0.1 6379 A\n10.0.0.2 6380\n\n10.0.0.3 6381 C\n10.0.0.2 6380 B extra\n10.0.0.2 6380 B\n";
        let peers = parse_peers(content);
        let names: Vec<_> = peers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C", "B"]);
    }

    #[tokio::test]
    async fn test_populate_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# shibui cluster").unwrap();
        writeln!(file, "127.0.0.1 6379 A").unwrap();
        writeln!(file, "127.0.0.1 6380 B").unwrap();
        writeln!(file, "127.0.0.1 6380 B-again").unwrap();
        writeln!(file, "127.0.0.1 6381 C").unwrap();

        let state = ClusterState::new(LocalIdentity::new("B", "127.0.0.1", 6380));
        let peers = load_peers_file(file.path()).unwrap();
        assert_eq!(peers.len(), 4);

        let admitted = populate(&state, peers).await;
        assert_eq!(admitted, 3);

        let members = state.members().await;
        let names: Vec<_> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert!(members[1].is_self);
        assert_eq!(state.unreachable_count().await, 2);
    }

    #[test]
    fn test_missing_file() {
        let result = load_peers_file(Path::new("/nonexistent/shibui/cluster.conf"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
