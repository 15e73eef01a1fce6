//! Parser for the node-list seed file.
//!
//! The format is tabular text, one node per row, comma separated:
//!
//! ```text
//! nodeId,address,coordinationPort,clientPort
//! 1,127.0.0.1,9101,9201
//! 2,127.0.0.1,9102,9202
//! ```
//!
//! The header row is skipped.

use std::io;
use std::path::Path;

use tracing::debug;

use crate::VirtualNode;

/// Reads and parses a node-list file.
pub fn parse_node_file(path: impl AsRef<Path>) -> io::Result<Vec<VirtualNode>> {
    let contents = std::fs::read_to_string(path)?;
    parse_node_list(&contents)
}

/// Parses node-list rows from already-loaded text.
pub fn parse_node_list(contents: &str) -> io::Result<Vec<VirtualNode>> {
    let mut nodes = Vec::new();

    // The first line is the header row.
    for (line_no, line) in contents.lines().enumerate().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let node = parse_row(line).map_err(|field| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line {}: invalid {field}: {line:?}", line_no + 1),
            )
        })?;

        debug!(node_id = node.node_id, address = %node.address, "Parsed node list entry.");
        nodes.push(node);
    }

    Ok(nodes)
}

fn parse_row(line: &str) -> Result<VirtualNode, &'static str> {
    let mut fields = line.split(',').map(str::trim);

    let node_id = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or("node id")?;
    let address = fields.next().filter(|f| !f.is_empty()).ok_or("address")?;
    let coordination_port = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or("coordination port")?;
    let client_port = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or("client port")?;

    if fields.next().is_some() {
        return Err("trailing field");
    }

    Ok(VirtualNode::new(
        node_id,
        address,
        coordination_port,
        client_port,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    static SAMPLE: &str = "\
nodeId,address,coordinationPort,clientPort
1,127.0.0.1,9101,9201
2,127.0.0.1,9102,9202

6,node-six.internal,9106,9206
";

    #[test]
    fn test_parse_skips_header_and_blank_lines() {
        let nodes = parse_node_list(SAMPLE).unwrap();

        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0], VirtualNode::new(1, "127.0.0.1", 9101, 9201));
        assert_eq!(nodes[2].address, "node-six.internal");
        assert_eq!(nodes[2].client_port, 9206);
    }

    #[test]
    fn test_malformed_row_is_an_error() {
        let result = parse_node_list("header\n1,127.0.0.1,not-a-port,9201\n");
        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("coordination port"));
    }

    #[test]
    fn test_trailing_fields_rejected() {
        let result = parse_node_list("header\n1,127.0.0.1,9101,9201,extra\n");
        assert!(result.is_err());
    }
}
