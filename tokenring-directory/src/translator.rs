use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::{NodeId, VirtualNode};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Network endpoints for one node, as recorded in the directory.
pub struct NodeEndpoint {
    pub host: String,
    pub coordination_port: u16,
    pub client_port: u16,
}

impl NodeEndpoint {
    /// Resolves the coordination endpoint. The UDP control socket and the
    /// TCP ring listener share this port number.
    pub fn coordination_addr(&self) -> io::Result<SocketAddr> {
        resolve(&self.host, self.coordination_port)
    }

    /// Resolves the client-facing endpoint.
    pub fn client_addr(&self) -> io::Result<SocketAddr> {
        resolve(&self.host, self.client_port)
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address resolved for {host}:{port}"),
        )
    })
}

#[derive(Debug, Clone, Default)]
/// Read-only lookup of node ID to network endpoints, built once from a
/// directory snapshot at node startup.
///
/// Addresses are static per run; rebuilding means re-snapshotting.
pub struct AddressTranslator {
    endpoints: HashMap<NodeId, NodeEndpoint>,
}

impl AddressTranslator {
    pub fn from_snapshot(nodes: &[VirtualNode]) -> Self {
        let endpoints = nodes
            .iter()
            .map(|node| {
                (
                    node.node_id,
                    NodeEndpoint {
                        host: node.address.clone(),
                        coordination_port: node.coordination_port,
                        client_port: node.client_port,
                    },
                )
            })
            .collect();

        Self { endpoints }
    }

    pub fn endpoint(&self, node_id: NodeId) -> Option<&NodeEndpoint> {
        self.endpoints.get(&node_id)
    }

    /// Resolved coordination address for the given node.
    pub fn coordination_addr(&self, node_id: NodeId) -> io::Result<SocketAddr> {
        self.endpoint(node_id)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("node {node_id} is not in the address table"),
                )
            })?
            .coordination_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_from_snapshot() {
        let nodes = vec![
            VirtualNode::new(1, "127.0.0.1", 9101, 9201),
            VirtualNode::new(6, "127.0.0.1", 9106, 9206),
        ];

        let translator = AddressTranslator::from_snapshot(&nodes);

        let endpoint = translator.endpoint(6).expect("node 6 known");
        assert_eq!(endpoint.coordination_port, 9106);
        assert_eq!(
            translator.coordination_addr(6).unwrap(),
            "127.0.0.1:9106".parse().unwrap(),
        );
        assert!(translator.endpoint(3).is_none());
        assert!(translator.coordination_addr(3).is_err());
    }
}
