//! The control-plane channel: an unreliable, connectionless transport
//! carrying one message per UDP datagram.
//!
//! Delivery is best-effort by contract; callers own their retries. A
//! malformed datagram is logged and dropped, never surfaced as an error.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokenring_directory::{AddressTranslator, NodeId};
use tokio::net::UdpSocket;
use tracing::{trace, warn};

use crate::error::NodeError;
use crate::wire::{self, Message, MAX_DATAGRAM_SIZE};

#[derive(Clone)]
pub struct ControlChannel {
    socket: Arc<UdpSocket>,
    translator: Arc<AddressTranslator>,
}

impl ControlChannel {
    /// Binds the node's coordination port.
    ///
    /// Failing to bind is the one startup error that terminates the node.
    pub async fn bind(
        self_id: NodeId,
        translator: Arc<AddressTranslator>,
    ) -> Result<Self, NodeError> {
        let addr = translator
            .coordination_addr(self_id)
            .map_err(|_| NodeError::UnknownPeer(self_id))?;
        let socket = UdpSocket::bind(addr).await?;

        Ok(Self {
            socket: Arc::new(socket),
            translator,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sends a message to the given destination, best-effort.
    pub async fn send(&self, message: &Message, dest_id: NodeId) -> Result<(), NodeError> {
        let dest = self
            .translator
            .coordination_addr(dest_id)
            .map_err(|_| NodeError::UnknownPeer(dest_id))?;
        let bytes = wire::encode_datagram(message)?;

        trace!(dest_id = dest_id, dest = %dest, "Sending control message.");
        self.socket.send_to(&bytes, dest).await?;
        Ok(())
    }

    /// Blocks up to `timeout` for the next well-formed message.
    ///
    /// Returns `None` on timeout and on malformed input; the caller's loop
    /// just continues.
    pub async fn recv(&self, timeout: Duration) -> Option<Message> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        let received = tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await;
        match received {
            Err(_elapsed) => None,
            Ok(Err(error)) => {
                warn!(error = %error, "Control socket receive failed.");
                None
            },
            Ok(Ok((len, from))) => match wire::decode(&buf[..len]) {
                Ok(message) => Some(message),
                Err(error) => {
                    warn!(from = %from, error = %error, "Discarding malformed datagram.");
                    None
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tokenring_directory::VirtualNode;

    use super::*;
    use crate::wire::Payload;

    fn translator_for(nodes: &[VirtualNode]) -> Arc<AddressTranslator> {
        Arc::new(AddressTranslator::from_snapshot(nodes))
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let addr_1 = test_helper::get_unused_udp_addr();
        let addr_2 = test_helper::get_unused_udp_addr();
        let translator = translator_for(&[
            VirtualNode::new(1, addr_1.ip().to_string(), addr_1.port(), 0),
            VirtualNode::new(2, addr_2.ip().to_string(), addr_2.port(), 0),
        ]);

        let channel_1 = ControlChannel::bind(1, translator.clone()).await.unwrap();
        let channel_2 = ControlChannel::bind(2, translator).await.unwrap();

        channel_1
            .send(&Message::new(1, Payload::Join), 2)
            .await
            .unwrap();

        let received = channel_2
            .recv(Duration::from_secs(5))
            .await
            .expect("message should arrive");
        assert_eq!(received, Message::new(1, Payload::Join));
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let addr = test_helper::get_unused_udp_addr();
        let translator = translator_for(&[VirtualNode::new(
            1,
            addr.ip().to_string(),
            addr.port(),
            0,
        )]);

        let channel = ControlChannel::bind(1, translator).await.unwrap();
        assert!(channel.recv(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let addr = test_helper::get_unused_udp_addr();
        let translator = translator_for(&[VirtualNode::new(
            1,
            addr.ip().to_string(),
            addr.port(),
            0,
        )]);

        let channel = ControlChannel::bind(1, translator).await.unwrap();
        let local = channel.local_addr().unwrap();

        let prober = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        prober.send_to(&[0xde, 0xad, 0xbe, 0xef], local).await.unwrap();

        assert!(channel.recv(Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_unknown_node_fails() {
        let addr = test_helper::get_unused_udp_addr();
        let translator = translator_for(&[VirtualNode::new(
            1,
            addr.ip().to_string(),
            addr.port(),
            0,
        )]);

        let channel = ControlChannel::bind(1, translator).await.unwrap();
        let err = channel
            .send(&Message::new(1, Payload::Keepalive), 9)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::UnknownPeer(9)));
    }
}
