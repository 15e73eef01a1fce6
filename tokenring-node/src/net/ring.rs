//! The ring link manager: two independently owned point-to-point streams.
//!
//! The successor link (outbound) belongs to the node's state-machine task,
//! which is the only task that ever writes to it. The predecessor link
//! (inbound) belongs to a dedicated accept task; everything else talks to
//! that task through its command channel, so neither socket handle is ever
//! shared between tasks.
//!
//! Any I/O error on either link is reported as "link lost" and never retried
//! here; recovery belongs to the state machine.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokenring_directory::{AddressTranslator, NodeId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::wire::{self, Message, Payload};

type RingFramed = Framed<TcpStream, LengthDelimitedCodec>;

fn framed(stream: TcpStream) -> RingFramed {
    Framed::new(stream, LengthDelimitedCodec::new())
}

#[derive(Debug)]
/// Commands understood by the predecessor accept task.
pub(crate) enum PredecessorCommand {
    /// Write a TOKEN_ACK back over the inbound connection.
    SendTokenAck,
}

#[derive(Debug)]
/// Events emitted by the predecessor accept task.
pub(crate) enum RingEvent {
    /// A well-formed frame arrived from the predecessor.
    Frame(Message),
    /// A new predecessor connected.
    PredecessorConnected(std::net::SocketAddr),
    /// The inbound connection died; the task is re-accepting.
    PredecessorLost,
}

/// The outbound half of the ring: a connect-on-demand stream to the current
/// successor, replaced whenever the successor changes.
pub(crate) struct SuccessorLink {
    self_id: NodeId,
    translator: Arc<AddressTranslator>,
    current: Option<Connection>,
}

struct Connection {
    successor_id: NodeId,
    framed: RingFramed,
}

impl SuccessorLink {
    pub(crate) fn new(self_id: NodeId, translator: Arc<AddressTranslator>) -> Self {
        Self {
            self_id,
            translator,
            current: None,
        }
    }

    pub(crate) fn successor_id(&self) -> Option<NodeId> {
        self.current.as_ref().map(|conn| conn.successor_id)
    }

    /// A ring of size one: this node's successor is itself.
    pub(crate) fn is_closed_loop(&self) -> bool {
        self.successor_id() == Some(self.self_id)
    }

    /// Closes any existing link and connects to the given successor's ring
    /// listener.
    pub(crate) async fn connect(&mut self, successor_id: NodeId) -> Result<(), NodeError> {
        // Dropping the old connection closes it, which is what nudges the
        // old successor's accept task back into `accept()`.
        self.current = None;

        let addr = self
            .translator
            .coordination_addr(successor_id)
            .map_err(|_| NodeError::UnknownPeer(successor_id))?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        debug!(successor_id = successor_id, addr = %addr, "Connected successor link.");
        self.current = Some(Connection {
            successor_id,
            framed: framed(stream),
        });
        Ok(())
    }

    pub(crate) async fn send(&mut self, message: &Message) -> Result<(), NodeError> {
        let conn = self.current.as_mut().ok_or_else(|| {
            NodeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no successor link",
            ))
        })?;

        let bytes = wire::encode(message)?;
        conn.framed
            .send(Bytes::from(bytes))
            .await
            .map_err(NodeError::Io)
    }

    /// Sends the token to the successor.
    ///
    /// In a closed loop success is assumed without an acknowledgement;
    /// otherwise this blocks (bounded) for a TOKEN_ACK on the successor
    /// link. `false` signals successor loss to the caller.
    pub(crate) async fn forward_token(&mut self, ack_timeout: Duration) -> bool {
        let message = Message::new(self.self_id, Payload::Token);
        if let Err(error) = self.send(&message).await {
            warn!(error = %error, "Failed to send token to successor.");
            return false;
        }

        if self.is_closed_loop() {
            return true;
        }

        self.await_token_ack(ack_timeout).await
    }

    /// Waits for a TOKEN_ACK from the successor. The successor only ever
    /// writes acknowledgements back over this connection.
    async fn await_token_ack(&mut self, timeout: Duration) -> bool {
        let conn = match self.current.as_mut() {
            Some(conn) => conn,
            None => return false,
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = match tokio::time::timeout_at(deadline, conn.framed.next()).await {
                Err(_elapsed) => {
                    warn!("Timed out waiting on token ACK.");
                    return false;
                },
                Ok(None) => return false,
                Ok(Some(Err(error))) => {
                    warn!(error = %error, "Successor link failed while awaiting ACK.");
                    return false;
                },
                Ok(Some(Ok(frame))) => frame,
            };

            match wire::decode(&frame) {
                Ok(message) if matches!(message.payload, Payload::TokenAck) => return true,
                Ok(message) => {
                    debug!(payload = ?message.payload, "Ignoring unexpected frame while awaiting ACK.");
                },
                Err(error) => {
                    warn!(error = %error, "Discarding malformed frame while awaiting ACK.");
                },
            }
        }
    }
}

/// Runs the predecessor side of the ring: accept one inbound connection at a
/// time, decode its frames into [RingEvent]s, write TOKEN_ACKs on command,
/// and go back to accepting whenever the connection dies.
pub(crate) fn spawn_predecessor_task(
    self_id: NodeId,
    listener: TcpListener,
    events: flume::Sender<RingEvent>,
    commands: flume::Receiver<PredecessorCommand>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, remote) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(error) => {
                        warn!(error = %error, "Failed to accept predecessor connection.");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    },
                },
                _ = shutdown.changed() => return,
            };

            if stream.set_nodelay(true).is_err() {
                continue;
            }

            debug!(remote = %remote, "Predecessor connected.");
            if events
                .send_async(RingEvent::PredecessorConnected(remote))
                .await
                .is_err()
            {
                return;
            }

            let mut link = framed(stream);
            loop {
                tokio::select! {
                    frame = link.next() => match frame {
                        Some(Ok(bytes)) => match wire::decode(&bytes) {
                            Ok(message) => {
                                if events.send_async(RingEvent::Frame(message)).await.is_err() {
                                    return;
                                }
                            },
                            Err(error) => {
                                warn!(error = %error, "Discarding malformed ring frame.");
                            },
                        },
                        Some(Err(error)) => {
                            warn!(error = %error, "Predecessor link failed.");
                            break;
                        },
                        None => {
                            debug!("Predecessor closed the link.");
                            break;
                        },
                    },
                    command = commands.recv_async() => match command {
                        Ok(PredecessorCommand::SendTokenAck) => {
                            let ack = Message::new(self_id, Payload::TokenAck);
                            let bytes = match wire::encode(&ack) {
                                Ok(bytes) => bytes,
                                Err(error) => {
                                    warn!(error = %error, "Failed to encode token ACK.");
                                    continue;
                                },
                            };

                            if let Err(error) = link.send(Bytes::from(bytes)).await {
                                warn!(error = %error, "Failed to send token ACK to predecessor.");
                                break;
                            }
                        },
                        Err(_closed) => return,
                    },
                    _ = shutdown.changed() => return,
                }
            }

            if events.send_async(RingEvent::PredecessorLost).await.is_err() {
                return;
            }
        }
    })
}
