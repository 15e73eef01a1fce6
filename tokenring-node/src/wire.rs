//! Wire format shared by both transports.
//!
//! Every message is a bincode-encoded [Message]: the enum discriminants play
//! the role of the type tags. The control plane ships one message per UDP
//! datagram; the ring links wrap the same bytes in length-delimited frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokenring_directory::NodeId;

/// Upper bound for a control-plane datagram. There is no fragmentation
/// handling; anything larger is refused at the send site.
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode or decode message: {0}")]
    Codec(#[from] bincode::Error),

    #[error("message of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub src_id: NodeId,
    pub payload: Payload,
}

impl Message {
    pub fn new(src_id: NodeId, payload: Payload) -> Self {
        Self { src_id, payload }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// A successor request for a node wishing to join the ring.
    Join,
    /// Sent to the coordinator when a node loses contact with its successor.
    SuccessorRequest,
    /// Reply to a join or successor request carrying the node's new successor.
    Successor { successor_id: NodeId },
    /// The mutual-exclusion token.
    Token,
    /// Acknowledgement of a received token, sent over the predecessor link.
    TokenAck,
    /// Election traffic envelope.
    Election(ElectionHeader),
    /// Liveness beacon; receipt requires no reply.
    Keepalive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Which election algorithm a node runs. All three converge on the maximum
/// participating node ID; they differ in messaging pattern and transport.
pub enum ElectionMethod {
    /// Growing candidate roster forwarded around the ring.
    RingBased,
    /// Single surviving candidate forwarded around the ring.
    ChangRoberts,
    /// Timeout-driven election over the control plane.
    Bully,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Envelope nested inside [Payload::Election].
pub struct ElectionHeader {
    /// Election method that should be used to interpret the message.
    pub method: ElectionMethod,
    /// The message kind together with its method-specific payload.
    pub body: ElectionBody,
}

impl ElectionHeader {
    pub fn new(method: ElectionMethod, body: ElectionBody) -> Self {
        Self { method, body }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionBody {
    /// Ring-based election roster, growing hop by hop.
    Roster {
        originator: NodeId,
        candidates: Vec<NodeId>,
    },
    /// Chang-Roberts election carrying the current surviving candidate.
    Candidate { candidate_id: NodeId },
    /// Bully election announcement sent to higher-ID members.
    Election,
    /// A node has been 'bullied' into standing down: a higher-ID member took
    /// over the election.
    Ok,
    /// New coordinator announcement.
    Coordinator { coordinator_id: NodeId },
}

pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    Ok(bincode::serialize(message)?)
}

/// Encodes a message destined for a single datagram, refusing anything that
/// would need fragmentation.
pub fn encode_datagram(message: &Message) -> Result<Vec<u8>, WireError> {
    let bytes = encode(message)?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(WireError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
    Ok(bincode::deserialize(bytes)?)
}
