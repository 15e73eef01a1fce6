use std::io;

use thiserror::Error;
use tokenring_directory::DirectoryError;

use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{0}")]
    /// An IO error has occurred.
    Io(#[from] io::Error),

    #[error(transparent)]
    /// The membership directory failed; the in-progress ring mutation must
    /// be considered failed.
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    /// A message could not be encoded or decoded.
    Wire(#[from] WireError),

    #[error("no coordinator is recorded in the directory")]
    /// The node needed a coordinator (join, successor request) but the
    /// directory holds no coordinator flag.
    NoCoordinator,

    #[error("no successor assignment arrived after {tries} attempts")]
    /// Bounded retries for a successor assignment were exhausted.
    SuccessorTimeout { tries: u32 },

    #[error("node {0} is missing from the directory snapshot")]
    /// The node's own ID (or a peer it must talk to) is not present in the
    /// address table built from the directory.
    UnknownPeer(tokenring_directory::NodeId),
}
