//! # tokenring
//! A self-organising ring of peer processes: coordinator election with three
//! interchangeable algorithms, coordinator-mediated ring membership backed by
//! a durable directory, and a mutual-exclusion token circulated around the
//! ring.
//!
//! This is a convenience package re-exporting the sub-projects; realistically
//! you probably only want some of these:
//!
//! ### Features
//! - `tokenring-directory` - The membership directory trait, core types and
//!   the in-memory reference implementation.
//! - `tokenring-node` - The ring node itself: transports, elections and the
//!   node state machine.
//! - `sqlite` - A `Directory` implementation backed by SQLite.

#[cfg(feature = "tokenring-directory")]
pub use tokenring_directory as directory;
#[cfg(feature = "tokenring-node")]
pub use tokenring_node as node;
#[cfg(feature = "tokenring-sqlite")]
pub use tokenring_sqlite as sqlite;
