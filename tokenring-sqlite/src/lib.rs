mod db;
mod from_row_impl;

use std::path::Path;

use async_trait::async_trait;
pub use db::FromRow;
use rusqlite::Row;
use tokenring_directory::{Directory, DirectoryError, NodeId, VirtualNode};
use tracing::info;

const NODE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    node_id           INTEGER NOT NULL,
    address           TEXT NOT NULL,
    coordination_port INTEGER NOT NULL,
    client_port       INTEGER NOT NULL,
    successor_id      INTEGER,
    PRIMARY KEY (node_id),
    FOREIGN KEY (successor_id) REFERENCES nodes (node_id)
);
CREATE TABLE IF NOT EXISTS coordinator (
    single_row_lock INTEGER NOT NULL PRIMARY KEY CHECK (single_row_lock = 1),
    coordinator_id  INTEGER,
    FOREIGN KEY (coordinator_id) REFERENCES nodes (node_id) ON DELETE SET NULL
);
";

const DROP_EVERYTHING: &str = "
DROP TABLE IF EXISTS coordinator;
DROP TABLE IF EXISTS nodes;
";

const SELECT_ALL: &str = "
    SELECT n.node_id, n.address, n.coordination_port, n.client_port,
           n.successor_id, c.coordinator_id
    FROM nodes n
    LEFT JOIN coordinator c ON c.single_row_lock = 1";

const SELECT_ALL_WITH_SUCCESSOR: &str = "
    SELECT n.node_id, n.address, n.coordination_port, n.client_port,
           n.successor_id, c.coordinator_id
    FROM nodes n
    LEFT JOIN coordinator c ON c.single_row_lock = 1
    WHERE n.successor_id IS NOT NULL";

const SELECT_IN_RING_WITH_ID_GREATER_THAN: &str = "
    SELECT n.node_id, n.address, n.coordination_port, n.client_port,
           n.successor_id, c.coordinator_id
    FROM nodes n
    LEFT JOIN coordinator c ON c.single_row_lock = 1
    WHERE n.successor_id IS NOT NULL AND n.node_id > ?";

const COUNT_NODES: &str = "SELECT count(*) FROM nodes";
const COUNT_NODES_IN_RING: &str =
    "SELECT count(*) FROM nodes WHERE successor_id IS NOT NULL";

const INSERT_NODE: &str = "
    INSERT INTO nodes (node_id, address, coordination_port, client_port, successor_id)
    VALUES (?, ?, ?, ?, NULL)";

const SET_SUCCESSOR: &str = "UPDATE nodes SET successor_id = ?1 WHERE node_id = ?2";

const NODE_EXISTS: &str = "SELECT 1 FROM nodes WHERE node_id = ?";

const UPSERT_COORDINATOR: &str = "
    INSERT INTO coordinator (single_row_lock, coordinator_id) VALUES (1, ?1)
    ON CONFLICT (single_row_lock)
    DO UPDATE SET coordinator_id = excluded.coordinator_id";

const CLAIM_COORDINATOR: &str = "
    INSERT INTO coordinator (single_row_lock, coordinator_id) VALUES (1, ?1)
    ON CONFLICT (single_row_lock)
    DO UPDATE SET coordinator_id = excluded.coordinator_id
    WHERE coordinator.coordinator_id IS NULL";

const SELECT_COORDINATOR: &str =
    "SELECT coordinator_id FROM coordinator WHERE single_row_lock = 1";

#[derive(Debug, thiserror::Error)]
pub enum SqliteDirectoryError {
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),
}

/// A [tokenring_directory::Directory] implementation based on an SQLite database.
///
/// All operations run on a dedicated connection thread; the multi-row ring
/// mutations execute inside one transaction so a half-applied splice is never
/// observable.
pub struct SqliteDirectory {
    inner: db::DatabaseHandle,
}

impl SqliteDirectory {
    /// Opens a SQLite-backed directory in the given path.
    ///
    /// If the database does not already exist it will be created.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, SqliteDirectoryError> {
        let inner = db::DatabaseHandle::open(path.as_ref()).await?;
        Ok(Self { inner })
    }

    /// Opens the directory after dropping any existing state, mirroring a
    /// full system restart.
    pub async fn open_full_restart<P: AsRef<Path>>(
        path: P,
    ) -> Result<Self, SqliteDirectoryError> {
        let directory = Self::open(path).await?;
        directory
            .inner
            .submit_task(|conn| conn.execute_batch(DROP_EVERYTHING))
            .await?;

        info!("Dropped existing ring state for a full restart.");
        Ok(directory)
    }

    /// Opens a new in-memory directory, mostly useful for testing.
    pub async fn open_in_memory() -> Result<Self, SqliteDirectoryError> {
        let inner = db::DatabaseHandle::open_in_memory().await?;
        Ok(Self { inner })
    }

    /// Applies a batch of successor updates in one transaction, rolling the
    /// whole batch back if any referenced node is missing.
    async fn set_successors_atomically(
        &self,
        updates: Vec<(Option<NodeId>, NodeId)>,
    ) -> Result<(), DirectoryError> {
        let outcome = self
            .inner
            .submit_task(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(SET_SUCCESSOR)?;
                    for (successor_id, node_id) in updates {
                        if stmt.execute((successor_id, node_id))? == 0 {
                            // Dropping the transaction rolls back the rows
                            // already touched.
                            return Ok(Err(node_id));
                        }
                    }
                }
                tx.commit()?;
                Ok(Ok(()))
            })
            .await
            .map_err(store_error)?;

        outcome.map_err(DirectoryError::UnknownNode)
    }
}

fn store_error(error: rusqlite::Error) -> DirectoryError {
    DirectoryError::Store(error.into())
}

/// Database representation of one node row, including the joined
/// coordinator flag.
struct NodeRow(VirtualNode);

impl FromRow for NodeRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let node_id: NodeId = row.get(0)?;
        let coordinator_id: Option<NodeId> = row.get(5)?;

        Ok(NodeRow(VirtualNode {
            node_id,
            address: row.get(1)?,
            coordination_port: row.get(2)?,
            client_port: row.get(3)?,
            successor_id: row.get(4)?,
            is_coordinator: coordinator_id == Some(node_id),
        }))
    }
}

#[async_trait]
impl Directory for SqliteDirectory {
    async fn initialize(&self, seed: &[VirtualNode]) -> Result<(), DirectoryError> {
        let seed = seed.to_vec();
        self.inner
            .submit_task(move |conn| {
                conn.execute_batch(NODE_SCHEMA)?;

                let count: u32 =
                    conn.query_row(COUNT_NODES, (), |row| row.get(0))?;
                if count != 0 {
                    return Ok(());
                }

                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(INSERT_NODE)?;
                    for node in seed {
                        stmt.execute((
                            node.node_id,
                            node.address,
                            node.coordination_port,
                            node.client_port,
                        ))?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(store_error)
    }

    async fn get_all_nodes(&self) -> Result<Vec<VirtualNode>, DirectoryError> {
        let rows = self
            .inner
            .fetch_all::<_, NodeRow>(SELECT_ALL, ())
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn get_all_nodes_with_successors(&self) -> Result<Vec<VirtualNode>, DirectoryError> {
        let rows = self
            .inner
            .fetch_all::<_, NodeRow>(SELECT_ALL_WITH_SUCCESSOR, ())
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn ring_size(&self) -> Result<usize, DirectoryError> {
        let count = self
            .inner
            .fetch_one::<_, (u32,)>(COUNT_NODES_IN_RING, ())
            .await
            .map_err(store_error)?
            .unwrap_or((0,));
        Ok(count.0 as usize)
    }

    async fn set_node_successor(
        &self,
        node_id: NodeId,
        successor_id: NodeId,
    ) -> Result<(), DirectoryError> {
        self.set_successors_atomically(vec![(Some(successor_id), node_id)])
            .await
    }

    async fn remove_node_successor(&self, node_id: NodeId) -> Result<(), DirectoryError> {
        self.set_successors_atomically(vec![(None, node_id)]).await
    }

    async fn insert_into_ring(
        &self,
        predecessor_id: NodeId,
        successor_id: NodeId,
        new_node_id: NodeId,
    ) -> Result<(), DirectoryError> {
        self.set_successors_atomically(vec![
            (Some(successor_id), new_node_id),
            (Some(new_node_id), predecessor_id),
        ])
        .await
    }

    async fn remove_from_ring(
        &self,
        predecessor_id: NodeId,
        successor_id: NodeId,
        removed_id: NodeId,
    ) -> Result<(), DirectoryError> {
        self.set_successors_atomically(vec![
            (Some(successor_id), predecessor_id),
            (None, removed_id),
        ])
        .await
    }

    async fn update_coordinator(&self, new_coordinator_id: NodeId) -> Result<(), DirectoryError> {
        let outcome = self
            .inner
            .submit_task(move |conn| {
                let known: Option<u32> = conn
                    .query_row(NODE_EXISTS, [new_coordinator_id], |row| row.get(0))
                    .map(Some)
                    .or_else(ignore_no_rows)?;
                if known.is_none() {
                    return Ok(Err(new_coordinator_id));
                }

                conn.execute(UPSERT_COORDINATOR, [new_coordinator_id])?;
                Ok(Ok(()))
            })
            .await
            .map_err(store_error)?;

        outcome.map_err(DirectoryError::UnknownNode)
    }

    async fn try_claim_coordinator(&self, candidate_id: NodeId) -> Result<bool, DirectoryError> {
        let outcome = self
            .inner
            .submit_task(move |conn| {
                let known: Option<u32> = conn
                    .query_row(NODE_EXISTS, [candidate_id], |row| row.get(0))
                    .map(Some)
                    .or_else(ignore_no_rows)?;
                if known.is_none() {
                    return Ok(Err(candidate_id));
                }

                conn.execute(CLAIM_COORDINATOR, [candidate_id])?;

                let current: Option<NodeId> = conn
                    .query_row(SELECT_COORDINATOR, (), |row| row.get(0))
                    .map(Some)
                    .or_else(ignore_no_rows)?
                    .flatten();

                Ok(Ok(current == Some(candidate_id)))
            })
            .await
            .map_err(store_error)?;

        outcome.map_err(DirectoryError::UnknownNode)
    }

    async fn nodes_in_ring_with_id_greater_than(
        &self,
        min_id: NodeId,
    ) -> Result<Vec<VirtualNode>, DirectoryError> {
        let rows = self
            .inner
            .fetch_all::<_, NodeRow>(SELECT_IN_RING_WITH_ID_GREATER_THAN, [min_id])
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }
}

fn ignore_no_rows<T>(error: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match error {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}
