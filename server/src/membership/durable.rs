//! Collaborator traits for the two durable stores the core depends on but
//! does not own (spec §1/§6): the referee-decision cache and the node's own
//! control file. A third trait, [`TwoPhaseStore`], stands in for the
//! prepared-transaction log consulted when answering `POLL_REQUEST`.
//!
//! All three are async: `redb` itself is a synchronous embedded store, but
//! the `postgres` feature's `sqlx` backing genuinely needs to await, so the
//! trait boundary is async uniformly rather than forcing callers to special
//! case one backend. The `redb` implementations below simply have no
//! `.await` points worth yielding on.

use async_trait::async_trait;
use mm_wire::node_mask::NodeId;
use mm_wire::status::TxState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backing store I/O error: {0}")]
    Io(#[from] anyhow::Error),
}

/// The `mtm.referee_decision` single-row key/value table (spec §6). Only
/// the `key = 'winner'` row is ever used.
#[async_trait]
pub trait RefereeStore: Send + Sync {
    async fn read_winner(&self) -> Result<Option<NodeId>, StoreError>;
    /// Inserts `node` as the winner, leaving any existing row untouched
    /// (mirrors the original's `on conflict(key) do nothing`), and returns
    /// whatever value was already stored, if any, so the caller can log a
    /// warning when it disagrees with `node`.
    async fn write_winner_if_absent(&self, node: NodeId) -> Result<Option<NodeId>, StoreError>;
    async fn delete_winner(&self) -> Result<(), StoreError>;
}

/// The node's own control file: persists the recovery donor across
/// restarts (spec §6, "Control file update").
#[async_trait]
pub trait ControlFile: Send + Sync {
    async fn set_recovery_donor(&self, donor: NodeId) -> Result<(), StoreError>;
    async fn recovery_donor(&self) -> Result<Option<NodeId>, StoreError>;
}

/// Stands in for the durable prepared-transaction log (spec §4.5 step 3,
/// §8 scenario 6): maps a global transaction id to its current 3PC state.
#[async_trait]
pub trait TwoPhaseStore: Send + Sync {
    async fn lookup(&self, gid: &str) -> Result<TxState, StoreError>;
}

/// An in-memory [`TwoPhaseStore`], useful for tests and for hosts that
/// haven't wired up the real prepared-transaction catalog yet.
#[derive(Debug, Default)]
pub struct InMemoryTwoPhaseStore {
    states: parking_lot::RwLock<std::collections::HashMap<String, TxState>>,
}

impl InMemoryTwoPhaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, gid: impl Into<String>, state: TxState) {
        self.states.write().insert(gid.into(), state);
    }
}

#[async_trait]
impl TwoPhaseStore for InMemoryTwoPhaseStore {
    async fn lookup(&self, gid: &str) -> Result<TxState, StoreError> {
        Ok(self.states.read().get(gid).copied().unwrap_or(TxState::NotFound))
    }
}

#[cfg(feature = "redb")]
pub mod redb_backed {
    use super::{ControlFile, NodeId, RefereeStore, StoreError};
    use async_trait::async_trait;
    use redb::{Database, ReadableTable, TableDefinition};
    use std::sync::Arc;

    const REFEREE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("referee_decision");
    const CONTROL_TABLE: TableDefinition<&str, u64> = TableDefinition::new("control_file");

    fn io_err<E: std::fmt::Display>(e: E) -> StoreError {
        StoreError::Io(anyhow::anyhow!("{e}"))
    }

    /// `redb`-backed [`RefereeStore`]: the default reference implementation
    /// of the single-row `referee_decision` table (spec §6).
    pub struct RedbRefereeStore {
        db: Arc<Database>,
    }

    impl RedbRefereeStore {
        #[must_use]
        pub fn new(db: Arc<Database>) -> Self {
            RedbRefereeStore { db }
        }
    }

    #[async_trait]
    impl RefereeStore for RedbRefereeStore {
        async fn read_winner(&self) -> Result<Option<NodeId>, StoreError> {
            let txn = self.db.begin_read().map_err(io_err)?;
            let table = match txn.open_table(REFEREE_TABLE) {
                Ok(t) => t,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(io_err(e)),
            };
            Ok(table.get("winner").map_err(io_err)?.map(|v| v.value() as NodeId))
        }

        async fn write_winner_if_absent(&self, node: NodeId) -> Result<Option<NodeId>, StoreError> {
            let existing = self.read_winner().await?;
            if existing.is_some() {
                return Ok(existing);
            }
            let txn = self.db.begin_write().map_err(io_err)?;
            {
                let mut table = txn.open_table(REFEREE_TABLE).map_err(io_err)?;
                table.insert("winner", u64::from(node)).map_err(io_err)?;
            }
            txn.commit().map_err(io_err)?;
            Ok(None)
        }

        async fn delete_winner(&self) -> Result<(), StoreError> {
            let txn = self.db.begin_write().map_err(io_err)?;
            {
                match txn.open_table(REFEREE_TABLE) {
                    Ok(mut table) => {
                        table.remove("winner").map_err(io_err)?;
                    }
                    Err(redb::TableError::TableDoesNotExist(_)) => {}
                    Err(e) => return Err(io_err(e)),
                }
            }
            txn.commit().map_err(io_err)?;
            Ok(())
        }
    }

    /// `redb`-backed [`ControlFile`].
    pub struct RedbControlFile {
        db: Arc<Database>,
    }

    impl RedbControlFile {
        #[must_use]
        pub fn new(db: Arc<Database>) -> Self {
            RedbControlFile { db }
        }
    }

    #[async_trait]
    impl ControlFile for RedbControlFile {
        async fn set_recovery_donor(&self, donor: NodeId) -> Result<(), StoreError> {
            let txn = self.db.begin_write().map_err(io_err)?;
            {
                let mut table = txn.open_table(CONTROL_TABLE).map_err(io_err)?;
                table.insert("recovery_donor", u64::from(donor)).map_err(io_err)?;
            }
            txn.commit().map_err(io_err)?;
            Ok(())
        }

        async fn recovery_donor(&self) -> Result<Option<NodeId>, StoreError> {
            let txn = self.db.begin_read().map_err(io_err)?;
            let table = match txn.open_table(CONTROL_TABLE) {
                Ok(t) => t,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(io_err(e)),
            };
            Ok(table
                .get("recovery_donor")
                .map_err(io_err)?
                .map(|v| v.value() as NodeId))
        }
    }

}

#[cfg(feature = "postgres")]
pub mod sqlx_backed {
    use super::{ControlFile, NodeId, RefereeStore, StoreError};
    use async_trait::async_trait;
    use sqlx::PgPool;

    fn io_err<E: std::fmt::Display>(e: E) -> StoreError {
        StoreError::Io(anyhow::anyhow!("{e}"))
    }

    /// `sqlx`/Postgres-backed [`RefereeStore`], for deployments that keep
    /// the multimaster schema (`mtm.referee_decision`) in the same cluster
    /// the node itself replicates, rather than in an embedded `redb` file.
    pub struct SqlxRefereeStore {
        pool: PgPool,
    }

    impl SqlxRefereeStore {
        #[must_use]
        pub fn new(pool: PgPool) -> Self {
            SqlxRefereeStore { pool }
        }
    }

    #[async_trait]
    impl RefereeStore for SqlxRefereeStore {
        async fn read_winner(&self) -> Result<Option<NodeId>, StoreError> {
            let row: Option<(i32,)> =
                sqlx::query_as("select node_id from mtm.referee_decision where key = 'winner'")
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(io_err)?;
            Ok(row.map(|(id,)| id as NodeId))
        }

        async fn write_winner_if_absent(&self, node: NodeId) -> Result<Option<NodeId>, StoreError> {
            let existing = self.read_winner().await?;
            sqlx::query(
                "insert into mtm.referee_decision values ('winner', $1) on conflict(key) do nothing",
            )
            .bind(node as i32)
            .execute(&self.pool)
            .await
            .map_err(io_err)?;
            Ok(existing)
        }

        async fn delete_winner(&self) -> Result<(), StoreError> {
            sqlx::query("delete from mtm.referee_decision where key = 'winner'")
                .execute(&self.pool)
                .await
                .map_err(io_err)?;
            Ok(())
        }
    }

    /// `sqlx`/Postgres-backed [`ControlFile`], storing the recovery donor in
    /// the same single-row-per-key convention as the referee table.
    pub struct SqlxControlFile {
        pool: PgPool,
    }

    impl SqlxControlFile {
        #[must_use]
        pub fn new(pool: PgPool) -> Self {
            SqlxControlFile { pool }
        }
    }

    #[async_trait]
    impl ControlFile for SqlxControlFile {
        async fn set_recovery_donor(&self, donor: NodeId) -> Result<(), StoreError> {
            sqlx::query(
                "insert into mtm.control_file(key, node_id) values ('recovery_donor', $1) \
                 on conflict(key) do update set node_id = excluded.node_id",
            )
            .bind(donor as i32)
            .execute(&self.pool)
            .await
            .map_err(io_err)?;
            Ok(())
        }

        async fn recovery_donor(&self) -> Result<Option<NodeId>, StoreError> {
            let row: Option<(i32,)> =
                sqlx::query_as("select node_id from mtm.control_file where key = 'recovery_donor'")
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(io_err)?;
            Ok(row.map(|(id,)| id as NodeId))
        }
    }
}
