//! Persistent transaction log
//!
//! `SQLite` store owned exclusively by the transaction manager. The
//! `prepared` transition is written and committed before any 2PC decision
//! leaves the manager; every other transition is batched and flushed at
//! idle. On restart, surviving `prepared` rows are re-driven to completion.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{Pool, Row, Sqlite, migrate::Migrator};
use tracing::{info, instrument};

use crate::domain_types::{ResourceId, Xid};
use crate::error::Result;

static MIGRATOR: Migrator = sqlx::migrate!("migrations/transaction");

/// Logged state values; stable in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum LoggedState {
    /// Every participant voted yes; the decision is commit
    Prepared = 10,
    /// The decision has been carried out everywhere
    Committed = 30,
    /// The transaction was rolled back
    RolledBack = 40,
    /// A resource decided unilaterally; operator evidence
    Heuristic = 50,
}

impl LoggedState {
    fn from_value(value: i64) -> Self {
        match value {
            10 => Self::Prepared,
            30 => Self::Committed,
            40 => Self::RolledBack,
            _ => Self::Heuristic,
        }
    }
}

/// A surviving row, replayed on restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    /// Transaction identity
    pub trid: Xid,
    /// Logged state at the time of the crash
    pub state: LoggedState,
    /// Resources the decision must reach
    pub resources: Vec<ResourceId>,
}

#[derive(Debug)]
enum Operation {
    Remove { trid: Xid },
}

/// The log: a pool plus the batch of not-yet-durable transitions
pub struct Log {
    pool: Pool<Sqlite>,
    batch: Vec<Operation>,
    /// Durable (immediate) writes since open
    pub writes: u64,
    /// Batched writes since open
    pub batched: u64,
}

impl Log {
    /// Opens (or creates) the log store and runs migrations
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be opened or migrated; this is fatal for
    /// the owning manager.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            // prepare durability is the contract; FULL keeps the fsync at
            // transaction commit
            .pragma("synchronous", "FULL");

        let pool = SqlitePool::connect_with(options).await?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|error| crate::error::CasualError::Storage {
                source: Box::new(sqlx::Error::Migrate(Box::new(error))),
            })?;

        info!(path = %path.display(), "transaction log open");
        Ok(Self {
            pool,
            batch: Vec::new(),
            writes: 0,
            batched: 0,
        })
    }

    /// In-memory log for tests and transient domains
    ///
    /// # Errors
    ///
    /// Fails when the in-memory store cannot be created.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // one connection: each in-memory connection is its own database
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|error| crate::error::CasualError::Storage {
                source: Box::new(sqlx::Error::Migrate(Box::new(error))),
            })?;
        Ok(Self {
            pool,
            batch: Vec::new(),
            writes: 0,
            batched: 0,
        })
    }

    fn encode_resources(resources: &[ResourceId]) -> String {
        serde_json::to_string(&resources.iter().map(|id| u64::from(*id)).collect::<Vec<_>>())
            .unwrap_or_else(|_| "[]".into())
    }

    fn decode_resources(raw: &str) -> Vec<ResourceId> {
        serde_json::from_str::<Vec<u64>>(raw)
            .unwrap_or_default()
            .into_iter()
            .map(ResourceId::new)
            .collect()
    }

    /// Durably records the `prepared` transition; returns only after the
    /// row is committed to the store
    ///
    /// # Errors
    ///
    /// Propagates store failures; the 2PC decision must not be released
    /// when this fails.
    #[instrument(skip(self, resources), fields(%trid))]
    pub async fn prepare(&mut self, trid: Xid, resources: &[ResourceId]) -> Result<()> {
        let now = unix_now();
        sqlx::query(
            r"
            INSERT OR REPLACE INTO transaction_log
                (gtrid, bqual, state, resources, started_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?);
            ",
        )
        .bind(trid.gtrid.to_string())
        .bind(trid.bqual.to_string())
        .bind(LoggedState::Prepared as i64)
        .bind(Self::encode_resources(resources))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.writes += 1;
        Ok(())
    }

    /// Durably records a heuristic outcome with its evidence
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn heuristic(&mut self, trid: Xid, resources: &[ResourceId]) -> Result<()> {
        let now = unix_now();
        sqlx::query(
            r"
            INSERT OR REPLACE INTO transaction_log
                (gtrid, bqual, state, resources, started_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?);
            ",
        )
        .bind(trid.gtrid.to_string())
        .bind(trid.bqual.to_string())
        .bind(LoggedState::Heuristic as i64)
        .bind(Self::encode_resources(resources))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.writes += 1;
        Ok(())
    }

    /// Batches the `committed` transition: the prepared row is removed at
    /// the next flush
    pub fn committed(&mut self, trid: Xid) {
        self.batch.push(Operation::Remove { trid });
    }

    /// Batches the `rolled back` transition
    pub fn rolled_back(&mut self, trid: Xid) {
        self.batch.push(Operation::Remove { trid });
    }

    /// Flushes the batch in one store transaction; called at loop idle
    ///
    /// # Errors
    ///
    /// Propagates store failures; the batch is retained for a later flush.
    pub async fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let mut store = self.pool.begin().await?;
        for operation in &self.batch {
            let Operation::Remove { trid } = operation;
            sqlx::query(r"DELETE FROM transaction_log WHERE gtrid = ? AND bqual = ?;")
                .bind(trid.gtrid.to_string())
                .bind(trid.bqual.to_string())
                .execute(&mut *store)
                .await?;
        }
        store.commit().await?;
        self.batched += self.batch.len() as u64;
        self.batch.clear();
        Ok(())
    }

    /// Rows that survived a crash: `prepared` transactions to re-drive and
    /// `heuristic` evidence for operators
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn recover(&self) -> Result<Vec<Recovered>> {
        let rows = sqlx::query(
            r"SELECT gtrid, bqual, state, resources FROM transaction_log ORDER BY started_at;",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = Vec::with_capacity(rows.len());
        for row in rows {
            let gtrid: String = row.get("gtrid");
            let bqual: String = row.get("bqual");
            let (Ok(gtrid), Ok(bqual)) = (gtrid.parse(), bqual.parse()) else {
                continue;
            };
            recovered.push(Recovered {
                trid: Xid { gtrid, bqual },
                state: LoggedState::from_value(row.get("state")),
                resources: Self::decode_resources(&row.get::<String, _>("resources")),
            });
        }
        Ok(recovered)
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepared_row_survives_and_recovers() {
        let mut log = Log::in_memory().await.expect("opens");
        let trid = Xid::generate();
        let resources = vec![ResourceId::new(1), ResourceId::new(2)];

        log.prepare(trid, &resources).await.expect("writes");

        let recovered = log.recover().await.expect("reads");
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].trid, trid);
        assert_eq!(recovered[0].state, LoggedState::Prepared);
        assert_eq!(recovered[0].resources, resources);
    }

    #[tokio::test]
    async fn committed_removes_at_flush() {
        let mut log = Log::in_memory().await.expect("opens");
        let trid = Xid::generate();
        log.prepare(trid, &[ResourceId::new(1)]).await.expect("writes");

        log.committed(trid);
        // not yet durable: still recoverable before the flush
        assert_eq!(log.recover().await.expect("reads").len(), 1);

        log.flush().await.expect("flushes");
        assert!(log.recover().await.expect("reads").is_empty());
    }

    #[tokio::test]
    async fn heuristic_evidence_is_kept() {
        let mut log = Log::in_memory().await.expect("opens");
        let trid = Xid::generate();
        log.heuristic(trid, &[ResourceId::new(7)]).await.expect("writes");

        let recovered = log.recover().await.expect("reads");
        assert_eq!(recovered[0].state, LoggedState::Heuristic);
    }

    #[tokio::test]
    async fn file_backed_log_reopens() {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("transaction.log.db");
        let trid = Xid::generate();

        {
            let mut log = Log::open(&path).await.expect("opens");
            log.prepare(trid, &[ResourceId::new(3)]).await.expect("writes");
        }

        let log = Log::open(&path).await.expect("reopens");
        let recovered = log.recover().await.expect("reads");
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].trid, trid);
    }
}
