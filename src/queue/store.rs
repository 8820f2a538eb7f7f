//! Queue group store
//!
//! `SQLite` store owned exclusively by one queue group. Enqueues under a
//! transaction are invisible until commit; dequeues under a transaction
//! hold the message until commit removes it or rollback returns it with an
//! incremented redelivery count and a pushed `available_at`. Messages that
//! exhaust their retries move to the queue's error queue.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite, migrate::Migrator};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain_types::{QueueName, RetryCount, RetryDelayMs, Xid};
use crate::error::{CasualError, Result};
use crate::message::queue as message;

static MIGRATOR: Migrator = sqlx::migrate!("migrations/queue");

const STATE_ENQUEUED: i64 = 1;
const STATE_COMMITTED: i64 = 2;
const STATE_DEQUEUED: i64 = 3;

/// The store
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Opens (or creates) a store and runs migrations
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be opened; fatal for the owning group.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            .pragma("foreign_keys", "ON");
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        MIGRATOR.run(&pool).await.map_err(|error| CasualError::Storage {
            source: Box::new(sqlx::Error::Migrate(Box::new(error))),
        })?;
        info!(path = %path.display(), "queue store open");
        Ok(Self { pool })
    }

    /// In-memory store for tests and transient groups
    ///
    /// # Errors
    ///
    /// Fails when the in-memory store cannot be created.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // one connection: each in-memory connection is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await.map_err(|error| CasualError::Storage {
            source: Box::new(sqlx::Error::Migrate(Box::new(error))),
        })?;
        Ok(Self { pool })
    }

    /// Creates a queue and its error queue when missing
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    #[instrument(skip(self))]
    pub async fn create_queue(
        &self,
        name: &QueueName,
        retry_count: RetryCount,
        retry_delay: RetryDelayMs,
    ) -> Result<()> {
        let error_name = format!("{name}.error");

        sqlx::query(
            r"INSERT OR IGNORE INTO queues (name, retry_count, retry_delay_ms) VALUES (?, 0, 0);",
        )
        .bind(&error_name)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            INSERT OR IGNORE INTO queues (name, retry_count, retry_delay_ms, error_queue)
            VALUES (?, ?, ?, (SELECT id FROM queues WHERE name = ?));
            ",
        )
        .bind(name.to_string())
        .bind(i64::try_from(u64::from(retry_count)).unwrap_or(i64::MAX))
        .bind(i64::try_from(u64::from(retry_delay)).unwrap_or(i64::MAX))
        .bind(&error_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue_id(&self, name: &QueueName) -> Result<Option<i64>> {
        let row = sqlx::query(r"SELECT id FROM queues WHERE name = ?;")
            .bind(name.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("id")))
    }

    /// Enqueues a message; visible immediately without a transaction,
    /// on commit otherwise. Returns the message id, or `None` for an
    /// unknown queue.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn enqueue(
        &self,
        name: &QueueName,
        trid: Option<Xid>,
        message: &message::Message,
    ) -> Result<Option<Uuid>> {
        let Some(queue) = self.queue_id(name).await? else {
            return Ok(None);
        };

        let id = if message.id.is_nil() {
            Uuid::new_v4()
        } else {
            message.id
        };
        let state = if trid.is_some() {
            STATE_ENQUEUED
        } else {
            STATE_COMMITTED
        };

        sqlx::query(
            r"
            INSERT INTO messages
                (id, queue, gtrid, bqual, state, properties, reply, content_type,
                 payload, available_at, enqueued_at, redelivered)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0);
            ",
        )
        .bind(id.to_string())
        .bind(queue)
        .bind(trid.map(|trid| trid.gtrid.to_string()))
        .bind(trid.map(|trid| trid.bqual.to_string()))
        .bind(state)
        .bind(&message.properties)
        .bind(message.reply.as_ref().map(ToString::to_string))
        .bind(&message.r#type)
        .bind(&message.payload)
        .bind(to_millis(message.available))
        .bind(to_millis(message.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(Some(id))
    }

    /// Dequeues the oldest available message; held under the transaction
    /// when one is given, removed outright otherwise.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn dequeue(
        &self,
        name: &QueueName,
        trid: Option<Xid>,
        properties: Option<&str>,
    ) -> Result<Option<message::Message>> {
        let Some(queue) = self.queue_id(name).await? else {
            return Ok(None);
        };
        let now = to_millis(SystemTime::now());

        let row = match properties {
            Some(properties) => {
                sqlx::query(
                    r"
                    SELECT id, properties, reply, content_type, payload,
                           available_at, enqueued_at, redelivered
                    FROM messages
                    WHERE queue = ? AND state = ? AND available_at <= ? AND properties = ?
                    ORDER BY available_at, enqueued_at
                    LIMIT 1;
                    ",
                )
                .bind(queue)
                .bind(STATE_COMMITTED)
                .bind(now)
                .bind(properties)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r"
                    SELECT id, properties, reply, content_type, payload,
                           available_at, enqueued_at, redelivered
                    FROM messages
                    WHERE queue = ? AND state = ? AND available_at <= ?
                    ORDER BY available_at, enqueued_at
                    LIMIT 1;
                    ",
                )
                .bind(queue)
                .bind(STATE_COMMITTED)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        let Some(row) = row else { return Ok(None) };
        let message = parse_message(&row)?;

        match trid {
            Some(trid) => {
                sqlx::query(
                    r"UPDATE messages SET state = ?, gtrid = ?, bqual = ? WHERE id = ?;",
                )
                .bind(STATE_DEQUEUED)
                .bind(trid.gtrid.to_string())
                .bind(trid.bqual.to_string())
                .bind(message.id.to_string())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(r"DELETE FROM messages WHERE id = ?;")
                    .bind(message.id.to_string())
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(Some(message))
    }

    /// Commits a transaction's operations: held dequeues are removed,
    /// uncommitted enqueues become deliverable
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    #[instrument(skip(self), fields(%trid))]
    pub async fn commit(&self, trid: Xid) -> Result<()> {
        let mut store = self.pool.begin().await?;
        sqlx::query(r"DELETE FROM messages WHERE gtrid = ? AND bqual = ? AND state = ?;")
            .bind(trid.gtrid.to_string())
            .bind(trid.bqual.to_string())
            .bind(STATE_DEQUEUED)
            .execute(&mut *store)
            .await?;
        sqlx::query(
            r"
            UPDATE messages SET state = ?, gtrid = NULL, bqual = NULL
            WHERE gtrid = ? AND bqual = ? AND state = ?;
            ",
        )
        .bind(STATE_COMMITTED)
        .bind(trid.gtrid.to_string())
        .bind(trid.bqual.to_string())
        .bind(STATE_ENQUEUED)
        .execute(&mut *store)
        .await?;
        store.commit().await?;
        Ok(())
    }

    /// Rolls a transaction's operations back: uncommitted enqueues vanish;
    /// held dequeues return with `redelivered + 1` and `available_at`
    /// pushed by the queue's retry delay, or move to the error queue when
    /// retries are exhausted
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    #[instrument(skip(self), fields(%trid))]
    pub async fn rollback(&self, trid: Xid) -> Result<()> {
        let mut store = self.pool.begin().await?;
        sqlx::query(r"DELETE FROM messages WHERE gtrid = ? AND bqual = ? AND state = ?;")
            .bind(trid.gtrid.to_string())
            .bind(trid.bqual.to_string())
            .bind(STATE_ENQUEUED)
            .execute(&mut *store)
            .await?;

        let now = to_millis(SystemTime::now());

        // exhausted retries: park on the error queue, origin recorded
        sqlx::query(
            r"
            UPDATE messages SET
                state = ?, gtrid = NULL, bqual = NULL,
                redelivered = redelivered + 1,
                origin = queue,
                queue = (SELECT error_queue FROM queues WHERE id = messages.queue),
                available_at = ?
            WHERE gtrid = ? AND bqual = ? AND state = ?
              AND redelivered + 1 > (SELECT retry_count FROM queues WHERE id = messages.queue)
              AND (SELECT error_queue FROM queues WHERE id = messages.queue) IS NOT NULL;
            ",
        )
        .bind(STATE_COMMITTED)
        .bind(now)
        .bind(trid.gtrid.to_string())
        .bind(trid.bqual.to_string())
        .bind(STATE_DEQUEUED)
        .execute(&mut *store)
        .await?;

        // retry with delay
        sqlx::query(
            r"
            UPDATE messages SET
                state = ?, gtrid = NULL, bqual = NULL,
                redelivered = redelivered + 1,
                available_at = ? + (SELECT retry_delay_ms FROM queues WHERE id = messages.queue)
            WHERE gtrid = ? AND bqual = ? AND state = ?;
            ",
        )
        .bind(STATE_COMMITTED)
        .bind(now)
        .bind(trid.gtrid.to_string())
        .bind(trid.bqual.to_string())
        .bind(STATE_DEQUEUED)
        .execute(&mut *store)
        .await?;

        store.commit().await?;
        Ok(())
    }

    /// Moves error-queue messages back to their origin queue; returns the
    /// count moved
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn restore(&self, name: &QueueName) -> Result<u64> {
        let Some(queue) = self.queue_id(name).await? else {
            return Ok(0);
        };
        let now = to_millis(SystemTime::now());
        let result = sqlx::query(
            r"
            UPDATE messages SET queue = origin, origin = NULL, redelivered = 0, available_at = ?
            WHERE origin = ?
              AND queue = (SELECT error_queue FROM queues WHERE id = ?);
            ",
        )
        .bind(now)
        .bind(queue)
        .bind(queue)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Purges all messages of a queue; returns the count removed
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn clear(&self, name: &QueueName) -> Result<u64> {
        let Some(queue) = self.queue_id(name).await? else {
            return Ok(0);
        };
        let result = sqlx::query(r"DELETE FROM messages WHERE queue = ?;")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deliverable messages of a queue, oldest first, without consuming
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn peek(&self, name: &QueueName) -> Result<Vec<message::Message>> {
        let Some(queue) = self.queue_id(name).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r"
            SELECT id, properties, reply, content_type, payload,
                   available_at, enqueued_at, redelivered
            FROM messages
            WHERE queue = ? AND state = ?
            ORDER BY available_at, enqueued_at;
            ",
        )
        .bind(queue)
        .bind(STATE_COMMITTED)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            messages.push(parse_message(row)?);
        }
        Ok(messages)
    }

    /// Depth metrics per operator queue
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn information(&self) -> Result<Vec<message::Information>> {
        let rows = sqlx::query(
            r"
            SELECT q.name AS name,
                (SELECT COUNT(*) FROM messages m WHERE m.queue = q.id AND m.state = 2) AS count,
                (SELECT COUNT(*) FROM messages m WHERE m.queue = q.error_queue) AS error_count
            FROM queues q
            WHERE q.error_queue IS NOT NULL
            ORDER BY q.name;
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut information = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("name");
            let Ok(name) = QueueName::try_new(name) else {
                continue;
            };
            information.push(message::Information {
                name,
                count: row.get::<i64, _>("count").max(0) as u64,
                error_count: row.get::<i64, _>("error_count").max(0) as u64,
            });
        }
        Ok(information)
    }

    /// Earliest future availability on a queue, for waiter wakeup
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn earliest_available(&self, name: &QueueName) -> Result<Option<SystemTime>> {
        let Some(queue) = self.queue_id(name).await? else {
            return Ok(None);
        };
        let row = sqlx::query(
            r"SELECT MIN(available_at) AS at FROM messages WHERE queue = ? AND state = ?;",
        )
        .bind(queue)
        .bind(STATE_COMMITTED)
        .fetch_one(&self.pool)
        .await?;
        let at: Option<i64> = row.get("at");
        Ok(at.map(from_millis))
    }
}

fn to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

fn from_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(u64::try_from(millis).unwrap_or_default())
}

fn parse_message(row: &sqlx::sqlite::SqliteRow) -> Result<message::Message> {
    let id: String = row.get("id");
    let id = id.parse::<Uuid>().map_err(|error| CasualError::InvalidSemantics {
        reason: format!("message id is not a uuid: {error}"),
    })?;
    let reply: Option<String> = row.get("reply");
    Ok(message::Message {
        id,
        properties: row.get("properties"),
        reply: reply.and_then(|name| QueueName::try_new(name).ok()),
        r#type: row.get("content_type"),
        payload: row.get("payload"),
        available: from_millis(row.get("available_at")),
        timestamp: from_millis(row.get("enqueued_at")),
        redelivered: row.get::<i64, _>("redelivered").max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(value: &str) -> QueueName {
        QueueName::try_new(value).expect("valid name")
    }

    fn sample(payload: &[u8]) -> message::Message {
        message::Message {
            id: Uuid::nil(),
            properties: String::new(),
            reply: None,
            r#type: "application/octet-stream".into(),
            payload: payload.to_vec(),
            available: SystemTime::now(),
            timestamp: SystemTime::now(),
            redelivered: 0,
        }
    }

    async fn store_with_queue(retry_count: u64, retry_delay_ms: u64) -> Store {
        let store = Store::in_memory().await.expect("opens");
        store
            .create_queue(
                &name("q"),
                RetryCount::try_new(retry_count).expect("valid count"),
                RetryDelayMs::try_new(retry_delay_ms).expect("valid delay"),
            )
            .await
            .expect("creates");
        store
    }

    #[tokio::test]
    async fn enqueue_dequeue_without_transaction() {
        let store = store_with_queue(3, 0).await;
        let id = store
            .enqueue(&name("q"), None, &sample(b"payload"))
            .await
            .expect("enqueues")
            .expect("queue exists");

        let message = store
            .dequeue(&name("q"), None, None)
            .await
            .expect("dequeues")
            .expect("a message");
        assert_eq!(message.id, id);
        assert_eq!(message.payload, b"payload");

        // consumed
        assert!(store.dequeue(&name("q"), None, None).await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn transactional_enqueue_is_invisible_until_commit() {
        let store = store_with_queue(3, 0).await;
        let trid = Xid::generate();
        store
            .enqueue(&name("q"), Some(trid), &sample(b"m"))
            .await
            .expect("enqueues");

        assert!(store.dequeue(&name("q"), None, None).await.expect("ok").is_none());

        store.commit(trid).await.expect("commits");
        assert!(store.dequeue(&name("q"), None, None).await.expect("ok").is_some());
    }

    #[tokio::test]
    async fn rolled_back_enqueue_vanishes() {
        let store = store_with_queue(3, 0).await;
        let trid = Xid::generate();
        store
            .enqueue(&name("q"), Some(trid), &sample(b"m"))
            .await
            .expect("enqueues");
        store.rollback(trid).await.expect("rolls back");
        store.commit(trid).await.expect("commit of nothing");
        assert!(store.dequeue(&name("q"), None, None).await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn rollback_redelivers_with_delay() {
        let store = store_with_queue(10, 100).await;
        store
            .enqueue(&name("q"), None, &sample(b"m"))
            .await
            .expect("enqueues");

        let trid = Xid::generate();
        let message = store
            .dequeue(&name("q"), Some(trid), None)
            .await
            .expect("dequeues")
            .expect("a message");
        assert_eq!(message.redelivered, 0);

        store.rollback(trid).await.expect("rolls back");

        // immediately: nothing available, the delay pushed availability out
        assert!(store.dequeue(&name("q"), None, None).await.expect("ok").is_none());

        tokio::time::sleep(Duration::from_millis(120)).await;
        let again = store
            .dequeue(&name("q"), None, None)
            .await
            .expect("dequeues")
            .expect("available again");
        assert_eq!(again.redelivered, 1);
    }

    #[tokio::test]
    async fn retry_exhaustion_moves_to_error_queue_and_restore_returns() {
        let store = store_with_queue(0, 0).await;
        store
            .enqueue(&name("q"), None, &sample(b"m"))
            .await
            .expect("enqueues");

        let trid = Xid::generate();
        assert!(store
            .dequeue(&name("q"), Some(trid), None)
            .await
            .expect("ok")
            .is_some());
        store.rollback(trid).await.expect("rolls back");

        // exhausted: not on the queue any more
        assert!(store.dequeue(&name("q"), None, None).await.expect("ok").is_none());
        let information = store.information().await.expect("info");
        assert_eq!(information[0].error_count, 1);
        assert_eq!(information[0].count, 0);

        let restored = store.restore(&name("q")).await.expect("restores");
        assert_eq!(restored, 1);
        assert!(store.dequeue(&name("q"), None, None).await.expect("ok").is_some());
    }

    #[tokio::test]
    async fn clear_purges() {
        let store = store_with_queue(3, 0).await;
        for payload in [b"a".as_slice(), b"b", b"c"] {
            store
                .enqueue(&name("q"), None, &sample(payload))
                .await
                .expect("enqueues");
        }
        assert_eq!(store.clear(&name("q")).await.expect("clears"), 3);
        assert!(store.peek(&name("q")).await.expect("peeks").is_empty());
    }

    #[tokio::test]
    async fn dequeue_matches_properties() {
        let store = store_with_queue(3, 0).await;
        let mut tagged = sample(b"tagged");
        tagged.properties = "colour=red".into();
        store.enqueue(&name("q"), None, &sample(b"plain")).await.expect("ok");
        store.enqueue(&name("q"), None, &tagged).await.expect("ok");

        let message = store
            .dequeue(&name("q"), None, Some("colour=red"))
            .await
            .expect("dequeues")
            .expect("match");
        assert_eq!(message.payload, b"tagged");
    }
}
