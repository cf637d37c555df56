//! Store adapter: the only module that talks to the persistent store.
//!
//! The broker needs four primitives from its store: durable insert, an
//! atomic find-and-update (the claim), bulk conditional update with a
//! limit, and count-by-predicate. This module binds them to SQLite through
//! sqlx; any store offering the same guarantees could replace it behind
//! the same interface.
//!
//! Claim atomicity is delegated to the store: the claim is a single
//! `UPDATE ... WHERE id = (SELECT ... LIMIT 1) RETURNING *` statement, so
//! no two concurrent callers can receive the same row. The adapter holds
//! no in-process locks.

use chrono::Utc;
use sqlx::{
    sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::{
    config::Config,
    error::{Error, Result},
    message::{Message, MessageFilter},
};

/// Handle to the message store. Cheap to clone; all clones share one
/// connection pool, opened once at construction and closed by the broker
/// at shutdown.
#[derive(Clone)]
pub struct Store {
    db: SqlitePool,
}

impl Store {
    pub async fn connect() -> Result<Self> {
        Self::connect_with(&Config::default()).await
    }

    pub async fn connect_with(config: &Config) -> Result<Self> {
        let opts = if let Some(path) = &config.db_path {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        let mut pool_opts = SqlitePoolOptions::new();
        if config.db_path.is_none() {
            // Each SQLite connection gets its own private in-memory
            // database; a single long-lived connection keeps it alive.
            pool_opts = pool_opts
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { db: pool })
    }

    /// Inserts a new pending message and returns its id.
    pub async fn insert(
        &self,
        queue: impl AsRef<str>,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (queue, payload, created_at) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(queue.as_ref())
        .bind(sqlx::types::Json(payload))
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await?;

        Ok(id)
    }

    /// Atomically claims the oldest pending message in `queue`, flipping it
    /// to processing. Returns `None` when the queue is empty; that is the
    /// normal idle signal, not an error.
    ///
    /// Failed messages (error set) are not eligible; they stay parked until
    /// [`Store::clear_errors`] returns them to pending.
    pub async fn claim_next(&self, queue: impl AsRef<str>) -> Result<Option<Message>> {
        let claimed = sqlx::query_as(
            "UPDATE messages
             SET processing = TRUE, processing_started_at = $2
             WHERE id = (
                 SELECT id FROM messages
                 WHERE queue = $1
                   AND processed = FALSE
                   AND processing = FALSE
                   AND error IS NULL
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(queue.as_ref())
        .bind(Utc::now())
        .fetch_optional(&self.db)
        .await?;

        Ok(claimed)
    }

    /// Records successful completion. Idempotent: repeating the call is a
    /// no-op update; the first completion timestamp is preserved.
    pub async fn mark_processed(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE messages
             SET processed = TRUE, processed_at = COALESCE(processed_at, $2),
                 processing = FALSE, error = NULL, error_at = NULL
             WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(id));
        }

        Ok(())
    }

    /// Records a failed attempt, releasing the claim. The message keeps
    /// `processed = false` but is parked behind its error until retried.
    pub async fn mark_failed(&self, id: i64, error: impl AsRef<str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE messages
             SET processing = FALSE, error = $2, error_at = $3
             WHERE id = $1",
        )
        .bind(id)
        .bind(error.as_ref())
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(id));
        }

        Ok(())
    }

    /// Fetches one message by id, for inspection of the audit trail.
    pub async fn find(&self, id: i64) -> Result<Option<Message>> {
        Ok(sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    /// Counts messages in `queue` matching `filter`.
    pub async fn count(&self, queue: impl AsRef<str>, filter: MessageFilter) -> Result<u64> {
        let query = match filter {
            MessageFilter::Pending => {
                "SELECT COUNT(*) FROM messages
                 WHERE queue = $1 AND processed = FALSE AND processing = FALSE
                   AND error IS NULL"
            }
            MessageFilter::Processing => {
                "SELECT COUNT(*) FROM messages WHERE queue = $1 AND processing = TRUE"
            }
            MessageFilter::Processed => {
                "SELECT COUNT(*) FROM messages WHERE queue = $1 AND processed = TRUE"
            }
            MessageFilter::Failed => {
                "SELECT COUNT(*) FROM messages WHERE queue = $1 AND error IS NOT NULL"
            }
        };

        let count: i64 = sqlx::query_scalar(query)
            .bind(queue.as_ref())
            .fetch_one(&self.db)
            .await?;

        Ok(count as u64)
    }

    /// Bulk-resets up to `limit` failed messages in `queue` back to
    /// pending, oldest first, clearing their error fields. `created_at` is
    /// untouched, so retried messages keep their place in claim order.
    pub async fn clear_errors(&self, queue: impl AsRef<str>, limit: u64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages
             SET processed = FALSE, processing = FALSE, error = NULL, error_at = NULL
             WHERE id IN (
                 SELECT id FROM messages
                 WHERE queue = $1 AND error IS NOT NULL
                 ORDER BY created_at ASC, id ASC
                 LIMIT $2
             )",
        )
        .bind(queue.as_ref())
        .bind(limit as i64)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Closes the connection pool. Safe to call more than once.
    pub async fn close(&self) {
        self.db.close().await;
    }
}
