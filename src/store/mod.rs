use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use multistream_db::{StreamDatabase, stream::StreamStatus};
use tokio::sync::Mutex;

use crate::types::{JobId, StreamJob};

#[cfg(test)]
pub mod memory;

/// Durable stream state the engine reads due work from and writes status to.
///
/// Every write is a single statement; there is no multi-step update to roll back.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Scheduled jobs due at `now` whose account is entitled to stream.
    async fn due_jobs(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<StreamJob>>;

    async fn load_job(&self, id: JobId) -> anyhow::Result<Option<StreamJob>>;

    /// Whether the account's entitlement flag allows streaming right now.
    async fn account_active(&self, account_id: i64) -> anyhow::Result<bool>;

    async fn mark_active(
        &self,
        id: JobId,
        started_at: DateTime<Utc>,
        log_path: &Path,
    ) -> anyhow::Result<()>;

    async fn mark_finished(
        &self,
        id: JobId,
        status: StreamStatus,
        ended_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Fails every job still recorded as active. Returns how many were touched.
    async fn fail_orphaned(&self, reason: &str, at: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// [`StatusStore`] over the turso stream database.
pub struct DbStatusStore {
    conn: Mutex<turso::Connection>,
}

impl DbStatusStore {
    pub fn new(db: &StreamDatabase) -> anyhow::Result<Self> {
        Ok(Self {
            conn: Mutex::new(db.connect()?),
        })
    }
}

#[async_trait]
impl StatusStore for DbStatusStore {
    async fn due_jobs(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<StreamJob>> {
        let conn = self.conn.lock().await;
        let rows = multistream_db::stream::due(now, &conn).await?;
        Ok(rows.into_iter().map(StreamJob::from).collect())
    }

    async fn load_job(&self, id: JobId) -> anyhow::Result<Option<StreamJob>> {
        let conn = self.conn.lock().await;
        let row = multistream_db::stream::by_id(id, &conn).await?;
        Ok(row.map(StreamJob::from))
    }

    async fn account_active(&self, account_id: i64) -> anyhow::Result<bool> {
        let conn = self.conn.lock().await;
        multistream_db::stream::account_active(account_id, &conn).await
    }

    async fn mark_active(
        &self,
        id: JobId,
        started_at: DateTime<Utc>,
        log_path: &Path,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let log_path = log_path.to_string_lossy();
        multistream_db::stream::set_active(id, started_at, &log_path, &conn).await
    }

    async fn mark_finished(
        &self,
        id: JobId,
        status: StreamStatus,
        ended_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        multistream_db::stream::set_finished(id, status, ended_at, error, &conn).await
    }

    async fn fail_orphaned(&self, reason: &str, at: DateTime<Utc>) -> anyhow::Result<u64> {
        let conn = self.conn.lock().await;
        multistream_db::stream::fail_active(reason, at, &conn).await
    }
}
