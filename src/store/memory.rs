use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use multistream_db::stream::StreamStatus;

use super::StatusStore;
use crate::types::{JobId, Platform, StreamJob};

/// A status write as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Active {
        id: JobId,
        log_path: PathBuf,
    },
    Finished {
        id: JobId,
        status: StreamStatus,
        error: Option<String>,
    },
    Orphans,
}

/// In-memory [`StatusStore`] that records every write.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<JobId, StreamJob>>,
    inactive_accounts: Mutex<HashSet<i64>>,
    writes: Mutex<Vec<Write>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: StreamJob) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn deactivate_account(&self, account_id: i64) {
        self.inactive_accounts.lock().unwrap().insert(account_id);
    }

    pub fn job(&self, id: JobId) -> Option<StreamJob> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_for(&self, id: JobId) -> Vec<Write> {
        self.writes()
            .into_iter()
            .filter(|w| match w {
                Write::Active { id: job, .. } | Write::Finished { id: job, .. } => *job == id,
                Write::Orphans => false,
            })
            .collect()
    }

    /// Polls until the job reaches `status`, panicking after a few seconds.
    pub async fn wait_for_status(&self, id: JobId, status: StreamStatus) -> StreamJob {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(job) = self.job(id) {
                if job.status == status {
                    return job;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "job {} never reached {}, last seen {:?}",
                    id,
                    status,
                    self.job(id).map(|j| j.status)
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// A scheduled job fixture.
pub fn job(id: JobId, source: impl Into<PathBuf>, platforms: Vec<Platform>) -> StreamJob {
    StreamJob {
        id,
        account_id: 1,
        source_path: source.into(),
        platforms,
        status: StreamStatus::Scheduled,
        scheduled_at: Some(Utc::now() - chrono::Duration::minutes(1)),
        started_at: None,
        ended_at: None,
        error: None,
        log_path: None,
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn due_jobs(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<StreamJob>> {
        let inactive = self.inactive_accounts.lock().unwrap().clone();
        let mut due: Vec<StreamJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.status == StreamStatus::Scheduled)
            .filter(|j| j.scheduled_at.is_some_and(|at| at <= now))
            .filter(|j| !inactive.contains(&j.account_id))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.scheduled_at, j.id));
        Ok(due)
    }

    async fn load_job(&self, id: JobId) -> anyhow::Result<Option<StreamJob>> {
        Ok(self.job(id))
    }

    async fn account_active(&self, account_id: i64) -> anyhow::Result<bool> {
        Ok(!self.inactive_accounts.lock().unwrap().contains(&account_id))
    }

    async fn mark_active(
        &self,
        id: JobId,
        started_at: DateTime<Utc>,
        log_path: &Path,
    ) -> anyhow::Result<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
            job.status = StreamStatus::Active;
            job.started_at = Some(started_at);
            job.ended_at = None;
            job.error = None;
            job.log_path = Some(log_path.to_string_lossy().into_owned());
        }
        self.writes.lock().unwrap().push(Write::Active {
            id,
            log_path: log_path.to_path_buf(),
        });
        Ok(())
    }

    async fn mark_finished(
        &self,
        id: JobId,
        status: StreamStatus,
        ended_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
            job.status = status;
            job.ended_at = Some(ended_at);
            if let Some(error) = error {
                job.error = Some(error.to_string());
            }
        }
        self.writes.lock().unwrap().push(Write::Finished {
            id,
            status,
            error: error.map(str::to_owned),
        });
        Ok(())
    }

    async fn fail_orphaned(&self, reason: &str, at: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut touched = 0;
        for job in self.jobs.lock().unwrap().values_mut() {
            if job.status == StreamStatus::Active {
                job.status = StreamStatus::Failed;
                job.error = Some(reason.to_string());
                job.ended_at = Some(at);
                touched += 1;
            }
        }
        self.writes.lock().unwrap().push(Write::Orphans);
        Ok(touched)
    }
}
