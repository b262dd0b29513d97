use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::Utc;
use multistream_db::stream::StreamStatus;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};

use crate::{
    error::RelayError,
    store::StatusStore,
    supervisor::{ExitEvent, SessionInfo, Supervisor},
    types::{JobId, JobStart, StartOutcome, StartRequest, StopOutcome, Trigger},
};

/// One async mutex per job id; different ids never contend.
#[derive(Default)]
pub struct KeyedLocks {
    locks: std::sync::Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, id: JobId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // drop entries nobody is holding or waiting on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    /// Waits until every operation holding or queued on a lock right now is done.
    pub async fn quiesce(&self) {
        let pending: Vec<Arc<Mutex<()>>> = {
            let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.values().cloned().collect()
        };
        for lock in pending {
            drop(lock.lock().await);
        }
    }
}

struct Inner {
    supervisor: Supervisor,
    locks: KeyedLocks,
    closing: AtomicBool,
}

/// Single funnel between the trigger sources and the supervisor.
///
/// Start and stop requests for one job are serialized, as is the reaction to
/// that job's process exiting; requests for different jobs run in parallel.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Wraps `supervisor` and spawns the loop consuming its exit events.
    pub fn new(supervisor: Supervisor, exits: mpsc::UnboundedReceiver<ExitEvent>) -> Self {
        let dispatcher = Self {
            inner: Arc::new(Inner {
                supervisor,
                locks: KeyedLocks::default(),
                closing: AtomicBool::new(false),
            }),
        };
        tokio::spawn(Self::exit_loop(Arc::downgrade(&dispatcher.inner), exits));
        dispatcher
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        self.inner.supervisor.store()
    }

    pub async fn request_start(&self, req: StartRequest) -> anyhow::Result<StartOutcome> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Ok(StartOutcome::ShuttingDown);
        }
        let _guard = self.inner.locks.lock(req.job_id).await;
        if let Some(refused) = self.refuse_start(req.job_id).await {
            return Ok(refused);
        }
        self.inner.supervisor.start(req).await
    }

    /// Starts a stored job after re-reading it under the job's lock.
    ///
    /// The row decides eligibility, not whatever snapshot the caller saw: a
    /// scheduled start only proceeds while the job is still `scheduled`, and
    /// every start needs an entitled account and an existing source file. A
    /// missing file is persisted as `failed`; other refusals write nothing.
    pub async fn request_job_start(
        &self,
        start: JobStart,
        media_dir: &Path,
    ) -> anyhow::Result<StartOutcome> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Ok(StartOutcome::ShuttingDown);
        }
        let job_id = start.job_id;
        let _guard = self.inner.locks.lock(job_id).await;
        if let Some(refused) = self.refuse_start(job_id).await {
            return Ok(refused);
        }

        let Some(job) = self.store().load_job(job_id).await? else {
            log::warn!("Dispatch: job {} not found", job_id);
            return Ok(StartOutcome::UnknownJob);
        };
        if start.trigger == Trigger::Scheduled && job.status != StreamStatus::Scheduled {
            log::info!("Dispatch: job {} is {}, not starting", job_id, job.status);
            return Ok(StartOutcome::Ineligible(format!("job is {}", job.status)));
        }
        if !self.store().account_active(job.account_id).await? {
            log::info!(
                "Dispatch: account {} of job {} is not entitled to stream",
                job.account_id,
                job_id
            );
            return Ok(StartOutcome::Ineligible(format!(
                "account {} is not active",
                job.account_id
            )));
        }

        let source = start.source_path.unwrap_or(job.source_path);
        let source = resolve_source(media_dir, &source);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            let reason = RelayError::ResourceMissing { path: source }.to_string();
            log::warn!("Dispatch: job {}: {}", job_id, reason);
            self.store()
                .mark_finished(job_id, StreamStatus::Failed, Utc::now(), Some(&reason))
                .await?;
            return Ok(StartOutcome::Failed(reason));
        }

        let platforms = start.platforms.unwrap_or(job.platforms);
        self.inner
            .supervisor
            .start(StartRequest::new(job_id, source, platforms))
            .await
    }

    /// Checks made under the job's lock before any start.
    async fn refuse_start(&self, job_id: JobId) -> Option<StartOutcome> {
        // shutdown may have begun while we waited for the lock
        if self.inner.closing.load(Ordering::SeqCst) {
            return Some(StartOutcome::ShuttingDown);
        }
        if self.inner.supervisor.is_running(job_id).await {
            log::info!("Dispatch: job {} already running", job_id);
            return Some(StartOutcome::AlreadyRunning);
        }
        None
    }

    pub async fn request_stop(&self, job_id: JobId) -> anyhow::Result<StopOutcome> {
        let _guard = self.inner.locks.lock(job_id).await;
        let outcome = self.inner.supervisor.stop(job_id).await?;
        if outcome == StopOutcome::NotRunning {
            log::info!("Dispatch: job {} not running", job_id);
        }
        Ok(outcome)
    }

    pub async fn is_running(&self, job_id: JobId) -> bool {
        self.inner.supervisor.is_running(job_id).await
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.supervisor.snapshot().await
    }

    /// Refuses new starts, stops every live session and waits for all of them.
    pub async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        // let starts that were already past the closing check register first
        self.inner.locks.quiesce().await;
        let ids = self.inner.supervisor.active_ids().await;
        log::info!("Dispatch: shutting down, stopping {} session(s)", ids.len());

        let stops = ids.into_iter().map(|id| {
            let this = self.clone();
            async move {
                if let Err(e) = this.request_stop(id).await {
                    log::error!("Dispatch: stop of job {} during shutdown: {:#}", id, e);
                }
            }
        });
        futures::future::join_all(stops).await;
        log::info!("Dispatch: all sessions stopped");
    }

    /// Ends once the last dispatcher handle is gone.
    async fn exit_loop(inner: Weak<Inner>, mut exits: mpsc::UnboundedReceiver<ExitEvent>) {
        while let Some(event) = exits.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let this = Dispatcher { inner };
            tokio::spawn(async move {
                let job_id = event.job_id;
                let _guard = this.inner.locks.lock(job_id).await;
                if let Err(e) = this.inner.supervisor.on_exit(event).await {
                    log::error!("Dispatch: recording exit of job {}: {:#}", job_id, e);
                }
            });
        }
    }
}

/// Source paths in the store are relative to the media directory unless absolute.
pub fn resolve_source(media_dir: &Path, source: &Path) -> PathBuf {
    if source.is_absolute() {
        source.to_path_buf()
    } else {
        media_dir.join(source)
    }
}

#[cfg(all(test, unix))]
#[path = "dispatch_test.rs"]
mod dispatch_test;
