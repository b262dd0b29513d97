use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    dispatch::Dispatcher,
    types::{JobStart, StartOutcome, StreamJob},
};

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub dispatched: usize,
    /// Already running, no longer scheduled, or refused because the engine is closing.
    pub skipped: usize,
    pub failed: usize,
}

/// Periodically starts scheduled jobs whose time has come.
pub struct Scheduler {
    dispatcher: Dispatcher,
    media_dir: PathBuf,
    period: Duration,
}

impl Scheduler {
    pub fn new(dispatcher: Dispatcher, media_dir: impl Into<PathBuf>, period: Duration) -> Self {
        Self {
            dispatcher,
            media_dir: media_dir.into(),
            period,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!("Scheduler: ticking every {:?}", self.period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Scheduler: cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.due > 0 => log::info!("Scheduler: {:?}", report),
                        Ok(_) => {}
                        Err(e) => log::error!("Scheduler: tick failed: {:#}", e),
                    }
                }
            }
        }
    }

    /// Dispatches every job due at `now`, one at a time.
    ///
    /// Only the due-jobs query can fail the tick; per-job errors are logged
    /// and counted.
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<TickReport> {
        let jobs = self.dispatcher.store().due_jobs(now).await?;
        Ok(self.dispatch_all(jobs).await)
    }

    /// The listed jobs are only candidates: each is re-read under its lock,
    /// so one that was started or finished since the query is skipped.
    pub(crate) async fn dispatch_all(&self, jobs: Vec<StreamJob>) -> TickReport {
        let mut report = TickReport {
            due: jobs.len(),
            ..TickReport::default()
        };

        for job in jobs {
            let outcome = self
                .dispatcher
                .request_job_start(JobStart::scheduled(job.id), &self.media_dir)
                .await;
            match outcome {
                Ok(StartOutcome::Started { .. }) => report.dispatched += 1,
                Ok(StartOutcome::Failed(_)) => report.failed += 1,
                Ok(
                    StartOutcome::AlreadyRunning
                    | StartOutcome::ShuttingDown
                    | StartOutcome::UnknownJob
                    | StartOutcome::Ineligible(_),
                ) => report.skipped += 1,
                Err(e) => {
                    log::error!("Scheduler: job {} could not be dispatched: {:#}", job.id, e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[cfg(all(test, unix))]
#[path = "scheduler_test.rs"]
mod scheduler_test;
