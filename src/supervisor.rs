use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use multistream_db::stream::StreamStatus;
use serde::Serialize;
use tokio::{
    process::Command,
    sync::{RwLock, mpsc, watch},
};
use uuid::Uuid;

use crate::{
    command::CommandBuilder,
    error::RelayError,
    sink::LogSink,
    store::StatusStore,
    types::{JobId, Platform, StartOutcome, StartRequest, StopOutcome},
};

/// How a relay process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn error(&self) -> Option<RelayError> {
        if self.success() {
            return None;
        }
        Some(RelayError::AbnormalExit {
            code: self.code,
            signal: self.signal,
        })
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl Display for ExitInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.error() {
            None => f.write_str("relay exited cleanly"),
            Some(e) => write!(f, "{}", e),
        }
    }
}

/// Sent by a session's monitor task once its process has ended.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub job_id: JobId,
    pub session_id: Uuid,
    pub exit: ExitInfo,
}

/// Read-only view of a live session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub job_id: JobId,
    pub session_id: Uuid,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub platforms: Vec<Platform>,
}

/// Runtime shadow of a streaming job. Lives only in the registry.
struct ActiveSession {
    info: SessionInfo,
    exited: watch::Receiver<Option<ExitInfo>>,
}

/// Sole owner of relay processes: spawns, watches and terminates them.
///
/// Callers must serialize operations per job id; the dispatcher does that.
pub struct Supervisor {
    store: Arc<dyn StatusStore>,
    builder: Arc<dyn CommandBuilder>,
    log_dir: PathBuf,
    kill_after: Option<Duration>,
    sessions: RwLock<HashMap<JobId, ActiveSession>>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn StatusStore>,
        builder: Arc<dyn CommandBuilder>,
        log_dir: impl Into<PathBuf>,
        kill_after: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<ExitEvent>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            store,
            builder,
            log_dir: log_dir.into(),
            kill_after,
            sessions: RwLock::new(HashMap::new()),
            exit_tx,
        };
        (supervisor, exit_rx)
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub async fn is_running(&self, job_id: JobId) -> bool {
        self.sessions.read().await.contains_key(&job_id)
    }

    pub async fn active_ids(&self) -> Vec<JobId> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|s| s.info.clone()).collect();
        infos.sort_by_key(|s| s.job_id);
        infos
    }

    /// Builds the invocation, spawns the relay and records the job as active.
    ///
    /// Build and spawn failures are persisted as `failed` and returned as
    /// [`StartOutcome::Failed`]; only store errors surface as `Err`.
    pub async fn start(&self, req: StartRequest) -> anyhow::Result<StartOutcome> {
        if self.is_running(req.job_id).await {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let started_at = Utc::now();
        let (session, exited_rx) = match self.spawn(&req, started_at).await {
            Ok(spawned) => spawned,
            Err(e) => {
                let reason = e.to_string();
                log::error!("Supervisor: job {} failed to start: {}", req.job_id, reason);
                self.store
                    .mark_finished(
                        req.job_id,
                        StreamStatus::Failed,
                        Utc::now(),
                        Some(&reason),
                    )
                    .await?;
                return Ok(StartOutcome::Failed(reason));
            }
        };

        let pid = session.pid;
        let log_path = session.log_path.clone();
        self.sessions.write().await.insert(
            req.job_id,
            ActiveSession {
                info: session,
                exited: exited_rx,
            },
        );
        log::info!(
            "Supervisor: job {} started, pid {:?}, log {}",
            req.job_id,
            pid,
            log_path.display()
        );

        self.store
            .mark_active(req.job_id, started_at, &log_path)
            .await?;
        Ok(StartOutcome::Started {
            pid: pid.unwrap_or_default(),
            log_path,
        })
    }

    async fn spawn(
        &self,
        req: &StartRequest,
        started_at: DateTime<Utc>,
    ) -> Result<(SessionInfo, watch::Receiver<Option<ExitInfo>>), RelayError> {
        let invocation = self.builder.build(&req.source_path, &req.platforms)?;
        let mut sink = LogSink::create(&self.log_dir, req.job_id, started_at).await?;
        sink.write_line(format!(
            "[{}] job {}: {}",
            started_at.to_rfc3339(),
            req.job_id,
            invocation
        ));

        let spawned = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let err = RelayError::SpawnFailure {
                    program: invocation.program.clone(),
                    reason: e.to_string(),
                };
                sink.write_line(format!("[{}] {}", Utc::now().to_rfc3339(), err));
                sink.close().await;
                return Err(err);
            }
        };

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            sink.attach(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            sink.attach(stderr);
        }

        let info = SessionInfo {
            job_id: req.job_id,
            session_id: Uuid::new_v4(),
            pid,
            started_at,
            log_path: sink.path().to_path_buf(),
            platforms: req.platforms.clone(),
        };

        let (exited_tx, exited_rx) = watch::channel(None);
        let exit_tx = self.exit_tx.clone();
        let job_id = req.job_id;
        let session_id = info.session_id;
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    log::error!("Supervisor: waiting on job {} failed: {}", job_id, e);
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            sink.write_line(format!("[{}] {}", Utc::now().to_rfc3339(), exit));
            sink.close().await;
            let _ = exited_tx.send(Some(exit));
            let _ = exit_tx.send(ExitEvent {
                job_id,
                session_id,
                exit,
            });
        });

        Ok((info, exited_rx))
    }

    /// Terminates the job's relay and records it as stopped.
    ///
    /// Returns once the process has actually exited.
    pub async fn stop(&self, job_id: JobId) -> anyhow::Result<StopOutcome> {
        let (pid, session_id, mut exited) = {
            let sessions = self.sessions.read().await;
            match sessions.get(&job_id) {
                Some(s) => (s.info.pid, s.info.session_id, s.exited.clone()),
                None => return Ok(StopOutcome::NotRunning),
            }
        };

        let already_exited = exited.borrow().is_some();
        if !already_exited {
            if let Some(pid) = pid {
                log::info!("Supervisor: stopping job {} (pid {})", job_id, pid);
                if let Err(e) = terminate(pid) {
                    log::warn!("Supervisor: terminate job {}: {:#}", job_id, e);
                }
            }
            self.wait_exit(job_id, pid, &mut exited).await;
        }

        {
            let mut sessions = self.sessions.write().await;
            if sessions
                .get(&job_id)
                .is_some_and(|s| s.info.session_id == session_id)
            {
                sessions.remove(&job_id);
            }
        }

        self.store
            .mark_finished(job_id, StreamStatus::Stopped, Utc::now(), None)
            .await?;
        log::info!("Supervisor: job {} stopped", job_id);
        Ok(StopOutcome::Stopped)
    }

    async fn wait_exit(
        &self,
        job_id: JobId,
        pid: Option<u32>,
        exited: &mut watch::Receiver<Option<ExitInfo>>,
    ) {
        if let Some(limit) = self.kill_after {
            let in_time = tokio::time::timeout(limit, exited.wait_for(Option::is_some))
                .await
                .is_ok();
            if in_time {
                return;
            }
            log::warn!(
                "Supervisor: job {} ignored terminate for {:?}, killing",
                job_id,
                limit
            );
            if let Some(pid) = pid {
                if let Err(e) = force_kill(pid) {
                    log::warn!("Supervisor: kill job {}: {:#}", job_id, e);
                }
            }
        }
        let _ = exited.wait_for(Option::is_some).await;
    }

    /// Exit reaction: frees the registry slot and persists the final status.
    ///
    /// A no-op when the session was already removed by [`Supervisor::stop`] or
    /// belongs to an older run of the same job.
    pub async fn on_exit(&self, event: ExitEvent) -> anyhow::Result<()> {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let current = sessions
                .get(&event.job_id)
                .is_some_and(|s| s.info.session_id == event.session_id);
            current && sessions.remove(&event.job_id).is_some()
        };
        if !removed {
            log::debug!(
                "Supervisor: exit of job {} already handled",
                event.job_id
            );
            return Ok(());
        }

        let (status, error) = match event.exit.error() {
            None => (StreamStatus::Completed, None),
            Some(e) => (StreamStatus::Failed, Some(e.to_string())),
        };
        log::info!(
            "Supervisor: job {} {} ({})",
            event.job_id,
            status,
            event.exit
        );
        self.store
            .mark_finished(event.job_id, status, Utc::now(), error.as_deref())
            .await
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> anyhow::Result<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn force_kill(pid: u32) -> anyhow::Result<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> anyhow::Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| anyhow::anyhow!("pid {} out of range", pid))?;
    kill(Pid::from_raw(raw), signal)
        .map_err(|e| anyhow::anyhow!("{} to pid {} failed: {}", signal, pid, e))
}

#[cfg(windows)]
fn terminate(pid: u32) -> anyhow::Result<()> {
    taskkill(pid, false)
}

#[cfg(windows)]
fn force_kill(pid: u32) -> anyhow::Result<()> {
    taskkill(pid, true)
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> anyhow::Result<()> {
    let pid = pid.to_string();
    let mut args = vec!["/PID", pid.as_str()];
    if force {
        args.push("/F");
    }
    std::process::Command::new("taskkill")
        .args(&args)
        .status()
        .map_err(|e| anyhow::anyhow!("taskkill failed: {}", e))?;
    Ok(())
}

#[cfg(all(test, unix))]
#[path = "supervisor_test.rs"]
mod supervisor_test;
