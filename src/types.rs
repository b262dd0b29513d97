use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use multistream_db::stream::{PlatformRow, StreamRow, StreamStatus};
use serde::{Deserialize, Serialize};

/// Primary key of a stream row, assigned by whoever created it.
pub type JobId = i64;

/// Destination type of a relay target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PlatformKind {
    /// Relay-protocol endpoint: server + stream key
    Rtmp,
    /// Arbitrary output URL
    Custom,
    /// Anything else; never relayed
    Other(String),
}

impl From<String> for PlatformKind {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "rtmp" => PlatformKind::Rtmp,
            "custom" | "url" => PlatformKind::Custom,
            _ => PlatformKind::Other(value),
        }
    }
}

impl From<PlatformKind> for String {
    fn from(value: PlatformKind) -> Self {
        match value {
            PlatformKind::Rtmp => "rtmp".to_string(),
            PlatformKind::Custom => "custom".to_string(),
            PlatformKind::Other(kind) => kind,
        }
    }
}

/// One relay target of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(rename = "type")]
    pub kind: PlatformKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Platform {
    pub fn rtmp(server: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: PlatformKind::Rtmp,
            server: Some(server.into()),
            key: Some(key.into()),
            url: None,
        }
    }

    pub fn custom(url: impl Into<String>) -> Self {
        Self {
            kind: PlatformKind::Custom,
            server: None,
            key: None,
            url: Some(url.into()),
        }
    }

    /// Output URL the relay should push to, if this platform can be relayed at all.
    pub fn output_url(&self) -> Option<String> {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        match self.kind {
            PlatformKind::Rtmp => {
                let server = non_empty(&self.server)?;
                let key = non_empty(&self.key)?;
                Some(format!(
                    "{}/{}",
                    server.trim_end_matches('/'),
                    key.trim_start_matches('/')
                ))
            }
            PlatformKind::Custom => non_empty(&self.url),
            PlatformKind::Other(_) => None,
        }
    }
}

impl From<PlatformRow> for Platform {
    fn from(row: PlatformRow) -> Self {
        let blank_to_none = |v: Option<String>| v.filter(|s| !s.is_empty());
        Self {
            kind: PlatformKind::from(row.kind),
            server: blank_to_none(row.server),
            key: blank_to_none(row.stream_key),
            url: blank_to_none(row.url),
        }
    }
}

/// A persisted request to relay one media file to its platforms
#[derive(Debug, Clone)]
pub struct StreamJob {
    pub id: JobId,
    pub account_id: i64,
    pub source_path: PathBuf,
    pub platforms: Vec<Platform>,
    pub status: StreamStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub log_path: Option<String>,
}

impl From<StreamRow> for StreamJob {
    fn from(row: StreamRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            source_path: PathBuf::from(row.video_path),
            platforms: row.platforms.into_iter().map(Platform::from).collect(),
            status: row.status,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            error: row.error,
            log_path: row.log_path,
        }
    }
}

/// What both trigger sources hand to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub job_id: JobId,
    pub source_path: PathBuf,
    pub platforms: Vec<Platform>,
}

impl StartRequest {
    pub fn new(job_id: JobId, source_path: impl Into<PathBuf>, platforms: Vec<Platform>) -> Self {
        Self {
            job_id,
            source_path: source_path.into(),
            platforms,
        }
    }
}

/// Which trigger path asked for a start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Scheduler tick; the job must still be `scheduled`.
    Scheduled,
    /// Control channel or admin API; re-submitting a finished job is allowed.
    Immediate,
}

/// Start of a stored job. The dispatcher reloads the row under the job's
/// lock and fills in whatever is left as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStart {
    pub job_id: JobId,
    pub trigger: Trigger,
    pub source_path: Option<PathBuf>,
    pub platforms: Option<Vec<Platform>>,
}

impl JobStart {
    pub fn scheduled(job_id: JobId) -> Self {
        Self {
            job_id,
            trigger: Trigger::Scheduled,
            source_path: None,
            platforms: None,
        }
    }

    pub fn immediate(job_id: JobId) -> Self {
        Self {
            job_id,
            trigger: Trigger::Immediate,
            source_path: None,
            platforms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32, log_path: PathBuf },
    AlreadyRunning,
    /// No stored job with that id.
    UnknownJob,
    /// The job or its account may not start now; nothing was written.
    Ineligible(String),
    /// Build or spawn failed; the error text has been persisted.
    Failed(String),
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

impl Display for StartOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StartOutcome::Started { pid, log_path } => {
                write!(f, "started (pid {}, log {})", pid, log_path.display())
            }
            StartOutcome::AlreadyRunning => f.write_str("already running"),
            StartOutcome::UnknownJob => f.write_str("unknown job"),
            StartOutcome::Ineligible(reason) => write!(f, "not eligible: {}", reason),
            StartOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            StartOutcome::ShuttingDown => f.write_str("shutting down"),
        }
    }
}

impl Display for StopOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StopOutcome::Stopped => f.write_str("stopped"),
            StopOutcome::NotRunning => f.write_str("not running"),
        }
    }
}
