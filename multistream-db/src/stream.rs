use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use turso::{Connection, Row};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Lifecycle of a stream row. `active` is the only live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Scheduled,
    Pending,
    Active,
    Completed,
    Failed,
    Stopped,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Scheduled => "scheduled",
            StreamStatus::Pending => "pending",
            StreamStatus::Active => "active",
            StreamStatus::Completed => "completed",
            StreamStatus::Failed => "failed",
            StreamStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamStatus::Completed | StreamStatus::Failed | StreamStatus::Stopped
        )
    }
}

impl Display for StreamStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(StreamStatus::Scheduled),
            "pending" => Ok(StreamStatus::Pending),
            "active" => Ok(StreamStatus::Active),
            "completed" => Ok(StreamStatus::Completed),
            "failed" => Ok(StreamStatus::Failed),
            "stopped" => Ok(StreamStatus::Stopped),
            other => Err(anyhow::anyhow!("unknown stream status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformRow {
    pub kind: String,
    pub server: Option<String>,
    pub stream_key: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamRow {
    pub id: i64,
    pub account_id: i64,
    pub title: String,
    pub video_path: String,
    pub status: StreamStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub log_path: Option<String>,
    pub platforms: Vec<PlatformRow>,
}

#[derive(Debug, Clone)]
pub struct NewStream {
    pub account_id: i64,
    pub title: String,
    pub video_path: String,
    pub status: StreamStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map_err(|e| anyhow::anyhow!("bad timestamp '{}': {}", s, e))?;
    Ok(naive.and_utc())
}

const STREAM_COLUMNS: &str = "s.id, s.account_id, s.title, s.video_path, s.status, s.scheduled_at, \
     s.started_at, s.ended_at, s.error, s.log_path";

/// Scheduled streams whose start time has passed and whose account may stream.
pub async fn due(now: DateTime<Utc>, conn: &Connection) -> anyhow::Result<Vec<StreamRow>> {
    let sql = format!(
        "SELECT {} FROM streams s JOIN accounts a ON a.id = s.account_id \
         WHERE s.status = 'scheduled' AND s.scheduled_at IS NOT NULL \
         AND s.scheduled_at <= ?1 AND a.active = 1 \
         ORDER BY s.scheduled_at, s.id",
        STREAM_COLUMNS
    );
    let now = format_ts(now);
    let mut rows = conn.query(&sql, (now.as_str(),)).await?;
    let mut streams = Vec::new();
    while let Some(row) = rows.next().await? {
        streams.push(row_to_stream(&row)?);
    }
    for stream in streams.iter_mut() {
        stream.platforms = platforms(stream.id, conn).await?;
    }
    Ok(streams)
}

pub async fn by_id(id: i64, conn: &Connection) -> anyhow::Result<Option<StreamRow>> {
    let sql = format!(
        "SELECT {} FROM streams s WHERE s.id = ?1 LIMIT 1",
        STREAM_COLUMNS
    );
    let mut rows = conn.query(&sql, (id,)).await?;
    let Some(row) = rows.next().await? else {
        return Ok(None);
    };
    let mut stream = row_to_stream(&row)?;
    stream.platforms = platforms(id, conn).await?;
    Ok(Some(stream))
}

/// Whether the account may stream. Unknown accounts may not.
pub async fn account_active(account_id: i64, conn: &Connection) -> anyhow::Result<bool> {
    let mut rows = conn
        .query("SELECT active FROM accounts WHERE id = ?1", (account_id,))
        .await?;
    match rows.next().await? {
        Some(row) => Ok(integer(&row, 0, "active")? != 0),
        None => Ok(false),
    }
}

pub async fn platforms(stream_id: i64, conn: &Connection) -> anyhow::Result<Vec<PlatformRow>> {
    let mut rows = conn
        .query(
            "SELECT kind, server, stream_key, url FROM stream_platforms \
             WHERE stream_id = ?1 ORDER BY position, id",
            (stream_id,),
        )
        .await?;
    let mut platforms = Vec::new();
    while let Some(row) = rows.next().await? {
        platforms.push(PlatformRow {
            kind: required_text(&row, 0, "kind")?,
            server: optional_text(&row, 1)?,
            stream_key: optional_text(&row, 2)?,
            url: optional_text(&row, 3)?,
        });
    }
    Ok(platforms)
}

pub async fn set_active(
    id: i64,
    started_at: DateTime<Utc>,
    log_path: &str,
    conn: &Connection,
) -> anyhow::Result<()> {
    let started_at = format_ts(started_at);
    conn.execute(
        "UPDATE streams SET status = ?1, started_at = ?2, ended_at = NULL, error = NULL, \
         log_path = ?3 WHERE id = ?4",
        (
            StreamStatus::Active.as_str(),
            started_at.as_str(),
            log_path,
            id,
        ),
    )
    .await?;
    Ok(())
}

pub async fn set_finished(
    id: i64,
    status: StreamStatus,
    ended_at: DateTime<Utc>,
    error: Option<&str>,
    conn: &Connection,
) -> anyhow::Result<()> {
    let ended_at = format_ts(ended_at);
    match error {
        Some(error) => {
            conn.execute(
                "UPDATE streams SET status = ?1, ended_at = ?2, error = ?3 WHERE id = ?4",
                (status.as_str(), ended_at.as_str(), error, id),
            )
            .await?
        }
        None => {
            conn.execute(
                "UPDATE streams SET status = ?1, ended_at = ?2 WHERE id = ?3",
                (status.as_str(), ended_at.as_str(), id),
            )
            .await?
        }
    };
    Ok(())
}

/// Marks every `active` row as failed. Returns the number of rows touched.
pub async fn fail_active(
    reason: &str,
    at: DateTime<Utc>,
    conn: &Connection,
) -> anyhow::Result<u64> {
    let at = format_ts(at);
    let affected = conn
        .execute(
            "UPDATE streams SET status = ?1, ended_at = ?2, error = ?3 WHERE status = ?4",
            (
                StreamStatus::Failed.as_str(),
                at.as_str(),
                reason,
                StreamStatus::Active.as_str(),
            ),
        )
        .await?;
    Ok(affected)
}

pub async fn insert_account(name: &str, active: bool, conn: &Connection) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO accounts (name, active) VALUES (?1, ?2)",
        (name, active as i64),
    )
    .await?;
    Ok(conn.last_insert_rowid())
}

pub async fn insert(stream: &NewStream, conn: &Connection) -> anyhow::Result<i64> {
    match stream.scheduled_at {
        Some(at) => {
            let at = format_ts(at);
            conn.execute(
                "INSERT INTO streams (account_id, title, video_path, status, scheduled_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (
                    stream.account_id,
                    stream.title.as_str(),
                    stream.video_path.as_str(),
                    stream.status.as_str(),
                    at.as_str(),
                ),
            )
            .await?
        }
        None => {
            conn.execute(
                "INSERT INTO streams (account_id, title, video_path, status) \
                 VALUES (?1, ?2, ?3, ?4)",
                (
                    stream.account_id,
                    stream.title.as_str(),
                    stream.video_path.as_str(),
                    stream.status.as_str(),
                ),
            )
            .await?
        }
    };
    Ok(conn.last_insert_rowid())
}

pub async fn insert_platform(
    stream_id: i64,
    position: i64,
    platform: &PlatformRow,
    conn: &Connection,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO stream_platforms (stream_id, position, kind, server, stream_key, url) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        (
            stream_id,
            position,
            platform.kind.as_str(),
            platform.server.as_deref().unwrap_or(""),
            platform.stream_key.as_deref().unwrap_or(""),
            platform.url.as_deref().unwrap_or(""),
        ),
    )
    .await?;
    Ok(())
}

fn row_to_stream(row: &Row) -> anyhow::Result<StreamRow> {
    let status = required_text(row, 4, "status")?;
    Ok(StreamRow {
        id: integer(row, 0, "id")?,
        account_id: integer(row, 1, "account_id")?,
        title: optional_text(row, 2)?.unwrap_or_default(),
        video_path: required_text(row, 3, "video_path")?,
        status: status.parse()?,
        scheduled_at: optional_ts(row, 5)?,
        started_at: optional_ts(row, 6)?,
        ended_at: optional_ts(row, 7)?,
        error: optional_text(row, 8)?,
        log_path: optional_text(row, 9)?,
        platforms: Vec::new(),
    })
}

fn integer(row: &Row, idx: usize, name: &str) -> anyhow::Result<i64> {
    row.get_value(idx)?
        .as_integer()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("{} is null", name))
}

fn required_text(row: &Row, idx: usize, name: &str) -> anyhow::Result<String> {
    optional_text(row, idx)?.ok_or_else(|| anyhow::anyhow!("{} is null", name))
}

fn optional_text(row: &Row, idx: usize) -> anyhow::Result<Option<String>> {
    Ok(row.get_value(idx)?.as_text().map(|s| s.to_owned()))
}

fn optional_ts(row: &Row, idx: usize) -> anyhow::Result<Option<DateTime<Utc>>> {
    match optional_text(row, idx)? {
        Some(s) if !s.is_empty() => Ok(Some(parse_ts(&s)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
#[path = "stream_test.rs"]
mod stream_test;
