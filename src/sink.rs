use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{error::RelayError, types::JobId};

const READ_CHUNK: usize = 8 * 1024;

/// Deterministic per-session log file name; unique across restarts.
pub fn log_file_name(job_id: JobId, started_at: DateTime<Utc>) -> String {
    format!(
        "stream_{}_{}.log",
        job_id,
        started_at.format("%Y%m%d%H%M%S%3f")
    )
}

/// Per-session log file the relay's stdout and stderr are multiplexed into.
///
/// A single writer task owns the file; every attached stream is pumped into it
/// in chunks, so output from both streams interleaves the way the relay wrote it.
pub struct LogSink {
    path: PathBuf,
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    pumps: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl LogSink {
    pub async fn create(
        dir: &Path,
        job_id: JobId,
        started_at: DateTime<Utc>,
    ) -> Result<Self, RelayError> {
        let path = dir.join(log_file_name(job_id, started_at));
        let file = File::create(&path)
            .await
            .map_err(|e| RelayError::LogSink {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_chunks(file, rx, path.clone()));

        Ok(Self {
            path,
            tx: Some(tx),
            pumps: Vec::new(),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line of engine-side annotation.
    pub fn write_line(&self, line: impl AsRef<str>) {
        if let Some(tx) = &self.tx {
            let mut bytes = line.as_ref().as_bytes().to_vec();
            bytes.push(b'\n');
            let _ = tx.send(bytes);
        }
    }

    /// Pumps `reader` into the file until it reaches EOF.
    pub fn attach<R>(&mut self, mut reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Some(tx) = self.tx.clone() else {
            return;
        };
        self.pumps.push(tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Waits for attached streams to drain, then flushes and closes the file.
    pub async fn close(mut self) {
        self.tx.take();
        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }
}

async fn write_chunks(file: File, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, path: PathBuf) {
    let mut out = BufWriter::new(file);
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = out.write_all(&chunk).await {
            log::warn!("LogSink: write to {} failed: {}", path.display(), e);
            break;
        }
    }
    if let Err(e) = out.flush().await {
        log::warn!("LogSink: flush of {} failed: {}", path.display(), e);
    }
}
