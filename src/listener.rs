use std::path::PathBuf;

use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    dispatch::Dispatcher,
    types::{JobId, JobStart, Platform, StartOutcome, StopOutcome},
};

/// Capacity of the queue between the transport and the listener.
pub const COMMAND_QUEUE: usize = 1024;

/// Immediate request received on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start {
        job_id: JobId,
        source_path: Option<PathBuf>,
        platforms: Option<Vec<Platform>>,
    },
    Stop {
        job_id: JobId,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlPayload {
    #[serde(deserialize_with = "job_id_from_number_or_string")]
    job_id: JobId,
    #[serde(default)]
    source_path: Option<PathBuf>,
    #[serde(default)]
    platforms: Option<Vec<Platform>>,
}

fn job_id_from_number_or_string<'de, D>(deserializer: D) -> Result<JobId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(JobId),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(id) => Ok(id),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Names of the start and stop channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub start: String,
    pub stop: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            start: "stream:start".to_string(),
            stop: "stream:stop".to_string(),
        }
    }
}

impl Topics {
    pub fn parse(&self, topic: &str, payload: &str) -> anyhow::Result<ControlCommand> {
        let payload: ControlPayload = serde_json::from_str(payload)
            .map_err(|e| anyhow::anyhow!("bad payload on {}: {}", topic, e))?;
        if topic == self.start {
            Ok(ControlCommand::Start {
                job_id: payload.job_id,
                source_path: payload.source_path,
                platforms: payload.platforms,
            })
        } else if topic == self.stop {
            Ok(ControlCommand::Stop {
                job_id: payload.job_id,
            })
        } else {
            Err(anyhow::anyhow!("unexpected topic {}", topic))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Start(StartOutcome),
    Stop(StopOutcome),
}

/// Forwards control-channel commands to the dispatcher.
///
/// Delivery is at-least-once; a redelivered start is absorbed by the
/// dispatcher's duplicate check.
#[derive(Clone)]
pub struct CommandListener {
    dispatcher: Dispatcher,
    media_dir: PathBuf,
}

impl CommandListener {
    pub fn new(dispatcher: Dispatcher, media_dir: impl Into<PathBuf>) -> Self {
        Self {
            dispatcher,
            media_dir: media_dir.into(),
        }
    }

    pub fn spawn(
        self,
        rx: mpsc::Receiver<ControlCommand>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(rx, cancel).await })
    }

    pub async fn run(self, mut rx: mpsc::Receiver<ControlCommand>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Listener: cancelled");
                    break;
                }
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        log::warn!("Listener: command queue closed");
                        break;
                    };
                    // a stop may wait on a slow process; keep other jobs moving
                    let this = self.clone();
                    tokio::spawn(async move {
                        log::debug!("Listener: received {:?}", cmd);
                        match this.handle(cmd).await {
                            Ok(outcome) => log::info!("Listener: {:?}", outcome),
                            Err(e) => log::error!("Listener: {:#}", e),
                        }
                    });
                }
            }
        }
    }

    pub async fn handle(&self, cmd: ControlCommand) -> anyhow::Result<ControlOutcome> {
        match cmd {
            ControlCommand::Start {
                job_id,
                source_path,
                platforms,
            } => {
                // whatever the payload leaves out comes from the stored job
                let start = JobStart {
                    source_path,
                    platforms,
                    ..JobStart::immediate(job_id)
                };
                let outcome = self
                    .dispatcher
                    .request_job_start(start, &self.media_dir)
                    .await?;
                Ok(ControlOutcome::Start(outcome))
            }
            ControlCommand::Stop { job_id } => {
                let outcome = self.dispatcher.request_stop(job_id).await?;
                Ok(ControlOutcome::Stop(outcome))
            }
        }
    }
}

#[cfg(all(test, unix))]
#[path = "listener_test.rs"]
mod listener_test;
