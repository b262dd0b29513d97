use std::time::Duration;

use futures::StreamExt;
use redis::aio::PubSub;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::listener::{ControlCommand, Topics};

const RESUBSCRIBE_MIN: Duration = Duration::from_secs(1);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

/// Redis pub/sub feed of control commands.
pub struct RedisCommands {
    client: redis::Client,
    topics: Topics,
}

impl RedisCommands {
    /// Opens the first subscription. Failure here is fatal to the caller.
    pub async fn connect(url: &str, topics: Topics) -> anyhow::Result<(Self, PubSub)> {
        let client = redis::Client::open(url)?;
        let this = Self { client, topics };
        let pubsub = this.subscribe().await?;
        Ok((this, pubsub))
    }

    async fn subscribe(&self) -> anyhow::Result<PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.topics.start).await?;
        pubsub.subscribe(&self.topics.stop).await?;
        log::info!(
            "Redis: subscribed to {} and {}",
            self.topics.start,
            self.topics.stop
        );
        Ok(pubsub)
    }

    pub fn spawn(
        self,
        pubsub: PubSub,
        tx: mpsc::Sender<ControlCommand>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(pubsub, tx, cancel).await })
    }

    async fn run(
        self,
        mut pubsub: PubSub,
        tx: mpsc::Sender<ControlCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            if self.forward(&mut pubsub, &tx, &cancel).await {
                return;
            }
            match self.resubscribe(&cancel).await {
                Some(fresh) => pubsub = fresh,
                None => return,
            }
        }
    }

    /// Pumps messages into `tx`. Returns true when the feed should end for
    /// good, false when the subscription dropped.
    async fn forward(
        &self,
        pubsub: &mut PubSub,
        tx: &mpsc::Sender<ControlCommand>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return true,
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        log::warn!("Redis: subscription ended");
                        return false;
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            log::warn!(
                                "Redis: unreadable payload on {}: {}",
                                msg.get_channel_name(),
                                e
                            );
                            continue;
                        }
                    };
                    match self.topics.parse(msg.get_channel_name(), &payload) {
                        Ok(cmd) => {
                            if tx.send(cmd).await.is_err() {
                                log::warn!("Redis: listener gone, dropping feed");
                                return true;
                            }
                        }
                        Err(e) => log::warn!("Redis: {:#}", e),
                    }
                }
            }
        }
    }

    async fn resubscribe(&self, cancel: &CancellationToken) -> Option<PubSub> {
        let mut delay = RESUBSCRIBE_MIN;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.subscribe().await {
                Ok(pubsub) => return Some(pubsub),
                Err(e) => {
                    delay = (delay * 2).min(RESUBSCRIBE_MAX);
                    log::error!(
                        "Redis: resubscribe failed, retrying in {:?}: {:#}",
                        delay,
                        e
                    );
                }
            }
        }
    }
}
