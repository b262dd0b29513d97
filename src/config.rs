use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;

use crate::listener::Topics;

#[derive(Debug, Clone, Parser)]
#[command(name = "multistream")]
#[command(about = "Relays scheduled media files to many live platforms")]
pub struct EngineConfig {
    /// Path of the SQLite database holding accounts and streams
    #[arg(long, env = "MULTISTREAM_DB", default_value = "multistream.db")]
    pub db: String,

    #[arg(
        long,
        env = "MULTISTREAM_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_url: String,

    #[arg(long, env = "MULTISTREAM_START_TOPIC", default_value = "stream:start")]
    pub start_topic: String,

    #[arg(long, env = "MULTISTREAM_STOP_TOPIC", default_value = "stream:stop")]
    pub stop_topic: String,

    /// Relative source paths are resolved against this directory
    #[arg(long, env = "MULTISTREAM_MEDIA_DIR", default_value = "media")]
    pub media_dir: PathBuf,

    /// One log file per relay process is written here
    #[arg(long, env = "MULTISTREAM_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    #[arg(long, env = "MULTISTREAM_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Seconds between scheduler ticks
    #[arg(
        long,
        env = "MULTISTREAM_TICK_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub tick_secs: u64,

    /// Force-kill a relay this many seconds after a graceful stop; waits forever if unset
    #[arg(long, env = "MULTISTREAM_KILL_AFTER_SECS")]
    pub kill_after_secs: Option<u64>,

    #[arg(long, env = "MULTISTREAM_API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: SocketAddr,
}

impl EngineConfig {
    pub fn topics(&self) -> Topics {
        Topics {
            start: self.start_topic.clone(),
            stop: self.stop_topic.clone(),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn kill_after(&self) -> Option<Duration> {
        self.kill_after_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::try_parse_from(["multistream"]).unwrap();
        assert_eq!(config.db, "multistream.db");
        assert_eq!(config.topics(), Topics::default());
        assert_eq!(config.tick(), Duration::from_secs(60));
        assert_eq!(config.kill_after(), None);
        assert_eq!(config.api_addr.port(), 8080);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = EngineConfig::try_parse_from([
            "multistream",
            "--tick-secs",
            "5",
            "--kill-after-secs",
            "10",
            "--stop-topic",
            "relay.halt",
            "--media-dir",
            "/srv/media",
        ])
        .unwrap();
        assert_eq!(config.tick(), Duration::from_secs(5));
        assert_eq!(config.kill_after(), Some(Duration::from_secs(10)));
        assert_eq!(config.topics().stop, "relay.halt");
        assert_eq!(config.media_dir, PathBuf::from("/srv/media"));
    }

    #[test]
    fn test_zero_tick_is_rejected() {
        assert!(EngineConfig::try_parse_from(["multistream", "--tick-secs", "0"]).is_err());
    }
}
