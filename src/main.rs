use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use multistream_db::StreamDatabase;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod api;
mod command;
mod config;
mod dispatch;
mod error;
mod handler;
mod listener;
mod scheduler;
mod sink;
mod store;
mod supervisor;
mod transport;
mod types;

use crate::{
    command::FfmpegCommand,
    config::EngineConfig,
    dispatch::Dispatcher,
    handler::AppState,
    listener::{COMMAND_QUEUE, CommandListener},
    scheduler::Scheduler,
    store::{DbStatusStore, StatusStore},
    supervisor::Supervisor,
    transport::RedisCommands,
};

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("multistream", log::LevelFilter::Debug)
        .filter_module("multistream_db", log::LevelFilter::Debug)
        .init();
}

fn fatal(what: &str, e: anyhow::Error) -> ! {
    eprintln!("Error {}: {:#}", what, e);
    std::process::exit(1);
}

async fn terminated() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = EngineConfig::parse();

    let db = StreamDatabase::open(&config.db)
        .await
        .unwrap_or_else(|e| fatal("opening database", e));
    let store: Arc<dyn StatusStore> = Arc::new(
        DbStatusStore::new(&db).unwrap_or_else(|e| fatal("connecting to database", e)),
    );
    match store
        .fail_orphaned("engine restarted while stream was active", Utc::now())
        .await
    {
        Ok(0) => {}
        Ok(n) => log::warn!("marked {} orphaned active stream(s) as failed", n),
        Err(e) => fatal("reconciling active streams", e),
    }

    for dir in [&config.media_dir, &config.log_dir] {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            fatal(&format!("creating {}", dir.display()), e.into());
        }
    }

    let (supervisor, exits) = Supervisor::new(
        store,
        Arc::new(FfmpegCommand::new(&config.ffmpeg)),
        &config.log_dir,
        config.kill_after(),
    );
    let dispatcher = Dispatcher::new(supervisor, exits);

    let (commands, pubsub) = RedisCommands::connect(&config.redis_url, config.topics())
        .await
        .unwrap_or_else(|e| fatal("subscribing to redis", e));

    let cancel = CancellationToken::new();

    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    commands.spawn(pubsub, tx, cancel.clone());
    CommandListener::new(dispatcher.clone(), &config.media_dir).spawn(rx, cancel.clone());
    Scheduler::new(dispatcher.clone(), &config.media_dir, config.tick()).spawn(cancel.clone());

    let state = AppState {
        dispatcher: dispatcher.clone(),
        media_dir: config.media_dir.clone(),
    };
    if let Err(e) = api::start_api_server(config.api_addr, state, cancel.clone()).await {
        fatal("starting admin api", e);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("interrupted"),
        _ = terminated() => log::info!("terminated"),
    }
    cancel.cancel();
    dispatcher.shutdown().await;

    std::process::exit(0);
}
