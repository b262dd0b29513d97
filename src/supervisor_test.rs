// ============================================================================
// Process Supervisor Tests
// ============================================================================

use std::{path::Path, sync::Arc, time::Duration};

use multistream_db::stream::StreamStatus;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ExitEvent, Supervisor};
use crate::{
    command::{CommandBuilder, Invocation, resolve_outputs},
    error::RelayError,
    store::memory::{MemoryStore, Write, job},
    types::{Platform, StartOutcome, StartRequest, StopOutcome},
};

fn shell(script: &'static str) -> Arc<dyn CommandBuilder> {
    Arc::new(
        move |_: &Path, platforms: &[Platform]| -> Result<Invocation, RelayError> {
            resolve_outputs(platforms)?;
            Ok(Invocation::new("/bin/sh", ["-c", script]))
        },
    )
}

fn platforms() -> Vec<Platform> {
    vec![Platform::rtmp("rtmp://a.example/live", "k1")]
}

struct Fixture {
    store: Arc<MemoryStore>,
    supervisor: Supervisor,
    exits: mpsc::UnboundedReceiver<ExitEvent>,
    logs: tempfile::TempDir,
}

fn fixture(builder: Arc<dyn CommandBuilder>, kill_after: Option<Duration>) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    store.insert(job(1, "in.mp4", platforms()));
    let logs = tempfile::tempdir().unwrap();
    let (supervisor, exits) = Supervisor::new(store.clone(), builder, logs.path(), kill_after);
    Fixture {
        store,
        supervisor,
        exits,
        logs,
    }
}

fn request() -> StartRequest {
    StartRequest::new(1, "in.mp4", platforms())
}

// ------------------------------------------------------------------------
// Start and exit reaction
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_clean_exit_completes() {
    let mut f = fixture(shell("echo relay-output; exit 0"), None);

    let outcome = f.supervisor.start(request()).await.unwrap();
    let log_path = match outcome {
        StartOutcome::Started { log_path, .. } => log_path,
        other => panic!("expected Started, got {:?}", other),
    };
    assert!(log_path.starts_with(f.logs.path()));
    let active = f.store.job(1).unwrap();
    assert_eq!(active.status, StreamStatus::Active);
    assert_eq!(
        active.log_path.as_deref(),
        Some(log_path.to_string_lossy().as_ref())
    );

    let event = f.exits.recv().await.unwrap();
    assert!(event.exit.success());
    f.supervisor.on_exit(event).await.unwrap();

    let done = f.store.job(1).unwrap();
    assert_eq!(done.status, StreamStatus::Completed);
    assert!(done.ended_at.is_some());
    assert!(!f.supervisor.is_running(1).await);

    let log = tokio::fs::read_to_string(&log_path).await.unwrap();
    assert!(log.contains("job 1: /bin/sh -c"));
    assert!(log.contains("relay-output"));
    assert!(log.contains("relay exited cleanly"));
}

#[tokio::test]
async fn test_nonzero_exit_fails() {
    let mut f = fixture(shell("exit 3"), None);

    f.supervisor.start(request()).await.unwrap();
    let event = f.exits.recv().await.unwrap();
    assert_eq!(event.exit.code, Some(3));
    f.supervisor.on_exit(event).await.unwrap();

    let failed = f.store.job(1).unwrap();
    assert_eq!(failed.status, StreamStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("relay exited with code 3"));
    assert!(failed.ended_at.is_some());
    assert!(f.supervisor.active_ids().await.is_empty());
}

#[tokio::test]
async fn test_invalid_configuration_never_spawns() {
    let f = fixture(shell("exit 0"), None);

    let outcome = f
        .supervisor
        .start(StartRequest::new(1, "in.mp4", vec![Platform::custom("")]))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StartOutcome::Failed(ref e) if e.starts_with("invalid configuration")
    ));

    let failed = f.store.job(1).unwrap();
    assert_eq!(failed.status, StreamStatus::Failed);
    assert!(!f.supervisor.is_running(1).await);
    assert_eq!(std::fs::read_dir(f.logs.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_spawn_failure_is_persisted() {
    let builder: Arc<dyn CommandBuilder> = Arc::new(
        |_: &Path, _: &[Platform]| -> Result<Invocation, RelayError> {
            Ok(Invocation::new("/nonexistent/relay-tool", Vec::<String>::new()))
        },
    );
    let f = fixture(builder, None);

    let outcome = f.supervisor.start(request()).await.unwrap();
    assert!(matches!(
        outcome,
        StartOutcome::Failed(ref e) if e.contains("failed to spawn")
    ));
    let failed = f.store.job(1).unwrap();
    assert_eq!(failed.status, StreamStatus::Failed);
    assert!(failed.error.unwrap().contains("/nonexistent/relay-tool"));
    assert!(!f.supervisor.is_running(1).await);
}

// ------------------------------------------------------------------------
// Stop
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_stop_terminates_and_is_idempotent() {
    let mut f = fixture(shell("exec sleep 30"), None);

    f.supervisor.start(request()).await.unwrap();
    assert!(f.supervisor.is_running(1).await);

    let outcome = tokio::time::timeout(Duration::from_secs(10), f.supervisor.stop(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, StopOutcome::Stopped);
    assert!(!f.supervisor.is_running(1).await);
    assert_eq!(f.store.job(1).unwrap().status, StreamStatus::Stopped);

    // the exit event racing the stop must not overwrite "stopped"
    let event = f.exits.recv().await.unwrap();
    assert!(!event.exit.success());
    f.supervisor.on_exit(event).await.unwrap();
    assert_eq!(f.store.job(1).unwrap().status, StreamStatus::Stopped);

    let writes_before = f.store.writes().len();
    assert_eq!(f.supervisor.stop(1).await.unwrap(), StopOutcome::NotRunning);
    assert_eq!(f.store.writes().len(), writes_before);

    let writes = f.store.writes_for(1);
    assert_eq!(writes.len(), 2);
    assert!(matches!(writes[0], Write::Active { .. }));
    assert_eq!(
        writes[1],
        Write::Finished {
            id: 1,
            status: StreamStatus::Stopped,
            error: None
        }
    );
}

#[tokio::test]
async fn test_stop_unknown_job_is_not_running() {
    let f = fixture(shell("exit 0"), None);
    assert_eq!(
        f.supervisor.stop(99).await.unwrap(),
        StopOutcome::NotRunning
    );
    assert!(f.store.writes().is_empty());
}

#[tokio::test]
async fn test_stop_escalates_when_terminate_is_ignored() {
    let f = fixture(
        shell("trap '' TERM; exec sleep 30"),
        Some(Duration::from_millis(200)),
    );

    f.supervisor.start(request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outcome = tokio::time::timeout(Duration::from_secs(10), f.supervisor.stop(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, StopOutcome::Stopped);
    assert_eq!(f.store.job(1).unwrap().status, StreamStatus::Stopped);
}

#[tokio::test]
async fn test_stale_exit_event_is_ignored() {
    let f = fixture(shell("exec sleep 30"), None);
    f.supervisor.start(request()).await.unwrap();

    let stale = ExitEvent {
        job_id: 1,
        session_id: Uuid::new_v4(),
        exit: super::ExitInfo {
            code: Some(1),
            signal: None,
        },
    };
    f.supervisor.on_exit(stale).await.unwrap();
    assert!(f.supervisor.is_running(1).await);
    assert_eq!(f.store.job(1).unwrap().status, StreamStatus::Active);

    f.supervisor.stop(1).await.unwrap();
}

#[tokio::test]
async fn test_snapshot_lists_sessions() {
    let f = fixture(shell("exec sleep 30"), None);
    f.supervisor.start(request()).await.unwrap();

    let sessions = f.supervisor.snapshot().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].job_id, 1);
    assert!(sessions[0].pid.is_some());
    assert_eq!(sessions[0].platforms, platforms());

    f.supervisor.stop(1).await.unwrap();
    assert!(f.supervisor.snapshot().await.is_empty());
}
