#![cfg(unix)]

use pm2_deck::pm2::invoker::CommandInvoker;
use pm2_deck::pm2::locator::ExecutableLocator;
use pm2_deck::{AppError, Pm2Service, ProcessRegistry, ProcessStatus, RefreshPhase, StatusFilter};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// A stand-in pm2 keeping one process (id 7) whose status lives in a file
// next to the script. Writing "broken" to the mode file makes jlist fail.
const STUB: &str = r#"#!/bin/sh
DIR="$(dirname "$0")"
STATE="$DIR/state"
MODE="$DIR/mode"
[ -f "$STATE" ] || echo stopped > "$STATE"
status="$(cat "$STATE")"
if [ "$status" = "online" ]; then pid=4321; else pid=0; fi
record="{\"pm_id\":7,\"name\":\"billing\",\"pid\":$pid,\"monit\":{\"cpu\":2,\"memory\":10485760},\"pm2_env\":{\"status\":\"$status\",\"restart_time\":1,\"exec_mode\":\"fork_mode\"}}"
case "$1" in
  jlist)
    if [ -f "$MODE" ] && [ "$(cat "$MODE")" = "broken" ]; then
      echo "connect EACCES /root/.pm2/rpc.sock" 1>&2
      exit 1
    fi
    echo "[$record]"
    ;;
  describe)
    if [ "$2" = "7" ]; then echo "[$record]"; else echo "[]"; fi
    ;;
  start|restart)
    if [ "$2" != "7" ]; then echo "[PM2][ERROR] Process or Namespace $2 not found" 1>&2; exit 1; fi
    echo online > "$STATE"
    ;;
  stop)
    echo stopped > "$STATE"
    ;;
  logs)
    echo "billing out line"
    echo "billing err line" 1>&2
    ;;
  --version)
    echo "5.3.1"
    ;;
  *)
    echo "unknown command $1" 1>&2
    exit 1
    ;;
esac
"#;

struct Stub {
    dir: TempDir,
    tool: PathBuf,
}

impl Stub {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("pm2");
        std::fs::write(&tool, STUB).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, tool }
    }

    fn set_mode(&self, mode: &str) {
        std::fs::write(self.dir.path().join("mode"), mode).unwrap();
    }

    fn registry(&self) -> Arc<ProcessRegistry> {
        Arc::new(ProcessRegistry::new(Arc::new(service_for(&self.tool))))
    }
}

fn service_for(tool: &Path) -> Pm2Service {
    let locator = ExecutableLocator::with_environment(tool.to_string_lossy(), Vec::new(), None, None);
    Pm2Service::new(locator, CommandInvoker::from_process_env("pm2", &[]), Duration::from_secs(10))
}

#[tokio::test]
async fn start_then_refresh_shows_process_online() {
    let stub = Stub::new();
    let registry = stub.registry();

    registry.refresh(true).await.unwrap();
    let view = registry.view();
    assert_eq!(view.snapshot.len(), 1);
    assert_eq!(view.snapshot[0].status, ProcessStatus::Stopped);
    assert_eq!(view.snapshot[0].pid, None);

    registry.start_process(7).await.unwrap();
    let view = registry.view();
    let record = view.snapshot.iter().find(|r| r.id == 7).unwrap();
    assert_eq!(record.status, ProcessStatus::Online);
    assert_eq!(record.pid, Some(4321));
    assert_eq!(record.memory_mb(), 10.0);
    assert_eq!(record.cpu_percent, 2.0);
    assert!(!view.is_loading);
}

#[tokio::test]
async fn unknown_id_is_reported_as_not_found() {
    let stub = Stub::new();
    let registry = stub.registry();

    let err = registry.restart_process(99).await.unwrap_err();
    assert!(matches!(err, AppError::EntityNotFound(_)), "got {:?}", err);
    assert!(matches!(registry.describe(99).await, Err(AppError::EntityNotFound(_))));
    assert_eq!(registry.describe(7).await.unwrap().exec_mode.as_deref(), Some("fork_mode"));
}

#[tokio::test]
async fn failing_list_keeps_previous_snapshot() {
    let stub = Stub::new();
    let registry = stub.registry();
    registry.refresh(false).await.unwrap();

    stub.set_mode("broken");
    let err = registry.refresh(true).await.unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)), "got {:?}", err);

    let view = registry.view();
    assert_eq!(view.snapshot.len(), 1);
    assert_eq!(view.phase, RefreshPhase::Error);
    assert!(!view.is_loading);

    stub.set_mode("ok");
    registry.refresh(false).await.unwrap();
    assert_eq!(registry.view().phase, RefreshPhase::Idle);
}

#[tokio::test]
async fn filters_apply_to_real_output() {
    let stub = Stub::new();
    let registry = stub.registry();
    registry.set_status_filter(StatusFilter::parse("online"));
    registry.refresh(false).await.unwrap();
    assert!(registry.view().filtered.is_empty());

    registry.start_process(7).await.unwrap();
    assert_eq!(registry.view().filtered.len(), 1);
}

#[tokio::test]
async fn logs_and_health_check() {
    let stub = Stub::new();
    let registry = stub.registry();

    let logs = registry.fetch_logs(7, Some(5)).await.unwrap();
    assert!(logs.contains("billing out line"));
    assert!(logs.contains("billing err line"));

    assert!(registry.check_health().await);
    assert_eq!(registry.view().tool_version.as_deref(), Some("5.3.1"));
}

#[tokio::test]
async fn missing_tool_is_not_installed() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ProcessRegistry::new(Arc::new(service_for(&dir.path().join("pm2"))));

    assert_eq!(registry.refresh(false).await.unwrap_err(), AppError::ToolNotInstalled);
    assert_eq!(registry.view().tool_available, Some(false));
    assert!(!registry.check_health().await);
}
