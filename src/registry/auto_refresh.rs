//! Periodic background refresh tied to the lifetime of a handle.

use super::ProcessRegistry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

/// Owns the refresh task. Dropping the handle cancels it; in-flight PM2
/// invocations finish on their own.
#[derive(Debug)]
pub struct AutoRefreshHandle {
    task: Option<JoinHandle<()>>,
}

impl AutoRefreshHandle {
    pub fn stop(mut self) {
        self.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Auto-refresh stopped");
        }
    }
}

impl Drop for AutoRefreshHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Polls `--version` until PM2 answers, then refreshes on every tick. A
/// refresh that reports the tool missing drops back to health polling.
pub(super) fn spawn(registry: Arc<ProcessRegistry>, period: Duration) -> AutoRefreshHandle {
    info!(period_ms = period.as_millis() as u64, "Auto-refresh started");
    let task = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if registry.view().tool_available != Some(true) {
                if !registry.check_health().await {
                    continue;
                }
                let _ = registry.refresh(false).await;
                continue;
            }
            match registry.refresh_if_idle().await {
                Ok(true) => {}
                Ok(false) => debug!("Tick skipped, refresh already in flight"),
                Err(err) => debug!(kind = err.kind(), "Background refresh failed"),
            }
        }
    });
    AutoRefreshHandle { task: Some(task) }
}
