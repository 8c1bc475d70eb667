//! UI-agnostic process state kept eventually consistent with PM2.
//!
//! The snapshot is replaced wholesale per successful refresh under a single
//! write lock, so readers of [`ProcessRegistry::view`] never see a half-applied
//! list. Failures keep the last good snapshot and only set the error.

pub mod auto_refresh;
pub mod filter;

use crate::error::AppError;
use crate::pm2::record::ProcessRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filter::{apply_filters, FilterState, StatusFilter};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

pub use auto_refresh::AutoRefreshHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessAction {
    Start,
    Stop,
    Restart,
    Delete,
}

impl ProcessAction {
    pub fn verb(&self) -> &'static str {
        match self {
            ProcessAction::Start => "start",
            ProcessAction::Stop => "stop",
            ProcessAction::Restart => "restart",
            ProcessAction::Delete => "delete",
        }
    }
}

impl fmt::Display for ProcessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// What the registry needs from the process manager.
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    async fn list(&self) -> Result<Vec<ProcessRecord>, AppError>;
    async fn describe(&self, id: u32) -> Result<ProcessRecord, AppError>;
    /// Raw output of the action; the exit code is what matters.
    async fn perform(&self, action: ProcessAction, id: u32) -> Result<String, AppError>;
    async fn logs(&self, id: u32, lines: u32) -> Result<String, AppError>;
    async fn version(&self) -> Result<String, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RefreshPhase {
    Idle,
    Refreshing,
    Error,
}

/// Everything a front-end renders from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryView {
    pub phase: RefreshPhase,
    pub snapshot: Vec<ProcessRecord>,
    pub filter: FilterState,
    pub filtered: Vec<ProcessRecord>,
    pub selected: Option<ProcessRecord>,
    pub error: Option<AppError>,
    pub is_loading: bool,
    /// `None` until the first health check or refresh.
    pub tool_available: Option<bool>,
    pub tool_version: Option<String>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub revision: u64,
    #[serde(skip)]
    in_flight: usize,
}

impl RegistryView {
    fn empty() -> Self {
        Self {
            phase: RefreshPhase::Idle,
            snapshot: Vec::new(),
            filter: FilterState::default(),
            filtered: Vec::new(),
            selected: None,
            error: None,
            is_loading: false,
            tool_available: None,
            tool_version: None,
            last_refreshed_at: None,
            revision: 0,
            in_flight: 0,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    fn settle_phase(&mut self) {
        self.phase = if self.in_flight > 0 {
            RefreshPhase::Refreshing
        } else if self.error.is_some() {
            RefreshPhase::Error
        } else {
            RefreshPhase::Idle
        };
    }

    fn reapply_filters(&mut self) -> bool {
        let filtered = apply_filters(&self.snapshot, &self.filter);
        let changed = filtered.len() != self.filtered.len()
            || filtered.iter().zip(self.filtered.iter()).any(|(a, b)| a.id != b.id);
        self.filtered = filtered;
        changed
    }

    fn reselect(&mut self) {
        if let Some(selected_id) = self.selected.as_ref().map(|r| r.id) {
            self.selected = self.snapshot.iter().find(|r| r.id == selected_id).cloned();
            if self.selected.is_none() {
                debug!(id = selected_id, "Selected process disappeared");
            }
        }
    }
}

pub struct ProcessRegistry {
    backend: Arc<dyn ProcessBackend>,
    state: RwLock<RegistryView>,
    revision_tx: watch::Sender<u64>,
    default_log_lines: u32,
}

impl fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("revision", &*self.revision_tx.borrow())
            .field("default_log_lines", &self.default_log_lines)
            .finish_non_exhaustive()
    }
}

impl ProcessRegistry {
    pub fn new(backend: Arc<dyn ProcessBackend>) -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            backend,
            state: RwLock::new(RegistryView::empty()),
            revision_tx,
            default_log_lines: 200,
        }
    }

    pub fn with_default_log_lines(mut self, lines: u32) -> Self {
        self.default_log_lines = lines;
        self
    }

    pub fn view(&self) -> RegistryView {
        self.read().clone()
    }

    /// Receives the revision number after every state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.read().in_flight > 0
    }

    /// Fetch the list and replace the snapshot. On failure the previous
    /// snapshot stays and the error is recorded.
    #[instrument(skip(self))]
    pub async fn refresh(&self, show_loading: bool) -> Result<(), AppError> {
        self.begin_refresh(show_loading, false);
        self.finish_refresh(show_loading).await
    }

    /// Like `refresh(false)`, but does nothing while another refresh is in
    /// flight. Returns whether a refresh ran.
    pub async fn refresh_if_idle(&self) -> Result<bool, AppError> {
        if !self.begin_refresh(false, true) {
            debug!("Skipping background refresh, one is already in flight");
            return Ok(false);
        }
        self.finish_refresh(false).await.map(|_| true)
    }

    fn begin_refresh(&self, show_loading: bool, only_if_idle: bool) -> bool {
        self.update(|s| {
            if only_if_idle && s.in_flight > 0 {
                return false;
            }
            s.in_flight += 1;
            s.is_loading |= show_loading;
            s.settle_phase();
            true
        })
    }

    async fn finish_refresh(&self, show_loading: bool) -> Result<(), AppError> {
        let mut guard = InFlightGuard { registry: self, show_loading, armed: true };
        let result = self.backend.list().await;
        guard.armed = false;
        let now = Utc::now();
        self.update(|s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            if show_loading {
                s.is_loading = false;
            }
            match &result {
                Ok(records) => {
                    s.snapshot = records.clone();
                    s.error = None;
                    s.tool_available = Some(true);
                    s.last_refreshed_at = Some(now);
                    s.reapply_filters();
                    s.reselect();
                }
                Err(err) => {
                    s.error = Some(err.clone());
                    if matches!(err, AppError::ToolNotInstalled) {
                        s.tool_available = Some(false);
                    }
                }
            }
            s.settle_phase();
        });
        match result {
            Ok(records) => {
                debug!(count = records.len(), "Snapshot replaced");
                Ok(())
            }
            Err(err) => {
                warn!(kind = err.kind(), detail = ?err.detail(), "Refresh failed, keeping previous snapshot");
                Err(err)
            }
        }
    }

    /// Probe `--version`. Records availability and clears a stale
    /// tool-missing error when the tool is back.
    #[instrument(skip(self))]
    pub async fn check_health(&self) -> bool {
        let result = self.backend.version().await;
        let available = result.is_ok();
        self.update(|s| {
            s.tool_available = Some(available);
            match &result {
                Ok(version) => {
                    s.tool_version = Some(version.clone()).filter(|v| !v.is_empty());
                    if matches!(s.error, Some(AppError::ToolNotInstalled)) {
                        s.error = None;
                    }
                }
                Err(err) => s.error = Some(err.clone()),
            }
            s.settle_phase();
        });
        match &result {
            Ok(version) => info!(%version, "PM2 health check passed"),
            Err(err) => warn!(kind = err.kind(), "PM2 health check failed"),
        }
        available
    }

    /// Run an action, then resynchronize without the loading indicator.
    /// A failed action leaves the snapshot alone.
    #[instrument(skip(self))]
    pub async fn perform(&self, action: ProcessAction, id: u32) -> Result<String, AppError> {
        match self.backend.perform(action, id).await {
            Ok(output) => {
                info!(%action, id, "Action accepted");
                if let Err(err) = self.refresh(false).await {
                    debug!(kind = err.kind(), "Refresh after action failed");
                }
                Ok(output)
            }
            Err(err) => {
                warn!(%action, id, kind = err.kind(), detail = ?err.detail(), "Action failed");
                Err(err)
            }
        }
    }

    pub async fn start_process(&self, id: u32) -> Result<String, AppError> {
        self.perform(ProcessAction::Start, id).await
    }

    pub async fn stop_process(&self, id: u32) -> Result<String, AppError> {
        self.perform(ProcessAction::Stop, id).await
    }

    pub async fn restart_process(&self, id: u32) -> Result<String, AppError> {
        self.perform(ProcessAction::Restart, id).await
    }

    pub async fn delete_process(&self, id: u32) -> Result<String, AppError> {
        self.perform(ProcessAction::Delete, id).await
    }

    pub async fn fetch_logs(&self, id: u32, lines: Option<u32>) -> Result<String, AppError> {
        self.backend.logs(id, lines.unwrap_or(self.default_log_lines)).await
    }

    pub async fn describe(&self, id: u32) -> Result<ProcessRecord, AppError> {
        self.backend.describe(id).await
    }

    pub fn set_search_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.update(|s| {
            s.filter.search_text = text;
            s.reapply_filters();
        });
    }

    pub fn set_status_filter(&self, status: StatusFilter) {
        self.update(|s| {
            s.filter.status = status;
            s.reapply_filters();
        });
    }

    pub fn set_filter(&self, filter: FilterState) {
        self.update(|s| {
            s.filter = filter;
            s.reapply_filters();
        });
    }

    /// Recompute the filtered view from the current snapshot and filter.
    pub fn apply_filters(&self) {
        let revision = {
            let mut state = self.write();
            if !state.reapply_filters() {
                return;
            }
            state.revision += 1;
            state.revision
        };
        self.revision_tx.send_replace(revision);
    }

    /// Select by id from the current snapshot.
    pub fn select(&self, id: u32) -> Option<ProcessRecord> {
        self.update(|s| {
            s.selected = s.snapshot.iter().find(|r| r.id == id).cloned();
            s.selected.clone()
        })
    }

    pub fn clear_selection(&self) {
        self.update(|s| s.selected = None);
    }

    /// Start the periodic refresh loop. Dropping the handle stops it.
    pub fn activate(self: &Arc<Self>, period: Duration) -> AutoRefreshHandle {
        auto_refresh::spawn(Arc::clone(self), period)
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryView> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryView> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update<T>(&self, mutate: impl FnOnce(&mut RegistryView) -> T) -> T {
        let (out, revision) = {
            let mut state = self.write();
            let out = mutate(&mut state);
            state.revision += 1;
            (out, state.revision)
        };
        self.revision_tx.send_replace(revision);
        out
    }
}

/// Releases the in-flight slot of a refresh whose future was dropped mid-call.
struct InFlightGuard<'a> {
    registry: &'a ProcessRegistry,
    show_loading: bool,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let show_loading = self.show_loading;
            self.registry.update(|s| {
                s.in_flight = s.in_flight.saturating_sub(1);
                if show_loading {
                    s.is_loading = false;
                }
                s.settle_phase();
            });
        }
    }
}
