use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

const BYTES_PER_MB: f64 = 1_048_576.0;

/// Lifecycle state reported by PM2. Unknown states are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProcessStatus {
    Online,
    Stopped,
    Errored,
    Launching,
    Stopping,
    WaitingRestart,
    OneLaunchStatus,
    Other(String),
}

impl ProcessStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "online" => ProcessStatus::Online,
            "stopped" => ProcessStatus::Stopped,
            "errored" => ProcessStatus::Errored,
            "launching" => ProcessStatus::Launching,
            "stopping" => ProcessStatus::Stopping,
            "waiting restart" => ProcessStatus::WaitingRestart,
            "one-launch-status" => ProcessStatus::OneLaunchStatus,
            _ => ProcessStatus::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProcessStatus::Online => "online",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Errored => "errored",
            ProcessStatus::Launching => "launching",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::WaitingRestart => "waiting restart",
            ProcessStatus::OneLaunchStatus => "one-launch-status",
            ProcessStatus::Other(s) => s,
        }
    }

    pub fn matches(&self, other: &str) -> bool {
        self.as_str().eq_ignore_ascii_case(other.trim())
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Online | ProcessStatus::Launching)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ProcessStatus {
    fn from(raw: String) -> Self {
        ProcessStatus::parse(&raw)
    }
}

impl From<ProcessStatus> for String {
    fn from(status: ProcessStatus) -> Self {
        status.as_str().to_string()
    }
}

/// One PM2-managed process as of the last refresh.
///
/// Identity is `id` alone: equality and hashing ignore every other field.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub id: u32,
    pub name: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub started_at_epoch_ms: Option<i64>,
    pub created_at_epoch_ms: Option<i64>,
    pub restart_count: u32,
    pub exec_path: Option<String>,
    pub exec_mode: Option<String>,
    pub runtime_version: Option<String>,
    pub app_version: Option<String>,
}

impl ProcessRecord {
    pub fn new(id: u32, name: impl Into<String>, status: ProcessStatus) -> Self {
        Self {
            id,
            name: name.into(),
            status,
            pid: None,
            cpu_percent: 0.0,
            memory_bytes: 0,
            started_at_epoch_ms: None,
            created_at_epoch_ms: None,
            restart_count: 0,
            exec_path: None,
            exec_mode: None,
            runtime_version: None,
            app_version: None,
        }
    }

    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes as f64 / BYTES_PER_MB
    }

    pub fn uptime(&self) -> Duration {
        self.uptime_at(Utc::now().timestamp_millis())
    }

    /// Zero when the start time is unknown or in the future.
    pub fn uptime_at(&self, now_epoch_ms: i64) -> Duration {
        match self.started_at_epoch_ms {
            Some(started) if now_epoch_ms > started => Duration::from_millis((now_epoch_ms - started) as u64),
            _ => Duration::ZERO,
        }
    }
}

impl PartialEq for ProcessRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ProcessRecord {}

impl Hash for ProcessRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
