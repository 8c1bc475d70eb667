//! Turns `pm2 jlist` / `pm2 describe` output into [`ProcessRecord`]s.
//!
//! Required fields (`pm_id`, `pm2_env.status`) fail the whole batch when missing
//! or mistyped. Every other field falls back to its default on its own.

use crate::error::AppError;
use crate::pm2::record::{ProcessRecord, ProcessStatus};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub fn decode_process_list(raw: &str) -> Result<Vec<ProcessRecord>, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let value = parse_json_array(trimmed)?;
    let items = value
        .as_array()
        .ok_or_else(|| AppError::InvalidOutput("expected a JSON array of processes".to_string()))?;

    let records = items
        .iter()
        .enumerate()
        .map(|(index, item)| decode_record(item).map_err(|reason| {
            warn!(index, reason = %reason, "Rejecting process list");
            AppError::InvalidOutput(format!("process #{}: {}", index, reason))
        }))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(count = records.len(), "Decoded process list");
    Ok(records)
}

/// Decodes `describe` output and picks the element for `id`.
pub fn decode_single(raw: &str, id: u32) -> Result<ProcessRecord, AppError> {
    decode_process_list(raw)?
        .into_iter()
        .find(|record| record.id == id)
        .ok_or_else(|| AppError::EntityNotFound(format!("no process with id {}", id)))
}

// PM2 can print banner and warning lines around the JSON document, which
// itself always sits on one line. Its own `[PM2]` lines also start with `[`,
// so every candidate is parsed, newest first.
fn parse_json_array(text: &str) -> Result<Value, AppError> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Ok(value),
        Err(whole_err) => text
            .lines()
            .rev()
            .map(str::trim)
            .filter(|line| line.starts_with('['))
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .find(Value::is_array)
            .ok_or_else(|| AppError::InvalidOutput(format!("malformed JSON: {}", whole_err))),
    }
}

fn decode_record(item: &Value) -> Result<ProcessRecord, String> {
    let object = item.as_object().ok_or("element is not an object")?;

    let id = object
        .get("pm_id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or("missing or invalid pm_id")?;

    let env = object.get("pm2_env").and_then(Value::as_object);
    let status = env
        .and_then(|env| env.get("status"))
        .and_then(Value::as_str)
        .map(ProcessStatus::parse)
        .ok_or("missing or invalid pm2_env.status")?;

    let name = opt_string(Some(object), "name")
        .or_else(|| opt_string(env, "name"))
        .unwrap_or_default();

    let monit = object.get("monit").and_then(Value::as_object);

    Ok(ProcessRecord {
        id,
        name,
        status,
        // PM2 reports pid 0 for processes that are not running.
        pid: object
            .get("pid")
            .and_then(Value::as_u64)
            .and_then(|pid| u32::try_from(pid).ok())
            .filter(|pid| *pid != 0),
        cpu_percent: cpu_value(monit.and_then(|m| m.get("cpu"))),
        memory_bytes: monit.and_then(|m| m.get("memory")).and_then(Value::as_u64).unwrap_or(0),
        started_at_epoch_ms: opt_epoch_ms(env, "pm_uptime"),
        created_at_epoch_ms: opt_epoch_ms(env, "created_at"),
        restart_count: env
            .and_then(|env| env.get("restart_time"))
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        exec_path: opt_string(env, "pm_exec_path"),
        exec_mode: opt_string(env, "exec_mode"),
        runtime_version: opt_string(env, "node_version"),
        app_version: opt_string(env, "version"),
    })
}

/// Integer and float encodings both normalize to `f64`; anything else is zero.
fn cpu_value(value: Option<&Value>) -> f64 {
    let cpu = match value {
        Some(Value::Number(n)) => n.as_i64().map(|i| i as f64).or_else(|| n.as_f64()),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    cpu.filter(|c| c.is_finite() && *c >= 0.0).unwrap_or(0.0)
}

fn opt_string(object: Option<&Map<String, Value>>, key: &str) -> Option<String> {
    object?
        .get(key)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "N/A")
        .map(String::from)
}

fn opt_epoch_ms(object: Option<&Map<String, Value>>, key: &str) -> Option<i64> {
    match object?.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
    .filter(|ms| *ms > 0)
}
