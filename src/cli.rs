use clap::{Args, Parser, Subcommand};
use pm2_deck::{ProcessRecord, RegistryView};
use std::fmt::Write as _;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "pm2-deck", version)]
#[command(about = "Inspect and control PM2-managed processes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the current process list
    List {
        #[command(flatten)]
        filter: FilterArgs,
        /// Emit the filtered records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep the list on screen, refreshing periodically until Ctrl-C
    Watch {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Show every known field of one process
    Describe { id: u32 },
    Start { id: u32 },
    Stop { id: u32 },
    Restart { id: u32 },
    Delete { id: u32 },
    /// Print recent log lines of one process
    Logs {
        id: u32,
        /// Defaults to PM2_DECK_LOG_LINES
        #[arg(long)]
        lines: Option<u32>,
    },
    /// Report where pm2 was found and whether it answers
    Doctor,
}

#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Case-insensitive substring of the process name
    #[arg(long, default_value = "")]
    pub search: String,
    /// Exact status (online, stopped, errored, ...); "all" disables
    #[arg(long, default_value = "all")]
    pub status: String,
}

pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

pub fn render_table(records: &[ProcessRecord], now_epoch_ms: i64) -> String {
    let name_width = records.iter().map(|r| r.name.len()).max().unwrap_or(0).max(4);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>4}  {:<name_width$}  {:<10}  {:>7}  {:>6}  {:>9}  {:>8}",
        "id", "name", "status", "pid", "cpu", "memory", "uptime"
    );
    for record in records {
        let pid = record.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        let uptime = if record.status.is_running() {
            format_uptime(record.uptime_at(now_epoch_ms))
        } else {
            "-".to_string()
        };
        let _ = writeln!(
            out,
            "{:>4}  {:<name_width$}  {:<10}  {:>7}  {:>5.1}%  {:>6.1} MB  {:>8}",
            record.id,
            record.name,
            record.status.as_str(),
            pid,
            record.cpu_percent,
            record.memory_mb(),
            uptime
        );
    }
    out
}

pub fn render_record(record: &ProcessRecord, now_epoch_ms: i64) -> String {
    let dash = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
    let mut out = String::new();
    let _ = writeln!(out, "id:        {}", record.id);
    let _ = writeln!(out, "name:      {}", record.name);
    let _ = writeln!(out, "status:    {}", record.status.as_str());
    let _ = writeln!(out, "pid:       {}", record.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()));
    let _ = writeln!(out, "cpu:       {:.1}%", record.cpu_percent);
    let _ = writeln!(out, "memory:    {:.1} MB", record.memory_mb());
    let _ = writeln!(out, "uptime:    {}", format_uptime(record.uptime_at(now_epoch_ms)));
    let _ = writeln!(out, "restarts:  {}", record.restart_count);
    let _ = writeln!(out, "exec mode: {}", dash(&record.exec_mode));
    let _ = writeln!(out, "script:    {}", dash(&record.exec_path));
    let _ = writeln!(out, "node:      {}", dash(&record.runtime_version));
    let _ = writeln!(out, "version:   {}", dash(&record.app_version));
    out
}

/// Header line plus table, with the last error underneath when there is one.
pub fn render_view(view: &RegistryView, now_epoch_ms: i64) -> String {
    let mut out = String::new();
    let refreshed = view
        .last_refreshed_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    let _ = writeln!(
        out,
        "{} of {} processes, refreshed {}",
        view.filtered.len(),
        view.snapshot.len(),
        refreshed
    );
    out.push_str(&render_table(&view.filtered, now_epoch_ms));
    if let Some(message) = view.error_message() {
        let _ = writeln!(out, "\nerror: {}", message);
    }
    out
}
