use once_cell::sync::Lazy;
use regex::Regex;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Every failure that crosses the core boundary. `Display` is the sentence shown
/// to the user; `detail()` carries the diagnostic text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("PM2 is not installed or could not be found on this system.")]
    ToolNotInstalled,

    #[error("The PM2 command could not be completed.")]
    CommandFailed(String),

    #[error("PM2 returned output that could not be understood.")]
    InvalidOutput(String),

    #[error("Permission was denied while running PM2.")]
    PermissionDenied(String),

    #[error("The requested process could not be found.")]
    EntityNotFound(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ToolNotInstalled => "toolNotInstalled",
            AppError::CommandFailed(_) => "commandFailed",
            AppError::InvalidOutput(_) => "invalidOutput",
            AppError::PermissionDenied(_) => "permissionDenied",
            AppError::EntityNotFound(_) => "entityNotFound",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            AppError::ToolNotInstalled => None,
            AppError::CommandFailed(d)
            | AppError::InvalidOutput(d)
            | AppError::PermissionDenied(d)
            | AppError::EntityNotFound(d) => Some(d.as_str()).filter(|d| !d.is_empty()),
        }
    }

    pub fn timed_out(after_ms: u128) -> Self {
        AppError::CommandFailed(format!("timed out after {}ms", after_ms))
    }

    fn timed_out_by_signal() -> Self {
        AppError::CommandFailed("timed out (terminated by SIGTERM)".to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::CommandFailed(d) if d.starts_with("timed out"))
    }
}

impl Serialize for AppError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("AppError", 3)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("detail", &self.detail())?;
        state.end()
    }
}

/// SIGTERM. Exit via this signal (or the shell's 128+15) reads as the timeout path.
const SIGTERM: i32 = 15;
const SHELL_SIGTERM_CODE: i32 = 128 + SIGTERM;
/// What a shell or `env` shebang exits with when the program is missing.
const COMMAND_NOT_FOUND_CODE: i32 = 127;

static TOOL_MISSING: Lazy<Regex> = Lazy::new(|| {
    // Shell and exec shapes only. A bare ENOENT is usually about the managed
    // app's own files, not about pm2 or node.
    Regex::new(r"(?im)(command not found|^\S*:(\s*\d+:)?\s*\S+:\s*not found\s*$|\benv:\s*'?[^'\s]+'?:\s*no such file or directory|is not recognized as an internal or external command)")
        .expect("tool-missing pattern is valid")
});

static PERMISSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(permission denied|operation not permitted|access is denied|\bEACCES\b|\bEPERM\b)")
        .expect("permission pattern is valid")
});

static PROCESS_MISSING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(process or namespace \S+ not found|process \S+ not found|\S+ doesn't exist)")
        .expect("process-missing pattern is valid")
});

/// Termination information for a finished child, decoupled from `ExitStatus`
/// so classification stays a pure function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self { code: status.code(), signal }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn terminated(&self) -> bool {
        self.signal == Some(SIGTERM) || self.code == Some(SHELL_SIGTERM_CODE)
    }
}

/// Maps a finished invocation onto the taxonomy. `None` means success.
///
/// A SIGTERM exit is reported as a timeout even when something other than our
/// timer sent the signal.
pub fn classify_exit(exit: ExitInfo, stderr: &str) -> Option<AppError> {
    if exit.success() {
        return None;
    }
    if exit.terminated() {
        return Some(AppError::timed_out_by_signal());
    }
    if exit.code == Some(COMMAND_NOT_FOUND_CODE) {
        return Some(AppError::ToolNotInstalled);
    }
    Some(classify_stderr(stderr).unwrap_or_else(|| {
        let trimmed = stderr.trim();
        if trimmed.is_empty() {
            match (exit.code, exit.signal) {
                (Some(code), _) => AppError::CommandFailed(format!("exit code {}", code)),
                (None, Some(sig)) => AppError::CommandFailed(format!("terminated by signal {}", sig)),
                (None, None) => AppError::CommandFailed("exited abnormally".to_string()),
            }
        } else {
            AppError::CommandFailed(trimmed.to_string())
        }
    }))
}

/// Recognizes the stderr shapes that map onto a specific kind.
pub fn classify_stderr(stderr: &str) -> Option<AppError> {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return None;
    }
    if TOOL_MISSING.is_match(trimmed) {
        return Some(AppError::ToolNotInstalled);
    }
    if PERMISSION.is_match(trimmed) {
        return Some(AppError::PermissionDenied(trimmed.to_string()));
    }
    if PROCESS_MISSING.is_match(trimmed) {
        return Some(AppError::EntityNotFound(trimmed.to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> ExitInfo {
        ExitInfo { code: Some(code), signal: None }
    }

    #[test]
    fn zero_exit_is_success() {
        assert_eq!(classify_exit(exited(0), "some warning on stderr"), None);
    }

    #[test]
    fn sigterm_is_reported_as_timeout() {
        let by_signal = classify_exit(ExitInfo { code: None, signal: Some(15) }, "").unwrap();
        assert!(by_signal.is_timeout());
        let by_shell_code = classify_exit(exited(143), "").unwrap();
        assert!(by_shell_code.is_timeout());
    }

    #[test]
    fn missing_tool_stderr() {
        let err = classify_exit(exited(127), "sh: 1: pm2: not found\n").unwrap();
        assert_eq!(err, AppError::ToolNotInstalled);
        let err = classify_exit(exited(127), "/usr/bin/env: 'node': No such file or directory").unwrap();
        assert_eq!(err, AppError::ToolNotInstalled);
        let err = classify_exit(exited(1), "bash: pm2: command not found").unwrap();
        assert_eq!(err, AppError::ToolNotInstalled);
        assert_eq!(classify_exit(exited(127), "").unwrap(), AppError::ToolNotInstalled);
    }

    #[test]
    fn app_file_enoent_is_not_a_missing_tool() {
        let stderr = "[PM2][ERROR] Error: ENOENT: no such file or directory, open '/srv/api/ecosystem.config.js'";
        let err = classify_exit(exited(1), stderr).unwrap();
        assert_ne!(err, AppError::ToolNotInstalled);
        assert_eq!(err, AppError::CommandFailed(stderr.to_string()));

        let err = classify_exit(exited(1), "Error: Cannot find module '/srv/api/server.js'").unwrap();
        assert_eq!(err.kind(), "commandFailed");
    }

    #[test]
    fn permission_stderr() {
        let err = classify_exit(exited(1), "Error: EACCES: permission denied, open '/root/.pm2/pm2.log'").unwrap();
        assert!(matches!(err, AppError::PermissionDenied(ref d) if d.contains("EACCES")));
    }

    #[test]
    fn pm2_process_not_found_is_entity_not_found() {
        let err = classify_exit(exited(1), "[PM2][ERROR] Process or Namespace 42 not found").unwrap();
        assert_eq!(err.kind(), "entityNotFound");
    }

    #[test]
    fn unrecognized_stderr_is_kept_as_detail() {
        let err = classify_exit(exited(1), "  boom happened \n").unwrap();
        assert_eq!(err, AppError::CommandFailed("boom happened".to_string()));
        assert_eq!(err.to_string(), "The PM2 command could not be completed.");
        assert_eq!(err.detail(), Some("boom happened"));
    }

    #[test]
    fn empty_stderr_falls_back_to_exit_code() {
        let err = classify_exit(exited(3), "").unwrap();
        assert_eq!(err.detail(), Some("exit code 3"));
    }

    #[test]
    fn user_messages_are_sentences() {
        let all = [
            AppError::ToolNotInstalled,
            AppError::CommandFailed("RAW-DETAIL".into()),
            AppError::InvalidOutput("RAW-DETAIL".into()),
            AppError::PermissionDenied("RAW-DETAIL".into()),
            AppError::EntityNotFound("RAW-DETAIL".into()),
        ];
        for err in all {
            let msg = err.to_string();
            assert!(msg.ends_with('.'), "{msg}");
            assert!(!msg.contains("RAW-DETAIL"), "raw detail leaked into {msg}");
        }
    }

    #[test]
    fn serializes_kind_message_and_detail() {
        let value = serde_json::to_value(AppError::CommandFailed("exit code 2".into())).unwrap();
        assert_eq!(value["kind"], "commandFailed");
        assert_eq!(value["detail"], "exit code 2");
        let value = serde_json::to_value(AppError::ToolNotInstalled).unwrap();
        assert!(value["detail"].is_null());
    }
}
