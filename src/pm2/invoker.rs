//! Runs one external command to completion or timeout.
//!
//! Both pipes are drained by their own task while the child runs, into a buffer
//! shared under one mutex with the single-resolution slot. A natural exit and
//! the timeout timer race to take that slot; whoever takes it delivers the only
//! result the caller will ever see.

use crate::error::{classify_exit, AppError, ExitInfo};
use crate::utils::search_path::{augmented_search_path, resolve_home};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio as StdProcessStdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as TokioCommand;
use tokio::sync::{oneshot, Mutex as TokioMutex, Notify};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const READ_CHUNK: usize = 8 * 1024;

/// Everything a finished invocation wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Both streams in arrival order.
    pub combined: String,
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

type Outcome = Result<CapturedOutput, AppError>;

#[derive(Debug, Default)]
struct OutputBuffer {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
}

impl OutputBuffer {
    fn append(&mut self, kind: StreamKind, chunk: &[u8]) {
        match kind {
            StreamKind::Stdout => self.stdout.extend_from_slice(chunk),
            StreamKind::Stderr => self.stderr.extend_from_slice(chunk),
        }
        self.combined.extend_from_slice(chunk);
    }

    fn snapshot(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            combined: String::from_utf8_lossy(&self.combined).into_owned(),
        }
    }
}

/// Per-invocation state. The output buffer and the resolution slot live under
/// the same lock.
#[derive(Debug)]
struct InvocationState {
    output: OutputBuffer,
    resolution: Option<oneshot::Sender<Outcome>>,
}

type SharedState = Arc<TokioMutex<InvocationState>>;

/// Delivers `outcome` unless a result was already delivered. Returns whether it won.
async fn resolve(state: &SharedState, outcome: impl FnOnce(&OutputBuffer) -> Outcome) -> bool {
    let mut guard = state.lock().await;
    match guard.resolution.take() {
        Some(sender) => {
            let result = outcome(&guard.output);
            let _ = sender.send(result);
            true
        }
        None => false,
    }
}

async fn drain<R>(mut reader: R, kind: StreamKind, state: SharedState)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => state.lock().await.output.append(kind, &chunk[..n]),
            Err(e) => {
                warn!(stream = ?kind, error = %e, "Stopped draining child stream");
                break;
            }
        }
    }
}

/// Spawns external commands with a prepared environment.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    environment: Arc<BTreeMap<OsString, OsString>>,
}

impl CommandInvoker {
    pub fn new(environment: BTreeMap<OsString, OsString>) -> Self {
        Self {
            environment: Arc::new(environment),
        }
    }

    /// Environment derived from the current process, augmented for `binary_name`.
    pub fn from_process_env(binary_name: &str, extra_dirs: &[PathBuf]) -> Self {
        Self::new(build_environment(std::env::vars_os(), binary_name, extra_dirs))
    }

    #[instrument(skip(self, program, args), fields(program = %program.display()))]
    pub async fn invoke<S: AsRef<OsStr>>(
        &self,
        program: &Path,
        args: &[S],
        timeout: Duration,
    ) -> Result<CapturedOutput, AppError> {
        let invocation_id = Uuid::new_v4();
        let started = Instant::now();
        let arg_list: Vec<String> = args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()).collect();
        debug!(%invocation_id, args = ?arg_list, timeout_ms = timeout.as_millis() as u64, "Invoking command");

        let mut command = TokioCommand::new(program);
        command
            .args(args)
            .env_clear()
            .envs(self.environment.iter())
            .stdin(StdProcessStdio::null())
            .stdout(StdProcessStdio::piped())
            .stderr(StdProcessStdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            error!(%invocation_id, error = %e, "Failed to spawn command");
            AppError::ToolNotInstalled
        })?;
        debug!(%invocation_id, pid = ?child.id(), "Spawned command");

        let (sender, receiver) = oneshot::channel();
        let state: SharedState = Arc::new(TokioMutex::new(InvocationState {
            output: OutputBuffer::default(),
            resolution: Some(sender),
        }));

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            return Err(AppError::CommandFailed("child output streams were not captured".to_string()));
        };
        let mut stdout_task = tokio::spawn(drain(stdout, StreamKind::Stdout, state.clone()));
        let mut stderr_task = tokio::spawn(drain(stderr, StreamKind::Stderr, state.clone()));

        // Fired by the timer after it wins the resolution slot.
        let kill_signal = Arc::new(Notify::new());

        let timer = {
            let state = state.clone();
            let kill_signal = kill_signal.clone();
            tokio::spawn(async move {
                sleep(timeout).await;
                let won = resolve(&state, |_| Err(AppError::timed_out(timeout.as_millis()))).await;
                if won {
                    warn!(%invocation_id, timeout_ms = timeout.as_millis() as u64, "Command timed out");
                    kill_signal.notify_one();
                }
            })
        };

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_signal.notified() => None,
            };

            let status = match status {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        debug!(%invocation_id, error = %e, "Kill after timeout failed, child already gone");
                    }
                    stdout_task.abort();
                    stderr_task.abort();
                    let _ = child.wait().await;
                    return;
                }
            };

            // The child may have left a descendant holding the pipes open, so the
            // timer stays armed while the streams finish.
            let drained = tokio::select! {
                _ = async { let _ = tokio::join!(&mut stdout_task, &mut stderr_task); } => true,
                _ = kill_signal.notified() => false,
            };
            if !drained {
                stdout_task.abort();
                stderr_task.abort();
                return;
            }
            timer.abort();

            let elapsed_ms = started.elapsed().as_millis() as u64;
            let status = match status {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    resolve(&state, |_| Err(AppError::CommandFailed(format!("failed to wait for command: {}", e)))).await;
                    return;
                }
            };

            resolve(&state, |output| {
                let captured = output.snapshot();
                match classify_exit(status, &captured.stderr) {
                    None => {
                        if !captured.stderr.trim().is_empty() {
                            debug!(%invocation_id, stderr = %captured.stderr.trim(), "Command wrote to stderr");
                        }
                        info!(%invocation_id, elapsed_ms, "Command succeeded");
                        Ok(captured)
                    }
                    Some(err) => {
                        warn!(%invocation_id, elapsed_ms, exit_code = ?status.code, signal = ?status.signal, kind = err.kind(), detail = ?err.detail(), "Command failed");
                        Err(err)
                    }
                }
            })
            .await;
        });

        receiver
            .await
            .unwrap_or_else(|_| Err(AppError::CommandFailed("the command ended without reporting a result".to_string())))
    }
}

/// The inherited environment plus PM2 defaults: `HOME` and `PM2_HOME` when unset,
/// and a search path with version-manager and common prefixes prepended.
pub fn build_environment<I>(inherited: I, binary_name: &str, extra_dirs: &[PathBuf]) -> BTreeMap<OsString, OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: BTreeMap<OsString, OsString> = inherited.into_iter().collect();

    let home = resolve_home(env.get(OsStr::new("HOME")).cloned());
    if let Some(home) = &home {
        env.entry(OsString::from("HOME")).or_insert_with(|| home.clone().into_os_string());
        env.entry(OsString::from("PM2_HOME"))
            .or_insert_with(|| home.join(".pm2").into_os_string());
    }

    let path = augmented_search_path(
        env.get(OsStr::new("PATH")).map(OsString::as_os_str),
        home.as_deref(),
        binary_name,
        extra_dirs,
    );
    env.insert(OsString::from("PATH"), path);
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))).collect()
    }

    #[test]
    fn environment_fills_pm2_defaults() {
        let env = build_environment(env_of(&[("HOME", "/home/ops"), ("PATH", "/usr/bin")]), "pm2", &[]);
        assert_eq!(env[OsStr::new("PM2_HOME")], OsString::from("/home/ops/.pm2"));
        let path: Vec<PathBuf> = std::env::split_paths(&env[OsStr::new("PATH")]).collect();
        assert!(path.contains(&PathBuf::from("/usr/bin")));
        assert!(path.contains(&PathBuf::from("/usr/local/bin")));
        assert!(path.contains(&PathBuf::from("/home/ops/.volta/bin")));
    }

    #[test]
    fn environment_keeps_existing_values() {
        let env = build_environment(
            env_of(&[("HOME", "/home/ops"), ("PM2_HOME", "/var/pm2"), ("NODE_ENV", "production")]),
            "pm2",
            &[],
        );
        assert_eq!(env[OsStr::new("PM2_HOME")], OsString::from("/var/pm2"));
        assert_eq!(env[OsStr::new("NODE_ENV")], OsString::from("production"));
    }

    #[tokio::test]
    async fn resolution_happens_once() {
        let (sender, mut receiver) = oneshot::channel();
        let state: SharedState = Arc::new(TokioMutex::new(InvocationState {
            output: OutputBuffer::default(),
            resolution: Some(sender),
        }));
        assert!(resolve(&state, |_| Err(AppError::timed_out(10))).await);
        state.lock().await.output.append(StreamKind::Stdout, b"late output");
        assert!(!resolve(&state, |o| Ok(o.snapshot())).await);
        assert!(receiver.try_recv().unwrap().unwrap_err().is_timeout());
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn sh() -> PathBuf {
            PathBuf::from("/bin/sh")
        }

        fn invoker() -> CommandInvoker {
            CommandInvoker::from_process_env("pm2", &[])
        }

        #[tokio::test]
        async fn captures_stdout_on_success() {
            let out = invoker()
                .invoke(&sh(), &["-c", "echo hello; echo warn 1>&2"], Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(out.stdout, "hello\n");
            assert_eq!(out.stderr, "warn\n");
            assert!(out.combined.contains("hello") && out.combined.contains("warn"));
        }

        #[tokio::test]
        async fn stdin_is_null() {
            let out = invoker()
                .invoke(&sh(), &["-c", "cat; echo done"], Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(out.stdout, "done\n");
        }

        #[tokio::test]
        async fn large_output_on_both_streams_does_not_deadlock() {
            let script = "i=0; while [ $i -lt 4000 ]; do \
                echo 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx'; \
                echo 'yyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyy' 1>&2; \
                i=$((i+1)); done";
            let out = invoker()
                .invoke(&sh(), &["-c", script], Duration::from_secs(30))
                .await
                .unwrap();
            assert_eq!(out.stdout.lines().count(), 4000);
            assert_eq!(out.stderr.lines().count(), 4000);
        }

        #[tokio::test]
        async fn timeout_resolves_once_with_command_failed() {
            let started = Instant::now();
            let err = invoker()
                .invoke(&sh(), &["-c", "sleep 5; echo too late"], Duration::from_millis(200))
                .await
                .unwrap_err();
            assert!(err.is_timeout(), "{err:?}");
            assert!(matches!(err, AppError::CommandFailed(ref d) if d.contains("timed out")));
            assert!(started.elapsed() < Duration::from_secs(4));
        }

        #[tokio::test]
        async fn non_zero_exit_is_classified() {
            let err = invoker()
                .invoke(&sh(), &["-c", "echo 'something broke' 1>&2; exit 2"], Duration::from_secs(5))
                .await
                .unwrap_err();
            assert_eq!(err, AppError::CommandFailed("something broke".to_string()));

            let err = invoker()
                .invoke(&sh(), &["-c", "exit 4"], Duration::from_secs(5))
                .await
                .unwrap_err();
            assert_eq!(err.detail(), Some("exit code 4"));

            let err = invoker()
                .invoke(&sh(), &["-c", "echo 'open /x: permission denied' 1>&2; exit 1"], Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::PermissionDenied(_)));
        }

        #[tokio::test]
        async fn self_sigterm_reads_as_timeout() {
            let err = invoker()
                .invoke(&sh(), &["-c", "kill -TERM $$"], Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(err.is_timeout());
        }

        #[tokio::test]
        async fn missing_program_is_tool_not_installed() {
            let err = invoker()
                .invoke(Path::new("/definitely/not/here/pm2"), &["jlist"], Duration::from_secs(1))
                .await
                .unwrap_err();
            assert_eq!(err, AppError::ToolNotInstalled);
        }

        #[tokio::test]
        async fn environment_reaches_the_child() {
            let mut env = BTreeMap::new();
            env.insert(OsString::from("PM2_HOME"), OsString::from("/tmp/custom-pm2"));
            let out = CommandInvoker::new(env)
                .invoke(&sh(), &["-c", "printf %s \"$PM2_HOME\""], Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(out.stdout, "/tmp/custom-pm2");
        }
    }
}
