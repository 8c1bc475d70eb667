use crate::config::Config;
use crate::error::AppError;
use crate::pm2::decoder::{decode_process_list, decode_single};
use crate::pm2::invoker::{CapturedOutput, CommandInvoker};
use crate::pm2::locator::ExecutableLocator;
use crate::pm2::record::ProcessRecord;
use crate::registry::{ProcessAction, ProcessBackend};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument};

/// The PM2 CLI as a typed backend: locate, invoke, decode.
#[derive(Debug)]
pub struct Pm2Service {
    locator: ExecutableLocator,
    invoker: CommandInvoker,
    timeout: Duration,
}

impl Pm2Service {
    pub fn new(locator: ExecutableLocator, invoker: CommandInvoker, timeout: Duration) -> Self {
        Self { locator, invoker, timeout }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            ExecutableLocator::new(config.binary_name.clone(), config.extra_search_paths.clone()),
            CommandInvoker::from_process_env(&config.binary_name, &config.extra_search_paths),
            config.command_timeout,
        )
    }

    pub fn locator(&self) -> &ExecutableLocator {
        &self.locator
    }

    async fn run(&self, args: &[String]) -> Result<CapturedOutput, AppError> {
        let program = self.locator.locate().ok_or(AppError::ToolNotInstalled)?;
        let result = self.invoker.invoke(&program, args, self.timeout).await;
        if matches!(result, Err(AppError::ToolNotInstalled)) {
            // Uninstalled or moved mid-session: look again next time.
            self.locator.invalidate();
        }
        result
    }
}

#[async_trait]
impl ProcessBackend for Pm2Service {
    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<ProcessRecord>, AppError> {
        let output = self.run(&["jlist".to_string()]).await?;
        decode_process_list(&output.stdout)
    }

    #[instrument(skip(self))]
    async fn describe(&self, id: u32) -> Result<ProcessRecord, AppError> {
        let output = self.run(&["describe".to_string(), id.to_string()]).await?;
        decode_single(&output.stdout, id)
    }

    #[instrument(skip(self))]
    async fn perform(&self, action: ProcessAction, id: u32) -> Result<String, AppError> {
        let output = self.run(&[action.verb().to_string(), id.to_string()]).await?;
        Ok(output.stdout)
    }

    #[instrument(skip(self))]
    async fn logs(&self, id: u32, lines: u32) -> Result<String, AppError> {
        let args = [
            "logs".to_string(),
            id.to_string(),
            "--lines".to_string(),
            lines.to_string(),
            "--nostream".to_string(),
            "--raw".to_string(),
        ];
        let output = self.run(&args).await?;
        Ok(output.combined)
    }

    #[instrument(skip(self))]
    async fn version(&self) -> Result<String, AppError> {
        let output = self.run(&["--version".to_string()]).await?;
        let version = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or_default()
            .to_string();
        debug!(%version, "PM2 is reachable");
        Ok(version)
    }
}
