mod cli;

use crate::cli::{Cli, Commands, FilterArgs};
use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use pm2_deck::config::LogFormat;
use pm2_deck::{AppError, Config, FilterState, Pm2Service, ProcessAction, ProcessRegistry, StatusFilter};
use std::io::Write;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str, format: LogFormat) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pm2_deck={}", level)));

    let builder = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE);

    let installed = match format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
    };
    if let Err(e) = installed {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// The user-facing sentence, with diagnostics appended when present.
fn report(err: AppError) -> anyhow::Error {
    match err.detail() {
        Some(detail) => anyhow::anyhow!("{}\n{}", err, detail.trim_end()),
        None => anyhow::anyhow!("{}", err),
    }
}

fn filter_from(args: &FilterArgs) -> FilterState {
    FilterState::new(args.search.clone(), StatusFilter::parse(&args.status))
}

async fn run_action(registry: &ProcessRegistry, action: ProcessAction, id: u32) -> Result<()> {
    registry.perform(action, id).await.map_err(report)?;
    match registry.view().snapshot.iter().find(|r| r.id == id) {
        Some(record) => println!("{} {}: {}", action, record.name, record.status.as_str()),
        None => println!("{} {}: done", action, id),
    }
    Ok(())
}

async fn watch(registry: Arc<ProcessRegistry>, config: &Config) -> Result<()> {
    let mut revisions = registry.subscribe();
    let handle = registry.activate(config.refresh_interval);
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = registry.view();
                write!(stdout, "\x1b[2J\x1b[H{}", cli::render_view(&view, Utc::now().timestamp_millis()))?;
                stdout.flush()?;
            }
        }
    }
    handle.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    setup_logging(&config.log_level, config.log_format);
    config.log_adjustments();

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), binary = %config.binary_name, "Starting pm2-deck");
    tracing::debug!("Loaded configuration: {:?}", config);

    let service = Arc::new(Pm2Service::from_config(&config));
    let registry = Arc::new(ProcessRegistry::new(service.clone()).with_default_log_lines(config.log_lines));
    let now_ms = || Utc::now().timestamp_millis();

    match cli.command {
        Commands::List { filter, json } => {
            registry.set_filter(filter_from(&filter));
            registry.refresh(true).await.map_err(report)?;
            let view = registry.view();
            if json {
                println!("{}", serde_json::to_string_pretty(&view.filtered)?);
            } else {
                print!("{}", cli::render_view(&view, now_ms()));
            }
        }
        Commands::Watch { filter } => {
            registry.set_filter(filter_from(&filter));
            watch(registry, &config).await?;
        }
        Commands::Describe { id } => {
            let record = registry.describe(id).await.map_err(report)?;
            print!("{}", cli::render_record(&record, now_ms()));
        }
        Commands::Start { id } => run_action(&registry, ProcessAction::Start, id).await?,
        Commands::Stop { id } => run_action(&registry, ProcessAction::Stop, id).await?,
        Commands::Restart { id } => run_action(&registry, ProcessAction::Restart, id).await?,
        Commands::Delete { id } => run_action(&registry, ProcessAction::Delete, id).await?,
        Commands::Logs { id, lines } => {
            print!("{}", registry.fetch_logs(id, lines).await.map_err(report)?);
        }
        Commands::Doctor => {
            match service.locator().locate() {
                Some(path) => println!("{}: {}", config.binary_name, path.display()),
                None => println!("{}: not found", config.binary_name),
            }
            if registry.check_health().await {
                let version = registry.view().tool_version.unwrap_or_else(|| "unknown".to_string());
                println!("version: {}", version);
            } else if let Some(message) = registry.view().error_message() {
                anyhow::bail!("{}", message);
            }
        }
    }

    Ok(())
}
