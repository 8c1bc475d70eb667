//! Drives the PM2 command-line tool: finds it, runs it with a hard timeout,
//! decodes its JSON and keeps a filtered process snapshot fresh.

pub mod config;
pub mod error;
pub mod pm2;
pub mod registry;
pub mod utils;

pub use config::Config;
pub use error::AppError;
pub use pm2::record::{ProcessRecord, ProcessStatus};
pub use pm2::service::Pm2Service;
pub use registry::filter::{FilterState, StatusFilter};
pub use registry::{AutoRefreshHandle, ProcessAction, ProcessBackend, ProcessRegistry, RefreshPhase, RegistryView};
