//! Platform service providers
//!
//! One capability interface, [`ServiceProvider`], implemented by two native
//! back ends: systemd on Linux and launchd on macOS. [`detect`] picks exactly
//! one of them at startup.

use async_trait::async_trait;
use log::{debug, info};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::models::{Scope, Service, ServiceConfig};
use crate::os_detection::{get_os_info, systemd_running, OsType, SYSTEMD_MARKER};

pub mod fallback;
pub mod launchd;
pub mod log_stream;
pub mod runner;
pub mod systemd;

pub use launchd::LaunchdProvider;
pub use log_stream::{cancellation, CancelHandle, CancelSignal, LogStream};
pub use runner::{CommandOutput, CommandRunner, SystemRunner};
pub use systemd::SystemdProvider;

/// Error types for provider operations
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No descriptor for this name in the scope's directories
    #[error("service not found: {0}")]
    NotFound(String),

    /// A descriptor with this name already exists
    #[error("service {0} already exists")]
    AlreadyExists(String),

    /// Missing required field or bad scope value
    #[error("invalid request: {0}")]
    Validation(String),

    /// A native command exited non-zero or could not be spawned
    #[error("{command} failed: {output}")]
    Execution { command: String, output: String },

    /// No usable service manager on this host
    #[error("platform detection failed: {0}")]
    Detection(String),
}

impl ProviderError {
    pub fn execution(command: impl Into<String>, output: impl Into<String>) -> Self {
        ProviderError::Execution {
            command: command.into(),
            output: output.into(),
        }
    }
}

/// Result type for provider operations
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Service management capability implemented by each platform back end.
///
/// Every call derives its state fresh from the host; implementations hold no
/// mutable state and are safe to share across tasks.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Platform name ("systemd", "launchd")
    fn name(&self) -> &'static str;

    /// Enumerate services in a scope
    async fn list_services(&self, scope: Scope) -> ProviderResult<Vec<Service>>;

    /// Look up a single service
    async fn get_service(&self, name: &str, scope: Scope) -> ProviderResult<Service>;

    async fn start(&self, name: &str, scope: Scope) -> ProviderResult<()>;

    async fn stop(&self, name: &str, scope: Scope) -> ProviderResult<()>;

    async fn restart(&self, name: &str, scope: Scope) -> ProviderResult<()>;

    /// Make the service start automatically
    async fn enable(&self, name: &str, scope: Scope) -> ProviderResult<()>;

    async fn disable(&self, name: &str, scope: Scope) -> ProviderResult<()>;

    /// Follow the service's log output until `cancel` fires or the log
    /// process exits
    async fn stream_logs(
        &self,
        cancel: CancelSignal,
        name: &str,
        scope: Scope,
    ) -> ProviderResult<LogStream>;

    /// Write a new descriptor and register it; returns the service name
    async fn create_service(&self, config: &ServiceConfig, scope: Scope) -> ProviderResult<String>;

    /// Unregister a service and remove its descriptor
    async fn delete_service(&self, name: &str, scope: Scope) -> ProviderResult<()>;
}

/// Detect the current platform and build its provider
pub fn detect(config: &Config) -> ProviderResult<Box<dyn ServiceProvider>> {
    let os_info = get_os_info();
    detect_for(os_info.os_type, Path::new(SYSTEMD_MARKER), config)
}

/// Provider selection for an explicit OS type and systemd marker path
pub fn detect_for(
    os_type: OsType,
    systemd_marker: &Path,
    config: &Config,
) -> ProviderResult<Box<dyn ServiceProvider>> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    let provider: Box<dyn ServiceProvider> = match os_type {
        OsType::MacOs => Box::new(LaunchdProvider::new(runner, config)?),
        OsType::Linux => {
            if !systemd_running(systemd_marker) {
                return Err(ProviderError::Detection(
                    "systemd not detected on this Linux system".to_string(),
                ));
            }
            Box::new(SystemdProvider::new(runner, config)?)
        }
        OsType::Unknown => {
            return Err(ProviderError::Detection(format!(
                "unsupported platform: {}",
                std::env::consts::OS
            )));
        }
    };

    info!("Using {} service provider", provider.name());
    debug!("Provider selected for {:?}", os_type);
    Ok(provider)
}
