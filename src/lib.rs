//! Autorun - unified service management over systemd and launchd
//!
//! One [`ServiceProvider`] interface lists, controls, creates and deletes
//! services and tails their logs, backed by whichever native service manager
//! the host runs.

pub mod config;
pub mod descriptor;
pub mod models;
pub mod os_detection;
pub mod platform;

pub use config::Config;
pub use models::{Scope, Service, ServiceConfig, ServiceStatus};
pub use platform::{cancellation, detect, CancelHandle, LogStream, ProviderError, ServiceProvider};
