//! Configuration management for autorun

use log::warn;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,

    /// Historical journal lines emitted before following
    pub log_tail_lines: u32,

    /// Capacity of the per-stream line queue
    pub log_buffer_capacity: usize,

    /// Back-off written alongside an always-restart policy (in seconds)
    pub restart_sec: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_tail_lines: 100,
            log_buffer_capacity: 100,
            restart_sec: 5,
        }
    }
}

impl Config {
    /// Load configuration from defaults plus environment overrides
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Ok(level) = env::var("AUTORUN_LOG_LEVEL") {
            if !level.trim().is_empty() {
                config.log_level = level.trim().to_lowercase();
            }
        }
        if let Some(lines) = parse_env("AUTORUN_LOG_LINES") {
            config.log_tail_lines = lines;
        }
        if let Some(capacity) = parse_env("AUTORUN_LOG_BUFFER") {
            config.log_buffer_capacity = capacity;
        }
        if let Some(secs) = parse_env("AUTORUN_RESTART_SEC") {
            config.restart_sec = secs;
        }

        config.validate_and_fix();
        config
    }

    /// Clamp values that would make the log bridge unusable
    pub fn validate_and_fix(&mut self) {
        if self.log_buffer_capacity == 0 {
            warn!("Log buffer capacity of 0 is invalid, using 1");
            self.log_buffer_capacity = 1;
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {}", key, value);
            None
        }
    }
}
