//! Service data model shared by every platform provider

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::platform::ProviderError;

/// Whether a service is managed per-user or for the whole system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    System,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::System => "system",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Scope::User),
            "system" => Ok(Scope::System),
            other => Err(ProviderError::Validation(format!("invalid scope: {}", other))),
        }
    }
}

/// Run state of a service, normalized across providers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Failed,
    Unknown,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
            ServiceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A service as seen by one provider in one scope.
///
/// Recomputed on every enumeration; nothing here is cached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub display_name: String,
    pub status: ServiceStatus,
    pub enabled: bool,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Input to `create_service`.
///
/// The descriptor file rendered from this is the durable record; the config
/// itself is never read back by the providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub name: String,
    pub description: Option<String>,
    pub program: String,
    pub arguments: Vec<String>,
    pub working_directory: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub run_at_load: bool,
    pub keep_alive: bool,
    pub standard_out_path: Option<String>,
    pub standard_error_path: Option<String>,
}

/// Reject names that are empty or could resolve outside a scope's
/// descriptor directories
pub fn validate_name(name: &str) -> Result<(), ProviderError> {
    if name.trim().is_empty() {
        return Err(ProviderError::Validation("service name is required".to_string()));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(ProviderError::Validation(format!(
            "service name must not contain path separators: {}",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(ProviderError::Validation(format!("invalid service name: {}", name)));
    }
    Ok(())
}

impl ServiceConfig {
    /// Reject configs missing a name or program
    pub fn validate(&self) -> Result<(), ProviderError> {
        validate_name(&self.name)?;
        if self.program.trim().is_empty() {
            return Err(ProviderError::Validation("program path is required".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parsing() {
        assert_eq!("user".parse::<Scope>().unwrap(), Scope::User);
        assert_eq!("SYSTEM".parse::<Scope>().unwrap(), Scope::System);

        let err = "global".parse::<Scope>().unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[test]
    fn test_service_serialization() {
        let service = Service {
            name: "foo".to_string(),
            display_name: "foo".to_string(),
            status: ServiceStatus::Running,
            enabled: true,
            scope: Scope::User,
            description: None,
        };

        let json = serde_json::to_string(&service).unwrap();
        assert!(json.contains("\"displayName\":\"foo\""));
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"scope\":\"user\""));
        assert!(!json.contains("description"));
    }

    #[test]
    fn test_config_deserialization_defaults() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"name":"web","program":"/usr/bin/web","runAtLoad":true}"#).unwrap();

        assert_eq!(config.name, "web");
        assert!(config.run_at_load);
        assert!(!config.keep_alive);
        assert!(config.arguments.is_empty());
        assert!(config.environment.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ServiceConfig {
            name: "web".to_string(),
            program: "/usr/bin/web".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.program = "  ".to_string();
        assert!(matches!(config.validate(), Err(ProviderError::Validation(_))));

        config.program = "/usr/bin/web".to_string();
        config.name = String::new();
        assert!(matches!(config.validate(), Err(ProviderError::Validation(_))));

        config.name = "../web".to_string();
        assert!(matches!(config.validate(), Err(ProviderError::Validation(_))));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web").is_ok());
        assert!(validate_name("com.example.web").is_ok());
        assert!(validate_name("web..backup").is_ok());

        for bad in ["", "  ", ".", "..", "../outside/victim", "a/b", "/etc/passwd", "a\\b"] {
            assert!(
                matches!(validate_name(bad), Err(ProviderError::Validation(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }
}
