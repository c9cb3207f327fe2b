//! systemd service provider
//!
//! Enumeration is one `systemctl list-units --output=json` call per scope;
//! enable-state is queried per unit and joined by name.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

use super::log_stream::{spawn_line_stream, CancelSignal, LogStream};
use super::runner::{display_command, CommandOutput, CommandRunner};
use super::{ProviderError, ProviderResult, ServiceProvider};
use crate::config::Config;
use crate::descriptor::unit_file::{self, logical_name, unit_file_name};
use crate::models::{validate_name, Scope, Service, ServiceConfig, ServiceStatus};

const SYSTEMCTL: &str = "systemctl";
const JOURNALCTL: &str = "journalctl";
const SYSTEM_UNIT_DIR: &str = "/etc/systemd/system";

/// Where unit files are written for each scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLayout {
    pub user_dir: PathBuf,
    pub system_dir: PathBuf,
}

impl UnitLayout {
    pub fn for_home(home: &Path) -> Self {
        Self {
            user_dir: home.join(".config").join("systemd").join("user"),
            system_dir: PathBuf::from(SYSTEM_UNIT_DIR),
        }
    }

    pub fn dir(&self, scope: Scope) -> &Path {
        match scope {
            Scope::User => &self.user_dir,
            Scope::System => &self.system_dir,
        }
    }
}

/// One record of `systemctl list-units --output=json`
#[derive(Debug, Clone, Deserialize)]
struct SystemdUnit {
    unit: String,
    #[serde(default)]
    load: String,
    #[serde(default)]
    active: String,
    #[serde(default)]
    sub: String,
    #[serde(default)]
    description: String,
}

fn parse_units(json: &str) -> ProviderResult<Vec<SystemdUnit>> {
    serde_json::from_str(json).map_err(|e| {
        ProviderError::execution(
            "systemctl list-units",
            format!("failed to parse output: {}", e),
        )
    })
}

/// Map systemd active/sub states onto the shared status
pub fn map_status(active: &str, sub: &str) -> ServiceStatus {
    match (active, sub) {
        ("active", "running") => ServiceStatus::Running,
        ("active", _) | ("inactive", _) => ServiceStatus::Stopped,
        ("failed", _) => ServiceStatus::Failed,
        _ => ServiceStatus::Unknown,
    }
}

fn scope_args(scope: Scope) -> Vec<String> {
    match scope {
        Scope::User => vec!["--user".to_string()],
        Scope::System => Vec::new(),
    }
}

pub struct SystemdProvider {
    runner: Arc<dyn CommandRunner>,
    layout: UnitLayout,
    log_tail_lines: u32,
    log_buffer_capacity: usize,
    restart_sec: u32,
}

impl SystemdProvider {
    /// Provider rooted at the current user's home directory
    pub fn new(runner: Arc<dyn CommandRunner>, config: &Config) -> ProviderResult<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            ProviderError::Detection("cannot resolve the current user's home directory".to_string())
        })?;
        Ok(Self::with_layout(runner, UnitLayout::for_home(&home), config))
    }

    pub fn with_layout(runner: Arc<dyn CommandRunner>, layout: UnitLayout, config: &Config) -> Self {
        Self {
            runner,
            layout,
            log_tail_lines: config.log_tail_lines,
            log_buffer_capacity: config.log_buffer_capacity,
            restart_sec: config.restart_sec,
        }
    }

    /// Run systemctl, failing on a non-zero exit with the combined output
    async fn systemctl(&self, scope: Scope, args: &[&str]) -> ProviderResult<CommandOutput> {
        let mut full = scope_args(scope);
        full.extend(args.iter().map(|a| a.to_string()));
        let command_line = display_command(SYSTEMCTL, &full);

        debug!("Executing {}", command_line);
        let output = self
            .runner
            .run(SYSTEMCTL, &full)
            .await
            .map_err(|e| ProviderError::execution(command_line.clone(), e.to_string()))?;

        if !output.success() {
            error!("{} failed (exit {}): {}", command_line, output.exit_code, output.combined());
            return Err(ProviderError::execution(command_line, output.combined()));
        }
        Ok(output)
    }

    async fn list_units(&self, scope: Scope) -> ProviderResult<Vec<SystemdUnit>> {
        let output = self
            .systemctl(scope, &["list-units", "--type=service", "--all", "--output=json"])
            .await?;
        let units = parse_units(&output.stdout)?;
        debug!("Listed {} {} units", units.len(), scope);
        Ok(units)
    }

    /// Failure to answer counts as disabled
    async fn is_enabled(&self, unit: &str, scope: Scope) -> bool {
        let mut args = scope_args(scope);
        args.push("is-enabled".to_string());
        args.push(unit.to_string());

        match self.runner.run(SYSTEMCTL, &args).await {
            Ok(output) => output.stdout.trim() == "enabled",
            Err(e) => {
                debug!("is-enabled {} failed: {}", unit, e);
                false
            }
        }
    }

    async fn control(&self, verb: &str, name: &str, scope: Scope) -> ProviderResult<()> {
        validate_name(name)?;
        let unit = unit_file_name(name);
        self.systemctl(scope, &[verb, unit.as_str()]).await?;
        debug!("systemctl {} {} succeeded", verb, unit);
        Ok(())
    }

    async fn daemon_reload(&self, scope: Scope) -> ProviderResult<()> {
        self.systemctl(scope, &["daemon-reload"]).await?;
        debug!("daemon-reload succeeded for {} scope", scope);
        Ok(())
    }

    /// journalctl arguments following the last lines of a unit
    pub fn log_args(&self, name: &str, scope: Scope) -> Vec<String> {
        let unit = unit_file_name(name);
        let filter = match scope {
            Scope::User => "--user-unit",
            Scope::System => "-u",
        };
        vec![
            "-f".to_string(),
            "-n".to_string(),
            self.log_tail_lines.to_string(),
            filter.to_string(),
            unit,
        ]
    }

    fn unit_path(&self, name: &str, scope: Scope) -> PathBuf {
        self.layout.dir(scope).join(unit_file_name(name))
    }
}

#[async_trait]
impl ServiceProvider for SystemdProvider {
    fn name(&self) -> &'static str {
        "systemd"
    }

    async fn list_services(&self, scope: Scope) -> ProviderResult<Vec<Service>> {
        let units = self.list_units(scope).await?;

        let mut services = Vec::with_capacity(units.len());
        for unit in units.into_iter().filter(|u| u.load != "not-found") {
            let name = logical_name(&unit.unit).to_string();
            let enabled = self.is_enabled(&unit.unit, scope).await;
            services.push(Service {
                display_name: name.clone(),
                name,
                status: map_status(&unit.active, &unit.sub),
                enabled,
                scope,
                description: Some(unit.description).filter(|d| !d.is_empty()),
            });
        }

        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn get_service(&self, name: &str, scope: Scope) -> ProviderResult<Service> {
        validate_name(name)?;
        let wanted = logical_name(name);
        self.list_services(scope)
            .await?
            .into_iter()
            .find(|svc| svc.name == wanted)
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))
    }

    async fn start(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        self.control("start", name, scope).await
    }

    async fn stop(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        self.control("stop", name, scope).await
    }

    async fn restart(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        self.control("restart", name, scope).await
    }

    async fn enable(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        self.control("enable", name, scope).await
    }

    async fn disable(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        self.control("disable", name, scope).await
    }

    async fn stream_logs(
        &self,
        cancel: CancelSignal,
        name: &str,
        scope: Scope,
    ) -> ProviderResult<LogStream> {
        validate_name(name)?;
        let mut command = Command::new(JOURNALCTL);
        command.args(self.log_args(name, scope));
        spawn_line_stream(command, cancel, self.log_buffer_capacity, name.to_string())
    }

    async fn create_service(&self, config: &ServiceConfig, scope: Scope) -> ProviderResult<String> {
        config.validate()?;
        let unit = unit_file::render_checked(config, self.restart_sec)?;
        debug!("Creating systemd service {} ({}) in {} scope", config.name, config.program, scope);

        let dir = self.layout.dir(scope);
        fs::create_dir_all(dir).map_err(|e| {
            ProviderError::execution(format!("create directory {}", dir.display()), e.to_string())
        })?;

        let path = self.unit_path(&config.name, scope);
        if path.exists() {
            warn!("Service {} already exists at {}", config.name, path.display());
            return Err(ProviderError::AlreadyExists(config.name.clone()));
        }

        debug!("Writing unit file {}", path.display());
        fs::write(&path, unit).map_err(|e| {
            ProviderError::execution(format!("write {}", path.display()), e.to_string())
        })?;

        if let Err(e) = self.daemon_reload(scope).await {
            error!("daemon-reload failed, removing {}", path.display());
            if let Err(rm) = fs::remove_file(&path) {
                warn!("Failed to roll back {}: {}", path.display(), rm);
            }
            return Err(e);
        }

        if config.run_at_load {
            debug!("Enabling and starting {}", config.name);
            self.enable(&config.name, scope).await?;
            self.start(&config.name, scope).await?;
        }

        info!("Created systemd service {}", config.name);
        Ok(config.name.clone())
    }

    async fn delete_service(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        validate_name(name)?;
        let path = self.unit_path(name, scope);
        if !path.exists() {
            return Err(ProviderError::NotFound(name.to_string()));
        }

        if let Err(e) = self.stop(name, scope).await {
            warn!("Ignoring stop failure while deleting {}: {}", name, e);
        }
        if let Err(e) = self.disable(name, scope).await {
            warn!("Ignoring disable failure while deleting {}: {}", name, e);
        }

        fs::remove_file(&path).map_err(|e| {
            ProviderError::execution(format!("remove {}", path.display()), e.to_string())
        })?;

        self.daemon_reload(scope).await?;
        info!("Deleted systemd service {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::ScriptedRunner;

    const UNITS_JSON: &str = r#"[
        {"unit":"foo.service","load":"loaded","active":"failed","sub":"failed","description":"Foo daemon"},
        {"unit":"bar.service","load":"loaded","active":"active","sub":"running","description":"Bar daemon"},
        {"unit":"baz.service","load":"loaded","active":"active","sub":"exited","description":""},
        {"unit":"ghost.service","load":"not-found","active":"inactive","sub":"dead","description":"ghost.service"}
    ]"#;

    fn provider(runner: &Arc<ScriptedRunner>, home: &Path) -> SystemdProvider {
        let runner: Arc<dyn CommandRunner> = runner.clone();
        let layout = UnitLayout {
            user_dir: home.join("user"),
            system_dir: home.join("system"),
        };
        SystemdProvider::with_layout(runner, layout, &Config::default())
    }

    fn web_config() -> ServiceConfig {
        ServiceConfig {
            name: "web".to_string(),
            program: "/usr/local/bin/web".to_string(),
            arguments: vec!["--port".to_string(), "8080".to_string()],
            keep_alive: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_map_status() {
        assert_eq!(map_status("active", "running"), ServiceStatus::Running);
        assert_eq!(map_status("active", "exited"), ServiceStatus::Stopped);
        assert_eq!(map_status("inactive", "dead"), ServiceStatus::Stopped);
        assert_eq!(map_status("failed", "failed"), ServiceStatus::Failed);
        assert_eq!(map_status("activating", "start"), ServiceStatus::Unknown);
    }

    #[test]
    fn test_layout_for_home() {
        let layout = UnitLayout::for_home(Path::new("/home/alice"));
        assert_eq!(layout.dir(Scope::User), Path::new("/home/alice/.config/systemd/user"));
        assert_eq!(layout.dir(Scope::System), Path::new("/etc/systemd/system"));
    }

    #[tokio::test]
    async fn test_list_services_maps_units() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl --user list-units", 0, UNITS_JSON, "");
        runner.on("systemctl --user is-enabled", 1, "disabled\n", "");
        runner.on("systemctl --user is-enabled bar.service", 0, "enabled\n", "");

        let services = provider(&runner, dir.path()).list_services(Scope::User).await.unwrap();

        let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["bar", "baz", "foo"]);

        let foo = &services[2];
        assert_eq!(foo.status, ServiceStatus::Failed);
        assert!(!foo.enabled);
        assert_eq!(foo.description.as_deref(), Some("Foo daemon"));
        assert_eq!(foo.scope, Scope::User);

        assert_eq!(services[0].status, ServiceStatus::Running);
        assert!(services[0].enabled);
        assert_eq!(services[1].status, ServiceStatus::Stopped);
        assert_eq!(services[1].description, None);
        assert!(!runner.called("systemctl --user is-enabled ghost.service"));
    }

    #[tokio::test]
    async fn test_is_enabled_spawn_failure_is_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "systemctl list-units",
            0,
            r#"[{"unit":"bar.service","load":"loaded","active":"active","sub":"running","description":""}]"#,
            "",
        );

        let services = provider(&runner, dir.path()).list_services(Scope::System).await.unwrap();
        assert_eq!(services.len(), 1);
        assert!(!services[0].enabled);
    }

    #[tokio::test]
    async fn test_list_services_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl list-units", 0, "not json", "");

        let result = provider(&runner, dir.path()).list_services(Scope::System).await;
        assert!(matches!(result, Err(ProviderError::Execution { .. })));
    }

    #[tokio::test]
    async fn test_get_service_accepts_unit_name() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl list-units", 0, UNITS_JSON, "");
        runner.on("systemctl is-enabled", 0, "enabled\n", "");
        let provider = provider(&runner, dir.path());

        let svc = provider.get_service("foo.service", Scope::System).await.unwrap();
        assert_eq!(svc.name, "foo");
        assert_eq!(svc.status, ServiceStatus::Failed);

        let missing = provider.get_service("ghost", Scope::System).await;
        assert!(matches!(missing, Err(ProviderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_control_failure_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl start", 4, "", "Failed to start foo.service: Access denied");

        let err = provider(&runner, dir.path()).start("foo", Scope::System).await.unwrap_err();
        match err {
            ProviderError::Execution { command, output } => {
                assert_eq!(command, "systemctl start foo.service");
                assert_eq!(output, "Failed to start foo.service: Access denied");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_user_scope_control_passes_flag() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl --user", 0, "", "");
        let provider = provider(&runner, dir.path());

        provider.stop("foo", Scope::User).await.unwrap();
        provider.stop("foo", Scope::User).await.unwrap();
        provider.enable("foo.service", Scope::User).await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "systemctl --user stop foo.service",
                "systemctl --user stop foo.service",
                "systemctl --user enable foo.service",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_writes_unit_and_starts() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl --user", 0, "", "");
        let provider = provider(&runner, dir.path());

        let mut config = web_config();
        config.run_at_load = true;
        let name = provider.create_service(&config, Scope::User).await.unwrap();
        assert_eq!(name, "web");

        let path = dir.path().join("user/web.service");
        let parsed = unit_file::parse("web.service", &fs::read_to_string(&path).unwrap());
        assert_eq!(parsed.program, config.program);
        assert_eq!(parsed.arguments, config.arguments);
        assert!(parsed.keep_alive);

        assert_eq!(
            runner.calls(),
            vec![
                "systemctl --user daemon-reload",
                "systemctl --user enable web.service",
                "systemctl --user start web.service",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_rejects_existing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl", 0, "", "");
        let provider = provider(&runner, dir.path());

        provider.create_service(&web_config(), Scope::System).await.unwrap();
        let again = provider.create_service(&web_config(), Scope::System).await;
        assert!(matches!(again, Err(ProviderError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_create_validates_before_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let provider = provider(&runner, dir.path());

        let mut config = web_config();
        config.program = String::new();
        let result = provider.create_service(&config, Scope::User).await;

        assert!(matches!(result, Err(ProviderError::Validation(_))));
        assert!(runner.calls().is_empty());
        assert!(!dir.path().join("user").exists());
    }

    #[tokio::test]
    async fn test_create_rejects_unrepresentable_values() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let provider = provider(&runner, dir.path());

        let mut config = web_config();
        config.arguments.push("first\nExecStartPre=/bin/evil".to_string());
        let result = provider.create_service(&config, Scope::User).await;

        assert!(matches!(result, Err(ProviderError::Validation(_))));
        assert!(runner.calls().is_empty());
        assert!(!dir.path().join("user/web.service").exists());
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_reload_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl daemon-reload", 1, "", "Failed to connect to bus");
        let provider = provider(&runner, dir.path());

        let result = provider.create_service(&web_config(), Scope::System).await;
        assert!(matches!(result, Err(ProviderError::Execution { .. })));
        assert!(!dir.path().join("system/web.service").exists());
    }

    #[tokio::test]
    async fn test_create_keeps_unit_when_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl", 0, "", "");
        runner.on("systemctl start", 1, "", "Job failed");
        let provider = provider(&runner, dir.path());

        let mut config = web_config();
        config.run_at_load = true;
        let result = provider.create_service(&config, Scope::System).await;

        assert!(result.is_err());
        assert!(dir.path().join("system/web.service").exists());
    }

    #[tokio::test]
    async fn test_delete_ignores_stop_and_disable_failures() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl", 0, "", "");
        let provider = provider(&runner, dir.path());
        provider.create_service(&web_config(), Scope::System).await.unwrap();

        runner.on("systemctl stop", 5, "", "not loaded");
        runner.on("systemctl disable", 1, "", "not enabled");
        provider.delete_service("web", Scope::System).await.unwrap();

        assert!(!dir.path().join("system/web.service").exists());
        assert_eq!(runner.calls().last().map(String::as_str), Some("systemctl daemon-reload"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());

        let result = provider(&runner, dir.path()).delete_service("nope", Scope::User).await;
        assert!(matches!(result, Err(ProviderError::NotFound(_))));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_names_cannot_escape_unit_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        let victim = outside.join("victim.service");
        fs::write(&victim, "[Unit]\n").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl", 0, "", "");
        let provider = provider(&runner, dir.path());

        let result = provider.delete_service("../outside/victim", Scope::User).await;
        assert!(matches!(result, Err(ProviderError::Validation(_))));
        assert!(victim.exists());

        for result in [
            provider.start("../outside/victim", Scope::User).await,
            provider.stop("..", Scope::User).await,
            provider.restart("a/b", Scope::System).await,
            provider.enable("../x", Scope::User).await,
            provider.disable("../x", Scope::User).await,
        ] {
            assert!(matches!(result, Err(ProviderError::Validation(_))));
        }
        let get = provider.get_service("../outside/victim", Scope::User).await;
        assert!(matches!(get, Err(ProviderError::Validation(_))));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_reload_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl", 0, "", "");
        let provider = provider(&runner, dir.path());
        provider.create_service(&web_config(), Scope::System).await.unwrap();

        runner.on("systemctl daemon-reload", 1, "", "bus error");
        let result = provider.delete_service("web", Scope::System).await;

        assert!(result.is_err());
        assert!(!dir.path().join("system/web.service").exists());
    }

    #[test]
    fn test_log_args() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let provider = provider(&runner, dir.path());

        assert_eq!(
            provider.log_args("foo", Scope::User),
            vec!["-f", "-n", "100", "--user-unit", "foo.service"]
        );
        assert_eq!(
            provider.log_args("foo", Scope::System),
            vec!["-f", "-n", "100", "-u", "foo.service"]
        );
    }
}
