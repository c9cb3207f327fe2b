//! launchd service provider
//!
//! launchd has no single query describing every service, so enumeration
//! joins three sources:
//! - the runtime domain snapshot from `launchctl print <domain>`
//! - the plist files found in the scope's LaunchAgents/LaunchDaemons
//!   directories
//! - the best-effort `launchctl print-disabled <domain>` classification
//!
//! Only labels with a plist on disk are reported. Start and stop have no
//! single reliable command and run as [`FallbackPlan`]s.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

use super::fallback::{FallbackPlan, Flow, Guard, Step};
use super::log_stream::{spawn_line_stream, CancelSignal, LogStream};
use super::runner::{display_command, CommandRunner};
use super::{ProviderError, ProviderResult, ServiceProvider};
use crate::config::Config;
use crate::descriptor::plist::{self, label_from_path, plist_file_name, program_from_xml};
use crate::models::{validate_name, Scope, Service, ServiceConfig, ServiceStatus};

const LAUNCHCTL: &str = "launchctl";
const PLUTIL: &str = "plutil";
const LOG: &str = "log";
const CONSOLE_DEVICE: &str = "/dev/console";

/// One entry of the `services = { ... }` block in `launchctl print`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEntry {
    /// 0 when not running
    pub pid: i64,
    pub label: String,
}

/// Parse the services block of `launchctl print <domain>`.
///
/// Lines look like `  1234      0      com.example.bar`, with `-` in the pid
/// column for loaded but idle services; those lines are skipped.
pub fn parse_domain_services(output: &str) -> Vec<DomainEntry> {
    let mut entries = Vec::new();
    let mut in_services = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if !in_services {
            in_services = trimmed == "services = {";
            continue;
        }
        if trimmed == "}" {
            break;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let Ok(pid) = fields[0].parse::<i64>() else {
            continue;
        };
        entries.push(DomainEntry {
            pid,
            label: fields[2].to_string(),
        });
    }

    entries
}

/// Parse `launchctl print-disabled <domain>` into label -> disabled
pub fn parse_disabled(output: &str) -> HashMap<String, bool> {
    let mut result = HashMap::new();

    for line in output.lines() {
        let Some((label, state)) = line.trim().split_once("=>") else {
            continue;
        };
        let label = label.trim().trim_matches('"');
        if label.is_empty() {
            continue;
        }
        let state = state.trim().trim_end_matches(',').trim();
        result.insert(label.to_string(), state == "disabled");
    }

    result
}

/// Join on-disk labels with the runtime snapshot and disabled list.
///
/// Runtime entries with no plist are dropped. Labels with no runtime entry
/// are reported stopped. Enabled defaults to true for any label with a plist
/// unless the disabled list says otherwise.
pub fn reconcile(
    labels: &BTreeSet<String>,
    entries: &[DomainEntry],
    disabled: &HashMap<String, bool>,
    scope: Scope,
) -> Vec<Service> {
    labels
        .iter()
        .map(|label| {
            let running = entries.iter().any(|e| e.label == *label && e.pid > 0);
            let enabled = disabled.get(label).map_or(true, |d| !d);
            Service {
                name: label.clone(),
                display_name: label.clone(),
                status: if running {
                    ServiceStatus::Running
                } else {
                    ServiceStatus::Stopped
                },
                enabled,
                scope,
                description: None,
            }
        })
        .collect()
}

/// Last dot-separated component of a label
fn label_tail(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Directory sets and domain owner for each scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchdLayout {
    pub uid: u32,
    pub user_dirs: Vec<PathBuf>,
    pub system_dirs: Vec<PathBuf>,
}

impl LaunchdLayout {
    pub fn for_user(uid: u32, home: &Path) -> Self {
        Self {
            uid,
            user_dirs: vec![
                home.join("Library").join("LaunchAgents"),
                PathBuf::from("/Library/LaunchAgents"),
            ],
            system_dirs: vec![
                PathBuf::from("/Library/LaunchDaemons"),
                PathBuf::from("/System/Library/LaunchDaemons"),
            ],
        }
    }

    pub fn dirs(&self, scope: Scope) -> &[PathBuf] {
        match scope {
            Scope::User => &self.user_dirs,
            Scope::System => &self.system_dirs,
        }
    }

    /// `gui/<uid>` or `system`
    pub fn domain(&self, scope: Scope) -> String {
        match scope {
            Scope::User => format!("gui/{}", self.uid),
            Scope::System => "system".to_string(),
        }
    }

    pub fn service_target(&self, name: &str, scope: Scope) -> String {
        format!("{}/{}", self.domain(scope), name)
    }

    /// First plist for `name` across the scope's directories
    pub fn find_plist(&self, name: &str, scope: Scope) -> Option<PathBuf> {
        let file = plist_file_name(name);
        self.dirs(scope)
            .iter()
            .map(|dir| dir.join(&file))
            .find(|path| path.is_file())
    }

    /// Labels of every plist in the scope's directories. Unreadable
    /// directories are skipped.
    pub fn scan_labels(&self, scope: Scope) -> BTreeSet<String> {
        let mut labels = BTreeSet::new();
        for dir in self.dirs(scope) {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Skipping {}: {}", dir.display(), e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                if let Some(label) = label_from_path(&entry.path()) {
                    labels.insert(label);
                }
            }
        }
        labels
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

#[cfg(unix)]
fn home_for_uid(uid: u32) -> Option<PathBuf> {
    use std::ffi::{CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;

    // SAFETY: the passwd record lives in static storage and is copied out
    // before any other call could overwrite it
    unsafe {
        let entry = libc::getpwuid(uid);
        if entry.is_null() || (*entry).pw_dir.is_null() {
            return None;
        }
        let dir = CStr::from_ptr((*entry).pw_dir);
        Some(PathBuf::from(OsStr::from_bytes(dir.to_bytes())))
    }
}

#[cfg(not(unix))]
fn home_for_uid(_uid: u32) -> Option<PathBuf> {
    None
}

/// uid owning the console, when someone other than root is logged in
fn console_uid() -> Option<u32> {
    let output = std::process::Command::new("stat")
        .args(["-f", "%u", CONSOLE_DEVICE])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|uid| *uid != 0)
}

pub struct LaunchdProvider {
    runner: Arc<dyn CommandRunner>,
    layout: LaunchdLayout,
    log_buffer_capacity: usize,
}

impl LaunchdProvider {
    /// Provider for the invoking user. Under root, user scope targets the
    /// console user's GUI domain instead.
    pub fn new(runner: Arc<dyn CommandRunner>, config: &Config) -> ProviderResult<Self> {
        let mut uid = current_uid();
        let mut home = dirs::home_dir();
        debug!("launchd provider running as uid {}", uid);

        if uid == 0 {
            debug!("Running as root, detecting console user");
            if let Some(console) = console_uid() {
                uid = console;
                debug!("Detected console user {}", uid);
                if let Some(console_home) = home_for_uid(uid) {
                    home = Some(console_home);
                }
            }
        }

        let home = home.ok_or_else(|| {
            ProviderError::Detection("cannot resolve the current user's home directory".to_string())
        })?;
        debug!("User home resolved to {}", home.display());

        Ok(Self::with_layout(runner, LaunchdLayout::for_user(uid, &home), config))
    }

    pub fn with_layout(runner: Arc<dyn CommandRunner>, layout: LaunchdLayout, config: &Config) -> Self {
        Self {
            runner,
            layout,
            log_buffer_capacity: config.log_buffer_capacity,
        }
    }

    fn require_plist(&self, name: &str, scope: Scope) -> ProviderResult<PathBuf> {
        validate_name(name)?;
        self.layout.find_plist(name, scope).ok_or_else(|| {
            error!("plist not found for {} in {} scope", name, scope);
            ProviderError::NotFound(name.to_string())
        })
    }

    async fn launchctl(&self, args: Vec<String>) -> ProviderResult<String> {
        let command_line = display_command(LAUNCHCTL, &args);
        debug!("Executing {}", command_line);

        let output = self
            .runner
            .run(LAUNCHCTL, &args)
            .await
            .map_err(|e| ProviderError::execution(command_line.clone(), e.to_string()))?;
        if !output.success() {
            error!("{} failed (exit {}): {}", command_line, output.exit_code, output.combined());
            return Err(ProviderError::execution(command_line, output.combined()));
        }
        Ok(output.stdout)
    }

    async fn domain_services(&self, domain: &str) -> ProviderResult<Vec<DomainEntry>> {
        let output = self
            .launchctl(vec!["print".to_string(), domain.to_string()])
            .await?;
        let entries = parse_domain_services(&output);
        debug!("Parsed {} services in domain {}", entries.len(), domain);
        Ok(entries)
    }

    /// Empty when the query fails
    async fn disabled_services(&self, domain: &str) -> HashMap<String, bool> {
        let args = vec!["print-disabled".to_string(), domain.to_string()];
        match self.runner.run(LAUNCHCTL, &args).await {
            Ok(output) if output.success() => parse_disabled(&output.stdout),
            Ok(output) => {
                debug!("print-disabled {} failed: {}", domain, output.combined());
                HashMap::new()
            }
            Err(e) => {
                debug!("print-disabled {} failed: {}", domain, e);
                HashMap::new()
            }
        }
    }

    pub fn start_plan(&self, name: &str, scope: Scope, plist: &Path) -> FallbackPlan {
        let domain = self.layout.domain(scope);
        let target = self.layout.service_target(name, scope);
        let plist = plist.display().to_string();

        FallbackPlan::new(format!("start {}", name), LAUNCHCTL)
            .step(Step::new("bootstrap", vec!["bootstrap".into(), domain, plist.clone()]))
            .step(
                Step::new("kickstart", vec!["kickstart".into(), "-k".into(), target.clone()])
                    .on_success(Flow::Succeed),
            )
            .step(
                Step::new("load", vec!["load".into(), plist])
                    .guard(Guard::Failed("bootstrap"))
                    .on_failure(Flow::Fail),
            )
            .step(
                Step::new("kickstart-after-load", vec!["kickstart".into(), target])
                    .guard(Guard::Succeeded("load"))
                    .on_success(Flow::Succeed)
                    .on_failure(Flow::Succeed),
            )
            .when_exhausted(Flow::Succeed)
    }

    pub fn stop_plan(&self, name: &str, scope: Scope, plist: Option<&Path>) -> FallbackPlan {
        let target = self.layout.service_target(name, scope);
        let mut plan = FallbackPlan::new(format!("stop {}", name), LAUNCHCTL);

        if plist.is_some() {
            plan = plan.step(
                Step::new("bootout", vec!["bootout".into(), target.clone()]).on_success(Flow::Succeed),
            );
        }

        let kill = Step::new("kill", vec!["kill".into(), "SIGTERM".into(), target]).on_success(Flow::Succeed);
        match plist {
            Some(plist) => plan
                .step(kill)
                .step(
                    Step::new("unload", vec!["unload".into(), plist.display().to_string()])
                        .on_success(Flow::Succeed)
                        .on_failure(Flow::Fail),
                ),
            None => plan.step(kill.on_failure(Flow::Fail)),
        }
    }

    /// Executable basename used to filter the unified log
    async fn process_name(&self, name: &str, scope: Scope) -> String {
        let fallback = || label_tail(name).to_string();

        let Some(plist) = self.layout.find_plist(name, scope) else {
            return fallback();
        };
        let args = vec![
            "-convert".to_string(),
            "xml1".to_string(),
            "-o".to_string(),
            "-".to_string(),
            plist.display().to_string(),
        ];
        let xml = match self.runner.run(PLUTIL, &args).await {
            Ok(output) if output.success() => output.stdout,
            _ => return fallback(),
        };

        program_from_xml(&xml)
            .and_then(|program| {
                Path::new(&program)
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
            })
            .unwrap_or_else(fallback)
    }

    /// `log stream` arguments matching the process or the label's subsystem
    pub async fn log_args(&self, name: &str, scope: Scope) -> Vec<String> {
        let process = self.process_name(name, scope).await;
        let predicate = format!(
            "process == '{process}' OR process CONTAINS '{process}' OR subsystem CONTAINS '{name}'"
        );
        vec![
            "stream".to_string(),
            "--predicate".to_string(),
            predicate,
            "--style".to_string(),
            "compact".to_string(),
        ]
    }

    async fn load_plist(&self, flag: &str, name: &str, scope: Scope) -> ProviderResult<()> {
        let plist = self.require_plist(name, scope)?;
        self.launchctl(vec![flag.to_string(), "-w".to_string(), plist.display().to_string()])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceProvider for LaunchdProvider {
    fn name(&self) -> &'static str {
        "launchd"
    }

    async fn list_services(&self, scope: Scope) -> ProviderResult<Vec<Service>> {
        let domain = self.layout.domain(scope);
        let entries = self.domain_services(&domain).await?;
        let disabled = self.disabled_services(&domain).await;
        let labels = self.layout.scan_labels(scope);

        Ok(reconcile(&labels, &entries, &disabled, scope))
    }

    async fn get_service(&self, name: &str, scope: Scope) -> ProviderResult<Service> {
        validate_name(name)?;
        self.list_services(scope)
            .await?
            .into_iter()
            .find(|svc| svc.name == name)
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))
    }

    async fn start(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        debug!("Starting {} in {} scope", name, scope);
        let plist = self.require_plist(name, scope)?;

        let (_, result) = self.start_plan(name, scope, &plist).execute(self.runner.as_ref()).await;
        result?;
        debug!("Service {} started", name);
        Ok(())
    }

    async fn stop(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        validate_name(name)?;
        debug!("Stopping {} in {} scope", name, scope);
        let plist = self.layout.find_plist(name, scope);

        let (_, result) = self
            .stop_plan(name, scope, plist.as_deref())
            .execute(self.runner.as_ref())
            .await;
        result?;
        debug!("Service {} stopped", name);
        Ok(())
    }

    async fn restart(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        if let Err(e) = self.stop(name, scope).await {
            debug!("Ignoring stop failure before restarting {}: {}", name, e);
        }
        self.start(name, scope).await
    }

    async fn enable(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        self.load_plist("load", name, scope).await
    }

    async fn disable(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        self.load_plist("unload", name, scope).await
    }

    async fn stream_logs(
        &self,
        cancel: CancelSignal,
        name: &str,
        scope: Scope,
    ) -> ProviderResult<LogStream> {
        validate_name(name)?;
        let mut command = Command::new(LOG);
        command.args(self.log_args(name, scope).await);
        spawn_line_stream(command, cancel, self.log_buffer_capacity, name.to_string())
    }

    async fn create_service(&self, config: &ServiceConfig, scope: Scope) -> ProviderResult<String> {
        config.validate()?;
        let content = plist::render_checked(config)?;
        debug!("Creating launchd service {} ({}) in {} scope", config.name, config.program, scope);

        let dir = self.layout.dirs(scope).first().ok_or_else(|| {
            ProviderError::Detection(format!("no plist directory configured for {} scope", scope))
        })?;
        fs::create_dir_all(dir).map_err(|e| {
            ProviderError::execution(format!("create directory {}", dir.display()), e.to_string())
        })?;

        if let Some(existing) = self.layout.find_plist(&config.name, scope) {
            warn!("Service {} already exists at {}", config.name, existing.display());
            return Err(ProviderError::AlreadyExists(config.name.clone()));
        }

        let path = dir.join(plist_file_name(&config.name));
        debug!("Writing plist {}", path.display());
        fs::write(&path, content).map_err(|e| {
            ProviderError::execution(format!("write {}", path.display()), e.to_string())
        })?;

        if config.run_at_load {
            debug!("Starting {} after creation", config.name);
            self.start(&config.name, scope).await?;
        }

        info!("Created launchd service {}", config.name);
        Ok(config.name.clone())
    }

    async fn delete_service(&self, name: &str, scope: Scope) -> ProviderResult<()> {
        let path = self.require_plist(name, scope)?;

        if let Err(e) = self.stop(name, scope).await {
            warn!("Ignoring stop failure while deleting {}: {}", name, e);
        }
        if let Err(e) = self.disable(name, scope).await {
            warn!("Ignoring disable failure while deleting {}: {}", name, e);
        }

        fs::remove_file(&path).map_err(|e| {
            ProviderError::execution(format!("remove {}", path.display()), e.to_string())
        })?;

        info!("Deleted launchd service {}", name);
        Ok(())
    }
}
