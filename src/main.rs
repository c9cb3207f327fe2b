use anyhow::{bail, Context, Result};
use autorun::{cancellation, detect, Config, Scope, ServiceConfig, ServiceProvider};
use log::{debug, error, info};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::fs;

fn print_help(program: &str) {
    println!("Autorun - Unified service management for systemd and launchd");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("\nUsage: {} [OPTIONS] <COMMAND> [ARG]\n", program);
    println!("Commands:");
    println!("  list                  List services in the selected scope");
    println!("  get <name>            Show a single service");
    println!("  start <name>          Start a service");
    println!("  stop <name>           Stop a service");
    println!("  restart <name>        Restart a service");
    println!("  enable <name>         Enable a service at boot/login");
    println!("  disable <name>        Disable a service");
    println!("  create <config.json>  Create a service from a JSON config");
    println!("  delete <name>         Stop, disable and remove a service");
    println!("  logs <name>           Follow service logs until Ctrl-C");
    println!("\nOptions:");
    println!("  --help, -h            Show this help message");
    println!("  --version, -v         Show version information");
    println!("  --debug               Enable debug logging");
    println!("  --user                Manage per-user services (default)");
    println!("  --system              Manage system-wide services");
    println!("\nEnvironment Variables:");
    println!("  AUTORUN_LOG_LEVEL=<level>     Log level when RUST_LOG is unset");
    println!("  AUTORUN_LOG_LINES=<n>         Journal lines shown before following (default: 100)");
    println!("  AUTORUN_LOG_BUFFER=<n>        Log line queue capacity (default: 100)");
    println!("  AUTORUN_RESTART_SEC=<secs>    RestartSec written for keep-alive units (default: 5)");
    println!("  RUST_LOG=<level>              Set log level (error|warn|info|debug)");
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn require<'a>(arg: Option<&'a str>, command: &str, what: &str) -> Result<&'a str> {
    match arg {
        Some(value) => Ok(value),
        None => bail!("'{}' requires a {} argument", command, what),
    }
}

async fn follow_logs(provider: &dyn ServiceProvider, name: &str, scope: Scope) -> Result<()> {
    let (handle, signal) = cancellation();
    let mut stream = provider.stream_logs(signal, name, scope).await?;
    info!("Following logs for {} (Ctrl-C to stop)", name);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = stream.next_line() => match line {
                Some(line) => println!("{}", line),
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                debug!("Interrupted, cancelling log stream for {}", name);
                interrupted = true;
                handle.cancel();
            }
        }
    }

    debug!("Log stream for {} closed", name);
    Ok(())
}

async fn run(
    provider: &dyn ServiceProvider,
    command: &str,
    arg: Option<&str>,
    scope: Scope,
) -> Result<()> {
    match command {
        "list" => print_json(&provider.list_services(scope).await?),
        "get" => {
            let name = require(arg, command, "service name")?;
            print_json(&provider.get_service(name, scope).await?)
        }
        "start" | "stop" | "restart" | "enable" | "disable" => {
            let name = require(arg, command, "service name")?;
            match command {
                "start" => provider.start(name, scope).await?,
                "stop" => provider.stop(name, scope).await?,
                "restart" => provider.restart(name, scope).await?,
                "enable" => provider.enable(name, scope).await?,
                _ => provider.disable(name, scope).await?,
            }
            print_json(&json!({ "service": name, "action": command, "status": "ok" }))
        }
        "create" => {
            let path = require(arg, command, "config file")?;
            let content =
                fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
            let config: ServiceConfig = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse service config {}", path))?;
            let name = provider.create_service(&config, scope).await?;
            print_json(&json!({ "service": name, "action": command, "status": "ok" }))
        }
        "delete" => {
            let name = require(arg, command, "service name")?;
            provider.delete_service(name, scope).await?;
            print_json(&json!({ "service": name, "action": command, "status": "ok" }))
        }
        "logs" => {
            let name = require(arg, command, "service name")?;
            follow_logs(provider, name, scope).await
        }
        other => bail!("unknown command '{}', see --help", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("autorun");

    if args.contains(&"--version".to_string()) || args.contains(&"-v".to_string()) {
        println!("autorun {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_help(program);
        return Ok(());
    }

    let debug_mode = args.contains(&"--debug".to_string());
    let mut config = Config::load();
    if debug_mode {
        config.log_level = "debug".to_string();
        env::set_var("RUST_LOG", "debug");
    } else if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", &config.log_level);
    }
    env_logger::init();

    if debug_mode {
        debug!("Command line args: {:?}", args);
        debug!("Configuration: {:?}", config);
    }

    let scope = if args.contains(&"--system".to_string()) {
        Scope::System
    } else {
        Scope::User
    };

    let positional: Vec<&str> = args
        .iter()
        .skip(1)
        .map(String::as_str)
        .filter(|a| !a.starts_with('-'))
        .collect();
    let Some(command) = positional.first().copied() else {
        print_help(program);
        bail!("no command given");
    };

    let provider = detect(&config)?;
    debug!("Running '{}' against {} in {} scope", command, provider.name(), scope);

    if let Err(e) = run(provider.as_ref(), command, positional.get(1).copied(), scope).await {
        error!("{} failed: {:#}", command, e);
        return Err(e);
    }

    Ok(())
}
