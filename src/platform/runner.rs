//! Native command execution
//!
//! Every systemctl, launchctl or plutil invocation goes through a
//! [`CommandRunner`], so providers can be exercised against scripted output.

use async_trait::async_trait;
use log::debug;
use std::process::Stdio;
use tokio::process::Command;

/// Captured result of one finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, trimmed
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (false, true) => stdout.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

/// Runs a program to completion and captures its output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`. A non-zero exit is reported through
    /// [`CommandOutput::exit_code`]; `Err` means the process never ran.
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runner backed by real subprocesses
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        debug!("Executing {} {:?}", program, args);

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        debug!("{} exited with code {}", program, result.exit_code);
        Ok(result)
    }
}

/// Render a command line for logs and error messages
pub fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        let output = CommandOutput {
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
            exit_code: 1,
        };
        assert_eq!(output.combined(), "out\nerr");
        assert!(!output.success());

        let only_err = CommandOutput {
            stderr: "Failed to start foo.service: Access denied".to_string(),
            exit_code: 4,
            ..Default::default()
        };
        assert_eq!(only_err.combined(), "Failed to start foo.service: Access denied");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_echo() {
        let output = SystemRunner
            .run("sh", &["-c".to_string(), "echo hello; echo oops >&2; exit 3".to_string()])
            .await
            .unwrap();

        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn test_system_runner_missing_binary() {
        let result = SystemRunner.run("definitely-not-a-real-binary-xyz", &[]).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_display_command() {
        let args = vec!["--user".to_string(), "start".to_string(), "foo.service".to_string()];
        assert_eq!(display_command("systemctl", &args), "systemctl --user start foo.service");
    }
}
