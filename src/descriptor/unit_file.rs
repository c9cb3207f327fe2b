//! systemd unit file rendering and parsing

use std::fmt::Write as _;

use crate::models::ServiceConfig;
use crate::platform::ProviderError;

pub const UNIT_SUFFIX: &str = ".service";

/// `foo` -> `foo.service`; already suffixed names are kept as is
pub fn unit_file_name(name: &str) -> String {
    if name.ends_with(UNIT_SUFFIX) {
        name.to_string()
    } else {
        format!("{}{}", name, UNIT_SUFFIX)
    }
}

/// `foo.service` -> `foo`
pub fn logical_name(unit: &str) -> &str {
    unit.strip_suffix(UNIT_SUFFIX).unwrap_or(unit)
}

/// Render a unit file for `config`. `restart_sec` is the back-off written
/// with the always-restart policy.
pub fn render(config: &ServiceConfig, restart_sec: u32) -> String {
    let mut out = String::new();

    out.push_str("[Unit]\n");
    match config.description.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(description) => {
            let _ = writeln!(out, "Description={}", escape_specifiers(description));
        }
        None => {
            let default = format!("{} service", logical_name(&config.name));
            let _ = writeln!(out, "Description={}", escape_specifiers(&default));
        }
    }
    out.push_str("After=network.target\n\n");

    out.push_str("[Service]\n");
    out.push_str("Type=simple\n");

    let mut exec_start = quote_word(&escape_exec(&config.program));
    for arg in &config.arguments {
        exec_start.push(' ');
        exec_start.push_str(&quote_word(&escape_exec(arg)));
    }
    let _ = writeln!(out, "ExecStart={}", exec_start);

    if let Some(dir) = config.working_directory.as_deref().filter(|d| !d.is_empty()) {
        let _ = writeln!(out, "WorkingDirectory={}", escape_specifiers(dir));
    }

    for (key, value) in &config.environment {
        let assignment = escape_specifiers(&format!("{}={}", key, value));
        let _ = writeln!(out, "Environment=\"{}\"", escape_quoted(&assignment));
    }

    if config.keep_alive {
        out.push_str("Restart=always\n");
        let _ = writeln!(out, "RestartSec={}", restart_sec);
    }

    if let Some(path) = config.standard_out_path.as_deref().filter(|p| !p.is_empty()) {
        let _ = writeln!(out, "StandardOutput=file:{}", escape_specifiers(path));
    }
    if let Some(path) = config.standard_error_path.as_deref().filter(|p| !p.is_empty()) {
        let _ = writeln!(out, "StandardError=file:{}", escape_specifiers(path));
    }

    out.push('\n');
    out.push_str("[Install]\n");
    out.push_str("WantedBy=default.target\n");

    out
}

/// Render a unit file and read it back, rejecting configs whose values the
/// unit syntax cannot carry (line breaks, surrounding blanks, `=` in an
/// environment key).
pub fn render_checked(config: &ServiceConfig, restart_sec: u32) -> Result<String, ProviderError> {
    let unit = render(config, restart_sec);
    let parsed = parse(&config.name, &unit);
    if recorded(&parsed) != recorded(config) {
        return Err(ProviderError::Validation(format!(
            "service {} has values a unit file cannot represent",
            config.name
        )));
    }
    Ok(unit)
}

/// The parts of a config that a unit file records
fn recorded(config: &ServiceConfig) -> ServiceConfig {
    let present = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());
    let name = logical_name(&config.name).to_string();
    let default_description = format!("{} service", name);
    ServiceConfig {
        description: config
            .description
            .clone()
            .filter(|d| !d.trim().is_empty() && *d != default_description),
        name,
        working_directory: present(&config.working_directory),
        standard_out_path: present(&config.standard_out_path),
        standard_error_path: present(&config.standard_error_path),
        run_at_load: false,
        ..config.clone()
    }
}

/// Read a unit file back into a config.
///
/// `run_at_load` is never recorded in a unit file and always comes back
/// false.
pub fn parse(name: &str, content: &str) -> ServiceConfig {
    let mut config = ServiceConfig {
        name: logical_name(name).to_string(),
        ..Default::default()
    };

    let mut section = String::new();
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            section = line[1..line.len() - 1].to_string();
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match (section.as_str(), key) {
            ("Unit", "Description") => {
                let description = unescape_specifiers(value);
                if description != format!("{} service", config.name) {
                    config.description = Some(description);
                }
            }
            ("Service", "ExecStart") => {
                let mut words = split_words(value).into_iter().map(|w| unescape_exec(&w));
                config.program = words.next().unwrap_or_default();
                config.arguments = words.collect();
            }
            ("Service", "WorkingDirectory") => {
                config.working_directory = Some(unescape_specifiers(value));
            }
            ("Service", "Environment") => {
                for assignment in split_words(value) {
                    let assignment = unescape_specifiers(&assignment);
                    if let Some((k, v)) = assignment.split_once('=') {
                        config.environment.insert(k.to_string(), v.to_string());
                    }
                }
            }
            ("Service", "Restart") => {
                config.keep_alive = value == "always";
            }
            ("Service", "StandardOutput") => {
                config.standard_out_path = value.strip_prefix("file:").map(unescape_specifiers);
            }
            ("Service", "StandardError") => {
                config.standard_error_path = value.strip_prefix("file:").map(unescape_specifiers);
            }
            _ => {}
        }
    }

    config
}

/// `%` starts a specifier in every directive value
fn escape_specifiers(s: &str) -> String {
    s.replace('%', "%%")
}

fn unescape_specifiers(s: &str) -> String {
    s.replace("%%", "%")
}

/// ExecStart also expands `$VAR`
fn escape_exec(word: &str) -> String {
    escape_specifiers(word).replace('$', "$$")
}

fn unescape_exec(word: &str) -> String {
    unescape_specifiers(&word.replace("$$", "$"))
}

/// Quote a command-line word if it contains whitespace, quotes,
/// backslashes or `;`, or is empty
fn quote_word(word: &str) -> String {
    let needs_quotes = word.is_empty()
        || word
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));
    if needs_quotes {
        format!("\"{}\"", escape_quoted(word))
    } else {
        word.to_string()
    }
}

fn escape_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Split a systemd command line into words, honouring double quotes and
/// backslash escapes inside them
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                in_word = true;
            }
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }

    words
}
