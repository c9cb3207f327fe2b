//! launchd property list rendering and parsing

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::iter::Peekable;
use std::path::Path;
use std::vec::IntoIter;

use crate::models::ServiceConfig;
use crate::platform::ProviderError;

pub const PLIST_SUFFIX: &str = ".plist";

const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
"#;

pub fn plist_file_name(label: &str) -> String {
    format!("{}{}", label, PLIST_SUFFIX)
}

/// Label of a descriptor path, if it is a plist
pub fn label_from_path(path: &Path) -> Option<String> {
    path.file_name()?
        .to_str()?
        .strip_suffix(PLIST_SUFFIX)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}

/// Escape the five XML reserved characters
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

pub fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

pub fn render(config: &ServiceConfig) -> String {
    let mut out = String::from(HEADER);

    write_string(&mut out, 1, "Label", &config.name);

    if config.arguments.is_empty() {
        write_string(&mut out, 1, "Program", &config.program);
    } else {
        out.push_str("\t<key>ProgramArguments</key>\n\t<array>\n");
        let _ = writeln!(out, "\t\t<string>{}</string>", escape_xml(&config.program));
        for arg in &config.arguments {
            let _ = writeln!(out, "\t\t<string>{}</string>", escape_xml(arg));
        }
        out.push_str("\t</array>\n");
    }

    if let Some(dir) = config.working_directory.as_deref().filter(|d| !d.is_empty()) {
        write_string(&mut out, 1, "WorkingDirectory", dir);
    }

    if !config.environment.is_empty() {
        out.push_str("\t<key>EnvironmentVariables</key>\n\t<dict>\n");
        for (key, value) in &config.environment {
            write_string(&mut out, 2, key, value);
        }
        out.push_str("\t</dict>\n");
    }

    let _ = writeln!(
        out,
        "\t<key>RunAtLoad</key>\n\t<{}/>",
        if config.run_at_load { "true" } else { "false" }
    );

    if config.keep_alive {
        out.push_str("\t<key>KeepAlive</key>\n\t<true/>\n");
    }

    if let Some(path) = config.standard_out_path.as_deref().filter(|p| !p.is_empty()) {
        write_string(&mut out, 1, "StandardOutPath", path);
    }
    if let Some(path) = config.standard_error_path.as_deref().filter(|p| !p.is_empty()) {
        write_string(&mut out, 1, "StandardErrorPath", path);
    }

    out.push_str("</dict>\n</plist>\n");
    out
}

fn write_string(out: &mut String, depth: usize, key: &str, value: &str) {
    let indent = "\t".repeat(depth);
    let _ = writeln!(out, "{indent}<key>{}</key>", escape_xml(key));
    let _ = writeln!(out, "{indent}<string>{}</string>", escape_xml(value));
}

/// Render a plist and read it back, rejecting values an XML property list
/// cannot hold
pub fn render_checked(config: &ServiceConfig) -> Result<String, ProviderError> {
    let mut values = vec![config.name.as_str(), config.program.as_str()];
    values.extend(config.arguments.iter().map(String::as_str));
    values.extend(config.environment.iter().flat_map(|(k, v)| [k.as_str(), v.as_str()]));
    values.extend(
        [&config.working_directory, &config.standard_out_path, &config.standard_error_path]
            .into_iter()
            .flatten()
            .map(String::as_str),
    );
    let illegal = |c: char| matches!(c, '\0'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f');
    if let Some(bad) = values.iter().find(|v| v.chars().any(illegal)) {
        return Err(ProviderError::Validation(format!(
            "{:?} contains characters a property list cannot hold",
            bad
        )));
    }

    let plist = render(config);
    if recorded(&parse(&plist)?) != recorded(config) {
        return Err(ProviderError::Validation(format!(
            "service {} has values a property list cannot represent",
            config.name
        )));
    }
    Ok(plist)
}

/// The parts of a config that a plist records
fn recorded(config: &ServiceConfig) -> ServiceConfig {
    let present = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());
    ServiceConfig {
        description: None,
        working_directory: present(&config.working_directory),
        standard_out_path: present(&config.standard_out_path),
        standard_error_path: present(&config.standard_error_path),
        ..config.clone()
    }
}

/// First program path in an XML plist: the `Program` string, else the first
/// `ProgramArguments` element
pub fn program_from_xml(content: &str) -> Option<String> {
    string_after(content, "<key>Program</key>")
        .or_else(|| string_after(content, "<key>ProgramArguments</key>"))
        .filter(|p| !p.is_empty())
        .map(|p| unescape_xml(&p))
}

fn string_after(content: &str, marker: &str) -> Option<String> {
    let rest = &content[content.find(marker)?..];
    let start = rest.find("<string>")? + "<string>".len();
    let rest = &rest[start..];
    let end = rest.find("</string>")?;
    Some(rest[..end].to_string())
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    String(String),
    Bool(bool),
    Array(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open(String),
    Close(String),
    Empty(String),
    Text(String),
}

/// Read an XML property list back into a config
pub fn parse(content: &str) -> Result<ServiceConfig, ProviderError> {
    let mut tokens = tokenize(content)?.into_iter().peekable();

    loop {
        match tokens.next() {
            Some(Token::Open(tag)) if tag == "dict" => break,
            Some(_) => continue,
            None => return Err(malformed("no top-level dict")),
        }
    }
    let root = parse_dict(&mut tokens)?;

    let string = |key: &str| match root.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };
    let flag = |key: &str| matches!(root.get(key), Some(Value::Bool(true)));

    let mut config = ServiceConfig {
        name: string("Label").unwrap_or_default(),
        working_directory: string("WorkingDirectory"),
        run_at_load: flag("RunAtLoad"),
        keep_alive: flag("KeepAlive"),
        standard_out_path: string("StandardOutPath"),
        standard_error_path: string("StandardErrorPath"),
        ..Default::default()
    };

    let argv: Vec<String> = match root.get("ProgramArguments") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    match (string("Program"), argv.split_first()) {
        (Some(program), Some((_, rest))) => {
            config.program = program;
            config.arguments = rest.to_vec();
        }
        (Some(program), None) => config.program = program,
        (None, Some((first, rest))) => {
            config.program = first.clone();
            config.arguments = rest.to_vec();
        }
        (None, None) => {}
    }

    if let Some(Value::Dict(env)) = root.get("EnvironmentVariables") {
        for (key, value) in env {
            if let Value::String(value) = value {
                config.environment.insert(key.clone(), value.clone());
            }
        }
    }

    Ok(config)
}

fn malformed(detail: &str) -> ProviderError {
    ProviderError::Validation(format!("malformed property list: {}", detail))
}

fn tokenize(content: &str) -> Result<Vec<Token>, ProviderError> {
    let mut tokens = Vec::new();
    let mut rest = content;

    while !rest.is_empty() {
        match rest.find('<') {
            Some(0) => {
                let end = rest.find('>').ok_or_else(|| malformed("unterminated tag"))?;
                let tag = &rest[1..end];
                rest = &rest[end + 1..];

                if tag.starts_with('?') || tag.starts_with('!') {
                    continue;
                }
                if let Some(name) = tag.strip_prefix('/') {
                    tokens.push(Token::Close(name.trim().to_string()));
                } else if let Some(name) = tag.strip_suffix('/') {
                    tokens.push(Token::Empty(name.trim().to_string()));
                } else {
                    let name = tag.split_whitespace().next().unwrap_or_default();
                    tokens.push(Token::Open(name.to_string()));
                }
            }
            Some(start) => {
                tokens.push(Token::Text(unescape_xml(&rest[..start])));
                rest = &rest[start..];
            }
            None => {
                tokens.push(Token::Text(unescape_xml(rest)));
                rest = "";
            }
        }
    }

    Ok(tokens)
}

type Tokens = Peekable<IntoIter<Token>>;

fn skip_whitespace(tokens: &mut Tokens) {
    while matches!(tokens.peek(), Some(Token::Text(t)) if t.trim().is_empty()) {
        tokens.next();
    }
}

fn parse_dict(tokens: &mut Tokens) -> Result<BTreeMap<String, Value>, ProviderError> {
    let mut map = BTreeMap::new();

    loop {
        skip_whitespace(tokens);
        match tokens.next() {
            Some(Token::Close(tag)) if tag == "dict" => return Ok(map),
            Some(Token::Open(tag)) if tag == "key" => {
                let key = match tokens.next() {
                    Some(Token::Text(text)) => {
                        tokens.next();
                        text
                    }
                    Some(Token::Close(_)) => String::new(),
                    _ => return Err(malformed("bad key")),
                };
                skip_whitespace(tokens);
                let value = parse_value(tokens)?;
                map.insert(key, value);
            }
            _ => return Err(malformed("expected key in dict")),
        }
    }
}

fn parse_value(tokens: &mut Tokens) -> Result<Value, ProviderError> {
    match tokens.next() {
        Some(Token::Empty(tag)) if tag == "true" => Ok(Value::Bool(true)),
        Some(Token::Empty(tag)) if tag == "false" => Ok(Value::Bool(false)),
        Some(Token::Empty(tag)) if tag == "string" => Ok(Value::String(String::new())),
        Some(Token::Empty(tag)) if tag == "array" => Ok(Value::Array(Vec::new())),
        Some(Token::Empty(tag)) if tag == "dict" => Ok(Value::Dict(BTreeMap::new())),
        Some(Token::Open(tag)) if tag == "dict" => Ok(Value::Dict(parse_dict(tokens)?)),
        Some(Token::Open(tag)) if tag == "array" => {
            let mut items = Vec::new();
            loop {
                skip_whitespace(tokens);
                if matches!(tokens.peek(), Some(Token::Close(t)) if t == "array") {
                    tokens.next();
                    return Ok(Value::Array(items));
                }
                if tokens.peek().is_none() {
                    return Err(malformed("unterminated array"));
                }
                items.push(parse_value(tokens)?);
            }
        }
        // string, integer, real, date and data all read as text
        Some(Token::Open(_)) => {
            let text = match tokens.next() {
                Some(Token::Text(text)) => {
                    tokens.next();
                    text
                }
                Some(Token::Close(_)) => String::new(),
                _ => return Err(malformed("bad scalar")),
            };
            Ok(Value::String(text))
        }
        _ => Err(malformed("expected value")),
    }
}
