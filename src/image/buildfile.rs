//! Image build file parser
//!
//! Parses Dockerfile/Containerfile syntax into stages of typed
//! instructions. The parser is line oriented: continuations are folded,
//! comments and blank lines skipped, and errors carry the source line.

use crate::error::{ConvoyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Default build file name
pub const DEFAULT_BUILD_FILE: &str = "Dockerfile";

/// Alternative build file name
pub const CONTAINERFILE_NAME: &str = "Containerfile";

/// Locate the build file inside a context directory
pub fn find_build_file(context_dir: &Path) -> std::path::PathBuf {
    let dockerfile = context_dir.join(DEFAULT_BUILD_FILE);
    if dockerfile.exists() {
        return dockerfile;
    }
    let containerfile = context_dir.join(CONTAINERFILE_NAME);
    if containerfile.exists() {
        return containerfile;
    }
    dockerfile
}

/// Parsed build instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BuildInstruction {
    /// FROM instruction - base image
    From {
        image: String,
        tag: Option<String>,
        alias: Option<String>,
    },
    /// RUN instruction - execute command
    Run { command: String, shell: bool },
    /// COPY instruction - copy files from the context or a prior stage
    Copy {
        src: Vec<String>,
        dest: String,
        from: Option<String>,
        chown: Option<String>,
    },
    /// ADD instruction
    Add {
        src: Vec<String>,
        dest: String,
        chown: Option<String>,
    },
    /// CMD instruction - default command
    Cmd { command: Vec<String>, shell: bool },
    /// ENTRYPOINT instruction
    Entrypoint { command: Vec<String>, shell: bool },
    /// ENV instruction - set environment variable
    Env { key: String, value: String },
    /// ARG instruction - build argument
    Arg {
        name: String,
        default: Option<String>,
    },
    /// WORKDIR instruction
    Workdir { path: String },
    /// USER instruction
    User { user: String, group: Option<String> },
    /// EXPOSE instruction
    Expose { port: u16, protocol: String },
    /// VOLUME instruction
    Volume { paths: Vec<String> },
    /// LABEL instruction
    Label { labels: HashMap<String, String> },
    /// HEALTHCHECK instruction
    Healthcheck {
        cmd: Option<String>,
        interval: Option<String>,
        timeout: Option<String>,
        start_period: Option<String>,
        retries: Option<u32>,
    },
    /// STOPSIGNAL instruction
    Stopsignal { signal: String },
    /// SHELL instruction
    Shell { shell: Vec<String> },
}

/// Build stage (for multi-stage builds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStage {
    /// Stage alias from `FROM ... AS name`
    pub name: Option<String>,
    /// Base image
    pub base_image: String,
    /// Base image tag
    pub base_tag: Option<String>,
    /// Instructions in this stage
    pub instructions: Vec<BuildInstruction>,
}

/// Parsed build file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedBuildFile {
    /// ARGs declared before the first FROM
    pub global_args: Vec<(String, Option<String>)>,
    /// Build stages in declaration order
    pub stages: Vec<BuildStage>,
}

impl ParsedBuildFile {
    /// Parse a build file from a path
    pub fn parse_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse build file content
    pub fn parse(content: &str) -> Result<Self> {
        let mut global_args = Vec::new();
        let mut stages: Vec<BuildStage> = Vec::new();
        let mut current_stage: Option<BuildStage> = None;
        let mut continued_line = String::new();

        for (line_num, raw) in content.lines().enumerate() {
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(without_backslash) = line.strip_suffix('\\') {
                continued_line.push_str(without_backslash);
                continued_line.push(' ');
                continue;
            }

            let full_line = if continued_line.is_empty() {
                line.to_string()
            } else {
                let result = format!("{}{}", continued_line, line);
                continued_line.clear();
                result
            };

            let instruction = parse_instruction(&full_line, line_num + 1)?;

            match instruction {
                BuildInstruction::From { image, tag, alias } => {
                    if let Some(stage) = current_stage.take() {
                        stages.push(stage);
                    }
                    current_stage = Some(BuildStage {
                        name: alias,
                        base_image: image,
                        base_tag: tag,
                        instructions: Vec::new(),
                    });
                }
                BuildInstruction::Arg { name, default } if current_stage.is_none() => {
                    global_args.push((name, default));
                }
                other => match current_stage {
                    Some(ref mut stage) => stage.instructions.push(other),
                    None => {
                        return Err(ConvoyError::BuildfileParse {
                            line: line_num + 1,
                            message: "Instruction before FROM".to_string(),
                        });
                    }
                },
            }
        }

        if let Some(stage) = current_stage {
            stages.push(stage);
        }

        if stages.is_empty() {
            return Err(ConvoyError::BuildfileParse {
                line: 0,
                message: "No FROM instruction found".to_string(),
            });
        }

        Ok(Self {
            global_args,
            stages,
        })
    }

    /// Find a stage by alias or zero-based index
    pub fn stage(&self, reference: &str) -> Option<&BuildStage> {
        if let Ok(index) = reference.parse::<usize>() {
            return self.stages.get(index);
        }
        self.stages
            .iter()
            .find(|s| s.name.as_deref() == Some(reference))
    }

    /// The stage an image build produces: the named target or the last one
    pub fn final_stage(&self, target: Option<&str>) -> Result<&BuildStage> {
        match target {
            Some(name) => self
                .stage(name)
                .ok_or_else(|| ConvoyError::Build(format!("Unknown build stage: {}", name))),
            None => self
                .stages
                .last()
                .ok_or_else(|| ConvoyError::Build("Build file has no stages".to_string())),
        }
    }
}

/// Parse a single instruction line
fn parse_instruction(line: &str, line_num: usize) -> Result<BuildInstruction> {
    let parts: Vec<&str> = line.splitn(2, char::is_whitespace).collect();
    let instruction = parts[0].to_uppercase();
    let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

    match instruction.as_str() {
        "FROM" => parse_from(args, line_num),
        "RUN" => Ok(BuildInstruction::Run {
            command: args.to_string(),
            shell: !args.starts_with('['),
        }),
        "COPY" => parse_copy(args),
        "ADD" => parse_add(args),
        "CMD" => Ok(parse_command_like(args, |command, shell| {
            BuildInstruction::Cmd { command, shell }
        })),
        "ENTRYPOINT" => Ok(parse_command_like(args, |command, shell| {
            BuildInstruction::Entrypoint { command, shell }
        })),
        "ENV" => parse_env(args, line_num),
        "ARG" => Ok(parse_arg(args)),
        "WORKDIR" => Ok(BuildInstruction::Workdir {
            path: args.to_string(),
        }),
        "USER" => {
            let parts: Vec<&str> = args.splitn(2, ':').collect();
            Ok(BuildInstruction::User {
                user: parts[0].to_string(),
                group: parts.get(1).map(|s| s.to_string()),
            })
        }
        "EXPOSE" => parse_expose(args, line_num),
        "VOLUME" => {
            let paths = if args.starts_with('[') {
                serde_json::from_str(args).unwrap_or_default()
            } else {
                args.split_whitespace().map(|s| s.to_string()).collect()
            };
            Ok(BuildInstruction::Volume { paths })
        }
        "LABEL" => Ok(parse_label(args)),
        "HEALTHCHECK" => Ok(parse_healthcheck(args)),
        "STOPSIGNAL" => Ok(BuildInstruction::Stopsignal {
            signal: args.to_string(),
        }),
        "SHELL" => {
            let shell: Vec<String> =
                serde_json::from_str(args).map_err(|_| ConvoyError::BuildfileParse {
                    line: line_num,
                    message: "SHELL requires JSON array format".to_string(),
                })?;
            Ok(BuildInstruction::Shell { shell })
        }
        _ => Err(ConvoyError::BuildfileParse {
            line: line_num,
            message: format!("Unknown instruction: {}", instruction),
        }),
    }
}

fn parse_from(args: &str, line_num: usize) -> Result<BuildInstruction> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.is_empty() {
        return Err(ConvoyError::BuildfileParse {
            line: line_num,
            message: "FROM requires an image".to_string(),
        });
    }

    let image_parts: Vec<&str> = parts[0].splitn(2, ':').collect();
    let image = image_parts[0].to_string();
    let tag = image_parts.get(1).map(|s| s.to_string());

    let alias = if parts.len() >= 3 && parts[1].to_uppercase() == "AS" {
        Some(parts[2].to_string())
    } else {
        None
    };

    Ok(BuildInstruction::From { image, tag, alias })
}

/// Strip a leading `--flag=value` if present, returning (value, rest)
fn take_flag<'a>(args: &'a str, flag: &str) -> (Option<String>, &'a str) {
    let prefix = format!("--{}=", flag);
    match args.strip_prefix(&prefix) {
        Some(rest) => {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            (Some(rest[..end].to_string()), rest[end..].trim_start())
        }
        None => (None, args),
    }
}

fn parse_copy(args: &str) -> Result<BuildInstruction> {
    let mut from = None;
    let mut chown = None;
    let mut remaining = args;

    while remaining.starts_with("--") {
        let (value, rest) = take_flag(remaining, "from");
        if let Some(v) = value {
            from = Some(v);
            remaining = rest;
            continue;
        }
        let (value, rest) = take_flag(remaining, "chown");
        if let Some(v) = value {
            chown = Some(v);
            remaining = rest;
            continue;
        }
        break;
    }

    let (src, dest) = split_sources(remaining);
    Ok(BuildInstruction::Copy {
        src,
        dest,
        from,
        chown,
    })
}

fn parse_add(args: &str) -> Result<BuildInstruction> {
    let (chown, remaining) = take_flag(args, "chown");
    let (src, dest) = split_sources(remaining);
    Ok(BuildInstruction::Add { src, dest, chown })
}

fn split_sources(args: &str) -> (Vec<String>, String) {
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.len() < 2 {
        return (Vec::new(), String::new());
    }
    let dest = parts[parts.len() - 1].to_string();
    let src = parts[..parts.len() - 1]
        .iter()
        .map(|s| s.to_string())
        .collect();
    (src, dest)
}

fn parse_command_like<F>(args: &str, build: F) -> BuildInstruction
where
    F: FnOnce(Vec<String>, bool) -> BuildInstruction,
{
    if args.starts_with('[') {
        let command: Vec<String> = serde_json::from_str(args).unwrap_or_default();
        build(command, false)
    } else {
        build(vec![args.to_string()], true)
    }
}

fn parse_env(args: &str, line_num: usize) -> Result<BuildInstruction> {
    // Both ENV key=value and ENV key value forms
    if let Some(eq_pos) = args.find('=') {
        let key = args[..eq_pos].trim().to_string();
        let value = args[eq_pos + 1..].trim().trim_matches('"').to_string();
        Ok(BuildInstruction::Env { key, value })
    } else {
        let parts: Vec<&str> = args.splitn(2, char::is_whitespace).collect();
        if parts.len() < 2 {
            return Err(ConvoyError::BuildfileParse {
                line: line_num,
                message: "ENV requires a key and value".to_string(),
            });
        }
        Ok(BuildInstruction::Env {
            key: parts[0].to_string(),
            value: parts[1].trim().to_string(),
        })
    }
}

fn parse_arg(args: &str) -> BuildInstruction {
    match args.find('=') {
        Some(eq_pos) => BuildInstruction::Arg {
            name: args[..eq_pos].trim().to_string(),
            default: Some(args[eq_pos + 1..].trim().to_string()),
        },
        None => BuildInstruction::Arg {
            name: args.trim().to_string(),
            default: None,
        },
    }
}

fn parse_expose(args: &str, line_num: usize) -> Result<BuildInstruction> {
    let parts: Vec<&str> = args.split('/').collect();
    let port: u16 = parts[0].parse().map_err(|_| ConvoyError::BuildfileParse {
        line: line_num,
        message: format!("Invalid port number: {}", parts[0]),
    })?;
    let protocol = parts.get(1).unwrap_or(&"tcp").to_string();

    Ok(BuildInstruction::Expose { port, protocol })
}

fn parse_label(args: &str) -> BuildInstruction {
    let mut labels = HashMap::new();
    for part in args.split_whitespace() {
        if let Some(eq_pos) = part.find('=') {
            let key = part[..eq_pos].to_string();
            let value = part[eq_pos + 1..].trim_matches('"').to_string();
            labels.insert(key, value);
        }
    }
    BuildInstruction::Label { labels }
}

fn parse_healthcheck(args: &str) -> BuildInstruction {
    if args.trim().to_uppercase() == "NONE" {
        return BuildInstruction::Healthcheck {
            cmd: None,
            interval: None,
            timeout: None,
            start_period: None,
            retries: None,
        };
    }

    let mut cmd = None;
    let mut interval = None;
    let mut timeout = None;
    let mut start_period = None;
    let mut retries = None;

    let parts: Vec<&str> = args.split_whitespace().collect();
    let mut i = 0;
    while i < parts.len() {
        if let Some(v) = parts[i].strip_prefix("--interval=") {
            interval = Some(v.to_string());
        } else if let Some(v) = parts[i].strip_prefix("--timeout=") {
            timeout = Some(v.to_string());
        } else if let Some(v) = parts[i].strip_prefix("--start-period=") {
            start_period = Some(v.to_string());
        } else if let Some(v) = parts[i].strip_prefix("--retries=") {
            retries = v.parse().ok();
        } else if parts[i] == "CMD" {
            cmd = Some(parts[i + 1..].join(" "));
            break;
        }
        i += 1;
    }

    BuildInstruction::Healthcheck {
        cmd,
        interval,
        timeout,
        start_period,
        retries,
    }
}
