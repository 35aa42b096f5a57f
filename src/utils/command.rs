/// Functions and structs for building command lines and running external tools

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use anyhow::{anyhow, Result};
use fxhash::FxHashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::JoinHandle;
use crate::config::defs::{PipelineError, GSUTIL_TAG, SAMBLASTER_TAG, SAMTOOLS_TAG, SENTIEON_TAG, STDERR_TAIL_LINES, TOOL_VERSIONS};
use crate::utils::streams::read_tail;


/// One external command as it appears in an invocation profile, before
/// placeholder expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A fully expanded command, ready to spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// Values substituted into `{name}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    scalars: FxHashMap<String, String>,
    lists: FxHashMap<String, Vec<String>>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.scalars.insert(name.to_string(), value.into());
        self
    }

    pub fn set_path(&mut self, name: &str, value: &Path) -> &mut Self {
        self.set(name, value.to_string_lossy().into_owned())
    }

    pub fn set_list(&mut self, name: &str, values: Vec<String>) -> &mut Self {
        self.lists.insert(name.to_string(), values);
        self
    }

    /// Expands a single string. List placeholders are rejected here because
    /// they only make sense as a whole argument.
    pub fn expand(&self, text: &str) -> Result<String, PipelineError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if is_placeholder_name(&after[..close]) => {
                    let name = &after[..close];
                    if let Some(value) = self.scalars.get(name) {
                        out.push_str(value);
                    } else if self.lists.contains_key(name) {
                        return Err(PipelineError::InvalidConfig(format!(
                            "Placeholder {{{}}} expands to several arguments and must stand alone in '{}'",
                            name, text
                        )));
                    } else {
                        return Err(PipelineError::InvalidConfig(format!(
                            "Unknown placeholder {{{}}} in '{}'",
                            name, text
                        )));
                    }
                    rest = &after[close + 1..];
                }
                _ => {
                    // Not a placeholder, e.g. an awk program; keep the brace.
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ToolTemplate {
    /// Expands every placeholder of the program and its arguments.
    ///
    /// # Arguments
    ///
    /// * `vars` - Placeholder values for this stage invocation.
    ///
    /// # Returns
    /// CommandSpec, or InvalidConfig on an unknown placeholder.
    pub fn render(&self, vars: &TemplateVars) -> Result<CommandSpec, PipelineError> {
        let program = vars.expand(&self.program)?;
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            let whole = arg
                .strip_prefix('{')
                .and_then(|a| a.strip_suffix('}'))
                .filter(|name| is_placeholder_name(name));
            match whole.and_then(|name| vars.lists.get(name)) {
                Some(values) => args.extend(values.iter().cloned()),
                None => args.push(vars.expand(arg)?),
            }
        }
        Ok(CommandSpec { program, args })
    }
}


/// Captured result of one command of a chain.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub tool: String,
    pub exit_code: i32,
    /// Last STDERR_TAIL_LINES lines of stderr.
    pub stderr_tail: Vec<String>,
}

/// Captured result of a whole chain.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub tools: Vec<ToolOutput>,
}


/// Exit code of a finished process; signal deaths map to 128 + signal like a shell.
pub fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

const SIGPIPE: i32 = 13;

/// Writer killed by SIGPIPE, directly or reported by a wrapping shell.
pub fn is_broken_pipe(exit_code: i32) -> bool {
    exit_code == 128 + SIGPIPE
}

/// The tool a failed chain is blamed on. When a reader dies, every writer
/// upstream of it gets SIGPIPE, so those deaths only count if nothing else failed.
fn culprit(tools: &[ToolOutput]) -> Option<&ToolOutput> {
    let failed: Vec<&ToolOutput> = tools.iter().filter(|t| t.exit_code != 0).collect();
    failed
        .iter()
        .rev()
        .find(|t| !is_broken_pipe(t.exit_code))
        .or(failed.first())
        .copied()
}


/// Runs a chain of commands with each stdout piped into the next stdin, the
/// way the shell drivers ran `samtools | samblaster | samtools sort`.
///
/// # Arguments
///
/// * `commands` - Expanded commands, in pipe order. Must not be empty.
/// * `cwd` - Working directory for every command.
/// * `stdout_to` - File receiving the last command's stdout; discarded when None.
///
/// # Returns
/// ChainOutput when every command exited 0, otherwise ToolExecution for the
/// last failing command that was not killed by a broken pipe.
pub async fn run_chain(
    commands: &[CommandSpec],
    cwd: &Path,
    stdout_to: Option<&Path>,
) -> Result<ChainOutput, PipelineError> {
    if commands.is_empty() {
        return Err(PipelineError::InvalidConfig("Empty command chain".to_string()));
    }

    let mut children = Vec::with_capacity(commands.len());
    let mut stderr_tasks: Vec<JoinHandle<Result<Vec<String>>>> = Vec::with_capacity(commands.len());
    let mut upstream: Option<Stdio> = None;

    for (i, spec) in commands.iter().enumerate() {
        let last = i + 1 == commands.len();
        debug!("Spawning {} {:?}", spec.program, spec.args);

        let stdout = match (last, stdout_to) {
            (true, Some(path)) => Stdio::from(std::fs::File::create(path)?),
            (true, None) => Stdio::null(),
            (false, _) => Stdio::piped(),
        };

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(cwd)
            .stdin(upstream.take().unwrap_or_else(Stdio::null))
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::ToolExecution {
                tool: spec.program.clone(),
                exit_code: None,
                stderr_tail: format!("Failed to spawn: {}. Is {} installed?", e, spec.program),
            })?;

        let stderr = child.stderr.take();
        stderr_tasks.push(tokio::spawn(async move {
            match stderr {
                Some(stderr) => read_tail(stderr, STDERR_TAIL_LINES).await,
                None => Ok(Vec::new()),
            }
        }));

        if !last {
            let out = child.stdout.take().ok_or_else(|| PipelineError::IOError(format!("No stdout from {}", spec.program)))?;
            let stdio: Stdio = out.try_into()?;
            upstream = Some(stdio);
        }
        children.push(child);
    }

    let mut tools = Vec::with_capacity(children.len());
    for ((spec, mut child), stderr_task) in commands.iter().zip(children).zip(stderr_tasks) {
        let status = child.wait().await?;
        let stderr_tail = stderr_task
            .await
            .map_err(|e| PipelineError::IOError(e.to_string()))?
            .map_err(|e| PipelineError::IOError(e.to_string()))?;
        tools.push(ToolOutput {
            tool: spec.program.clone(),
            exit_code: exit_code_of(&status),
            stderr_tail,
        });
    }

    if let Some(failed) = culprit(&tools) {
        return Err(PipelineError::ToolExecution {
            tool: failed.tool.clone(),
            exit_code: Some(failed.exit_code),
            stderr_tail: failed.stderr_tail.join("\n"),
        });
    }

    Ok(ChainOutput { tools })
}


/// Parses "1.20" or "1.20.3" into (major, minor).
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().trim_start_matches('v').split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()
        .map(|m| m.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|m| m.parse().ok())
        .unwrap_or(0);
    Some((major, minor))
}

/// Pulls the version token out of a tool's version banner.
pub fn version_from_banner(tool: &str, banner: &str) -> Option<String> {
    let first_line = banner.lines().find(|l| !l.trim().is_empty())?;
    let token = match tool {
        // "samtools 1.20"
        SAMTOOLS_TAG => first_line.split_whitespace().nth(1),
        // "samblaster: Version 0.1.26"
        SAMBLASTER_TAG => first_line.split_whitespace().last(),
        // "gsutil version: 5.27"
        GSUTIL_TAG => first_line.split_whitespace().last(),
        // "sentieon-genomics-202308.01"
        SENTIEON_TAG => first_line.trim().rsplit('-').next(),
        _ => None,
    }?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn version_args(tool: &str) -> Option<Vec<&'static str>> {
    match tool {
        SAMTOOLS_TAG => Some(vec!["--version"]),
        SAMBLASTER_TAG => Some(vec!["--version"]),
        GSUTIL_TAG => Some(vec!["version"]),
        SENTIEON_TAG => Some(vec!["driver", "--version"]),
        _ => None,
    }
}


/// Checks a known tool is installed and reports its version.
///
/// # Arguments
///
/// * `tool` - One of the *_TAG constants.
///
/// # Returns
/// Version string from the tool's banner.
pub async fn check_version(tool: &str) -> Result<String> {
    let args = version_args(tool).ok_or_else(|| anyhow!("Unknown tool: {}", tool))?;

    let output = Command::new(tool)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| anyhow!("Failed to spawn: {}. Is {} installed?", e, tool))?;

    // samblaster prints its banner on stderr
    let banner = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let version = version_from_banner(tool, &banner)
        .ok_or_else(|| anyhow!("Invalid {} version output: {}", tool, banner.trim()))?;

    if let (Some(found), Some(min)) = (parse_version(&version), TOOL_VERSIONS.get(tool)) {
        if found < *min {
            return Err(anyhow!(
                "{} version {} is older than required {}.{}",
                tool, version, min.0, min.1
            ));
        }
    }
    Ok(version)
}


/// Runs check_version for every known tool among `programs`; unknown
/// programs are skipped.
pub async fn check_versions(programs: &[String]) -> Result<Vec<(String, String)>> {
    let mut found = Vec::new();
    for program in programs {
        let tool = PathBuf::from(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone());
        if version_args(&tool).is_none() || found.iter().any(|(t, _)| t == &tool) {
            continue;
        }
        let version = check_version(&tool).await?;
        found.push((tool, version));
    }
    Ok(found)
}
