//! Bash tool: execute shell commands in the workspace root.
//!
//! Commands run under `sh -c` with a deadline. Network clients and browsers
//! are refused outright; a short list of read-only commands skips the
//! permission prompt.

use async_trait::async_trait;
use codeloom_core::error::ToolError;
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolResponse};
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::file::ToolEnv;

/// Output beyond this many characters is cut from the middle.
pub const MAX_OUTPUT_CHARS: usize = 30_000;

/// Commands the model may not run.
pub const BANNED_COMMANDS: &[&str] = &[
    "alias", "curl", "curlie", "wget", "axel", "aria2c", "nc", "telnet", "lynx", "w3m", "links",
    "httpie", "xh", "http-prompt", "chrome", "firefox", "safari",
];

/// Command prefixes that only read state and run without a prompt.
const READ_ONLY_PREFIXES: &[&str] = &[
    "ls", "pwd", "echo", "date", "cal", "whoami", "id", "uname", "hostname", "which", "type",
    "df", "du", "wc", "git status", "git log", "git diff", "git show", "git branch",
    "git ls-files", "git rev-parse", "git blame", "cargo --version", "rustc --version",
];

/// Shell syntax that can chain, redirect or substitute commands.
const SHELL_OPERATORS: &[&str] = &[";", "&", "|", ">", "<", "`", "$(", "\n"];

pub struct BashTool {
    env: Arc<ToolEnv>,
}

impl BashTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }

    fn timeout(&self, requested: Option<u64>) -> Duration {
        let limits = &self.env.limits;
        let ms = match requested {
            Some(ms) if ms > 0 => ms.min(limits.bash_max_timeout_ms),
            _ => limits.bash_default_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}

/// The first banned program named in any segment of `command`.
fn banned_program(command: &str) -> Option<String> {
    command
        .split(['|', ';', '&', '\n', '(', ')'])
        .filter_map(|segment| segment.split_whitespace().next())
        .map(|program| program.rsplit('/').next().unwrap_or(program))
        .find(|program| {
            BANNED_COMMANDS
                .iter()
                .any(|banned| program.eq_ignore_ascii_case(banned))
        })
        .map(str::to_string)
}

fn is_read_only(command: &str) -> bool {
    let command = command.trim();
    if SHELL_OPERATORS.iter().any(|op| command.contains(op)) {
        return false;
    }
    let lower = command.to_lowercase();
    READ_ONLY_PREFIXES.iter().any(|prefix| {
        lower.strip_prefix(prefix).is_some_and(|rest| {
            rest.is_empty() || rest.starts_with(' ') || rest.starts_with('-')
        })
    })
}

/// Keep the head and tail of `output`, replacing the middle with a marker.
fn truncate_middle(output: &str) -> String {
    let total = output.chars().count();
    if total <= MAX_OUTPUT_CHARS {
        return output.to_string();
    }
    let half = MAX_OUTPUT_CHARS / 2;
    let head_end = output.char_indices().nth(half).map_or(output.len(), |(i, _)| i);
    let tail_start = output
        .char_indices()
        .nth(total - half)
        .map_or(output.len(), |(i, _)| i);
    let omitted = output[head_end..tail_start].lines().count();
    format!(
        "{}\n\n... [{omitted} lines truncated] ...\n\n{}",
        &output[..head_end],
        &output[tail_start..]
    )
}

#[derive(Deserialize)]
struct BashParams {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace root and return its combined stdout and stderr along with the exit code. The optional timeout is in milliseconds (default 30000, maximum 600000). Output longer than 30000 characters is truncated in the middle. Network clients such as curl and wget are not allowed; use the fetch tool instead."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in milliseconds"
                }
            },
            "required": ["command"]
        })
    }

    fn requires_permission(&self, input: &serde_json::Value) -> bool {
        !input["command"].as_str().is_some_and(is_read_only)
    }

    fn permission_description(&self, input: &serde_json::Value) -> String {
        format!("Execute command: {}", input["command"].as_str().unwrap_or_default())
    }

    fn permission_path(&self, _input: &serde_json::Value) -> Option<String> {
        Some(self.env.workspace.root().display().to_string())
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let params: BashParams = call.parse_input()?;
        let command = params.command.trim();
        if command.is_empty() {
            return Err(ToolError::InvalidArguments("missing 'command' argument".into()));
        }
        if let Some(program) = banned_program(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: "bash".into(),
                reason: format!("command '{program}' is not allowed"),
            });
        }

        let timeout = self.timeout(params.timeout);
        debug!(command = %command, timeout_ms = timeout.as_millis() as u64, "Executing shell command");

        let child = Command::new("sh")
            .args(["-c", command])
            .current_dir(self.env.workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::failed("bash", e.to_string()))?;

        let started = Instant::now();
        // Dropping the future drops the child, which kills it.
        let output = tokio::select! {
            out = child.wait_with_output() => out.map_err(|e| ToolError::failed("bash", e.to_string()))?,
            _ = tokio::time::sleep(timeout) => {
                warn!(command = %command, "Command exceeded its deadline");
                return Err(ToolError::Timeout {
                    tool_name: "bash".into(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
        };
        let elapsed = started.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);
        let success = output.status.success();

        let mut text = stdout.trim_end().to_string();
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr.trim_end());
        }
        let mut text = truncate_middle(&text);
        if !success {
            warn!(command = %command, exit_code = code, "Command failed");
            text.push_str(&format!("\n[exit code: {code}]"));
        }
        if text.trim().is_empty() {
            text = "no output".to_string();
        }

        let response = if success { ToolResponse::text(text) } else { ToolResponse::error(text) };
        Ok(response.with_metadata(serde_json::json!({
            "exit_code": code,
            "duration_ms": elapsed.as_millis() as u64,
        })))
    }
}
