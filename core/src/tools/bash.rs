use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;

use super::ApprovalRequest;
use super::Tool;
use super::ToolContext;
use super::result_json;
use crate::command_safety::analyze;
use crate::models::JsonSchema;
use crate::models::ToolDef;

// Caps per stream: whichever budget runs out first marks the output
// truncated.
const MAX_STREAM_OUTPUT: usize = 10 * 1024;
const MAX_STREAM_OUTPUT_LINES: usize = 256;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct BashArgs {
    command: String,
}

/// Runs commands via `/bin/sh -lc` in the workspace root with a timeout and
/// capped output capture.
pub struct BashTool {
    timeout: Duration,
}

impl Default for BashTool {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl BashTool {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn definition(&self) -> ToolDef {
        let mut properties = BTreeMap::new();
        properties.insert(
            "command".to_string(),
            JsonSchema::string("Shell command to run in the workspace root"),
        );
        ToolDef::function(
            "bash",
            "Run a shell command and return its exit code and captured output",
            JsonSchema::object(properties, &["command"]),
        )
    }

    /// Approval when the analyzer flags the command, or when a `>` style
    /// redirection would overwrite an existing workspace file.
    fn approval_request(&self, ctx: &ToolContext, args: &Value) -> Option<ApprovalRequest> {
        let command = args.get("command")?.as_str()?;

        let risk = analyze(command);
        if risk.require_approval {
            return Some(ApprovalRequest {
                tool: "bash".to_string(),
                reason: risk
                    .reason
                    .unwrap_or_else(|| "flagged as dangerous".to_string()),
                raw_args: args.clone(),
            });
        }

        if let Some(target) = overwrite_redirect_target(command) {
            if let Ok(resolved) = ctx.workspace.resolve(&target) {
                if resolved.is_file() {
                    return Some(ApprovalRequest {
                        tool: "bash".to_string(),
                        reason: format!("overwrites existing file {target} via redirection"),
                        raw_args: args.clone(),
                    });
                }
            }
        }
        None
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String> {
        let args: BashArgs = serde_json::from_value(args)?;
        let start = Instant::now();

        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-lc")
            .arg(&args.command)
            .current_dir(ctx.workspace.root())
            // No stdin: some tools (ripgrep among them) block waiting on it.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout_reader = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdout pipe unavailable"))?;
        let stderr_reader = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("stderr pipe unavailable"))?;

        let stdout_handle = tokio::spawn(read_capped(
            BufReader::new(stdout_reader),
            MAX_STREAM_OUTPUT,
            MAX_STREAM_OUTPUT_LINES,
        ));
        let stderr_handle = tokio::spawn(read_capped(
            BufReader::new(stderr_reader),
            MAX_STREAM_OUTPUT,
            MAX_STREAM_OUTPUT_LINES,
        ));

        let mut timed_out = false;
        let status = tokio::select! {
            result = tokio::time::timeout(self.timeout, child.wait()) => match result {
                Ok(status) => Some(status?),
                Err(_) => {
                    timed_out = true;
                    child.start_kill()?;
                    let _ = child.wait().await;
                    None
                }
            },
            _ = ctx.cancel.cancelled() => {
                child.start_kill()?;
                let _ = child.wait().await;
                anyhow::bail!("command cancelled");
            }
        };

        let (stdout, stdout_truncated) = stdout_handle.await??;
        let (stderr, stderr_truncated) = stderr_handle.await??;

        let exit_code = match status {
            Some(status) => status.code().unwrap_or(-1),
            None => 124, // timeout, matching the `timeout(1)` convention
        };

        Ok(result_json(json!({
            "ok": exit_code == 0,
            "exit_code": exit_code,
            "stdout": String::from_utf8_lossy(&stdout),
            "stderr": String::from_utf8_lossy(&stderr),
            "truncated": stdout_truncated || stderr_truncated,
            "timed_out": timed_out,
            "duration_ms": start.elapsed().as_millis() as u64,
        })))
    }
}

/// Target of the first overwriting redirection (`>`, `1>`, `2>`), if any.
/// Appending (`>>`) never needs approval.
fn overwrite_redirect_target(command: &str) -> Option<String> {
    let tokens = shlex::split(command)?;
    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next() {
        let rest = if let Some(rest) = token.strip_prefix("1>") {
            rest
        } else if let Some(rest) = token.strip_prefix("2>") {
            rest
        } else if let Some(rest) = token.strip_prefix('>') {
            rest
        } else {
            continue;
        };
        // `>>` in either spelling is an append.
        if rest.starts_with('>') {
            continue;
        }
        if rest.is_empty() {
            if let Some(target) = iter.peek() {
                return Some((*target).clone());
            }
            return None;
        }
        return Some(rest.to_string());
    }
    None
}

async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    max_output: usize,
    max_lines: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::with_capacity(max_output.min(8 * 1024));
    let mut tmp = [0u8; 8192];
    let mut remaining_bytes = max_output;
    let mut remaining_lines = max_lines;
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        if remaining_bytes == 0 || remaining_lines == 0 {
            // Keep draining to avoid back-pressure, but discard.
            truncated = true;
            continue;
        }
        let mut copy_len = 0;
        for &b in &tmp[..n] {
            if remaining_bytes == 0 || remaining_lines == 0 {
                truncated = true;
                break;
            }
            copy_len += 1;
            remaining_bytes -= 1;
            if b == b'\n' {
                remaining_lines -= 1;
            }
        }
        buf.extend_from_slice(&tmp[..copy_len]);
    }

    Ok((buf, truncated))
}
