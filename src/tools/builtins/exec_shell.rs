//! Built-in `exec_shell` tool: runs a shell command in the configured
//! working directory.
//!
//! The spawned process is handed to the caller's run, so stopping the run
//! terminates the command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;

use crate::config::Config;
use crate::tools::{truncate_utf8_owned, Tool, ToolContext, ToolDescriptor};

const MAX_OUTPUT: usize = 256 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Blocklist of commands that are never allowed.
///
/// Only blocks privilege-escalation vectors, kernel/disk destructors,
/// and namespace escapes.
const EXEC_BLOCKLIST: &[&str] = &[
    // Privilege escalation
    "sudo", "su", "doas", "pkexec",
    // Dangerous disk / partition tools
    "dd", "mkfs", "fdisk", "parted", "losetup",
    // Kernel / module manipulation
    "insmod", "rmmod", "modprobe",
    // Namespace / chroot escapes
    "nsenter", "unshare", "chroot",
];

/// `eval` can reassemble blocked command names from strings.
const SHELL_ESCAPE_PATTERNS: &[&str] = &["eval ", "eval\t"];

/// Extract individual command names from a shell command string.
///
/// Splits on `|`, `&&`, `||`, and `;` operators, then takes the first
/// whitespace-delimited token of each resulting segment.  Path prefixes
/// (e.g. `/usr/bin/cat`) are stripped to their basename.
pub fn extract_command_names(cmd: &str) -> Vec<String> {
    let normalized = cmd.replace("&&", "\x00").replace("||", "\x00");
    let mut result = Vec::new();
    for segment in normalized.split(['|', ';', '\x00']) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        if let Some(first) = segment.split_whitespace().next() {
            let name = first.rsplit('/').next().unwrap_or(first);
            result.push(name.to_string());
        }
    }
    result
}

pub struct ExecShell {
    workdir: PathBuf,
    extra_blocked: Vec<String>,
}

impl ExecShell {
    pub fn new(workdir: PathBuf, extra_blocked: Vec<String>) -> Self {
        Self { workdir, extra_blocked }
    }

    fn is_blocked(&self, name: &str) -> bool {
        EXEC_BLOCKLIST.contains(&name) || self.extra_blocked.iter().any(|b| b == name)
    }

    fn check(&self, command: &str) -> anyhow::Result<()> {
        for name in extract_command_names(command) {
            if self.is_blocked(&name) {
                anyhow::bail!("exec_shell: command '{name}' is blocked");
            }
        }
        let lower = command.to_lowercase();
        for pat in SHELL_ESCAPE_PATTERNS {
            if lower.contains(pat) {
                anyhow::bail!("exec_shell: shell escape pattern '{}' is not allowed", pat.trim());
            }
        }
        Ok(())
    }
}

async fn read_limited<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut p) = pipe {
        let _ = p.read_to_end(&mut buf).await;
    }
    truncate_utf8_owned(String::from_utf8_lossy(&buf).trim().to_string(), MAX_OUTPUT)
}

#[async_trait]
impl Tool for ExecShell {
    async fn execute(&self, params: Value, _input: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("exec_shell: missing `command` argument"))?;
        self.check(command)?;

        let timeout = Duration::from_secs(
            params
                .get("timeoutSecs")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        );

        tokio::fs::create_dir_all(&self.workdir).await.ok();
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", self.workdir.to_string_lossy().to_string())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so stopping the run also reaches whatever
        // the shell forked.
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("exec_shell: spawn failed: {e}"))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut watch = ctx.register_child(child);

        let collected = tokio::select! {
            out = tokio::time::timeout(timeout, async {
                tokio::join!(read_limited(stdout), read_limited(stderr), watch.wait())
            }) => Some(out),
            _ = ctx.cancel.cancelled() => None,
        };

        let Some(collected) = collected else {
            watch.terminate();
            let _ = watch.wait().await;
            anyhow::bail!("exec_shell: run cancelled");
        };

        let (stdout, stderr, status) = match collected {
            Ok(out) => out,
            Err(_elapsed) => {
                watch.terminate();
                let _ = watch.wait().await;
                return Ok(json!({
                    "exit_code": -1,
                    "stdout": "",
                    "stderr": format!("timed out after {}s (child killed)", timeout.as_secs()),
                }));
            }
        };

        if ctx.is_cancelled() {
            anyhow::bail!("exec_shell: run cancelled");
        }

        Ok(json!({
            "exit_code": status.and_then(|s| s.code()).unwrap_or(-1),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

/// Descriptor wired to the configured working directory and blocklist.
pub fn descriptor(config: &Config) -> ToolDescriptor {
    ToolDescriptor::sync(
        "exec_shell",
        "Execute a shell command (via `sh -c`) in the tool working directory. Privilege \
         escalation and destructive disk/kernel tools are blocked. Stopping the run \
         terminates the command.",
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to execute (via `sh -c`)."
                },
                "timeoutSecs": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Kill the command after this many seconds. Default: 60."
                }
            },
            "required": ["command"],
            "additionalProperties": false
        }),
        Arc::new(ExecShell::new(
            config.exec_workdir(),
            config.exec.blocked_commands.clone(),
        )),
    )
}
