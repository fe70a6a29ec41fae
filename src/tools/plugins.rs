//! Plugin discovery and the plugin process boundary.
//!
//! Plugins live under `<plugins_dir>/<plugin>/manifest.json`:
//!
//! ```json
//! {
//!   "name": "weather-plugin",
//!   "version": "1.0.0",
//!   "tools": [{
//!     "type": "get-forecast",
//!     "description": "Forecast for a city",
//!     "entryPoint": "forecast.py",
//!     "command": "python3",
//!     "parameters": { "city": { "type": "string" } }
//!   }]
//! }
//! ```
//!
//! Each tool runs as a child process: the call document
//! `{params, input, context}` is written to stdin and the result JSON is
//! read from the last non-empty stdout line. Spawned processes are handed
//! to the caller's run so stopping the run terminates them.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{truncate_utf8_owned, Tool, ToolContext, ToolDescriptor, ToolSource};
use crate::error::ToolError;

const MANIFEST_FILE: &str = "manifest.json";
const MAX_STDERR: usize = 8 * 1024;
const JSON_SCHEMA_TYPES: &[&str] = &["string", "number", "integer", "boolean", "array", "object"];

// ── Manifest ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub tools: Vec<PluginToolDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub entry_point: String,
    /// Interpreter for the entry point. Inferred from the extension when absent.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub auth_provider: Option<String>,
}

/// Plugin parameter definition as written in manifests.
#[derive(Debug, Clone, Default, Deserialize)]
struct ParamDef {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    options: Option<Vec<Value>>,
    #[serde(default)]
    items: Option<Value>,
    #[serde(default)]
    conditional: Option<Value>,
    #[serde(default)]
    required: Option<bool>,
}

impl PluginManifest {
    /// Read and check one manifest file.
    pub async fn load(path: &Path) -> Result<PluginManifest, ToolError> {
        let invalid = |message: String| ToolError::PluginManifest {
            path: path.display().to_string(),
            message,
        };
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| invalid(e.to_string()))?;
        let manifest: PluginManifest =
            serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;
        if manifest.name.trim().is_empty() {
            return Err(invalid("missing name".into()));
        }
        if manifest.tools.is_empty() {
            return Err(invalid("no tools declared".into()));
        }
        Ok(manifest)
    }
}

/// Convert a manifest parameter map into a JSON-Schema object.
pub fn parameters_to_schema(tool: &str, params: &Map<String, Value>) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for (name, raw) in params {
        let def: ParamDef = serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
            warn!(tool = %tool, param = %name, error = %e, "unreadable parameter definition");
            ParamDef::default()
        });

        let mut kind = def.kind.clone().unwrap_or_else(|| "string".to_string());
        if !JSON_SCHEMA_TYPES.contains(&kind.as_str()) {
            warn!(tool = %tool, param = %name, kind = %kind, "invalid schema type, defaulting to string");
            kind = "string".to_string();
        }

        let mut prop = Map::new();
        prop.insert("type".into(), json!(kind));
        prop.insert(
            "description".into(),
            json!(def.description.clone().unwrap_or_default()),
        );
        if kind == "array" {
            prop.insert(
                "items".into(),
                def.items.clone().unwrap_or_else(|| json!({"type": "string"})),
            );
        }
        if let Some(default) = &def.default {
            prop.insert("default".into(), default.clone());
        }
        if let Some(options) = &def.options {
            prop.insert("enum".into(), Value::Array(options.clone()));
        }

        let conditional = matches!(&def.conditional, Some(v) if !v.is_null() && *v != json!(false));
        if def.default.is_none() && !conditional && def.required != Some(false) {
            required.push(json!(name));
        }
        properties.insert(name.clone(), Value::Object(prop));
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

// ── Discovery ────────────────────────────────────────────────

/// Scan `dir` for plugin manifests and build descriptors.
///
/// Never fails: a missing directory yields nothing and broken plugins are
/// skipped with a warning.
pub async fn discover(dir: &Path) -> Vec<ToolDescriptor> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "no plugins directory");
            return Vec::new();
        }
    };

    let mut set = tokio::task::JoinSet::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to read plugins directory entry");
                break;
            }
        };
        let plugin_dir = entry.path();
        if !plugin_dir.is_dir() {
            continue;
        }
        set.spawn(load_plugin(plugin_dir));
    }

    let mut descriptors = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(mut tools) => descriptors.append(&mut tools),
            Err(e) => warn!(error = %e, "plugin loader task failed"),
        }
    }
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));

    info!(dir = %dir.display(), tools = descriptors.len(), "plugins discovered");
    descriptors
}

async fn load_plugin(plugin_dir: PathBuf) -> Vec<ToolDescriptor> {
    let manifest_path = plugin_dir.join(MANIFEST_FILE);
    let manifest = match PluginManifest::load(&manifest_path).await {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "skipping plugin");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for def in &manifest.tools {
        let entry = plugin_dir.join(&def.entry_point);
        if !entry.exists() {
            warn!(
                plugin = %manifest.name,
                tool = %def.tool_type,
                entry = %entry.display(),
                "entry point missing, skipping tool"
            );
            continue;
        }

        let tool = PluginTool {
            plugin: manifest.name.clone(),
            tool_type: def.tool_type.clone(),
            plugin_dir: plugin_dir.clone(),
            entry,
            command: def.command.clone(),
            auth_required: def.auth_required,
            auth_provider: def.auth_provider.clone(),
        };
        let description = def
            .description
            .clone()
            .unwrap_or_else(|| format!("Plugin tool: {}", def.tool_type));
        let schema = parameters_to_schema(&def.tool_type, &def.parameters);

        debug!(plugin = %manifest.name, tool = %def.tool_type, "plugin tool loaded");
        out.push(
            ToolDescriptor::sync(&def.tool_type, &description, schema, Arc::new(tool))
                .with_source(ToolSource::Plugin),
        );
    }
    out
}

// ── Process boundary ─────────────────────────────────────────

/// Executor for one plugin tool.
#[derive(Debug, Clone)]
pub struct PluginTool {
    plugin: String,
    tool_type: String,
    plugin_dir: PathBuf,
    entry: PathBuf,
    command: Option<String>,
    auth_required: bool,
    auth_provider: Option<String>,
}

impl PluginTool {
    fn command(&self) -> tokio::process::Command {
        let interpreter = self.command.clone().or_else(|| {
            let ext = self.entry.extension().and_then(|e| e.to_str()).unwrap_or("");
            match ext {
                "js" | "mjs" | "cjs" => Some("node".to_string()),
                "py" => Some("python3".to_string()),
                "sh" => Some("sh".to_string()),
                _ => None,
            }
        });
        match interpreter {
            Some(bin) => {
                let mut cmd = tokio::process::Command::new(bin);
                cmd.arg(&self.entry);
                cmd
            }
            None => tokio::process::Command::new(&self.entry),
        }
    }
}

async fn read_pipe<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut p) = pipe {
        let _ = p.read_to_end(&mut buf).await;
    }
    buf
}

#[async_trait]
impl Tool for PluginTool {
    async fn execute(&self, params: Value, input: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        if self.auth_required && ctx.auth_token.is_none() {
            anyhow::bail!(
                "plugin tool '{}' requires authentication ({})",
                self.tool_type,
                self.auth_provider.as_deref().unwrap_or("unspecified provider")
            );
        }

        let payload = serde_json::to_vec(&json!({
            "tool": self.tool_type,
            "params": params,
            "input": input,
            "context": ctx.to_json(),
        }))?;

        let mut cmd = self.command();
        cmd.current_dir(&self.plugin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("plugin '{}': failed to spawn {}", self.plugin, self.entry.display()))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut watch = ctx.register_child(child);

        let write = async move {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            }
        };
        let collected = tokio::select! {
            out = async {
                let ((), out, err) = tokio::join!(write, read_pipe(stdout), read_pipe(stderr));
                (out, err, watch.wait().await)
            } => Some(out),
            _ = ctx.cancel.cancelled() => None,
        };

        let Some((out, err, status)) = collected else {
            watch.terminate();
            let _ = watch.wait().await;
            anyhow::bail!("plugin tool '{}' was cancelled", self.tool_type);
        };

        if ctx.is_cancelled() {
            anyhow::bail!("plugin tool '{}' was cancelled", self.tool_type);
        }

        let stderr_text = truncate_utf8_owned(String::from_utf8_lossy(&err).trim().to_string(), MAX_STDERR);
        match status {
            Some(s) if s.success() => {}
            Some(s) => anyhow::bail!(
                "plugin tool '{}' exited with {}: {}",
                self.tool_type,
                s.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                stderr_text
            ),
            None => anyhow::bail!("plugin tool '{}' exit status unavailable", self.tool_type),
        }

        let stdout_text = String::from_utf8_lossy(&out);
        let line = stdout_text
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("plugin tool '{}' produced no output", self.tool_type))?;
        serde_json::from_str(line.trim())
            .with_context(|| format!("plugin tool '{}' returned invalid JSON", self.tool_type))
    }
}
