use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Schema validation settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// When `true`, `format` keywords (e.g. `date-time`, `email`) are
    /// enforced. The default tolerates them so existing payloads keep
    /// validating.
    #[serde(default)]
    pub strict: bool,
}

/// Run manager settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RunsConfig {
    /// Grace period between SIGTERM and SIGKILL for tracked children.
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            termination_grace_ms: default_termination_grace_ms(),
        }
    }
}

fn default_termination_grace_ms() -> u64 {
    2000
}

/// Async job queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AsyncJobsConfig {
    /// Maximum number of jobs running at once for a single run.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_run: usize,
    /// Finished jobs older than this are dropped by `purge_finished`.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for AsyncJobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_run: default_max_concurrent(),
            retention_secs: default_retention_secs(),
        }
    }
}

fn default_max_concurrent() -> usize {
    10
}

fn default_retention_secs() -> u64 {
    3600
}

/// Native `exec_shell` settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ExecConfig {
    /// Commands rejected in addition to the built-in blocklist.
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    /// Working directory for shell commands. Defaults to the toolgate home.
    #[serde(default)]
    pub workdir: Option<String>,
}

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory scanned for `<plugin>/manifest.json`. Relative paths
    /// resolve against the toolgate home.
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: String,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    #[serde(default)]
    pub async_jobs: AsyncJobsConfig,
    #[serde(default)]
    pub exec: ExecConfig,
}

fn default_plugins_dir() -> String {
    "plugins/installed".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            validation: ValidationConfig::default(),
            runs: RunsConfig::default(),
            async_jobs: AsyncJobsConfig::default(),
            exec: ExecConfig::default(),
        }
    }
}

impl Config {
    /// Read and parse a YAML configuration file.
    ///
    /// A missing file is not an error: the defaults are returned so a
    /// fresh install can run without writing any configuration.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                let mut config = Config::default();
                config.resolve_paths();
                return Ok(config);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config file: {}", path.display()));
            }
        };

        let mut config = Config::parse(&contents)?;
        config.resolve_paths();

        tracing::debug!(
            plugins_dir = %config.plugins_dir,
            strict = config.validation.strict,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate YAML text without touching the filesystem.
    pub fn parse(contents: &str) -> anyhow::Result<Config> {
        let config: Config =
            serde_yaml_ng::from_str(contents).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute plugins directory.
    pub fn plugins_path(&self) -> PathBuf {
        PathBuf::from(&self.plugins_dir)
    }

    /// Working directory handed to `exec_shell`.
    pub fn exec_workdir(&self) -> PathBuf {
        match &self.exec.workdir {
            Some(dir) => PathBuf::from(dir),
            None => crate::toolgate_home(),
        }
    }

    fn resolve_paths(&mut self) {
        let home = crate::toolgate_home();
        let plugins = Path::new(&self.plugins_dir);
        if plugins.is_relative() {
            self.plugins_dir = home.join(plugins).to_string_lossy().to_string();
        }
        if let Some(dir) = &self.exec.workdir {
            let p = Path::new(dir);
            if p.is_relative() {
                self.exec.workdir = Some(home.join(p).to_string_lossy().to_string());
            }
        }
    }

    /// Validate semantic constraints that serde cannot enforce.
    fn validate(&self) -> anyhow::Result<()> {
        if self.plugins_dir.trim().is_empty() {
            anyhow::bail!("config: plugins_dir must not be empty");
        }
        if self.runs.termination_grace_ms == 0 {
            anyhow::bail!("config: runs.termination_grace_ms must be greater than 0");
        }
        if self.async_jobs.max_concurrent_per_run == 0 {
            anyhow::bail!("config: async_jobs.max_concurrent_per_run must be greater than 0");
        }
        for cmd in &self.exec.blocked_commands {
            if cmd.trim().is_empty() || cmd.contains(char::is_whitespace) {
                anyhow::bail!("config: exec.blocked_commands entry '{cmd}' is not a command name");
            }
        }
        Ok(())
    }

    /// Serialize and write the configuration back to a YAML file.
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_yaml_ng::to_string(self).context("serialize config YAML")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, &contents)
            .await
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}
