use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub tailer: TailerSettings,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    pub log_dir: String,
    /// Queue every existing log file except the newest at startup, oldest first.
    #[serde(default, alias = "readAll")]
    pub read_all: bool,
    #[serde(default = "default_extension")]
    pub extension: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TailerSettings {
    /// Start the first file at its current end so only new entries are processed.
    #[serde(default, alias = "skip.to.end")]
    pub skip_to_end: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilterConfig {
    /// Methods worth forwarding. Empty means any non-blank method.
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputConfig {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

const DEFAULT_EXTENSION: &str = "xml";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for TailerSettings {
    fn default() -> Self {
        Self {
            skip_to_end: false,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("invalid configuration")?;
        if config.watcher.log_dir.trim().is_empty() {
            anyhow::bail!("watcher.log_dir cannot be empty");
        }
        if config.watcher.extension.trim_start_matches('.').is_empty() {
            anyhow::bail!("watcher.extension cannot be empty");
        }
        if config.tailer.poll_interval_ms == 0 {
            anyhow::bail!("tailer.poll_interval_ms must be greater than zero");
        }
        Ok(config)
    }

    pub fn log_dir(&self) -> PathBuf {
        expand(&self.watcher.log_dir)
    }

    pub fn extension(&self) -> &str {
        self.watcher.extension.trim_start_matches('.')
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.tailer.poll_interval_ms)
    }

    pub fn output_path(&self) -> Option<PathBuf> {
        self.output
            .path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(expand)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
