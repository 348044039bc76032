use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:2283";
pub const DEFAULT_FILTER_PATH: &str = "/api/assets";
pub const DEFAULT_FILTER_FORM_KEY: &str = "assetData";
pub const DEFAULT_TASKS_FILE: &str = "tasks.yaml";
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 10;
pub const DEFAULT_DEVICE_ID: &str = "upload-optimizer";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub processing: ProcessingConfig,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    pub filter_path: String,
    pub filter_form_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessingConfig {
    pub tasks_file: PathBuf,
    pub max_concurrent_tasks: usize,
    pub work_dir: Option<PathBuf>,
}

/// Directory ingestion is enabled when `dir` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchConfig {
    pub dir: Option<PathBuf>,
    pub undone_dir: Option<PathBuf>,
    pub api_key: Option<String>,
    pub device_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            filter_path: DEFAULT_FILTER_PATH.to_string(),
            filter_form_key: DEFAULT_FILTER_FORM_KEY.to_string(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            tasks_file: PathBuf::from(DEFAULT_TASKS_FILE),
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            work_dir: None,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: None,
            undone_dir: None,
            api_key: None,
            device_id: DEFAULT_DEVICE_ID.to_string(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    /// Checks everything that must hold before the process serves traffic.
    pub fn validate(&self) -> Result<()> {
        self.upstream_url()?;

        if self.upstream.filter_path.trim().is_empty() {
            bail!("filter path must not be empty");
        }
        if self.upstream.filter_form_key.trim().is_empty() {
            bail!("filter form key must not be empty");
        }
        if self.processing.max_concurrent_tasks == 0 {
            bail!("max concurrent tasks must be at least 1");
        }

        if let Some(watch_dir) = self.watch.dir.as_deref() {
            let Some(undone_dir) = self.watch.undone_dir.as_deref() else {
                bail!("an undone directory is required when a watch directory is set");
            };
            if self
                .watch
                .api_key
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
            {
                bail!("an API key is required when a watch directory is set");
            }
            if is_within(watch_dir, undone_dir) {
                bail!(
                    "undone directory {} must not be inside the watch directory {}",
                    undone_dir.display(),
                    watch_dir.display()
                );
            }
        }

        Ok(())
    }

    pub fn upstream_url(&self) -> Result<Url> {
        if self.upstream.url.trim().is_empty() {
            bail!("the upstream URL is required");
        }
        let url = Url::parse(&self.upstream.url)
            .with_context(|| format!("invalid upstream URL: {}", self.upstream.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("upstream URL must use http or https, got {}", url.scheme());
        }
        Ok(url)
    }

    pub fn watch_enabled(&self) -> bool {
        self.watch.dir.is_some()
    }

    pub fn work_dir(&self) -> PathBuf {
        self.processing
            .work_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn is_within(root: &Path, candidate: &Path) -> bool {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let candidate = candidate
        .canonicalize()
        .unwrap_or_else(|_| candidate.to_path_buf());
    candidate.starts_with(root)
}
