//! Run configuration.
//!
//! A run is described by one TOML file:
//!
//! ```toml
//! log_level = "info"
//!
//! [pool]
//! workers = 4
//! mode = "process"
//! poll_interval_ms = 5
//! input_timeout_ms = 10
//! compute_budget_ms = 250
//!
//! [buffer]
//! max_height = 4096
//! max_width = 4096
//!
//! [plugins]
//! directories = ["plugins"]
//!
//! [app]
//! kind = "workflow"
//! pipeline = "pipeline.toml"
//! ```
//!
//! Every section except `[app]` is optional.

use crate::apps::AppConfig;
use crate::error::{Error, Result};
use crate::execution::WorkerConfig;
use crate::memory::DEFAULT_MAX_DIM;
use crate::plugin::PluginRegistry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn default_log_level() -> String {
    "info".into()
}

fn default_workers() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_input_timeout_ms() -> u64 {
    10
}

fn default_finish_timeout_ms() -> u64 {
    10_000
}

fn default_max_dim() -> usize {
    DEFAULT_MAX_DIM
}

/// Top-level run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Default log filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Worker pool settings.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Shared frame buffer capacity.
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Plugin discovery.
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// The application to run.
    pub app: AppConfig,
}

impl RunConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file.
    ///
    /// Relative paths inside the file are resolved against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Serialize back to TOML, e.g. to hand to a worker process.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(format!("cannot serialize config: {e}")))
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(Error::Config("pool.workers must be at least 1".into()));
        }
        if self.buffer.max_height == 0 || self.buffer.max_width == 0 {
            return Err(Error::Config("buffer dimensions must be non-zero".into()));
        }
        Ok(())
    }

    /// Make relative paths absolute with respect to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        for dir in &mut self.plugins.directories {
            resolve(dir, base);
        }
        self.app.resolve_paths(base);
    }
}

pub(crate) fn resolve(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

/// How workers are run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// One OS process per worker.
    #[default]
    Process,
    /// One thread per worker in the controller process.
    Thread,
}

/// `[pool]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Processes or threads.
    #[serde(default)]
    pub mode: PoolMode,
    /// Sleep at the end of each worker cycle.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bounded wait for the next input item.
    #[serde(default = "default_input_timeout_ms")]
    pub input_timeout_ms: u64,
    /// Log a warning when one compute takes longer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_budget_ms: Option<u64>,
    /// How long to wait for workers to acknowledge shutdown.
    #[serde(default = "default_finish_timeout_ms")]
    pub finish_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            mode: PoolMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            input_timeout_ms: default_input_timeout_ms(),
            compute_budget_ms: None,
            finish_timeout_ms: default_finish_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Worker loop timing derived from this section.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            input_timeout: Duration::from_millis(self.input_timeout_ms),
            compute_budget: self.compute_budget_ms.map(Duration::from_millis),
        }
    }

    /// Shutdown acknowledgement timeout.
    pub fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }
}

/// `[buffer]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum frame height.
    #[serde(default = "default_max_dim")]
    pub max_height: usize,
    /// Maximum frame width.
    #[serde(default = "default_max_dim")]
    pub max_width: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_height: DEFAULT_MAX_DIM,
            max_width: DEFAULT_MAX_DIM,
        }
    }
}

/// `[plugins]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directories scanned for plugin manifests, in order.
    #[serde(default)]
    pub directories: Vec<PathBuf>,
}

impl PluginsConfig {
    /// A registry with the built-ins plus every configured directory.
    ///
    /// Earlier directories win on name clashes; built-ins win over all.
    pub fn build_registry(&self) -> Result<Arc<PluginRegistry>> {
        let registry = PluginRegistry::with_builtins();
        for dir in &self.directories {
            let report = registry.discover(dir, false)?;
            info!(
                dir = %dir.display(),
                registered = report.registered.len(),
                rejected = report.rejected.len(),
                "Loaded plugin directory"
            );
        }
        Ok(Arc::new(registry))
    }
}
