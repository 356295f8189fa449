//! Applications run by the worker pool.
//!
//! - [`LiveDirectoryApp`] publishes the newest detector frame into a shared
//!   frame buffer.
//! - [`WorkflowApp`] runs a plugin pipeline for each frame index.

mod live_directory;
mod workflow;

pub use live_directory::{LiveDirectoryApp, LiveDirectoryConfig};
pub use workflow::{WorkflowApp, WorkflowConfig};

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::execution::App;
use crate::memory::SharedFrameBuffer;
use crate::plugin::PluginRegistry;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// The `[app]` section, selected by its `kind` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppConfig {
    /// Follow a directory of detector frames.
    LiveDirectory(LiveDirectoryConfig),
    /// Run a pipeline per frame index.
    Workflow(WorkflowConfig),
}

impl AppConfig {
    pub(crate) fn resolve_paths(&mut self, base: &Path) {
        match self {
            Self::LiveDirectory(c) => c.resolve_paths(base),
            Self::Workflow(c) => c.resolve_paths(base),
        }
    }
}

/// The controller's own instance of the configured app.
pub fn build_controller(config: &RunConfig, registry: Arc<PluginRegistry>) -> Result<Box<dyn App>> {
    match &config.app {
        AppConfig::LiveDirectory(app) => {
            if config.pool.workers > 1 {
                warn!(
                    workers = config.pool.workers,
                    "Live directory app runs best with one worker; extra workers race"
                );
            }
            Ok(Box::new(LiveDirectoryApp::new(app.clone(), config.buffer)))
        }
        AppConfig::Workflow(app) => Ok(Box::new(WorkflowApp::from_config(app, registry)?)),
    }
}

/// A worker's private instance of the configured app.
///
/// `buffer` is the controller's shared frame buffer, if it allocated one.
pub fn build_worker(
    config: &RunConfig,
    registry: Arc<PluginRegistry>,
    buffer: Option<Arc<SharedFrameBuffer>>,
) -> Result<Box<dyn App>> {
    match &config.app {
        AppConfig::LiveDirectory(app) => {
            let buffer = buffer.ok_or_else(|| {
                Error::Config("live directory worker started without a frame buffer".into())
            })?;
            Ok(Box::new(LiveDirectoryApp::with_buffer(app.clone(), buffer)))
        }
        AppConfig::Workflow(app) => Ok(Box::new(WorkflowApp::from_config(app, registry)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_kind_tag() {
        let config: AppConfig = toml::from_str(
            r#"
            kind = "live_directory"
            directory = "frames"
            pattern = "frame_{index:04}.tif"
            "#,
        )
        .unwrap();
        let AppConfig::LiveDirectory(live) = config else {
            panic!("expected live directory");
        };
        assert_eq!(live.pattern.as_deref(), Some("frame_{index:04}.tif"));
        assert_eq!(live.mask_value, 0.0);
    }

    #[test]
    fn test_resolve_paths() {
        let mut config = AppConfig::Workflow(WorkflowConfig {
            pipeline: "pipe.toml".into(),
            first_index: 0,
        });
        config.resolve_paths(Path::new("/data/run"));
        let AppConfig::Workflow(wf) = config else {
            unreachable!()
        };
        assert_eq!(wf.pipeline, Path::new("/data/run/pipe.toml"));
    }

    #[test]
    fn test_live_worker_needs_buffer() {
        let config = RunConfig::from_toml_str(
            r#"
            [app]
            kind = "live_directory"
            directory = "/tmp"
            "#,
        )
        .unwrap();
        let registry = Arc::new(PluginRegistry::new());
        assert!(matches!(
            build_worker(&config, registry, None),
            Err(Error::Config(_))
        ));
    }
}
