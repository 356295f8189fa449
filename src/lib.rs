//! # Frameflow
//!
//! Per-frame processing for live scientific data.
//!
//! Frameflow runs an [`App`](execution::App) across a pool of workers. The
//! workers are threads or separate processes. Each worker pulls frame indices
//! from a shared queue, decides per cycle whether to compute, and reports
//! results back to a controller. Frames are exchanged through a
//! [`SharedFrameBuffer`](memory::SharedFrameBuffer): one memfd region, mapped
//! by every process and guarded by an in-band lock word.
//!
//! Two apps ship with the crate:
//!
//! - [`LiveDirectoryApp`](apps::LiveDirectoryApp) follows a directory a
//!   detector writes into and publishes the newest frame.
//! - [`WorkflowApp`](apps::WorkflowApp) runs a tree of plugins, found
//!   through a [`PluginRegistry`](plugin::PluginRegistry), for each index.
//!
//! ## Quick Start
//!
//! ```rust
//! use frameflow::prelude::*;
//! use std::sync::Arc;
//!
//! let description = PipelineDescription::from_toml_str(r#"
//!     [[node]]
//!     id = "source"
//!     plugin = "constant_source"
//!     params = { height = 4, width = 4, value = 1.0 }
//!
//!     [[node]]
//!     id = "double"
//!     plugin = "scale"
//!     parent = "source"
//!     params = { factor = 2.0 }
//! "#)?;
//! let registry = Arc::new(PluginRegistry::with_builtins());
//! let mut graph = description.build(&registry)?;
//! graph.prepare()?;
//!
//! let leaves = graph.execute_process(Payload::Index(0))?;
//! assert_eq!(leaves.len(), 1);
//! # Ok::<(), frameflow::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod apps;
pub mod config;
pub mod error;
pub mod execution;
pub mod files;
pub mod frame;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod plugin;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::apps::{AppConfig, LiveDirectoryApp, WorkflowApp};
    pub use crate::config::RunConfig;
    pub use crate::error::{Error, Result};
    pub use crate::execution::{App, ItemResult, Runner, WorkItem, WorkerPool};
    pub use crate::frame::{Frame, Shape};
    pub use crate::memory::SharedFrameBuffer;
    pub use crate::pipeline::{PipelineDescription, PipelineGraph};
    pub use crate::plugin::{Payload, Plugin, PluginKind, PluginRegistry};
}

pub use error::{Error, Result};
