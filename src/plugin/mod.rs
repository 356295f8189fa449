//! Plugin system.
//!
//! A plugin is one processing stage. Implementations are Rust types
//! implementing [`Plugin`], registered with a [`PluginRegistry`] under an
//! implementation name together with a factory. Pipelines refer to plugin
//! *classes*: named bindings of an implementation to default parameters.
//! Classes come from [`register_builtin_plugins`] or from TOML manifests found
//! by [`PluginRegistry::discover`].
//!
//! # Example
//!
//! ```rust
//! use frameflow::plugin::{Payload, PluginRegistry, SideChannel};
//!
//! let registry = PluginRegistry::with_builtins();
//! let mut source = registry.get_by_name("constant_source").unwrap();
//! source.parameters_mut().set("value", 3.0);
//! let (out, _) = source.execute(Payload::Index(0), SideChannel::new()).unwrap();
//! assert_eq!(out.as_frame().unwrap().get(0, 0), Some(3.0));
//! ```

mod builtin;
mod manifest;
mod params;
mod registry;
mod traits;

pub use builtin::{
    ClampLow, ConstantSource, Crop, FileSource, FrameStatistics, Scale, register_builtin_plugins,
};
pub use manifest::{MANIFEST_EXTENSION, ManifestEntry, ManifestFile};
pub use params::{ParamValue, ParameterSet, SideChannel};
pub use registry::{DiscoveryReport, PluginClass, PluginRegistry};
pub use traits::{Payload, Plugin, PluginFactory, PluginKind};
