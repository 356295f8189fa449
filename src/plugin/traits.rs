//! Core plugin trait.

use super::params::{ParameterSet, SideChannel};
use crate::error::{Error, Result};
use crate::frame::{Frame, Shape};
use serde::{Deserialize, Serialize};

/// Role of a plugin within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Produces a frame from a work item index (file loaders, generators).
    Input,
    /// Transforms a frame.
    Processing,
    /// Terminal stage: summarizes or exports a frame.
    Output,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Processing => write!(f, "processing"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Data handed to a plugin's `execute`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A work item index, consumed by input plugins.
    Index(u64),
    /// A frame, produced by input plugins and consumed by everything else.
    Frame(Frame),
}

impl Payload {
    /// Take the frame out, or fail on behalf of `plugin`.
    pub fn into_frame(self, plugin: &str) -> Result<Frame> {
        match self {
            Payload::Frame(frame) => Ok(frame),
            Payload::Index(index) => Err(Error::plugin(
                plugin,
                format!("expected a frame, got index {index}"),
            )),
        }
    }

    /// Take the index out, or fail on behalf of `plugin`.
    pub fn into_index(self, plugin: &str) -> Result<u64> {
        match self {
            Payload::Index(index) => Ok(index),
            Payload::Frame(frame) => Err(Error::plugin(
                plugin,
                format!("expected an index, got a {} frame", frame.shape()),
            )),
        }
    }

    /// Borrow the frame, if this payload carries one.
    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            Payload::Frame(frame) => Some(frame),
            Payload::Index(_) => None,
        }
    }
}

/// A pipeline stage implementation.
///
/// A plugin instance is exclusively owned by one pipeline node. Its
/// parameters are a private copy of its class defaults.
///
/// `execute` receives the payload by value: when a node fans out to several
/// children, each child gets its own copy, so a plugin may freely mutate its
/// input frame.
pub trait Plugin: Send {
    /// Registered name of the plugin class.
    fn name(&self) -> &str;

    /// The plugin's role.
    fn kind(&self) -> PluginKind;

    /// Current parameters.
    fn parameters(&self) -> &ParameterSet;

    /// Mutable access to the parameters.
    fn parameters_mut(&mut self) -> &mut ParameterSet;

    /// Hook called once before a run starts executing frames.
    fn pre_execute(&mut self) -> Result<()> {
        Ok(())
    }

    /// Process one payload.
    fn execute(&mut self, data: Payload, side: SideChannel) -> Result<(Payload, SideChannel)>;

    /// Derive the output shape from the declared input shape, without data.
    ///
    /// Input plugins receive `None` and report the shape they will produce.
    fn calculate_result_shape(&mut self, input: Option<Shape>) -> Result<Shape>;
}

impl std::fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("parameters", &self.parameters().len())
            .finish()
    }
}

/// Constructor for a plugin implementation.
///
/// Receives the instance's own copy of the parameters.
pub type PluginFactory = fn(ParameterSet) -> Result<Box<dyn Plugin>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_accessors() {
        let frame = Frame::zeros(Shape::new(1, 1));
        assert!(Payload::Frame(frame.clone()).into_frame("p").is_ok());
        assert!(Payload::Index(3).into_frame("p").is_err());
        assert_eq!(Payload::Index(3).into_index("p").unwrap(), 3);
        assert!(Payload::Frame(frame).into_index("p").is_err());
    }

    #[test]
    fn test_plugin_kind_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: PluginKind,
        }
        let w: Wrapper = toml::from_str("kind = \"processing\"").unwrap();
        assert_eq!(w.kind, PluginKind::Processing);
        assert_eq!(PluginKind::Output.to_string(), "output");
    }
}
