//! Pipeline description files.
//!
//! ```toml
//! [[node]]
//! id = "source"
//! plugin = "constant_source"
//! params = { value = 3.0 }
//!
//! [[node]]
//! id = "clamp"
//! plugin = "clamp_low"
//! parent = "source"
//! params = { threshold = 5.0 }
//! ```
//!
//! Nodes are listed parents first. Exactly one node has no parent.

use super::graph::PipelineGraph;
use super::tree::NodeId;
use crate::error::{Error, Result};
use crate::plugin::{ParameterSet, PluginRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One `[[node]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    /// Label, unique within the description.
    pub id: String,
    /// Registered plugin class name.
    pub plugin: String,
    /// Label of the parent node; `None` for the root.
    #[serde(default)]
    pub parent: Option<String>,
    /// Overrides applied on top of the class defaults.
    #[serde(default)]
    pub params: ParameterSet,
}

/// A serializable pipeline layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescription {
    /// Nodes, parents before children.
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeDescription>,
}

impl PipelineDescription {
    /// Parse a description from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read a description file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read pipeline {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Instantiate every node through `registry` and assemble the graph.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown plugin classes; [`Error::Config`] for
    /// duplicate labels, unknown or later-declared parents, or a root count
    /// other than one.
    pub fn build(&self, registry: &PluginRegistry) -> Result<PipelineGraph> {
        let roots = self.nodes.iter().filter(|n| n.parent.is_none()).count();
        if roots != 1 {
            return Err(Error::Config(format!(
                "pipeline needs exactly one root node, found {roots}"
            )));
        }

        let mut graph = PipelineGraph::new();
        let mut ids: HashMap<&str, NodeId> = HashMap::new();
        for desc in &self.nodes {
            if ids.contains_key(desc.id.as_str()) {
                return Err(Error::Config(format!("duplicate node id '{}'", desc.id)));
            }
            let parent = match &desc.parent {
                Some(label) => Some(*ids.get(label.as_str()).ok_or_else(|| {
                    Error::Config(format!(
                        "node '{}' names parent '{label}' which is not declared before it",
                        desc.id
                    ))
                })?),
                None => None,
            };

            let mut plugin = registry.get_by_name(&desc.plugin)?;
            plugin.parameters_mut().merge(&desc.params);
            let id = graph.add_node(desc.id.clone(), plugin, parent)?;
            ids.insert(desc.id.as_str(), id);
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Payload;

    const TWO_STAGE: &str = r#"
        [[node]]
        id = "source"
        plugin = "constant_source"
        params = { value = 3.0 }

        [[node]]
        id = "clamp"
        plugin = "clamp_low"
        parent = "source"
        params = { threshold = 5.0 }
    "#;

    #[test]
    fn test_build_two_stage() {
        let registry = PluginRegistry::with_builtins();
        let mut graph = PipelineDescription::from_toml_str(TWO_STAGE)
            .unwrap()
            .build(&registry)
            .unwrap();
        let clamp = graph.tree().find("clamp").unwrap();
        let leaves = graph.execute_process(Payload::Index(0)).unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].0, clamp);
        assert!(leaves[0].1.payload.as_frame().unwrap().as_slice().iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_unknown_plugin() {
        let desc = PipelineDescription::from_toml_str(
            "[[node]]\nid = \"a\"\nplugin = \"does_not_exist\"\n",
        )
        .unwrap();
        let err = desc.build(&PluginRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_parent_must_come_first() {
        let desc = PipelineDescription::from_toml_str(
            r#"
            [[node]]
            id = "child"
            plugin = "scale"
            parent = "root"

            [[node]]
            id = "root"
            plugin = "constant_source"
            "#,
        )
        .unwrap();
        assert!(matches!(
            desc.build(&PluginRegistry::with_builtins()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_root_count() {
        let registry = PluginRegistry::with_builtins();
        assert!(PipelineDescription::default().build(&registry).is_err());
        let two_roots = PipelineDescription::from_toml_str(
            "[[node]]\nid = \"a\"\nplugin = \"scale\"\n[[node]]\nid = \"b\"\nplugin = \"scale\"\n",
        )
        .unwrap();
        assert!(two_roots.build(&registry).is_err());
    }
}
