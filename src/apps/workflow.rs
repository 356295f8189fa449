//! Run a plugin pipeline once per frame index.

use crate::config::resolve;
use crate::error::{Error, Result};
use crate::execution::{App, ItemResult, NodeFrame, WorkItem};
use crate::pipeline::{PipelineDescription, PipelineGraph};
use crate::plugin::{Payload, PluginRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `[app]` section for `kind = "workflow"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Pipeline description file.
    pub pipeline: PathBuf,
    /// First frame index submitted.
    #[serde(default)]
    pub first_index: u64,
}

impl WorkflowConfig {
    pub(crate) fn resolve_paths(&mut self, base: &Path) {
        resolve(&mut self.pipeline, base);
    }
}

/// Feeds each frame index to the root of a pipeline and returns the frames
/// reaching its leaves.
pub struct WorkflowApp {
    description: PipelineDescription,
    registry: Arc<PluginRegistry>,
    first_index: u64,
    graph: Option<PipelineGraph>,
    item: WorkItem,
    leaves: BTreeMap<u64, String>,
    results: BTreeMap<u64, Vec<NodeFrame>>,
    failures: BTreeMap<u64, String>,
}

impl WorkflowApp {
    /// App for an in-memory description.
    pub fn new(description: PipelineDescription, registry: Arc<PluginRegistry>) -> Self {
        Self {
            description,
            registry,
            first_index: 0,
            graph: None,
            item: WorkItem::Idle,
            leaves: BTreeMap::new(),
            results: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    /// App for a configured description file.
    pub fn from_config(config: &WorkflowConfig, registry: Arc<PluginRegistry>) -> Result<Self> {
        let description = PipelineDescription::load(&config.pipeline)?;
        Ok(Self::new(description, registry).with_first_index(config.first_index))
    }

    /// Start submitting at `index`.
    pub fn with_first_index(mut self, index: u64) -> Self {
        self.first_index = index;
        self
    }

    /// Leaf node labels by node id, available after preparation.
    pub fn leaves(&self) -> &BTreeMap<u64, String> {
        &self.leaves
    }

    /// Collected leaf frames by item index.
    pub fn results(&self) -> &BTreeMap<u64, Vec<NodeFrame>> {
        &self.results
    }

    /// Failure messages by item index.
    pub fn failures(&self) -> &BTreeMap<u64, String> {
        &self.failures
    }

    /// Take the collected results, leaving the app empty.
    pub fn take_results(&mut self) -> BTreeMap<u64, Vec<NodeFrame>> {
        std::mem::take(&mut self.results)
    }
}

impl App for WorkflowApp {
    fn name(&self) -> &str {
        "workflow"
    }

    fn prepare(&mut self) -> Result<()> {
        let mut graph = self.description.build(&self.registry)?;
        graph.prepare()?;
        let shapes = graph.get_complete_plugin_metadata()?;
        for (id, shape) in &shapes {
            debug!(node = %id, %shape, "Result shape");
        }
        self.leaves = graph
            .tree()
            .ids()
            .into_iter()
            .filter_map(|id| graph.node(id))
            .filter(|node| node.is_leaf())
            .map(|node| (node.id().index(), node.name().to_string()))
            .collect();
        info!(
            nodes = graph.tree().len(),
            leaves = self.leaves.len(),
            "Pipeline ready"
        );
        self.graph = Some(graph);
        Ok(())
    }

    fn pre_cycle(&mut self, item: WorkItem) {
        self.item = item;
    }

    fn carry_on(&mut self) -> bool {
        matches!(self.item, WorkItem::Index(_))
    }

    fn compute(&mut self, index: u64) -> Result<ItemResult> {
        let graph = self
            .graph
            .as_mut()
            .ok_or_else(|| Error::Config("workflow not prepared".into()))?;
        let outputs = graph.execute_process(Payload::Index(index))?;
        let mut frames = Vec::with_capacity(outputs.len());
        for (id, result) in outputs {
            let frame = match result.payload {
                Payload::Frame(frame) => frame,
                Payload::Index(_) => {
                    let name = graph.node(id).map_or("?", |n| n.name());
                    return Err(Error::plugin(name, "leaf produced no frame"));
                }
            };
            frames.push(NodeFrame {
                node: id.index(),
                frame,
                side: result.side.into_pairs(),
            });
        }
        Ok(ItemResult::Frames(frames))
    }

    fn store_result(&mut self, index: u64, result: ItemResult) -> Result<()> {
        match result {
            ItemResult::Frames(frames) => {
                debug!(index, leaves = frames.len(), "Stored pipeline output");
                self.results.insert(index, frames);
            }
            ItemResult::Failed { message } => {
                warn!(index, %message, "Pipeline failed");
                self.failures.insert(index, message);
            }
            ItemResult::Published { .. } => {
                return Err(Error::Protocol(format!(
                    "item {index}: workflow workers do not publish to a buffer"
                )));
            }
        }
        Ok(())
    }

    fn start_index(&self) -> u64 {
        self.first_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_STAGE: &str = r#"
        [[node]]
        id = "source"
        plugin = "constant_source"
        params = { height = 2, width = 2, value = 3.0 }

        [[node]]
        id = "clamp"
        plugin = "clamp_low"
        parent = "source"
        params = { threshold = 5.0 }
    "#;

    fn app() -> WorkflowApp {
        let description = PipelineDescription::from_toml_str(TWO_STAGE).unwrap();
        WorkflowApp::new(description, Arc::new(PluginRegistry::with_builtins()))
    }

    #[test]
    fn test_compute_returns_leaf_frames() {
        let mut app = app();
        app.prepare().unwrap();
        assert_eq!(app.leaves().values().collect::<Vec<_>>(), vec!["clamp"]);

        app.pre_cycle(WorkItem::Index(4));
        assert!(app.carry_on());
        let ItemResult::Frames(frames) = app.compute(4).unwrap() else {
            panic!("expected frames");
        };
        assert_eq!(frames.len(), 1);
        assert!(frames[0].frame.as_slice().iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_gate_follows_item() {
        let mut app = app();
        app.prepare().unwrap();
        app.pre_cycle(WorkItem::Idle);
        assert!(!app.carry_on());
    }

    #[test]
    fn test_compute_before_prepare_fails() {
        let mut app = app();
        assert!(matches!(app.compute(0), Err(Error::Config(_))));
    }

    #[test]
    fn test_store_result_collects() {
        let mut app = app().with_first_index(10);
        assert_eq!(app.start_index(), 10);
        app.store_result(10, ItemResult::Frames(Vec::new())).unwrap();
        app.store_result(11, ItemResult::Failed { message: "boom".into() })
            .unwrap();
        assert_eq!(app.results().len(), 1);
        assert_eq!(app.failures()[&11], "boom");
        assert!(app
            .store_result(12, ItemResult::Published {
                shape: crate::frame::Shape::new(1, 1),
                source: "x".into(),
            })
            .is_err());
    }
}
