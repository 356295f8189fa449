//! Pipeline evaluation over a [`PipelineTree`].

use super::tree::{Node, NodeId, PipelineTree};
use crate::error::{Error, Result};
use crate::frame::Shape;
use crate::plugin::{Payload, Plugin, SideChannel};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Lifecycle state of a [`PipelineGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GraphState {
    /// No root node.
    #[default]
    Unconfigured,
    /// Has a root and is idle.
    Configured,
    /// Evaluating one work item.
    Executing,
}

/// Output of one leaf node for one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    /// The leaf's output payload.
    pub payload: Payload,
    /// Side channel accumulated along the path to the leaf.
    pub side: SideChannel,
}

/// A tree of plugins evaluated once per work item.
///
/// The root plugin receives the work item; every node's output is handed to
/// each of its children. Each child receives its own copy of the payload and
/// side channel, so siblings never observe each other's changes.
#[derive(Debug, Default)]
pub struct PipelineGraph {
    tree: PipelineTree,
    state: GraphState,
}

impl PipelineGraph {
    /// Create an empty, unconfigured graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> GraphState {
        self.state
    }

    /// The underlying tree.
    pub fn tree(&self) -> &PipelineTree {
        &self.tree
    }

    /// Add a node below `parent`, or as the root if `parent` is `None`.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        plugin: Box<dyn Plugin>,
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        let id = self.tree.insert(name, plugin, parent)?;
        self.sync_state();
        Ok(id)
    }

    /// Attach an existing node. See [`PipelineTree::add_child`].
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.tree.add_child(parent, child)
    }

    /// Remove a node. See [`PipelineTree::delete_node`].
    pub fn delete_node(&mut self, id: NodeId, recursive: bool) -> Result<Vec<NodeId>> {
        let removed = self.tree.delete_node(id, recursive)?;
        self.sync_state();
        Ok(removed)
    }

    /// `id` and all descendants, pre-order.
    pub fn get_recursive_ids(&self, id: NodeId) -> Result<Vec<NodeId>> {
        self.tree.get_recursive_ids(id)
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.tree.get(id)
    }

    /// Look up a node mutably.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.tree.get_mut(id)
    }

    /// Run every plugin's `pre_execute` hook, parent before child.
    pub fn prepare(&mut self) -> Result<()> {
        let root = self.root_or_err()?;
        for id in self.tree.get_recursive_ids(root)? {
            if let Some(node) = self.tree.get_mut(id) {
                node.plugin_mut().pre_execute()?;
            }
        }
        Ok(())
    }

    /// Compute every node's result shape, parent before child.
    ///
    /// The root is asked with no input shape; every other node receives its
    /// parent's result shape.
    pub fn get_complete_plugin_metadata(&mut self) -> Result<BTreeMap<NodeId, Shape>> {
        let root = self.root_or_err()?;
        let mut shapes = BTreeMap::new();
        for id in self.tree.get_recursive_ids(root)? {
            let input = self
                .tree
                .get(id)
                .and_then(|n| n.parent())
                .and_then(|p| shapes.get(&p).copied());
            let Some(node) = self.tree.get_mut(id) else {
                continue;
            };
            let shape = node.plugin_mut().calculate_result_shape(input)?;
            node.set_result_shape(shape);
            trace!(node = %id, %shape, "Computed result shape");
            shapes.insert(id, shape);
        }
        Ok(shapes)
    }

    /// Evaluate the graph for one input.
    ///
    /// Returns the result of every leaf, in pre-order. Fails with a
    /// "tree empty" configuration error, before touching any plugin, if the
    /// graph has no root.
    pub fn execute_process(&mut self, input: Payload) -> Result<Vec<(NodeId, PipelineResult)>> {
        let root = self.root_or_err()?;
        self.state = GraphState::Executing;
        let result = self.evaluate(root, input);
        self.state = GraphState::Configured;
        result
    }

    fn evaluate(&mut self, root: NodeId, input: Payload) -> Result<Vec<(NodeId, PipelineResult)>> {
        let mut leaves = Vec::new();
        let mut stack = vec![(root, input, SideChannel::new())];

        while let Some((id, payload, side)) = stack.pop() {
            let node = self
                .tree
                .get_mut(id)
                .ok_or_else(|| Error::Structure(format!("no node {id}")))?;
            let (payload, side) = node.plugin_mut().execute(payload, side)?;
            debug!(node = %id, plugin = node.plugin().name(), "Executed node");

            let children = node.children();
            let Some((&last, rest)) = children.split_last() else {
                leaves.push((id, PipelineResult { payload, side }));
                continue;
            };
            // Pushed in reverse so children run in fan-out order.
            let mut pending = Vec::with_capacity(children.len());
            for &child in rest {
                pending.push((child, payload.clone(), side.clone()));
            }
            pending.push((last, payload, side));
            stack.extend(pending.into_iter().rev());
        }
        Ok(leaves)
    }

    fn root_or_err(&self) -> Result<NodeId> {
        self.tree
            .root()
            .ok_or_else(|| Error::Config("tree empty".into()))
    }

    fn sync_state(&mut self) {
        self.state = match self.tree.root() {
            Some(_) => GraphState::Configured,
            None => GraphState::Unconfigured,
        };
    }
}
