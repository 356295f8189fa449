//! Arena-backed pipeline tree.
//!
//! Nodes are stored by [`NodeId`] in a single map; parent and child links are
//! ids, never owning pointers. Ids are never reused within one tree.

use crate::error::{Error, Result};
use crate::frame::Shape;
use crate::plugin::Plugin;
use std::collections::BTreeMap;

/// Unique identifier for a node in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// Get the underlying integer.
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One pipeline stage.
pub struct Node {
    id: NodeId,
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    plugin: Box<dyn Plugin>,
    result_shape: Option<Shape>,
}

impl Node {
    /// The node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent id, `None` for the root and detached nodes.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in fan-out order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// The owned plugin instance.
    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    /// Mutable access to the plugin, e.g. to edit parameters.
    pub fn plugin_mut(&mut self) -> &mut dyn Plugin {
        self.plugin.as_mut()
    }

    /// Output shape from the last metadata pass.
    pub fn result_shape(&self) -> Option<Shape> {
        self.result_shape
    }

    pub(crate) fn set_result_shape(&mut self, shape: Shape) {
        self.result_shape = Some(shape);
    }

    /// Whether the node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("plugin", &self.plugin.name())
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish()
    }
}

/// A tree of plugin nodes.
#[derive(Debug, Default)]
pub struct PipelineTree {
    nodes: BTreeMap<NodeId, Node>,
    root: Option<NodeId>,
    next_id: u64,
}

impl PipelineTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a detached node and return its id.
    ///
    /// The node counts in [`ids`](Self::ids) and [`len`](Self::len) but is
    /// not reachable from the root until [`add_child`](Self::add_child) or
    /// [`set_root`](Self::set_root) attaches it.
    pub fn add_node(&mut self, name: impl Into<String>, plugin: Box<dyn Plugin>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                id,
                name: name.into(),
                parent: None,
                children: Vec::new(),
                plugin,
                result_shape: None,
            },
        );
        id
    }

    /// Register a node and attach it: below `parent`, or as the root when
    /// `parent` is `None`.
    ///
    /// Nothing is registered if attaching fails.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        plugin: Box<dyn Plugin>,
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        match parent {
            Some(parent) => self.require(parent)?,
            None if self.root.is_some() => {
                return Err(Error::Structure("tree already has a root".into()));
            }
            None => {}
        };
        let id = self.add_node(name, plugin);
        match parent {
            Some(parent) => self.add_child(parent, id)?,
            None => self.root = Some(id),
        }
        Ok(id)
    }

    /// Make a detached node the root.
    pub fn set_root(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_or_err(id)?;
        if node.parent.is_some() {
            return Err(Error::Structure(format!("node {id} has a parent")));
        }
        if let Some(root) = self.root.filter(|&root| root != id) {
            return Err(Error::Structure(format!("tree already has root {root}")));
        }
        self.root = Some(id);
        Ok(())
    }

    /// Append `child` to the children of `parent`.
    ///
    /// Fails if either node is missing, if `child` already has a parent or is
    /// the root, or if `child` is `parent` or one of its ancestors.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.require(parent)?;
        let child_node = self.node_or_err(child)?;
        if child_node.parent.is_some() {
            return Err(Error::Structure(format!("node {child} already has a parent")));
        }
        if self.root == Some(child) {
            return Err(Error::Structure(format!("root {child} cannot become a child")));
        }
        if self.ancestors_and_self(parent).contains(&child) {
            return Err(Error::Structure(format!(
                "attaching {child} below {parent} would create a cycle"
            )));
        }

        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(child);
        }
        Ok(())
    }

    /// `id` and all its descendants, pre-order, children in fan-out order.
    pub fn get_recursive_ids(&self, id: NodeId) -> Result<Vec<NodeId>> {
        self.require(id)?;
        let mut ids = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            ids.push(current);
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.children.iter().rev());
            }
        }
        Ok(ids)
    }

    /// Remove a node and, if `recursive`, all its descendants.
    ///
    /// Fails without changing anything if the node has children and
    /// `recursive` is false. Returns the removed ids, descendants first.
    pub fn delete_node(&mut self, id: NodeId, recursive: bool) -> Result<Vec<NodeId>> {
        let node = self.node_or_err(id)?;
        if !node.children.is_empty() && !recursive {
            return Err(Error::Structure(format!(
                "node {id} has {} children; delete recursively",
                node.children.len()
            )));
        }
        let parent = node.parent;

        let mut removed = self.get_recursive_ids(id)?;
        removed.reverse();
        for gone in &removed {
            self.nodes.remove(gone);
        }
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|&c| c != id);
        }
        if self.root == Some(id) {
            self.root = None;
        }
        Ok(removed)
    }

    /// The root node id.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Look up a node.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Look up a node mutably.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Find a node by label.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.values().find(|n| n.name == name).map(|n| n.id)
    }

    /// Every live id, ascending, detached nodes included.
    ///
    /// Equals `get_recursive_ids(root)` as a set once every node is attached.
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Number of live nodes, detached nodes included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn require(&self, id: NodeId) -> Result<()> {
        self.node_or_err(id).map(|_| ())
    }

    fn node_or_err(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::Structure(format!("no node {id}")))
    }

    fn ancestors_and_self(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = vec![id];
        let mut current = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(p) = current {
            chain.push(p);
            current = self.nodes.get(&p).and_then(|n| n.parent);
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Shape;
    use crate::plugin::{ParameterSet, Payload, PluginKind, SideChannel};

    #[derive(Default)]
    struct Noop {
        params: ParameterSet,
    }

    impl Plugin for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn kind(&self) -> PluginKind {
            PluginKind::Processing
        }
        fn parameters(&self) -> &ParameterSet {
            &self.params
        }
        fn parameters_mut(&mut self) -> &mut ParameterSet {
            &mut self.params
        }
        fn execute(&mut self, data: Payload, side: SideChannel) -> Result<(Payload, SideChannel)> {
            Ok((data, side))
        }
        fn calculate_result_shape(&mut self, input: Option<Shape>) -> Result<Shape> {
            Ok(input.unwrap_or(Shape::new(1, 1)))
        }
    }

    fn noop() -> Box<dyn Plugin> {
        Box::new(Noop::default())
    }

    #[test]
    fn test_insert_and_traverse() {
        let mut tree = PipelineTree::new();
        let root = tree.insert("root", noop(), None).unwrap();
        let a = tree.insert("a", noop(), Some(root)).unwrap();
        let b = tree.insert("b", noop(), Some(root)).unwrap();
        let a1 = tree.insert("a1", noop(), Some(a)).unwrap();

        assert_eq!(tree.get_recursive_ids(root).unwrap(), vec![root, a, a1, b]);
        assert_eq!(tree.get(a1).unwrap().parent(), Some(a));
        assert_eq!(tree.find("b"), Some(b));
        assert!(tree.insert("second_root", noop(), None).is_err());
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_add_child_rejects_cycles() {
        let mut tree = PipelineTree::new();
        let root = tree.insert("root", noop(), None).unwrap();
        let a = tree.insert("a", noop(), Some(root)).unwrap();

        assert!(tree.add_child(a, a).is_err());
        assert!(tree.add_child(a, root).is_err());

        let loose = tree.add_node("loose", noop());
        tree.add_child(a, loose).unwrap();
        // Already parented.
        assert!(tree.add_child(root, loose).is_err());
        assert_eq!(tree.get(root).unwrap().children(), &[a]);
    }

    #[test]
    fn test_detached_node_unreachable_until_attached() {
        let mut tree = PipelineTree::new();
        let root = tree.insert("root", noop(), None).unwrap();
        let loose = tree.add_node("loose", noop());
        assert_eq!(tree.ids(), vec![root, loose]);
        assert_eq!(tree.get_recursive_ids(root).unwrap(), vec![root]);

        tree.add_child(root, loose).unwrap();
        let mut reachable = tree.get_recursive_ids(root).unwrap();
        reachable.sort();
        assert_eq!(reachable, tree.ids());
    }

    #[test]
    fn test_delete_requires_recursive_for_children() {
        let mut tree = PipelineTree::new();
        let root = tree.insert("root", noop(), None).unwrap();
        let a = tree.insert("a", noop(), Some(root)).unwrap();
        let a1 = tree.insert("a1", noop(), Some(a)).unwrap();

        assert!(matches!(tree.delete_node(a, false), Err(Error::Structure(_))));
        assert_eq!(tree.len(), 3);

        let removed = tree.delete_node(a, true).unwrap();
        assert_eq!(removed, vec![a1, a]);
        assert_eq!(tree.get_recursive_ids(root).unwrap(), vec![root]);
        assert!(tree.get(a1).is_none());
    }

    #[test]
    fn test_delete_root_empties_tree() {
        let mut tree = PipelineTree::new();
        let root = tree.insert("root", noop(), None).unwrap();
        tree.insert("a", noop(), Some(root)).unwrap();
        tree.delete_node(root, true).unwrap();
        assert!(tree.is_empty());
        assert!(tree.root().is_none());
        // A new root can be inserted afterwards, with a fresh id.
        let new_root = tree.insert("root", noop(), None).unwrap();
        assert_ne!(new_root, root);
    }

    #[test]
    fn test_recursive_ids_match_live_ids_after_edits() {
        let mut tree = PipelineTree::new();
        let root = tree.insert("root", noop(), None).unwrap();
        let mut live = vec![root];

        // Deterministic mix of inserts and deletes.
        let mut state = 17u64;
        for step in 0..200 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let pick = live[(state >> 33) as usize % live.len()];
            if step % 3 == 2 && pick != root {
                tree.delete_node(pick, true).unwrap();
            } else {
                tree.insert(format!("n{step}"), noop(), Some(pick)).unwrap();
            }
            live = tree.get_recursive_ids(root).unwrap();

            let mut sorted = live.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), live.len(), "duplicate ids");
            assert_eq!(sorted, tree.ids());
        }
    }
}
