//! Pipeline construction and evaluation.
//!
//! A pipeline is a tree of plugin nodes ([`PipelineTree`]) evaluated once per
//! work item by a [`PipelineGraph`]. Layouts can be read from TOML with
//! [`PipelineDescription`].

mod description;
mod graph;
mod tree;

pub use description::{NodeDescription, PipelineDescription};
pub use graph::{GraphState, PipelineGraph, PipelineResult};
pub use tree::{Node, NodeId, PipelineTree};
