//! Work items and per-item results.

use crate::frame::{Frame, Shape};
use crate::plugin::{ParamValue, SideChannel};

/// One unit of work as seen by a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkItem {
    /// A frame index to process.
    Index(u64),
    /// No item arrived within the input timeout. Never sent by controllers.
    Idle,
    /// Terminal marker: the worker exits after receiving it.
    Stop,
}

impl WorkItem {
    /// The frame index, if this is a real item.
    pub fn index(&self) -> Option<u64> {
        match self {
            Self::Index(i) => Some(*i),
            _ => None,
        }
    }
}

/// Output of one pipeline leaf, flattened for transport.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct NodeFrame {
    /// Id of the leaf node.
    pub node: u64,
    /// The leaf's frame.
    pub frame: Frame,
    /// The leaf's side channel entries.
    pub side: Vec<(String, ParamValue)>,
}

impl NodeFrame {
    /// Rebuild the side channel.
    pub fn side_channel(&self) -> SideChannel {
        self.side.iter().cloned().collect()
    }
}

/// What a worker reports for one work item.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum ItemResult {
    /// A frame was written to the shared frame buffer.
    Published {
        /// Shape of the published frame.
        shape: Shape,
        /// File the frame was read from.
        source: String,
    },
    /// Frames produced by pipeline leaves, carried in the message itself.
    Frames(Vec<NodeFrame>),
    /// The cycle failed; the item was dropped.
    Failed {
        /// Description of the failure.
        message: String,
    },
}

impl ItemResult {
    /// Whether the item failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}
