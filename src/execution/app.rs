//! The application interface driven by worker loops and the controller.

use super::item::{ItemResult, WorkItem};
use crate::error::Result;
use crate::memory::SharedFrameBuffer;
use std::sync::Arc;
use std::time::Duration;

/// An application run across a worker pool.
///
/// Every worker owns a private instance; the controller owns one more, used
/// for preparation and for collecting results. Per cycle a worker calls
/// [`pre_cycle`](App::pre_cycle) with the held item, then
/// [`carry_on`](App::carry_on); only if the gate opens and the item is a real
/// index does it call [`compute`](App::compute).
pub trait App: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// One-time setup before the first cycle.
    fn prepare(&mut self) -> Result<()>;

    /// Observe the held item at the start of each cycle.
    fn pre_cycle(&mut self, _item: WorkItem) {}

    /// Whether the held item may be computed now.
    ///
    /// Returning false keeps the item for the next cycle.
    fn carry_on(&mut self) -> bool;

    /// Process one item.
    fn compute(&mut self, index: u64) -> Result<ItemResult>;

    /// Controller side: absorb a worker's result.
    fn store_result(&mut self, index: u64, result: ItemResult) -> Result<()>;

    /// First index the controller submits.
    fn start_index(&self) -> u64 {
        0
    }

    /// Buffer shared with the workers, if the app allocated one.
    fn shared_buffer(&self) -> Option<Arc<SharedFrameBuffer>> {
        None
    }

    /// Expected upper bound for one `compute`; overruns are logged.
    fn compute_budget(&self) -> Option<Duration> {
        None
    }
}
