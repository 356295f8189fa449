//! Worker loops, worker pools and the controller.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Controller                           │
//! │  - Owns the controller App and the shared frame buffer       │
//! │  - Submits indices, collects results via store_result        │
//! └───────┬───────────────────────────────────────▲──────────────┘
//!         │ input / stop                          │ output / finished
//!     ┌───▼──────────┐  ┌──────────────┐  ┌───────┴──────┐
//!     │ WorkerLoop 0 │  │ WorkerLoop 1 │  │ WorkerLoop N │
//!     │ (thread or   │  │              │  │              │
//!     │  process)    │  │              │  │              │
//!     └──────────────┘  └──────────────┘  └──────────────┘
//!             │                │                 │
//!             └────────────────┴─────────────────┘
//!                 Shared frame buffer (memfd)
//! ```
//!
//! Process workers talk to the controller over a Unix socket carrying
//! length-prefixed rkyv [`ControlMessage`]s; the frame buffer descriptor
//! travels once, via `SCM_RIGHTS`, right after `Init`.

mod app;
mod bridge;
mod item;
mod pool;
mod protocol;
mod runner;
mod worker;

pub use app::App;
pub use bridge::run_worker_process;
pub use item::{ItemResult, NodeFrame, WorkItem};
pub use pool::WorkerPool;
pub use protocol::{ControlMessage, frame_message, read_message, unframe_message, write_message};
pub use runner::{RunSummary, Runner, StopHandle, drive};
pub use worker::{
    ControllerChannels, DEFAULT_INPUT_TIMEOUT, DEFAULT_POLL_INTERVAL, WorkerChannels,
    WorkerConfig, WorkerLoop, channel_pair,
};
