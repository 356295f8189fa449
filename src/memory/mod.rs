//! Shared memory between the controller and worker processes.
//!
//! - [`SharedMemorySegment`]: a mapped memfd region
//! - [`SharedFrameBuffer`]: a lock-guarded frame slot laid out in a segment
//! - [`ipc`]: passing region descriptors over Unix sockets

mod frame_buffer;
pub mod ipc;
mod shared;

pub use frame_buffer::{
    DEFAULT_MAX_DIM, FrameBufferGuard, HEADER_SIZE, SharedFrameBuffer, region_size,
};
pub use shared::SharedMemorySegment;
