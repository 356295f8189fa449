//! Fixed-capacity shared frame buffer.
//!
//! One memfd region holding a single 2-D `f32` frame, shared by the
//! controller and every worker process. Layout:
//!
//! ```text
//! +--------------------------+ 0
//! | FrameBufferHeader (64 B) |  magic, lock, ready, width, height,
//! |                          |  max_height, max_width
//! +--------------------------+ 64
//! | f32 data                 |  max_height rows of max_width values;
//! |                          |  the current frame occupies the top-left
//! |                          |  height x width window
//! +--------------------------+ 64 + 4 * max_height * max_width
//! ```
//!
//! All payload and metadata access goes through [`FrameBufferGuard`], which
//! holds the lock word for its lifetime. The lock serializes access; it does
//! not arbitrate between producers. Only one process should write frames.

use super::shared::SharedMemorySegment;
use crate::error::{Error, Result};
use crate::frame::{Frame, Shape};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// "FFLW_FRB" in ASCII.
const FRAME_BUFFER_MAGIC: u64 = 0x4646_4C57_5F46_5242;

/// Size of the control header preceding the data region.
pub const HEADER_SIZE: usize = 64;

/// Default capacity, rows and columns.
pub const DEFAULT_MAX_DIM: usize = 10_000;

/// Spins before the lock starts yielding, then sleeping.
const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 256;

/// Control header at the start of the region.
#[repr(C, align(64))]
struct FrameBufferHeader {
    magic: AtomicU64,
    /// 0 when free, otherwise the pid of the holder.
    lock: AtomicU32,
    ready: AtomicU32,
    width: AtomicU32,
    height: AtomicU32,
    max_height: AtomicU32,
    max_width: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<FrameBufferHeader>() == HEADER_SIZE);

impl FrameBufferHeader {
    fn validate(&self) -> Result<()> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != FRAME_BUFFER_MAGIC {
            return Err(Error::InvalidSegment(format!(
                "invalid frame buffer magic: expected {FRAME_BUFFER_MAGIC:x}, got {magic:x}"
            )));
        }
        Ok(())
    }
}

/// Bytes needed for a buffer of the given capacity.
pub fn region_size(max_height: usize, max_width: usize) -> Result<usize> {
    max_height
        .checked_mul(max_width)
        .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
        .and_then(|n| n.checked_add(HEADER_SIZE))
        .ok_or_else(|| {
            Error::AllocationFailed(format!("frame buffer {max_height}x{max_width} is too large"))
        })
}

/// A lock-guarded shared frame slot.
///
/// # Example
///
/// ```rust
/// use frameflow::frame::{Frame, Shape};
/// use frameflow::memory::SharedFrameBuffer;
///
/// let buffer = SharedFrameBuffer::new(64, 64).unwrap();
/// buffer.lock().write_frame(&Frame::filled(Shape::new(4, 8), 1.0)).unwrap();
///
/// let guard = buffer.lock();
/// assert!(guard.is_ready());
/// assert_eq!(guard.read_frame().shape(), Shape::new(4, 8));
/// ```
pub struct SharedFrameBuffer {
    segment: SharedMemorySegment,
    capacity: Shape,
}

impl SharedFrameBuffer {
    /// Allocate a buffer able to hold frames up to `max_height x max_width`.
    pub fn new(max_height: usize, max_width: usize) -> Result<Self> {
        if max_height == 0 || max_width == 0 {
            return Err(Error::AllocationFailed(
                "frame buffer capacity must be non-zero".into(),
            ));
        }
        let (Ok(h), Ok(w)) = (u32::try_from(max_height), u32::try_from(max_width)) else {
            return Err(Error::AllocationFailed(format!(
                "frame buffer {max_height}x{max_width} exceeds u32 dimensions"
            )));
        };
        let size = region_size(max_height, max_width)?;
        let segment = SharedMemorySegment::new("frameflow-frame-buffer", size)?;

        let buffer = Self {
            segment,
            capacity: Shape::new(max_height, max_width),
        };
        let header = buffer.header();
        header.lock.store(0, Ordering::Relaxed);
        header.ready.store(0, Ordering::Relaxed);
        header.width.store(0, Ordering::Relaxed);
        header.height.store(0, Ordering::Relaxed);
        header.max_height.store(h, Ordering::Relaxed);
        header.max_width.store(w, Ordering::Relaxed);
        header.magic.store(FRAME_BUFFER_MAGIC, Ordering::Release);
        Ok(buffer)
    }

    /// Allocate a buffer with the default 10000x10000 capacity.
    pub fn with_default_capacity() -> Result<Self> {
        Self::new(DEFAULT_MAX_DIM, DEFAULT_MAX_DIM)
    }

    /// Map a buffer created by another process.
    ///
    /// The capacity is read from the header and checked against `size`.
    ///
    /// # Safety
    ///
    /// `fd` must refer to a frame buffer region that stays at least `size`
    /// bytes long while mapped.
    pub unsafe fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        if size < HEADER_SIZE {
            return Err(Error::InvalidSegment(format!(
                "frame buffer region of {size} bytes is smaller than its header"
            )));
        }
        // SAFETY: forwarded from the caller.
        let segment = unsafe { SharedMemorySegment::from_fd(fd, size)? };
        // SAFETY: the mapping holds at least HEADER_SIZE bytes and mmap is
        // page aligned.
        let header = unsafe { &*segment.as_ptr().cast::<FrameBufferHeader>() };
        header.validate()?;
        let capacity = Shape::new(
            header.max_height.load(Ordering::Acquire) as usize,
            header.max_width.load(Ordering::Acquire) as usize,
        );
        let needed = region_size(capacity.height, capacity.width)?;
        if needed > size {
            return Err(Error::InvalidSegment(format!(
                "header claims {capacity} capacity ({needed} bytes) but region is {size} bytes"
            )));
        }
        Ok(Self { segment, capacity })
    }

    /// Size of the mapped region in bytes.
    pub fn region_len(&self) -> usize {
        self.segment.len()
    }

    /// Maximum frame shape.
    pub fn capacity(&self) -> Shape {
        self.capacity
    }

    /// Duplicate the region's descriptor for handing to another process.
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        self.segment.try_clone_fd()
    }

    /// Acquire the lock, waiting as long as needed.
    ///
    /// The lock is not reentrant: locking twice from the same thread
    /// deadlocks.
    pub fn lock(&self) -> FrameBufferGuard<'_> {
        let mut attempts = 0u32;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            backoff(&mut attempts);
        }
    }

    /// Acquire the lock, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceUnavailable`] if the lock stays held, naming the
    /// holder's pid.
    pub fn lock_timeout(&self, timeout: Duration) -> Result<FrameBufferGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;
        loop {
            if let Some(guard) = self.try_lock() {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                let holder = self.header().lock.load(Ordering::Relaxed);
                return Err(Error::ResourceUnavailable(format!(
                    "frame buffer lock held by pid {holder}"
                )));
            }
            backoff(&mut attempts);
        }
    }

    /// Acquire the lock if it is free.
    pub fn try_lock(&self) -> Option<FrameBufferGuard<'_>> {
        let token = std::process::id().max(1);
        self.header()
            .lock
            .compare_exchange(0, token, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| FrameBufferGuard { buffer: self })
    }

    /// Lock, copy out the current frame, unlock.
    pub fn snapshot(&self) -> Frame {
        self.lock().read_frame()
    }

    fn header(&self) -> &FrameBufferHeader {
        // SAFETY: the region starts with an initialized header for the
        // lifetime of the segment.
        unsafe { &*self.segment.as_ptr().cast::<FrameBufferHeader>() }
    }

    fn data_ptr(&self) -> *mut f32 {
        // SAFETY: HEADER_SIZE is within the mapping and 4-byte aligned.
        unsafe { self.segment.as_ptr().add(HEADER_SIZE).cast::<f32>() }
    }
}

fn backoff(attempts: &mut u32) {
    *attempts += 1;
    if *attempts < SPIN_LIMIT {
        std::hint::spin_loop();
    } else if *attempts < YIELD_LIMIT {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(50));
    }
}

impl AsFd for SharedFrameBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.segment.as_fd()
    }
}

impl std::fmt::Debug for SharedFrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFrameBuffer")
            .field("capacity", &self.capacity)
            .field("region_len", &self.segment.len())
            .finish()
    }
}

/// Exclusive access to a [`SharedFrameBuffer`]. Unlocks on drop.
pub struct FrameBufferGuard<'a> {
    buffer: &'a SharedFrameBuffer,
}

impl FrameBufferGuard<'_> {
    /// Height of the current frame.
    pub fn height(&self) -> usize {
        self.buffer.header().height.load(Ordering::Acquire) as usize
    }

    /// Width of the current frame.
    pub fn width(&self) -> usize {
        self.buffer.header().width.load(Ordering::Acquire) as usize
    }

    /// Shape of the current frame.
    pub fn shape(&self) -> Shape {
        Shape::new(self.height(), self.width())
    }

    /// Whether a frame has been published.
    pub fn is_ready(&self) -> bool {
        self.buffer.header().ready.load(Ordering::Acquire) != 0
    }

    /// Withdraw the published frame.
    pub fn clear_ready(&mut self) {
        self.buffer.header().ready.store(0, Ordering::Release);
    }

    /// Copy `frame` into the top-left window and publish it.
    ///
    /// Width and height are updated only after the copy, then the ready flag
    /// is set.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSegment`] if the frame exceeds the capacity. The
    /// buffer is left untouched.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let shape = frame.shape();
        let capacity = self.buffer.capacity;
        if !shape.fits_within(capacity) {
            return Err(Error::InvalidSegment(format!(
                "frame {shape} exceeds buffer capacity {capacity}"
            )));
        }

        let base = self.buffer.data_ptr();
        for y in 0..shape.height {
            let row = frame.row(y);
            // SAFETY: y < max_height and row.len() <= max_width, so the
            // destination row lies within the data region.
            unsafe {
                let dst = base.add(y * capacity.width);
                std::ptr::copy_nonoverlapping(row.as_ptr(), dst, row.len());
            }
        }

        let header = self.buffer.header();
        header.width.store(shape.width as u32, Ordering::Release);
        header.height.store(shape.height as u32, Ordering::Release);
        header.ready.store(1, Ordering::Release);
        Ok(())
    }

    /// Copy out the current `height x width` window.
    pub fn read_frame(&self) -> Frame {
        let capacity = self.buffer.capacity;
        let shape = Shape::new(
            self.height().min(capacity.height),
            self.width().min(capacity.width),
        );
        let base = self.buffer.data_ptr();
        let mut frame = Frame::zeros(shape);
        for (y, dst) in frame.as_mut_slice().chunks_exact_mut(shape.width.max(1)).enumerate() {
            // SAFETY: the window is clamped to the capacity, which lies
            // within the mapped data region.
            let row =
                unsafe { std::slice::from_raw_parts(base.add(y * capacity.width), dst.len()) };
            dst.copy_from_slice(row);
        }
        frame
    }
}

impl Drop for FrameBufferGuard<'_> {
    fn drop(&mut self) {
        self.buffer.header().lock.store(0, Ordering::Release);
    }
}

// SAFETY: the payload is only reachable through FrameBufferGuard, which holds
// the cross-process lock word.
unsafe impl Send for SharedFrameBuffer {}
unsafe impl Sync for SharedFrameBuffer {}
