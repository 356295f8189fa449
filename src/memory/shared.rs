//! Shared memory segment using Linux memfd.
//!
//! The segment is anonymous shared memory created with `memfd_create`. It is
//! shared with worker processes by passing the file descriptor over a Unix
//! socket (see [`super::ipc`]).

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// A mapped memfd region.
pub struct SharedMemorySegment {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
    name: Option<String>,
}

impl SharedMemorySegment {
    /// Create and map a new zero-filled segment.
    ///
    /// `name` shows up in `/proc/<pid>/fd/` and is for debugging only.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or if `memfd_create`, `ftruncate`
    /// or `mmap` fails.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed("size must be greater than 0".into()));
        }

        let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        // SAFETY: fd is a fresh memfd of exactly `size` bytes.
        let ptr = unsafe { Self::map(&fd, size)? };
        Ok(Self {
            fd,
            ptr,
            len: size,
            name: Some(name.to_string()),
        })
    }

    /// Map a segment received from another process.
    ///
    /// Fails if the file is smaller than `size`.
    ///
    /// # Safety
    ///
    /// `fd` must be a memfd that no process truncates while it is mapped.
    pub unsafe fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed("size must be greater than 0".into()));
        }
        let actual = rustix::fs::fstat(&fd)?.st_size;
        if actual < 0 || (actual as u64) < size as u64 {
            return Err(Error::InvalidSegment(format!(
                "segment is {actual} bytes, expected at least {size}"
            )));
        }

        // SAFETY: the file is at least `size` bytes, checked above.
        let ptr = unsafe { Self::map(&fd, size)? };
        Ok(Self {
            fd,
            ptr,
            len: size,
            name: None,
        })
    }

    unsafe fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )?
        };
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))
    }

    /// Duplicate the descriptor, e.g. to hand it to a child process.
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        Ok(rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?)
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-sized segments cannot be created.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Debug name, if this process created the segment.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is process-wide and the fd is reference-counted by the
// kernel. Synchronizing access to the contents is up to the owner of the
// segment.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for SharedMemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemorySegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_memory_creation() {
        let segment = SharedMemorySegment::new("test-segment", 4096).unwrap();
        assert_eq!(segment.len(), 4096);
        assert_eq!(segment.name(), Some("test-segment"));
    }

    #[test]
    fn test_shared_memory_zero_size_fails() {
        assert!(SharedMemorySegment::new("test", 0).is_err());
    }

    #[test]
    fn test_shared_memory_modifications_visible() {
        let segment1 = SharedMemorySegment::new("test-shared", 4096).unwrap();
        let dup_fd = segment1.try_clone_fd().unwrap();
        let segment2 = unsafe { SharedMemorySegment::from_fd(dup_fd, 4096).unwrap() };

        unsafe {
            *segment1.as_ptr() = 77;
            *segment2.as_ptr().add(100) = 88;
            assert_eq!(*segment2.as_ptr(), 77);
            assert_eq!(*segment1.as_ptr().add(100), 88);
        }
    }

    #[test]
    fn test_from_fd_rejects_oversized_request() {
        let segment = SharedMemorySegment::new("test-small", 4096).unwrap();
        let dup_fd = segment.try_clone_fd().unwrap();
        assert!(unsafe { SharedMemorySegment::from_fd(dup_fd, 8192) }.is_err());
    }
}
