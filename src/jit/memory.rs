//! Executable memory management using mmap.
//!
//! The code arena lives in its own mapping, separate from the slot metadata.
//! Pages are read/execute while idle and are flipped to read/write only for
//! the duration of a patch, so the mapping is never writable and executable
//! at the same time.

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
    #[error("access at offset {offset} (+{len}) is outside the {size}-byte mapping")]
    OutOfBounds { offset: usize, len: usize, size: usize },
}

/// A block of memory allocated via mmap that can hold host code.
///
/// The memory is initially writable. Call `make_executable()` once the
/// initial contents are in place; later writes go through `patch()`, which
/// temporarily reopens only the affected pages.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a new block of memory with the given size.
    /// The memory is initially writable but not executable.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        // Round up to page size
        let page_size = Self::page_size();
        let aligned_size = size
            .checked_add(page_size - 1)
            .ok_or(MemoryError::InvalidSize)?
            & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Get the page size for the current system.
    pub fn page_size() -> usize {
        #[cfg(unix)]
        {
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 { size as usize } else { 4096 }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // Plain heap memory: correct for bookkeeping, not executable on most hosts.
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Get a pointer to the memory.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the allocated memory.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if the memory is executable.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Read back a range of the mapping.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8], MemoryError> {
        self.check_bounds(offset, len)?;
        // SAFETY: the range is inside the mapping and every page is readable.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }

    /// Write bytes to the memory at the given offset.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.patch(offset, data.len(), |dest| dest.copy_from_slice(data))
    }

    /// Fill `len` bytes starting at `offset` by repeating `pattern`.
    pub fn fill(&mut self, offset: usize, len: usize, pattern: &[u8]) -> Result<(), MemoryError> {
        if pattern.is_empty() {
            return Err(MemoryError::InvalidSize);
        }
        self.patch(offset, len, |dest| {
            for (byte, src) in dest.iter_mut().zip(pattern.iter().cycle()) {
                *byte = *src;
            }
        })
    }

    /// Run `f` over a writable view of `[offset, offset + len)`.
    ///
    /// Once the mapping is executable, the pages covering the range are
    /// switched to read/write for the call and back to read/execute after.
    pub fn patch<F>(&mut self, offset: usize, len: usize, f: F) -> Result<(), MemoryError>
    where
        F: FnOnce(&mut [u8]),
    {
        self.check_bounds(offset, len)?;
        if len == 0 {
            return Ok(());
        }

        let page_size = Self::page_size();
        let page_start = offset & !(page_size - 1);
        let page_end = (offset + len + page_size - 1) & !(page_size - 1);

        if self.executable {
            self.protect(page_start, page_end - page_start, Protection::ReadWrite)?;
        }

        // SAFETY: bounds were checked above and the pages are writable now.
        let dest = unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len) };
        f(dest);

        if self.executable {
            self.protect(page_start, page_end - page_start, Protection::ReadExecute)?;
        }
        Ok(())
    }

    /// Make the memory executable (and read-only).
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        self.protect(0, self.size, Protection::ReadExecute)?;
        self.executable = true;
        Ok(())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    #[cfg(unix)]
    fn protect(&self, offset: usize, len: usize, prot: Protection) -> Result<(), MemoryError> {
        let flags = match prot {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        };
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().add(offset) as *mut libc::c_void,
                len,
                flags,
            )
        };

        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn protect(&self, _offset: usize, _len: usize, _prot: Protection) -> Result<(), MemoryError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Protection {
    ReadWrite,
    ReadExecute,
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
                unsafe {
                    std::alloc::dealloc(self.ptr.as_ptr(), layout);
                }
            }
        }
    }
}

// The mapping is uniquely owned; mutation requires `&mut self`.
unsafe impl Send for ExecutableMemory {}
