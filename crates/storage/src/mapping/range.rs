//! Reserved virtual address ranges
//!
//! Each replica reserves its whole address-space ceiling up front with an
//! inaccessible anonymous mapping. Part files are then mapped over it with
//! `MAP_FIXED`, so the logical view stays flat and its base never moves as
//! the pool grows.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use pmobj_core::{Error, Result};

/// One replica's reserved address space
pub(crate) struct ReservedRange {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the range is owned by the mapping and only unmapped on drop; the
// memory behind it is shared file memory accessed under the mapping's rules.
unsafe impl Send for ReservedRange {}
unsafe impl Sync for ReservedRange {}

impl ReservedRange {
    /// Reserve `len` bytes of inaccessible address space
    pub(crate) fn reserve(len: u64) -> Result<Self> {
        let len = len as usize;
        // SAFETY: anonymous PROT_NONE mapping at a kernel-chosen address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::Other, "mmap returned null")))?;
        Ok(ReservedRange { ptr, len })
    }

    /// Map `len` bytes of `file` starting at `file_offset` over `[offset, offset + len)`
    pub(crate) fn map_file(&self, offset: u64, len: u64, file: &File, file_offset: u64) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len as u64) {
            return Err(Error::InvalidArgument(format!(
                "part at {:#x}+{} exceeds the reserved {} bytes",
                offset, len, self.len
            )));
        }
        // SAFETY: the target lies inside our own reservation, so MAP_FIXED
        // only replaces pages this range owns.
        let ptr = unsafe {
            libc::mmap(
                self.ptr.as_ptr().add(offset as usize).cast(),
                len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                file.as_raw_fd(),
                file_offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Put `[offset, offset + len)` back to inaccessible reserved space
    pub(crate) fn release(&self, offset: u64, len: u64) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len as u64) {
            return Err(Error::InvalidArgument(format!(
                "release at {:#x}+{} exceeds the reserved {} bytes",
                offset, len, self.len
            )));
        }
        // SAFETY: same bounds as map_file; replaces only our own pages.
        let ptr = unsafe {
            libc::mmap(
                self.ptr.as_ptr().add(offset as usize).cast(),
                len as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Flush `[offset, offset + len)` to the backing files
    pub(crate) fn sync(&self, offset: u64, len: u64, page_size: u64) -> Result<()> {
        let start = offset & !(page_size - 1);
        let end = offset + len;
        // SAFETY: the caller checked the range against committed space,
        // which is fully mapped.
        let rc = unsafe {
            libc::msync(
                self.ptr.as_ptr().add(start as usize).cast(),
                (end - start) as usize,
                libc::MS_SYNC,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for ReservedRange {
    fn drop(&mut self) {
        // SAFETY: unmaps the reservation and every part mapped inside it.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// System page size
pub(crate) fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}
