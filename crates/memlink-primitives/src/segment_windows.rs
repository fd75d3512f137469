//! Named shared memory segments over Win32 file mappings.

use std::ffi::CString;
use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingA, FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile,
    OpenFileMappingA, PAGE_READWRITE, UnmapViewOfFile,
};

use crate::keying::segment_name;
use crate::region::Region;

/// A named, fixed-size shared memory segment.
///
/// Backed by a pagefile mapping in the `Local\` session namespace. The
/// mapping object is reference-counted by the kernel: it disappears when the
/// last handle closes, so the owner/peer distinction only affects intent,
/// not cleanup mechanics.
#[derive(Debug)]
pub struct NamedSegment {
    handle: HANDLE,
    base: *mut u8,
    size: usize,
    owner: bool,
}

// Safety: the mapping is plain shared memory; access discipline is imposed
// by the layer above (counters + semaphores).
unsafe impl Send for NamedSegment {}
unsafe impl Sync for NamedSegment {}

impl NamedSegment {
    /// Create (or open, when it already exists) the segment for `channel`
    /// and map a view of it.
    pub fn create(channel: &str, size: usize) -> io::Result<Self> {
        let name = object_name(channel)?;
        let handle = unsafe {
            CreateFileMappingA(
                INVALID_HANDLE_VALUE,
                ptr::null(),
                PAGE_READWRITE,
                (size as u64 >> 32) as u32,
                size as u32,
                name.as_ptr() as *const u8,
            )
        };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Self::map(handle, size, true)
    }

    /// Open and map the existing segment for `channel`.
    pub fn attach(channel: &str, size: usize) -> io::Result<Self> {
        let name = object_name(channel)?;
        let handle =
            unsafe { OpenFileMappingA(FILE_MAP_ALL_ACCESS, 0, name.as_ptr() as *const u8) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Self::map(handle, size, false)
    }

    fn map(handle: HANDLE, size: usize, owner: bool) -> io::Result<Self> {
        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(err);
        }
        Ok(Self {
            handle,
            base: view.Value as *mut u8,
            size,
            owner,
        })
    }

    /// A [`Region`] view of the mapping.
    #[inline]
    pub fn region(&self) -> Region {
        unsafe { Region::from_raw(self.base, self.size) }
    }

    /// Size of the segment in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the segment is zero-sized.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether this handle created the mapping.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for NamedSegment {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.base as *mut core::ffi::c_void,
            });
            CloseHandle(self.handle);
        }
    }
}

fn object_name(channel: &str) -> io::Result<CString> {
    CString::new(segment_name(channel))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "channel name contains NUL"))
}
