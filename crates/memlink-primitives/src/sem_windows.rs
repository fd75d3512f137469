//! Channel semaphore sets over Win32 named semaphores.

use std::ffi::CString;
use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_TOO_MANY_POSTS, GetLastError, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreA, INFINITE, OpenSemaphoreA, ReleaseSemaphore, SEMAPHORE_ALL_ACCESS,
    WaitForSingleObject,
};

use crate::keying::semaphore_name;
use crate::sem::{SEM_COUNT, SEM_INITIAL, SEM_MAX, SemIndex};

/// The four named semaphores coordinating one channel.
///
/// Each is its own `Local\` kernel object. Like the mapping, the objects are
/// reference-counted by their handles; dropping any handle set merely closes
/// this process's references.
#[derive(Debug)]
pub struct SemaphoreSet {
    handles: [HANDLE; SEM_COUNT],
    owner: bool,
}

// Safety: semaphore handles may be used from any thread.
unsafe impl Send for SemaphoreSet {}
unsafe impl Sync for SemaphoreSet {}

impl SemaphoreSet {
    /// Create the set for `channel` with initial values `{1, 0, 1, 0}` and
    /// maxima `{1, 1000, 1, 1000}`.
    pub fn create(channel: &str) -> io::Result<Self> {
        Self::build(channel, |name, index| unsafe {
            CreateSemaphoreA(
                ptr::null(),
                SEM_INITIAL[index.index()] as i32,
                SEM_MAX[index.index()] as i32,
                name.as_ptr() as *const u8,
            )
        })
        .map(|handles| Self {
            handles,
            owner: true,
        })
    }

    /// Open the existing set for `channel`.
    pub fn open(channel: &str) -> io::Result<Self> {
        Self::build(channel, |name, _index| unsafe {
            OpenSemaphoreA(SEMAPHORE_ALL_ACCESS, 0, name.as_ptr() as *const u8)
        })
        .map(|handles| Self {
            handles,
            owner: false,
        })
    }

    fn build(
        channel: &str,
        acquire: impl Fn(&CString, SemIndex) -> HANDLE,
    ) -> io::Result<[HANDLE; SEM_COUNT]> {
        let mut handles: [HANDLE; SEM_COUNT] = [ptr::null_mut(); SEM_COUNT];
        for index in SemIndex::ALL {
            let name = CString::new(semaphore_name(channel, index)).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "channel name contains NUL")
            })?;
            let handle = acquire(&name, index);
            if handle.is_null() {
                let err = io::Error::last_os_error();
                for opened in &handles[..index.index()] {
                    unsafe { CloseHandle(*opened) };
                }
                return Err(err);
            }
            handles[index.index()] = handle;
        }
        Ok(handles)
    }

    /// Block until semaphore `index` can be decremented.
    pub fn wait(&self, index: SemIndex) -> io::Result<()> {
        match unsafe { WaitForSingleObject(self.handles[index.index()], INFINITE) } {
            WAIT_OBJECT_0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Decrement semaphore `index` without blocking.
    ///
    /// Returns `Ok(false)` when the semaphore is currently zero.
    pub fn try_wait(&self, index: SemIndex) -> io::Result<bool> {
        match unsafe { WaitForSingleObject(self.handles[index.index()], 0) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Whether this handle set created the semaphores.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Increment semaphore `index`.
    ///
    /// A semaphore already at its maximum (`ERROR_TOO_MANY_POSTS`) counts as
    /// success: the increment only carries a hint, and the hinted state is
    /// already observable.
    pub fn signal(&self, index: SemIndex) -> io::Result<()> {
        let ok =
            unsafe { ReleaseSemaphore(self.handles[index.index()], 1, ptr::null_mut()) };
        if ok == 0 {
            if unsafe { GetLastError() } == ERROR_TOO_MANY_POSTS {
                return Ok(());
            }
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for SemaphoreSet {
    fn drop(&mut self) {
        for handle in self.handles {
            unsafe { CloseHandle(handle) };
        }
    }
}
