//! Named shared memory segments over System V IPC.

use std::io;
use std::ptr;

use crate::keying::{KeyKind, derive_key};
use crate::region::Region;

/// Permission bits for the segment, world read/write.
const SEGMENT_MODE: libc::c_int = 0o666;

/// A named, fixed-size shared memory segment.
///
/// The creating side owns the underlying object and removes it on drop;
/// attached sides only detach. Removal under System V is deferred until the
/// last peer detaches, so an attached client keeps working while the server
/// tears down.
#[derive(Debug)]
pub struct NamedSegment {
    id: libc::c_int,
    base: *mut u8,
    size: usize,
    owner: bool,
}

// Safety: the mapping is plain shared memory; access discipline is imposed
// by the layer above (counters + semaphores).
unsafe impl Send for NamedSegment {}
unsafe impl Sync for NamedSegment {}

impl NamedSegment {
    /// Create (or take over) the segment for `channel` and attach to it.
    ///
    /// The content is whatever the kernel or a previous owner left behind;
    /// zeroing is the caller's job.
    pub fn create(channel: &str, size: usize) -> io::Result<Self> {
        let key = derive_key(channel, KeyKind::Segment);
        let id = unsafe { libc::shmget(key, size, libc::IPC_CREAT | SEGMENT_MODE) };
        if id == -1 {
            return Err(io::Error::last_os_error());
        }
        Self::map(id, size, true)
    }

    /// Attach to an existing segment for `channel`.
    ///
    /// Fails with `ENOENT` when no owner has created it yet.
    pub fn attach(channel: &str, size: usize) -> io::Result<Self> {
        let key = derive_key(channel, KeyKind::Segment);
        let id = unsafe { libc::shmget(key, size, SEGMENT_MODE) };
        if id == -1 {
            return Err(io::Error::last_os_error());
        }
        Self::map(id, size, false)
    }

    fn map(id: libc::c_int, size: usize, owner: bool) -> io::Result<Self> {
        let base = unsafe { libc::shmat(id, ptr::null(), 0) };
        if base as isize == -1 {
            let err = io::Error::last_os_error();
            if owner {
                unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
            }
            return Err(err);
        }
        Ok(Self {
            id,
            base: base as *mut u8,
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

    /// Whether this handle removes the segment on drop.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for NamedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.base as *const libc::c_void);
            if self.owner {
                libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("memlink-seg-{tag}-{}", std::process::id())
    }

    #[test]
    fn create_then_attach_shares_memory() {
        let name = unique("share");
        let owner = NamedSegment::create(&name, 4096).unwrap();
        let peer = NamedSegment::attach(&name, 4096).unwrap();

        unsafe { *owner.region().offset(100) = 0x5A };
        assert_eq!(unsafe { *peer.region().offset(100) }, 0x5A);

        unsafe { *peer.region().offset(101) = 0xC3 };
        assert_eq!(unsafe { *owner.region().offset(101) }, 0xC3);
    }

    #[test]
    fn attach_without_owner_fails() {
        let err = NamedSegment::attach(&unique("absent"), 4096).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn owner_drop_removes_the_segment() {
        let name = unique("cleanup");
        {
            let _owner = NamedSegment::create(&name, 1024).unwrap();
            assert!(NamedSegment::attach(&name, 1024).is_ok());
        }
        assert!(NamedSegment::attach(&name, 1024).is_err());
    }

    #[test]
    fn peer_drop_leaves_the_segment() {
        let name = unique("peer-drop");
        let owner = NamedSegment::create(&name, 1024).unwrap();
        {
            let _peer = NamedSegment::attach(&name, 1024).unwrap();
        }
        assert!(NamedSegment::attach(&name, 1024).is_ok());
        drop(owner);
    }
}
