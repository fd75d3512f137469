//! Channel semaphore sets over System V semaphores.

use std::io;

use crate::keying::{KeyKind, derive_key};
use crate::sem::{SEM_COUNT, SEM_INITIAL, SemIndex};

/// Permission bits for the set, world read/alter.
const SEM_MODE: libc::c_int = 0o666;

/// The four named semaphores coordinating one channel.
///
/// Backed by a single System V set of four. The creating side owns the set
/// and removes it on drop; opened handles leave it in place.
#[derive(Debug)]
pub struct SemaphoreSet {
    id: libc::c_int,
    owner: bool,
}

impl SemaphoreSet {
    /// Create (or take over) the set for `channel` and reset its values to
    /// the initial `{1, 0, 1, 0}`.
    pub fn create(channel: &str) -> io::Result<Self> {
        let key = derive_key(channel, KeyKind::Semaphore);
        let id = unsafe { libc::semget(key, SEM_COUNT as libc::c_int, libc::IPC_CREAT | SEM_MODE) };
        if id == -1 {
            return Err(io::Error::last_os_error());
        }

        let values: [libc::c_ushort; SEM_COUNT] = [
            SEM_INITIAL[0] as libc::c_ushort,
            SEM_INITIAL[1] as libc::c_ushort,
            SEM_INITIAL[2] as libc::c_ushort,
            SEM_INITIAL[3] as libc::c_ushort,
        ];
        if unsafe { libc::semctl(id, 0, libc::SETALL, values.as_ptr()) } == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::semctl(id, 0, libc::IPC_RMID) };
            return Err(err);
        }

        Ok(Self { id, owner: true })
    }

    /// Open the existing set for `channel`.
    ///
    /// Fails with `ENOENT` when no owner has created it yet.
    pub fn open(channel: &str) -> io::Result<Self> {
        let key = derive_key(channel, KeyKind::Semaphore);
        let id = unsafe { libc::semget(key, SEM_COUNT as libc::c_int, SEM_MODE) };
        if id == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { id, owner: false })
    }

    /// Block until semaphore `index` can be decremented.
    pub fn wait(&self, index: SemIndex) -> io::Result<()> {
        self.op(index, -1, 0)
    }

    /// Decrement semaphore `index` without blocking.
    ///
    /// Returns `Ok(false)` when the semaphore is currently zero.
    pub fn try_wait(&self, index: SemIndex) -> io::Result<bool> {
        match self.op(index, -1, libc::IPC_NOWAIT as libc::c_short) {
            Ok(()) => Ok(true),
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Increment semaphore `index`.
    ///
    /// A saturated counter (`ERANGE`) counts as success: the increment only
    /// carries a hint, and the hinted state is already observable.
    pub fn signal(&self, index: SemIndex) -> io::Result<()> {
        match self.op(index, 1, 0) {
            Err(err) if err.raw_os_error() == Some(libc::ERANGE) => Ok(()),
            other => other,
        }
    }

    /// Whether this handle removes the set on drop.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Current value of semaphore `index`. Diagnostic only; the value may be
    /// stale by the time the caller looks at it.
    pub fn value(&self, index: SemIndex) -> io::Result<u32> {
        let value = unsafe { libc::semctl(self.id, index.index() as libc::c_int, libc::GETVAL) };
        if value == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(value as u32)
    }

    fn op(&self, index: SemIndex, delta: libc::c_short, flags: libc::c_short) -> io::Result<()> {
        let mut op = libc::sembuf {
            sem_num: index.index() as libc::c_ushort,
            sem_op: delta,
            sem_flg: flags,
        };
        if unsafe { libc::semop(self.id, &mut op, 1) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for SemaphoreSet {
    fn drop(&mut self) {
        if self.owner {
            unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        }
    }
}
