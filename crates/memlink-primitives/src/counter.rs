//! Cross-process position counters.

use std::sync::atomic::{AtomicU32, Ordering};

/// A view of a `u32` counter that lives in memory shared between processes.
///
/// Every access is sequentially consistent. The counters are observed from
/// two address spaces, and the channel protocol requires the strongest
/// portable ordering for them on all target architectures; acquire/release
/// pairs are reserved for same-process synchronization.
#[derive(Debug, Clone, Copy)]
pub struct SharedCounter {
    cell: *const AtomicU32,
}

// Safety: the counter is a view of an atomic in shared memory; the atomic
// itself carries the synchronization.
unsafe impl Send for SharedCounter {}
unsafe impl Sync for SharedCounter {}

impl SharedCounter {
    /// Wrap a pointer to an atomic living in a mapped segment.
    ///
    /// # Safety
    ///
    /// `cell` must point to an initialized `AtomicU32` that stays mapped for
    /// as long as the counter is used.
    #[inline]
    pub unsafe fn from_raw(cell: *const AtomicU32) -> Self {
        Self { cell }
    }

    /// Read the counter.
    #[inline]
    pub fn load(&self) -> u32 {
        unsafe { &*self.cell }.load(Ordering::SeqCst)
    }

    /// Publish a new value.
    #[inline]
    pub fn store(&self, value: u32) {
        unsafe { &*self.cell }.store(value, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_store_roundtrip() {
        let cell = AtomicU32::new(7);
        let counter = unsafe { SharedCounter::from_raw(&cell) };
        assert_eq!(counter.load(), 7);
        counter.store(42);
        assert_eq!(counter.load(), 42);
        assert_eq!(cell.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn copies_alias_the_same_cell() {
        let cell = AtomicU32::new(0);
        let a = unsafe { SharedCounter::from_raw(&cell) };
        let b = a;
        a.store(5);
        assert_eq!(b.load(), 5);
    }
}
