//! Cross-process building blocks for the memlink channel.
//!
//! This crate holds the substrate the channel is assembled from:
//!
//! - [`Region`] / [`HeapRegion`]: byte-addressed views of raw memory
//! - [`RingBuffer`]: a one-direction byte ring with wrap-around
//! - [`SharedCounter`]: a cross-process position counter
//! - [`keying`]: deterministic OS-object identifiers for a channel name
//! - [`NamedSegment`]: a named shared memory segment (System V on POSIX,
//!   file mappings on Windows)
//! - [`SemaphoreSet`]: the four named semaphores coordinating a channel
//!
//! Nothing here knows about packets or roles; policy lives in the `memlink`
//! crate on top.

pub mod counter;
pub mod keying;
pub mod region;
pub mod ring;
pub mod sem;

#[cfg(unix)]
mod segment_unix;
#[cfg(unix)]
pub use segment_unix::NamedSegment;

#[cfg(windows)]
mod segment_windows;
#[cfg(windows)]
pub use segment_windows::NamedSegment;

#[cfg(unix)]
mod sem_unix;
#[cfg(unix)]
pub use sem_unix::SemaphoreSet;

#[cfg(windows)]
mod sem_windows;
#[cfg(windows)]
pub use sem_windows::SemaphoreSet;

pub use counter::SharedCounter;
pub use keying::KeyKind;
pub use region::{HeapRegion, Region};
pub use ring::RingBuffer;
pub use sem::{SEM_COUNT, SEM_INITIAL, SEM_MAX, SemIndex};
