//! Shared segment layout.
//!
//! The segment is packed, with no padding between parts:
//!
//! ```text
//! offset 0                    SharedHeader (4 × u32 counters)
//! offset 16                   server_to_client ring data [RING_SIZE]
//! offset 16 + RING_SIZE       client_to_server ring data [RING_SIZE]
//! ```
//!
//! Both peers compile the same constants; there is no in-band negotiation.

use core::mem::size_of;
use std::sync::atomic::AtomicU32;

use crate::packet::MIN_PACKET_SIZE;

/// Bytes in each direction's ring.
pub const RING_SIZE: u32 = 1024 * 1024;

/// Size of the control header at the start of the segment.
pub const SHARED_HEADER_SIZE: usize = 16;

/// Offset of the ring the server writes and the client reads.
pub const SERVER_TO_CLIENT_OFFSET: usize = SHARED_HEADER_SIZE;

/// Offset of the ring the client writes and the server reads.
pub const CLIENT_TO_SERVER_OFFSET: usize = SHARED_HEADER_SIZE + RING_SIZE as usize;

/// Total size of the shared segment.
pub const SEGMENT_SIZE: usize = SHARED_HEADER_SIZE + 2 * RING_SIZE as usize;

/// Largest payload a single packet can carry through a ring.
pub const MAX_PAYLOAD: usize = RING_SIZE as usize - MIN_PACKET_SIZE;

/// The four position counters at the start of the segment.
///
/// Each is an independent cross-process counter in `[0, RING_SIZE)`. Only
/// the owning side of a direction advances its write counter, and only the
/// consuming side advances the matching read counter; every access goes
/// through [`memlink_primitives::SharedCounter`] and is sequentially
/// consistent.
#[repr(C)]
pub struct SharedHeader {
    /// Next write offset in `server_to_client`.
    pub server_write_pos: AtomicU32,
    /// Next read offset in `client_to_server`.
    pub server_read_pos: AtomicU32,
    /// Next write offset in `client_to_server`.
    pub client_write_pos: AtomicU32,
    /// Next read offset in `server_to_client`.
    pub client_read_pos: AtomicU32,
}

const _: () = assert!(size_of::<SharedHeader>() == SHARED_HEADER_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_is_header_plus_two_rings() {
        assert_eq!(SEGMENT_SIZE, 16 + 2 * 1024 * 1024);
        assert_eq!(CLIENT_TO_SERVER_OFFSET - SERVER_TO_CLIENT_OFFSET, RING_SIZE as usize);
        assert_eq!(SEGMENT_SIZE - CLIENT_TO_SERVER_OFFSET, RING_SIZE as usize);
    }

    #[test]
    fn max_payload_leaves_room_for_framing() {
        assert_eq!(MAX_PAYLOAD + MIN_PACKET_SIZE, RING_SIZE as usize);
    }
}
