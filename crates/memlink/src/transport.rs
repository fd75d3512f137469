//! The packet transport: segment + semaphores + rings + codec.
//!
//! A [`Transport`] is one peer's view of a channel. The server side creates
//! the OS objects and zeroes the segment; the client side attaches to them
//! and waits for the zeroed state before declaring the channel usable.
//!
//! Writes and reads never block on a semaphore: contention and emptiness
//! surface as [`WriteError::Busy`] / [`ReadError::Empty`] and the caller
//! decides how to wait. That keeps every loop above this layer cancellable
//! within a bounded interval.

use std::fmt;
use std::io;
use std::thread;
use std::time::Duration;

use memlink_primitives::{NamedSegment, Region, RingBuffer, SemIndex, SemaphoreSet, SharedCounter};

use crate::layout::{
    CLIENT_TO_SERVER_OFFSET, RING_SIZE, SEGMENT_SIZE, SERVER_TO_CLIENT_OFFSET, SHARED_HEADER_SIZE,
    SharedHeader,
};
use crate::packet::{FrameError, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PACKET_MAGIC, Packet, PacketHeader};

/// Which side of the channel this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates, initializes, and finally destroys the OS objects.
    Server,
    /// Attaches to objects the server created; detaches on drop.
    Client,
}

impl Role {
    /// Whether this peer owns the channel's OS objects.
    #[inline]
    pub fn is_server(self) -> bool {
        matches!(self, Role::Server)
    }
}

/// Attempts a client makes while waiting for the server's objects.
const ATTACH_ATTEMPTS: u32 = 10;

/// Delay between client attach attempts.
const ATTACH_DELAY: Duration = Duration::from_millis(100);

/// Why a transport could not be brought up.
#[derive(Debug)]
pub enum AttachError {
    /// The shared segment could not be created or opened.
    Segment(io::Error),
    /// The semaphore set could not be created or opened.
    Semaphores(io::Error),
    /// The client never observed the zeroed initial state.
    HandshakeTimeout,
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::Segment(e) => write!(f, "shared segment unavailable: {e}"),
            AttachError::Semaphores(e) => write!(f, "semaphore set unavailable: {e}"),
            AttachError::HandshakeTimeout => {
                write!(f, "timed out waiting for the server to initialize the channel")
            }
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AttachError::Segment(e) | AttachError::Semaphores(e) => Some(e),
            AttachError::HandshakeTimeout => None,
        }
    }
}

/// Why a packet was not written.
#[derive(Debug)]
pub enum WriteError {
    /// The write mutex is currently held. Transient; retry.
    Busy,
    /// Not enough free ring space for the packet. Transient; retry.
    Full,
    /// The packet can never fit the ring.
    TooLarge(usize),
    /// A semaphore operation failed outright.
    Semaphore(io::Error),
}

impl WriteError {
    /// Whether retrying the write can succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, WriteError::Busy | WriteError::Full)
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::Busy => write!(f, "write mutex contended"),
            WriteError::Full => write!(f, "ring full"),
            WriteError::TooLarge(size) => {
                write!(f, "packet of {size} bytes exceeds ring capacity {RING_SIZE}")
            }
            WriteError::Semaphore(e) => write!(f, "semaphore failure: {e}"),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriteError::Semaphore(e) => Some(e),
            _ => None,
        }
    }
}

/// Why no packet came back from a read attempt.
#[derive(Debug)]
pub enum ReadError {
    /// Nothing to read. Not an error in any meaningful sense.
    Empty,
    /// The bytes at the tail did not start with the packet magic. The tail
    /// was advanced to the next magic boundary (or to the head).
    BadMagic(u32),
    /// The header declared a payload no ring could carry, or more bytes
    /// than were published. The tail was advanced as for `BadMagic`.
    BadLength(u32),
    /// A well-framed packet failed its checksum and was skipped whole.
    BadChecksum,
    /// A semaphore operation failed outright.
    Semaphore(io::Error),
}

impl ReadError {
    /// Whether the failure consumed (discarded) ring bytes.
    pub fn discarded_data(&self) -> bool {
        matches!(
            self,
            ReadError::BadMagic(_) | ReadError::BadLength(_) | ReadError::BadChecksum
        )
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Empty => write!(f, "no packet available"),
            ReadError::BadMagic(found) => write!(f, "bad magic 0x{found:08X} at ring tail"),
            ReadError::BadLength(len) => write!(f, "implausible payload length {len}"),
            ReadError::BadChecksum => write!(f, "packet checksum mismatch"),
            ReadError::Semaphore(e) => write!(f, "semaphore failure: {e}"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Semaphore(e) => Some(e),
            _ => None,
        }
    }
}

/// One direction of the channel as seen from this peer.
#[derive(Debug)]
struct Direction {
    ring: RingBuffer,
    /// Write position of the direction's producer.
    head: SharedCounter,
    /// Read position of the direction's consumer.
    tail: SharedCounter,
    /// Binary semaphore guarding the producer.
    write_sem: SemIndex,
    /// Counting semaphore signaling the consumer.
    read_sem: SemIndex,
}

/// One peer's packet transport over a named channel.
#[derive(Debug)]
pub struct Transport {
    role: Role,
    segment: NamedSegment,
    sems: SemaphoreSet,
    /// Direction this peer writes.
    tx: Direction,
    /// Direction this peer reads.
    rx: Direction,
}

impl Transport {
    /// Bring up the transport for `channel` in the given role.
    ///
    /// The server creates segment and semaphores and zeroes the whole
    /// segment. The client retries both opens for up to a second each, then
    /// polls the counters for the zeroed state for up to another second.
    pub fn create(channel: &str, role: Role) -> Result<Self, AttachError> {
        let transport = match role {
            Role::Server => {
                let segment = NamedSegment::create(channel, SEGMENT_SIZE)
                    .map_err(AttachError::Segment)?;
                let sems = SemaphoreSet::create(channel).map_err(AttachError::Semaphores)?;
                let transport = Self::assemble(segment, sems, role);
                transport.reset_segment();
                transport
            }
            Role::Client => {
                let segment = with_retry(|| NamedSegment::attach(channel, SEGMENT_SIZE))
                    .map_err(AttachError::Segment)?;
                let sems = with_retry(|| SemaphoreSet::open(channel))
                    .map_err(AttachError::Semaphores)?;
                let transport = Self::assemble(segment, sems, role);
                transport.await_reset()?;
                transport
            }
        };
        debug!(
            "transport up (channel={channel}, role={:?}, segment={} bytes)",
            role, SEGMENT_SIZE
        );
        Ok(transport)
    }

    fn assemble(segment: NamedSegment, sems: SemaphoreSet, role: Role) -> Self {
        let region = segment.region();
        let header = unsafe { &*(region.as_ptr() as *const SharedHeader) };

        let server_write = unsafe { SharedCounter::from_raw(&header.server_write_pos) };
        let server_read = unsafe { SharedCounter::from_raw(&header.server_read_pos) };
        let client_write = unsafe { SharedCounter::from_raw(&header.client_write_pos) };
        let client_read = unsafe { SharedCounter::from_raw(&header.client_read_pos) };

        let s2c = unsafe { RingBuffer::over(region, SERVER_TO_CLIENT_OFFSET, RING_SIZE) };
        let c2s = unsafe { RingBuffer::over(region, CLIENT_TO_SERVER_OFFSET, RING_SIZE) };

        let (tx, rx) = match role {
            Role::Server => (
                Direction {
                    ring: s2c,
                    head: server_write,
                    tail: client_read,
                    write_sem: SemIndex::ServerWrite,
                    read_sem: SemIndex::ClientRead,
                },
                Direction {
                    ring: c2s,
                    head: client_write,
                    tail: server_read,
                    write_sem: SemIndex::ClientWrite,
                    read_sem: SemIndex::ServerRead,
                },
            ),
            Role::Client => (
                Direction {
                    ring: c2s,
                    head: client_write,
                    tail: server_read,
                    write_sem: SemIndex::ClientWrite,
                    read_sem: SemIndex::ServerRead,
                },
                Direction {
                    ring: s2c,
                    head: server_write,
                    tail: client_read,
                    write_sem: SemIndex::ServerWrite,
                    read_sem: SemIndex::ClientRead,
                },
            ),
        };

        Self {
            role,
            segment,
            sems,
            tx,
            rx,
        }
    }

    /// Zero the counters and both ring regions.
    fn reset_segment(&self) {
        let region = self.segment.region();
        let header = unsafe { &*(region.as_ptr() as *const SharedHeader) };
        unsafe { SharedCounter::from_raw(&header.server_write_pos) }.store(0);
        unsafe { SharedCounter::from_raw(&header.server_read_pos) }.store(0);
        unsafe { SharedCounter::from_raw(&header.client_write_pos) }.store(0);
        unsafe { SharedCounter::from_raw(&header.client_read_pos) }.store(0);
        unsafe {
            region
                .offset(SHARED_HEADER_SIZE)
                .write_bytes(0, SEGMENT_SIZE - SHARED_HEADER_SIZE);
        }
    }

    /// Wait until the server has zeroed all four counters.
    fn await_reset(&self) -> Result<(), AttachError> {
        let region = self.segment.region();
        let header = unsafe { &*(region.as_ptr() as *const SharedHeader) };
        for attempt in 0..ATTACH_ATTEMPTS {
            let zeroed = [
                unsafe { SharedCounter::from_raw(&header.server_write_pos) }.load(),
                unsafe { SharedCounter::from_raw(&header.server_read_pos) }.load(),
                unsafe { SharedCounter::from_raw(&header.client_write_pos) }.load(),
                unsafe { SharedCounter::from_raw(&header.client_read_pos) }.load(),
            ]
            .iter()
            .all(|&value| value == 0);
            if zeroed {
                return Ok(());
            }
            if attempt + 1 < ATTACH_ATTEMPTS {
                thread::sleep(ATTACH_DELAY);
            }
        }
        warn!("channel counters never reached the zeroed state");
        Err(AttachError::HandshakeTimeout)
    }

    /// This peer's role.
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Raw view of the shared segment, for diagnostics.
    #[inline]
    pub fn region(&self) -> Region {
        self.segment.region()
    }

    /// Write one packet to the outgoing ring.
    ///
    /// Never blocks: contention reports [`WriteError::Busy`] and a full ring
    /// [`WriteError::Full`], both of which are retryable.
    pub fn write_packet(&self, packet: &Packet) -> Result<(), WriteError> {
        let total = packet.total_size();
        if total > RING_SIZE as usize {
            return Err(WriteError::TooLarge(total));
        }

        if !self
            .sems
            .try_wait(self.tx.write_sem)
            .map_err(WriteError::Semaphore)?
        {
            return Err(WriteError::Busy);
        }

        let head = self.tx.head.load();
        let tail = self.tx.tail.load();
        let free = self.tx.ring.free_space(head, tail);
        if free as usize <= total {
            let _ = self.sems.signal(self.tx.write_sem);
            return Err(WriteError::Full);
        }

        let bytes = packet.to_bytes();
        let new_head = self.tx.ring.write_at(head, &bytes);
        self.tx.head.store(new_head);

        // Data-available first, then the mutex: a woken reader must never
        // observe the head still unpublished.
        if let Err(e) = self.sems.signal(self.tx.read_sem) {
            warn!("failed to signal data-available semaphore: {e}");
        }
        if let Err(e) = self.sems.signal(self.tx.write_sem) {
            warn!("failed to release write semaphore: {e}");
        }

        trace!(
            "wrote packet ({total} bytes, head {head} -> {new_head}, role={:?})",
            self.role
        );
        Ok(())
    }

    /// Read one packet from the incoming ring.
    ///
    /// Never blocks. [`ReadError::Empty`] means nothing was available;
    /// protocol errors mean corrupt bytes were discarded and the next call
    /// may find a valid packet.
    pub fn read_packet(&self) -> Result<Packet, ReadError> {
        // Cheap emptiness probe before touching the semaphore.
        if self.rx.head.load() == self.rx.tail.load() {
            return Err(ReadError::Empty);
        }

        if !self
            .sems
            .try_wait(self.rx.read_sem)
            .map_err(ReadError::Semaphore)?
        {
            return Err(ReadError::Empty);
        }

        // Positions may have moved while the semaphore was acquired.
        let head = self.rx.head.load();
        let tail = self.rx.tail.load();
        if head == tail {
            let _ = self.sems.signal(self.rx.read_sem);
            return Err(ReadError::Empty);
        }

        let used = self.rx.ring.used_space(head, tail) as usize;
        if used < MIN_PACKET_SIZE {
            // A producer only publishes whole packets; this is corruption.
            return Err(self.discard(head, tail, ReadError::BadLength(used as u32)));
        }

        let mut header_bytes = [0u8; PACKET_HEADER_SIZE];
        self.rx.ring.read_at(tail, &mut header_bytes);
        let header = PacketHeader::from_bytes(&header_bytes);

        if header.magic != PACKET_MAGIC {
            return Err(self.discard(head, tail, ReadError::BadMagic(header.magic)));
        }
        let total = MIN_PACKET_SIZE + header.payload_len as usize;
        if total > RING_SIZE as usize || total > used {
            return Err(self.discard(head, tail, ReadError::BadLength(header.payload_len)));
        }

        let mut bytes = vec![0u8; total];
        self.rx.ring.read_at(tail, &mut bytes);
        let packet = match Packet::parse(&bytes) {
            Ok(packet) => packet,
            Err(FrameError::BadMagic(found)) => {
                return Err(self.discard(head, tail, ReadError::BadMagic(found)));
            }
            Err(_) => {
                return Err(self.discard(head, tail, ReadError::BadLength(header.payload_len)));
            }
        };

        if !packet.is_valid() {
            // Well-framed but corrupt: skip exactly this packet.
            self.rx.tail.store((tail + total as u32) % RING_SIZE);
            let _ = self.sems.signal(self.rx.read_sem);
            warn!("discarding packet with checksum mismatch ({total} bytes)");
            return Err(ReadError::BadChecksum);
        }

        self.rx.tail.store((tail + total as u32) % RING_SIZE);
        if let Err(e) = self.sems.signal(self.rx.write_sem) {
            warn!("failed to signal space-available semaphore: {e}");
        }

        trace!(
            "read packet ({total} bytes, tail {tail} -> {}, role={:?})",
            (tail + total as u32) % RING_SIZE,
            self.role
        );
        Ok(packet)
    }

    /// Drop unframeable bytes: advance the tail to the next magic boundary,
    /// or to the head when none is in sight, then hand back the semaphore.
    fn discard(&self, head: u32, tail: u32, reason: ReadError) -> ReadError {
        let new_tail = self.resync_tail(head, tail);
        self.rx.tail.store(new_tail);
        let _ = self.sems.signal(self.rx.read_sem);
        warn!(
            "discarded {} corrupt ring bytes ({reason})",
            self.rx.ring.used_space(new_tail, tail)
        );
        reason
    }

    /// Find the next plausible packet start strictly after `tail`.
    fn resync_tail(&self, head: u32, tail: u32) -> u32 {
        let used = self.rx.ring.used_space(head, tail) as usize;
        let mut bytes = vec![0u8; used];
        self.rx.ring.read_at(tail, &mut bytes);

        let magic = PACKET_MAGIC.to_ne_bytes();
        let mut offset = 1;
        while offset + magic.len() <= used {
            if bytes[offset..offset + magic.len()] == magic {
                return (tail + offset as u32) % RING_SIZE;
            }
            offset += 1;
        }
        head
    }
}

// Safety: the transport's raw views point into the segment it owns; the
// semaphore protocol serializes writers, and readers only consume published
// bytes.
unsafe impl Send for Transport {}
unsafe impl Sync for Transport {}

fn with_retry<T>(mut attempt: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut tries = 0;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(err) => {
                tries += 1;
                if tries >= ATTACH_ATTEMPTS {
                    return Err(err);
                }
                thread::sleep(ATTACH_DELAY);
            }
        }
    }
}
