//! Packet framing: fixed header, opaque payload, trailing CRC32.
//!
//! Every message crosses the channel as one packet:
//!
//! ```text
//! offset  size  field
//!      0     4  magic        0x5554494C ("UTIL")
//!      4     1  version      1
//!      5     1  kind         0x01..0x04, others reserved
//!      6     2  reserved     zero
//!      8     4  payload_len
//!     12     4  seq
//!     16     8  timestamp_ms
//!     24     N  payload
//!   24+N     4  crc32        over header + payload
//! ```
//!
//! All multi-byte fields are native-endian: the transport never leaves the
//! host, and both peers share its byte order. The CRC is the reflected
//! `0xEDB88320` polynomial with init and final-xor `0xFFFFFFFF`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel marking the start of every packet ("UTIL").
pub const PACKET_MAGIC: u32 = 0x5554_494C;

/// Current framing version.
pub const PACKET_VERSION: u8 = 1;

/// Size of the fixed packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 24;

/// Size of the trailing checksum in bytes.
pub const PACKET_CRC_SIZE: usize = 4;

/// Smallest possible on-wire packet: header plus checksum, empty payload.
pub const MIN_PACKET_SIZE: usize = PACKET_HEADER_SIZE + PACKET_CRC_SIZE;

/// Message kind carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0x01,
    Response = 0x02,
    Heartbeat = 0x03,
    Error = 0x04,
}

impl MessageKind {
    /// Decode a header byte. `None` for the reserved range `0x05..=0xFF`
    /// and for zero.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(MessageKind::Request),
            0x02 => Some(MessageKind::Response),
            0x03 => Some(MessageKind::Heartbeat),
            0x04 => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// The fixed fields at the front of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u8,
    pub kind: u8,
    pub reserved: u16,
    pub payload_len: u32,
    pub seq: u32,
    pub timestamp_ms: u64,
}

impl PacketHeader {
    /// Encode the header in wire order.
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut bytes = [0u8; PACKET_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_ne_bytes());
        bytes[4] = self.version;
        bytes[5] = self.kind;
        bytes[6..8].copy_from_slice(&self.reserved.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.payload_len.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.seq.to_ne_bytes());
        bytes[16..24].copy_from_slice(&self.timestamp_ms.to_ne_bytes());
        bytes
    }

    /// Decode a header from wire order. Performs no validation.
    pub fn from_bytes(bytes: &[u8; PACKET_HEADER_SIZE]) -> Self {
        Self {
            magic: u32::from_ne_bytes(bytes[0..4].try_into().unwrap()),
            version: bytes[4],
            kind: bytes[5],
            reserved: u16::from_ne_bytes(bytes[6..8].try_into().unwrap()),
            payload_len: u32::from_ne_bytes(bytes[8..12].try_into().unwrap()),
            seq: u32::from_ne_bytes(bytes[12..16].try_into().unwrap()),
            timestamp_ms: u64::from_ne_bytes(bytes[16..24].try_into().unwrap()),
        }
    }
}

/// Why a byte slice failed to parse as a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the smallest possible packet.
    Truncated,
    /// The leading four bytes are not the packet magic.
    BadMagic(u32),
    /// The declared payload length exceeds the bytes on hand.
    PayloadOverrun { declared: u32, available: u32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "input shorter than a minimal packet"),
            FrameError::BadMagic(found) => write!(f, "bad packet magic 0x{found:08X}"),
            FrameError::PayloadOverrun {
                declared,
                available,
            } => write!(
                f,
                "declared payload of {declared} bytes but only {available} available"
            ),
        }
    }
}

impl std::error::Error for FrameError {}

/// The destination buffer is too small for the serialized packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoSpace;

impl fmt::Display for NoSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "destination buffer too small for packet")
    }
}

impl std::error::Error for NoSpace {}

/// A framed message with an owned payload.
///
/// The checksum is computed when the packet is built and carried alongside;
/// [`Packet::is_valid`] recomputes it from the current field values. Cloning
/// deep-copies the payload.
#[derive(Debug, Clone)]
pub struct Packet {
    header: PacketHeader,
    payload: Vec<u8>,
    crc: u32,
}

impl Packet {
    /// Build a packet around `payload`, stamped with the current wall-clock
    /// time.
    pub fn new(kind: MessageKind, seq: u32, payload: &[u8]) -> Self {
        Self::with_timestamp(kind, seq, payload, now_ms())
    }

    /// Build a packet with an explicit timestamp.
    pub fn with_timestamp(kind: MessageKind, seq: u32, payload: &[u8], timestamp_ms: u64) -> Self {
        let header = PacketHeader {
            magic: PACKET_MAGIC,
            version: PACKET_VERSION,
            kind: kind as u8,
            reserved: 0,
            payload_len: payload.len() as u32,
            seq,
            timestamp_ms,
        };
        let payload = payload.to_vec();
        let crc = checksum(&header, &payload);
        Self {
            header,
            payload,
            crc,
        }
    }

    /// Reconstruct a packet from a contiguous byte slice.
    ///
    /// Validates the magic and the payload-length bound; the checksum is
    /// deliberately left to [`Packet::is_valid`] so callers can distinguish
    /// unframeable bytes from a well-framed but corrupted packet.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < MIN_PACKET_SIZE {
            return Err(FrameError::Truncated);
        }

        let header = PacketHeader::from_bytes(bytes[..PACKET_HEADER_SIZE].try_into().unwrap());
        if header.magic != PACKET_MAGIC {
            return Err(FrameError::BadMagic(header.magic));
        }

        let available = (bytes.len() - MIN_PACKET_SIZE) as u32;
        if header.payload_len > available {
            return Err(FrameError::PayloadOverrun {
                declared: header.payload_len,
                available,
            });
        }

        let payload_end = PACKET_HEADER_SIZE + header.payload_len as usize;
        let payload = bytes[PACKET_HEADER_SIZE..payload_end].to_vec();
        let crc = u32::from_ne_bytes(bytes[payload_end..payload_end + 4].try_into().unwrap());

        Ok(Self {
            header,
            payload,
            crc,
        })
    }

    /// Whether the stored checksum matches the packet's content.
    pub fn is_valid(&self) -> bool {
        self.header.magic == PACKET_MAGIC && checksum(&self.header, &self.payload) == self.crc
    }

    /// Serialize into `dst`: header, payload, checksum, contiguously.
    pub fn serialize_into(&self, dst: &mut [u8]) -> Result<usize, NoSpace> {
        let total = self.total_size();
        if dst.len() < total {
            return Err(NoSpace);
        }
        dst[..PACKET_HEADER_SIZE].copy_from_slice(&self.header.to_bytes());
        let payload_end = PACKET_HEADER_SIZE + self.payload.len();
        dst[PACKET_HEADER_SIZE..payload_end].copy_from_slice(&self.payload);
        dst[payload_end..total].copy_from_slice(&self.crc.to_ne_bytes());
        Ok(total)
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.total_size()];
        self.serialize_into(&mut bytes)
            .expect("buffer sized to total_size");
        bytes
    }

    /// The fixed header fields.
    #[inline]
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// The kind byte, decoded. `None` for reserved values.
    #[inline]
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_raw(self.header.kind)
    }

    /// The sequence number the writer chose.
    #[inline]
    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    /// Milliseconds since the epoch at encoding time.
    #[inline]
    pub fn timestamp_ms(&self) -> u64 {
        self.header.timestamp_ms
    }

    /// The payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the packet, keeping only the payload.
    #[inline]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// The stored checksum.
    #[inline]
    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Bytes this packet occupies on the wire.
    #[inline]
    pub fn total_size(&self) -> usize {
        MIN_PACKET_SIZE + self.payload.len()
    }
}

/// CRC32 over the encoded header followed by the payload.
fn checksum(header: &PacketHeader, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header.to_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_reference_vector() {
        // CRC-32 of "123456789" under the reflected 0xEDB88320 polynomial.
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn roundtrip_preserves_everything() {
        for payload in [&b""[..], b"x", b"hello, channel", &[0u8; 4096]] {
            let packet = Packet::new(MessageKind::Request, 77, payload);
            let parsed = Packet::parse(&packet.to_bytes()).unwrap();
            assert!(parsed.is_valid());
            assert_eq!(parsed.payload(), payload);
            assert_eq!(parsed.kind(), Some(MessageKind::Request));
            assert_eq!(parsed.seq(), 77);
            assert_eq!(parsed.timestamp_ms(), packet.timestamp_ms());
            assert_eq!(parsed.crc(), packet.crc());
        }
    }

    #[test]
    fn every_single_byte_flip_is_detected() {
        let packet = Packet::with_timestamp(MessageKind::Response, 3, b"payload bytes", 1_700_000_000_000);
        let clean = packet.to_bytes();

        for position in 0..clean.len() {
            let mut bent = clean.clone();
            bent[position] ^= 0x10;

            match Packet::parse(&bent) {
                // Flips inside the magic or the length field may make the
                // frame unparseable, which is detection too.
                Err(_) => {}
                Ok(parsed) => assert!(
                    !parsed.is_valid(),
                    "flip at byte {position} went unnoticed"
                ),
            }
        }
    }

    #[test]
    fn short_input_is_truncated() {
        assert!(matches!(
            Packet::parse(&[0u8; MIN_PACKET_SIZE - 1]),
            Err(FrameError::Truncated)
        ));
        assert!(matches!(Packet::parse(&[]), Err(FrameError::Truncated)));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = Packet::new(MessageKind::Request, 0, b"abc").to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Packet::parse(&bytes),
            Err(FrameError::BadMagic(_))
        ));
    }

    #[test]
    fn overlong_declared_payload_is_rejected() {
        let mut bytes = Packet::new(MessageKind::Request, 0, b"abc").to_bytes();
        bytes[8..12].copy_from_slice(&u32::MAX.to_ne_bytes());
        assert!(matches!(
            Packet::parse(&bytes),
            Err(FrameError::PayloadOverrun { .. })
        ));
    }

    #[test]
    fn serialize_into_short_buffer_fails() {
        let packet = Packet::new(MessageKind::Heartbeat, 0, b"abc");
        let mut small = vec![0u8; packet.total_size() - 1];
        assert_eq!(packet.serialize_into(&mut small), Err(NoSpace));
    }

    #[test]
    fn parse_tolerates_trailing_bytes() {
        // A parser fed a longer region than one packet must frame by the
        // declared length, not the input length.
        let packet = Packet::new(MessageKind::Request, 9, b"first");
        let mut bytes = packet.to_bytes();
        bytes.extend_from_slice(&[0xEE; 100]);

        let parsed = Packet::parse(&bytes).unwrap();
        assert!(parsed.is_valid());
        assert_eq!(parsed.payload(), b"first");
        assert_eq!(parsed.total_size(), packet.total_size());
    }

    #[test]
    fn reserved_kind_bytes_decode_to_none() {
        let mut bytes = Packet::with_timestamp(MessageKind::Error, 0, b"", 5).to_bytes();
        bytes[5] = 0x7F;
        // Checksum no longer matches, but the kind accessor is independent.
        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.kind(), None);
        assert!(!parsed.is_valid());
    }

    #[test]
    fn clone_deep_copies_the_payload() {
        let original = Packet::new(MessageKind::Request, 1, b"shared?");
        let copy = original.clone();
        assert_eq!(copy.payload(), original.payload());
        assert_ne!(copy.payload().as_ptr(), original.payload().as_ptr());
    }
}
