//! Packet-oriented duplex IPC between two processes over a named channel.
//!
//! A channel pairs exactly one **server** with one **client** on the same
//! host. Under the name live a shared memory segment holding two
//! single-producer/single-consumer byte rings (one per direction) and four
//! named semaphores coordinating them. Messages travel as framed,
//! CRC32-protected packets.
//!
//! ```text
//!  server process                         client process
//!  ┌────────────┐   server_to_client    ┌────────────┐
//!  │  Endpoint  │ ──────ring──────────▶ │  Endpoint  │
//!  │ (2 workers)│ ◀─────ring─────────── │ (2 workers)│
//!  └────────────┘   client_to_server    └────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use memlink::{Endpoint, Role};
//!
//! let server = Endpoint::with_config("my-channel", Role::Server);
//! server.start()?;
//!
//! server.send(&b"hello"[..]);
//! if let Some(reply) = server.receive() {
//!     // ...
//! }
//!
//! server.stop();
//! # Ok::<(), memlink::StartError>(())
//! ```
//!
//! The server creates and finally destroys the OS objects; the client
//! attaches to them and detaches. Both sides run two worker threads (sender
//! and receiver) that poll cooperatively and shut down within a bounded
//! interval on `stop()`.

#[macro_use]
mod macros;

pub mod engine;
pub mod layout;
pub mod packet;
#[cfg(unix)]
pub mod pipe;
pub mod transport;

pub use engine::{ConfigError, Endpoint, StartError};
pub use layout::{MAX_PAYLOAD, RING_SIZE, SEGMENT_SIZE, SharedHeader};
pub use packet::{MessageKind, PACKET_MAGIC, Packet, PacketHeader};
pub use transport::{AttachError, ReadError, Role, Transport, WriteError};
