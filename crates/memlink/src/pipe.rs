//! Packet streams over named pipes (Unix FIFOs).
//!
//! Alongside the shared-memory channel, packets can travel over a FIFO pair
//! in the filesystem: `<channel>.req` carries requests toward the server,
//! `<channel>.res` carries responses back. Unlike the ring transport, a
//! FIFO is a byte stream with no positions to resynchronize, so a reader
//! reassembles packets from whatever the kernel delivers, skipping to the
//! next magic boundary when the stream carries garbage.
//!
//! Both ends open non-blocking. A FIFO with no reader yet makes a plain
//! write-only open fail with `ENXIO`; the writer falls back to a blocking
//! open to wait for the reader, then restores non-blocking mode.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::fd::FromRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::packet::{MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PACKET_MAGIC, Packet, PacketHeader};

/// Largest payload a stream reader will believe. Streams carry no ring
/// bound, so an explicit cap keeps a corrupt length field from demanding
/// gigabytes of reassembly buffer.
pub const MAX_STREAM_PAYLOAD: usize = 10 * 1024 * 1024;

/// Mode bits for created FIFOs: user and group read/write.
const FIFO_MODE: libc::mode_t = 0o660;

/// Consecutive would-block stalls a writer tolerates before giving up.
const WRITE_STALL_LIMIT: u32 = 100;

/// Pause between stalled write attempts.
const WRITE_STALL_DELAY: Duration = Duration::from_millis(1);

/// Which direction of a channel's FIFO pair a path names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    /// Client-to-server traffic (`.req`).
    Request,
    /// Server-to-client traffic (`.res`).
    Response,
}

impl PipeKind {
    fn suffix(self) -> &'static str {
        match self {
            PipeKind::Request => "req",
            PipeKind::Response => "res",
        }
    }
}

/// Filesystem path of one FIFO of a channel's pair.
pub fn pipe_path(dir: &Path, channel: &str, kind: PipeKind) -> PathBuf {
    dir.join(format!("{channel}.{}", kind.suffix()))
}

/// The consuming end of a packet stream.
pub struct PipeReader {
    file: File,
    buffer: Vec<u8>,
    path: PathBuf,
    owns_path: bool,
}

impl PipeReader {
    /// Open `path` for reading, creating the FIFO when necessary.
    pub fn open(path: &Path) -> io::Result<Self> {
        let created = ensure_fifo(path)?;
        let file = open_raw(path, libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC)?;
        Ok(Self {
            file,
            buffer: Vec::new(),
            path: path.to_path_buf(),
            owns_path: created,
        })
    }

    /// Pull whatever bytes the kernel has and return the complete, valid
    /// packets among them. Never blocks; an idle stream yields an empty
    /// vector.
    pub fn poll(&mut self) -> io::Result<Vec<Packet>> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.file.read(&mut chunk) {
                // 0 means no writer is connected right now.
                Ok(0) => break,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(self.extract())
    }

    /// Bytes currently sitting in the reassembly buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn extract(&mut self) -> Vec<Packet> {
        let magic = PACKET_MAGIC.to_ne_bytes();
        let mut packets = Vec::new();

        loop {
            // Align the buffer to the next magic boundary.
            match find(&self.buffer, &magic) {
                Some(0) => {}
                Some(start) => {
                    warn!("skipping {start} stray bytes in packet stream");
                    self.buffer.drain(..start);
                }
                None => {
                    // Keep a partial magic that may complete next poll.
                    let keep = self.buffer.len().min(magic.len() - 1);
                    let cut = self.buffer.len() - keep;
                    if cut > 0 {
                        warn!("dropping {cut} unframeable bytes from packet stream");
                        self.buffer.drain(..cut);
                    }
                    break;
                }
            }

            if self.buffer.len() < PACKET_HEADER_SIZE {
                break;
            }
            let header = PacketHeader::from_bytes(
                self.buffer[..PACKET_HEADER_SIZE].try_into().unwrap(),
            );
            if header.payload_len as usize > MAX_STREAM_PAYLOAD {
                warn!(
                    "implausible stream payload length {}, realigning",
                    header.payload_len
                );
                self.buffer.drain(..1);
                continue;
            }

            let total = MIN_PACKET_SIZE + header.payload_len as usize;
            if self.buffer.len() < total {
                break;
            }

            match Packet::parse(&self.buffer[..total]) {
                Ok(packet) if packet.is_valid() => {
                    self.buffer.drain(..total);
                    packets.push(packet);
                }
                _ => {
                    warn!("corrupt packet in stream, realigning");
                    self.buffer.drain(..1);
                }
            }
        }

        packets
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if self.owns_path {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// The producing end of a packet stream.
pub struct PipeWriter {
    file: File,
    path: PathBuf,
    owns_path: bool,
}

impl PipeWriter {
    /// Open `path` for writing, creating the FIFO when necessary.
    ///
    /// When no reader has the FIFO open yet, the non-blocking open fails
    /// with `ENXIO`; this falls back to a blocking open that completes once
    /// a reader appears, then restores non-blocking mode.
    pub fn open(path: &Path) -> io::Result<Self> {
        let created = ensure_fifo(path)?;
        let file = match open_raw(path, libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC) {
            Ok(file) => file,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                debug!("no reader on {} yet, waiting with a blocking open", path.display());
                let file = open_raw(path, libc::O_WRONLY | libc::O_CLOEXEC)?;
                set_nonblocking(&file)?;
                file
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            file,
            path: path.to_path_buf(),
            owns_path: created,
        })
    }

    /// Serialize `packet` and write it whole.
    ///
    /// A FIFO that stays full for ~100 ms fails with `WouldBlock`; bytes
    /// already written stay in the stream, and the reader's magic scan
    /// recovers framing when the remainder never arrives.
    pub fn write_packet(&mut self, packet: &Packet) -> io::Result<()> {
        let bytes = packet.to_bytes();
        let mut written = 0;
        let mut stalls = 0;

        while written < bytes.len() {
            match self.file.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "pipe accepted no bytes",
                    ));
                }
                Ok(n) => {
                    written += n;
                    stalls = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    stalls += 1;
                    if stalls > WRITE_STALL_LIMIT {
                        warn!(
                            "pipe {} stayed full, abandoning packet mid-write",
                            self.path.display()
                        );
                        return Err(e);
                    }
                    thread::sleep(WRITE_STALL_DELAY);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if self.owns_path {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Create the FIFO at `path` unless a FIFO already sits there. A plain file
/// in the way is replaced. Returns whether this call created it.
fn ensure_fifo(path: &Path) -> io::Result<bool> {
    if let Ok(metadata) = fs::symlink_metadata(path) {
        use std::os::unix::fs::FileTypeExt;
        if metadata.file_type().is_fifo() {
            return Ok(false);
        }
        fs::remove_file(path)?;
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let c_path = c_string(path)?;
    if unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE) } == -1 {
        let err = io::Error::last_os_error();
        // Lost a creation race to the peer; a FIFO there is fine.
        if err.raw_os_error() == Some(libc::EEXIST) {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

fn open_raw(path: &Path, flags: libc::c_int) -> io::Result<File> {
    let c_path = c_string(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn c_string(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

/// First offset of `needle` within `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
