//! The send/receive engine: queues, worker threads, lifecycle.
//!
//! An [`Endpoint`] owns one peer's end of a channel. `send` enqueues and
//! returns; a sender worker drains the outbound queue into the transport
//! with bounded retries, and a receiver worker drains the transport into
//! the inbound queue in small batches. Both workers poll the shared
//! `running` flag at least every 50 ms, so `stop()` converges without any
//! thread-interruption machinery.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::packet::{MessageKind, Packet};
use crate::transport::{AttachError, ReadError, Role, Transport};

/// Entries either queue will hold before dropping messages.
const QUEUE_CAPACITY: usize = 1000;

/// Upper bound on any worker's wait between `running` checks.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Write attempts per message before it is re-queued or dropped.
const WRITE_ATTEMPTS: u32 = 3;

/// Backoff after the first failed write attempt; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(10);

/// Packets the receiver drains per pass.
const RECV_BATCH: usize = 10;

/// Slice of the receiver's idle wait, between `running` checks.
const IDLE_SLICE: Duration = Duration::from_millis(5);

/// Idle slices per empty pass (5 ms × 10 = 50 ms).
const IDLE_SLICES: u32 = 10;

/// Why `configure` was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Configuration is frozen while the engine runs.
    Running,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Running => write!(f, "cannot reconfigure a running endpoint"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Why `start` failed. The endpoint stays idle afterwards.
#[derive(Debug)]
pub enum StartError {
    /// No channel name configured.
    EmptyName,
    /// The endpoint is already running.
    AlreadyRunning,
    /// The transport could not be brought up.
    Attach(AttachError),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::EmptyName => write!(f, "channel name is empty"),
            StartError::AlreadyRunning => write!(f, "endpoint already running"),
            StartError::Attach(e) => write!(f, "failed to attach channel: {e}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::Attach(e) => Some(e),
            _ => None,
        }
    }
}

/// A FIFO of raw messages plus the condvar its consumers park on.
struct MsgQueue {
    queue: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
}

impl MsgQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }
}

struct Workers {
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

struct Config {
    channel: String,
    role: Role,
}

/// One peer's end of a channel.
///
/// All methods take `&self`; the endpoint may be shared across threads, and
/// concurrent `stop()` calls coalesce.
pub struct Endpoint {
    config: Mutex<Config>,
    running: Arc<AtomicBool>,
    workers: Mutex<Option<Workers>>,
    outbound: Arc<MsgQueue>,
    inbound: Arc<MsgQueue>,
}

impl Endpoint {
    /// An unconfigured, idle endpoint.
    pub fn new() -> Self {
        Self::with_config("", Role::Client)
    }

    /// An idle endpoint pre-configured for `channel` and `role`.
    pub fn with_config(channel: &str, role: Role) -> Self {
        Self {
            config: Mutex::new(Config {
                channel: channel.to_string(),
                role,
            }),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(None),
            outbound: Arc::new(MsgQueue::new()),
            inbound: Arc::new(MsgQueue::new()),
        }
    }

    /// Set the channel name and role. Only valid while idle.
    pub fn configure(&self, channel: &str, role: Role) -> Result<(), ConfigError> {
        let mut config = self.config.lock().unwrap();
        if self.running.load(Ordering::SeqCst) {
            error!("rejecting reconfiguration of a running endpoint");
            return Err(ConfigError::Running);
        }
        config.channel = channel.to_string();
        config.role = role;
        Ok(())
    }

    /// Bring up the transport and both workers.
    pub fn start(&self) -> Result<(), StartError> {
        let (channel, role) = {
            let config = self.config.lock().unwrap();
            (config.channel.clone(), config.role)
        };
        if channel.is_empty() {
            error!("cannot start: channel name not set");
            return Err(StartError::EmptyName);
        }

        let mut workers = self.workers.lock().unwrap();
        if self.running.load(Ordering::SeqCst) {
            warn!("endpoint already running (channel={channel})");
            return Err(StartError::AlreadyRunning);
        }

        let transport = Arc::new(
            Transport::create(&channel, role).map_err(StartError::Attach)?,
        );

        self.running.store(true, Ordering::SeqCst);

        let sender = {
            let transport = transport.clone();
            let running = self.running.clone();
            let outbound = self.outbound.clone();
            thread::spawn(move || sender_loop(&transport, &running, &outbound, role))
        };
        let receiver = {
            let running = self.running.clone();
            let inbound = self.inbound.clone();
            thread::spawn(move || receiver_loop(&transport, &running, &inbound))
        };
        *workers = Some(Workers { sender, receiver });

        info!("endpoint started (channel={channel}, role={role:?})");
        Ok(())
    }

    /// Shut down the workers and tear down the transport.
    ///
    /// Idempotent and safe to call from any number of threads: exactly one
    /// caller performs the join, the rest return immediately.
    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.outbound.available.notify_all();
        self.inbound.available.notify_all();

        let workers = self.workers.lock().unwrap().take();
        if let Some(workers) = workers {
            if workers.sender.join().is_err() {
                error!("sender worker panicked during shutdown");
            }
            if workers.receiver.join().is_err() {
                error!("receiver worker panicked during shutdown");
            }
        }
        // The workers held the last transport references; the channel's OS
        // objects are gone now if this peer was the server.
        info!("endpoint stopped");
    }

    /// Queue `message` for delivery. Returns `false` when the endpoint is
    /// not running or the outbound queue is full.
    pub fn send(&self, message: impl Into<Vec<u8>>) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            debug!("send rejected: endpoint not running");
            return false;
        }

        {
            let mut queue = self.outbound.queue.lock().unwrap();
            if queue.len() >= QUEUE_CAPACITY {
                warn!("outbound queue full ({QUEUE_CAPACITY} entries), dropping message");
                return false;
            }
            queue.push_back(message.into());
        }
        self.outbound.available.notify_one();
        true
    }

    /// Dequeue the next received message, if any. Never blocks.
    pub fn receive(&self) -> Option<Vec<u8>> {
        self.inbound.queue.lock().unwrap().pop_front()
    }

    /// Whether the workers are live.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drain the outbound queue into the transport, one message at a time.
fn sender_loop(
    transport: &Transport,
    running: &AtomicBool,
    outbound: &MsgQueue,
    role: Role,
) {
    debug!("sender worker started");
    let kind = if role.is_server() {
        MessageKind::Response
    } else {
        MessageKind::Request
    };

    loop {
        let message = {
            let mut queue = outbound.queue.lock().unwrap();
            if queue.is_empty() {
                let (guard, _) = outbound
                    .available
                    .wait_timeout(queue, IDLE_WAIT)
                    .unwrap();
                queue = guard;
            }
            if !running.load(Ordering::SeqCst) {
                break;
            }
            queue.pop_front()
        };
        let Some(message) = message else { continue };

        let packet = Packet::new(kind, 0, &message);
        let mut delivered = false;
        let mut recoverable = true;

        for attempt in 0..WRITE_ATTEMPTS {
            match transport.write_packet(&packet) {
                Ok(()) => {
                    delivered = true;
                    trace!("sent message ({} bytes)", message.len());
                    break;
                }
                Err(err) if err.is_transient() => {
                    debug!(
                        "write attempt {}/{WRITE_ATTEMPTS} failed: {err}",
                        attempt + 1
                    );
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    thread::sleep(RETRY_BASE * 2u32.pow(attempt));
                }
                Err(err) => {
                    error!("dropping undeliverable message: {err}");
                    recoverable = false;
                    break;
                }
            }
        }

        if !delivered && recoverable {
            if running.load(Ordering::SeqCst) {
                let mut queue = outbound.queue.lock().unwrap();
                if queue.len() < QUEUE_CAPACITY {
                    queue.push_front(message);
                } else {
                    warn!("outbound queue full, discarding unsent message");
                }
            } else {
                warn!("discarding unsent message during shutdown");
            }
        }
    }
    debug!("sender worker stopped");
}

/// Drain the transport into the inbound queue in bounded batches.
fn receiver_loop(transport: &Transport, running: &AtomicBool, inbound: &MsgQueue) {
    debug!("receiver worker started");

    while running.load(Ordering::SeqCst) {
        let mut drained = 0usize;

        for _ in 0..RECV_BATCH {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            match transport.read_packet() {
                Ok(packet) => {
                    drained += 1;
                    let mut queue = inbound.queue.lock().unwrap();
                    if queue.len() < QUEUE_CAPACITY {
                        queue.push_back(packet.into_payload());
                        drop(queue);
                        inbound.available.notify_one();
                    } else {
                        warn!("inbound queue full ({QUEUE_CAPACITY} entries), dropping message");
                    }
                }
                Err(ReadError::Empty) => break,
                Err(err) if err.discarded_data() => {
                    // Corrupt bytes were already skipped; a later packet in
                    // the same pass may still be intact.
                    warn!("dropped corrupt ring bytes: {err}");
                }
                Err(err) => {
                    warn!("receive error: {err}");
                    break;
                }
            }
        }

        if drained == 0 {
            for _ in 0..IDLE_SLICES {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(IDLE_SLICE);
            }
        }
    }
    debug!("receiver worker stopped");
}
