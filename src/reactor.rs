//! The socket reactor: everything below the distributor that touches bytes.
//!
//! The distributor consumes the [`Reactor`] trait and never sees sockets
//! directly. The production implementation is [`TcpReactor`], which owns a
//! dedicated runtime for its I/O threads; tests substitute a scripted
//! implementation.

pub(crate) mod tcp;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
    },
};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ErrorKind, Result},
    wire::{ConnectInfo, LoginRequest},
    BoxFuture,
};

pub(crate) use tcp::TcpReactor;

/// Connection id of the synthetic aggregate row in [`Reactor::io_stats`].
pub(crate) const GLOBAL_CONNECTION_ID: i64 = -1;

/// Receives the traffic and lifecycle notifications for one registered
/// connection. Implemented by the distributor's node connections.
pub(crate) trait ConnectionHandler: Send + Sync + 'static {
    /// An inbound frame body (length prefix already stripped).
    fn handle_frame(&self, body: Bytes);

    /// `bytes` of a previously enqueued frame were written to the socket.
    fn drained(&self, bytes: usize);

    /// The connection is being torn down. Called exactly once, after which no
    /// further frames are delivered.
    fn stopping(&self);
}

/// The reactor surface the distributor depends on.
pub(crate) trait Reactor: Send + Sync + 'static {
    /// Opens a socket to `hostname:port`, runs the login handshake, and
    /// registers `handler` for inbound traffic. On success the connection is
    /// live and frames may already be flowing into `handler`.
    fn connect<'a>(
        &'a self,
        hostname: &'a str,
        port: u16,
        login: &'a LoginRequest,
        handler: Arc<dyn ConnectionHandler>,
    ) -> BoxFuture<'a, Result<EstablishedConnection>>;

    /// Per-connection byte/message counters, keyed by connection id, with an
    /// aggregate entry at [`GLOBAL_CONNECTION_ID`]. When `interval` is true,
    /// deltas since the previous interval snapshot are reported.
    fn io_stats(&self, interval: bool) -> HashMap<i64, IoStats>;

    /// Closes all sockets and stops the I/O threads.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// A successfully established, registered connection.
pub(crate) struct EstablishedConnection {
    pub(crate) info: ConnectInfo,
    pub(crate) channel: NetworkConnection,
}

/// The write side of a registered connection, plus its teardown handle.
#[derive(Clone, Debug)]
pub(crate) struct NetworkConnection {
    sender: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl NetworkConnection {
    pub(crate) fn new(
        sender: mpsc::UnboundedSender<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self { sender, cancel }
    }

    /// Enqueues a frame for write. Fails once the connection's writer has
    /// stopped.
    pub(crate) fn enqueue(&self, frame: Bytes) -> Result<()> {
        self.sender
            .send(frame)
            .map_err(|_| ErrorKind::Io(Arc::new(std::io::ErrorKind::BrokenPipe.into())).into())
    }

    /// Starts ordered teardown: the connection's tasks stop and the handler's
    /// `stopping` is invoked.
    pub(crate) fn unregister(&self) {
        self.cancel.cancel();
    }
}

/// Monotonic byte/message counters for one connection, updated by the
/// reactor's tasks.
#[derive(Debug, Default)]
pub(crate) struct IoCounters {
    bytes_read: AtomicU64,
    messages_read: AtomicU64,
    bytes_written: AtomicU64,
    messages_written: AtomicU64,
}

impl IoCounters {
    pub(crate) fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_written.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> IoSnapshot {
        IoSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            messages_read: self.messages_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            messages_written: self.messages_written.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`IoCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct IoSnapshot {
    pub(crate) bytes_read: u64,
    pub(crate) messages_read: u64,
    pub(crate) bytes_written: u64,
    pub(crate) messages_written: u64,
}

impl IoSnapshot {
    fn since(self, base: IoSnapshot) -> IoSnapshot {
        IoSnapshot {
            bytes_read: self.bytes_read - base.bytes_read,
            messages_read: self.messages_read - base.messages_read,
            bytes_written: self.bytes_written - base.bytes_written,
            messages_written: self.messages_written - base.messages_written,
        }
    }

    fn accumulate(&mut self, other: IoSnapshot) {
        self.bytes_read += other.bytes_read;
        self.messages_read += other.messages_read;
        self.bytes_written += other.bytes_written;
        self.messages_written += other.messages_written;
    }
}

/// One row of [`Reactor::io_stats`] output.
#[derive(Clone, Debug)]
pub(crate) struct IoStats {
    pub(crate) hostname: String,
    pub(crate) io: IoSnapshot,
}

struct RegistryEntry {
    hostname: String,
    counters: Arc<IoCounters>,
    interval_base: IoSnapshot,
}

/// Bookkeeping shared by reactor implementations: which counters belong to
/// which connection, and the baselines for interval snapshots.
#[derive(Default)]
pub(crate) struct IoRegistry {
    entries: Mutex<HashMap<i64, RegistryEntry>>,
}

impl IoRegistry {
    pub(crate) fn register(&self, connection_id: i64, hostname: String) -> Arc<IoCounters> {
        let counters = Arc::new(IoCounters::default());
        self.entries.lock().unwrap().insert(
            connection_id,
            RegistryEntry {
                hostname,
                counters: counters.clone(),
                interval_base: IoSnapshot::default(),
            },
        );
        counters
    }

    /// Drops a connection's entry once it is torn down, so snapshots stop
    /// carrying dead connection ids.
    pub(crate) fn deregister(&self, connection_id: i64) {
        self.entries.lock().unwrap().remove(&connection_id);
    }

    pub(crate) fn snapshot(&self, interval: bool) -> HashMap<i64, IoStats> {
        let mut entries = self.entries.lock().unwrap();
        let mut stats = HashMap::with_capacity(entries.len() + 1);
        let mut global = IoSnapshot::default();
        for (id, entry) in entries.iter_mut() {
            let current = entry.counters.snapshot();
            let io = if interval {
                let io = current.since(entry.interval_base);
                entry.interval_base = current;
                io
            } else {
                current
            };
            global.accumulate(io);
            stats.insert(
                *id,
                IoStats {
                    hostname: entry.hostname.clone(),
                    io,
                },
            );
        }
        stats.insert(
            GLOBAL_CONNECTION_ID,
            IoStats {
                hostname: "GLOBAL".to_string(),
                io: global,
            },
        );
        stats
    }
}
