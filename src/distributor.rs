//! The distributor: fans invocations out over the connection pool and
//! correlates responses back to their callbacks.

pub(crate) mod connection;
mod reaper;
pub(crate) mod stats;
#[cfg(test)]
mod test;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use self::{
    connection::NodeConnection,
    reaper::{Reaper, TaskHandle},
    stats::InvocationCounters,
};
use crate::{
    error::{Error, ErrorKind, Result},
    event::StatusListener,
    options::DistributorOptions,
    reactor::{ConnectionHandler, Reactor, TcpReactor, GLOBAL_CONNECTION_ID},
    table::{Column, ColumnType, Table, Value},
    wire::{self, ClusterIdentity, Invocation, LoginRequest, Response, HEARTBEAT_HANDLE},
};

/// A point-in-time description of one pooled connection.
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// Host the connection dials.
    pub hostname: String,
    /// Port the connection dials.
    pub port: u16,
    /// The server-assigned id of the host behind this connection.
    pub server_host_id: i32,
    /// The server-assigned id of this connection.
    pub connection_id: i64,
    /// Callbacks accepted on this connection but not yet run to completion.
    pub outstanding: u64,
}

/// Receives the periodic statistics snapshots produced by
/// [`Distributor::start_stats_loader`]. Where the tables go from here is the
/// sink's concern.
pub trait StatsSink: Send + Sync {
    /// An interval snapshot of the connection-stats table.
    fn connection_stats(&self, table: Table);

    /// An interval snapshot of the procedure-stats table.
    fn procedure_stats(&self, table: Table);
}

/// The connection pool and everything hanging off it. Shared between the
/// facade, the node connections, and the background tasks.
pub(crate) struct Shared {
    pub(crate) options: DistributorOptions,
    pub(crate) reactor: Arc<dyn Reactor>,
    pub(crate) pool: Mutex<Pool>,
    listeners: Mutex<Vec<Arc<dyn StatusListener>>>,
    shutdown: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

pub(crate) struct Pool {
    pub(crate) connections: Vec<Arc<NodeConnection>>,
    cursor: i64,
    identity: Option<ClusterIdentity>,
    build_string: Option<String>,
}

#[derive(Default)]
struct Lifecycle {
    reaper: Option<TaskHandle>,
    stats_loader: Option<TaskHandle>,
}

impl Shared {
    pub(crate) fn listeners_snapshot(&self) -> Vec<Arc<dyn StatusListener>> {
        self.listeners.lock().unwrap().clone()
    }

    pub(crate) fn notify_listeners(&self, f: impl Fn(&dyn StatusListener)) {
        for listener in self.listeners_snapshot() {
            f(listener.as_ref());
        }
    }

    fn pool_snapshot(&self) -> Vec<Arc<NodeConnection>> {
        self.pool.lock().unwrap().connections.clone()
    }

    fn connection_stats_table(&self, interval: bool) -> Table {
        let timestamp = epoch_micros();
        let connections = self.pool_snapshot();
        let io = self.reactor.io_stats(interval);
        let mut table = Table::new(connection_schema());
        let mut totals = InvocationCounters::default();
        for connection in &connections {
            let (info, counters) = connection.connection_summary(interval);
            totals.accumulate(counters);
            let io_row = io.get(&info.connection_id).map(|s| s.io).unwrap_or_default();
            table.push_row_unchecked(vec![
                Value::Timestamp(timestamp),
                Value::Str(info.hostname),
                Value::BigInt(info.connection_id),
                Value::Integer(info.server_host_id),
                big(counters.completed),
                big(counters.aborted),
                big(counters.errored),
                big(io_row.bytes_read),
                big(io_row.messages_read),
                big(io_row.bytes_written),
                big(io_row.messages_written),
            ]);
        }
        let (global_hostname, global_io) = io
            .get(&GLOBAL_CONNECTION_ID)
            .map(|s| (s.hostname.clone(), s.io))
            .unwrap_or_else(|| ("GLOBAL".to_string(), Default::default()));
        table.push_row_unchecked(vec![
            Value::Timestamp(timestamp),
            Value::Str(global_hostname),
            Value::BigInt(GLOBAL_CONNECTION_ID),
            Value::Integer(-1),
            big(totals.completed),
            big(totals.aborted),
            big(totals.errored),
            big(global_io.bytes_read),
            big(global_io.messages_read),
            big(global_io.bytes_written),
            big(global_io.messages_written),
        ]);
        table
    }

    fn procedure_stats_table(&self, interval: bool) -> Table {
        let timestamp = epoch_micros();
        let mut table = Table::new(procedure_schema());
        for connection in self.pool_snapshot() {
            let (connection_id, rows) = connection.procedure_summaries(interval);
            for (procedure, summary) in rows {
                if interval && summary.counters.completed == 0 {
                    continue;
                }
                table.push_row_unchecked(vec![
                    Value::Timestamp(timestamp),
                    Value::Str(connection.hostname().to_string()),
                    Value::BigInt(connection_id),
                    Value::Str(procedure),
                    big(summary.counters.completed),
                    big(summary.counters.aborted),
                    big(summary.counters.errored),
                    big(summary.client.avg_ms),
                    big(summary.client.min_ms),
                    big(summary.client.max_ms),
                    big(summary.cluster.avg_ms),
                    big(summary.cluster.min_ms),
                    big(summary.cluster.max_ms),
                ]);
            }
        }
        table
    }

    fn latency_histogram_table(&self, client_rtt: bool, interval: bool) -> Table {
        let timestamp = epoch_micros();
        let mut table = Table::new(histogram_schema(self.options.latency_bucket_count));
        for connection in self.pool_snapshot() {
            let (connection_id, rows) = connection.histograms(client_rtt, interval);
            for (procedure, bucket_width_ms, buckets) in rows {
                if interval && buckets.iter().all(|b| *b == 0) {
                    continue;
                }
                let mut row = Vec::with_capacity(5 + buckets.len());
                row.push(Value::Timestamp(timestamp));
                row.push(Value::Str(connection.hostname().to_string()));
                row.push(Value::BigInt(connection_id));
                row.push(Value::Str(procedure));
                row.push(Value::Integer(
                    i32::try_from(bucket_width_ms).unwrap_or(i32::MAX),
                ));
                row.extend(buckets.into_iter().map(big));
                table.push_row_unchecked(row);
            }
        }
        table
    }
}

/// The client-side multiplexing transport.
///
/// A `Distributor` owns a pool of persistent, authenticated connections to a
/// single cluster. [`queue`](Distributor::queue) dispatches invocations
/// round-robin over the pool, skipping connections under backpressure, and
/// correlates each response back to its completion callback by client handle.
/// A 1 Hz reaper enforces heartbeats and per-call deadlines.
///
/// `Distributor` is cheaply cloneable; all clones share the same pool.
#[derive(Clone)]
pub struct Distributor {
    inner: Arc<Shared>,
}

impl fmt::Debug for Distributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Distributor")
            .field("connections", &self.inner.pool.lock().unwrap().connections.len())
            .finish()
    }
}

impl Distributor {
    /// Creates a distributor with an empty pool. Must be called from within a
    /// tokio runtime; the reaper task starts immediately.
    pub fn new(options: DistributorOptions) -> Result<Self> {
        let threads = options.reactor_threads();
        let reactor = Arc::new(TcpReactor::new(threads)?);
        Ok(Self::with_reactor(options, reactor))
    }

    pub(crate) fn with_reactor(options: DistributorOptions, reactor: Arc<dyn Reactor>) -> Self {
        let inner = Arc::new(Shared {
            options,
            reactor,
            pool: Mutex::new(Pool {
                connections: Vec::new(),
                cursor: -1,
                identity: None,
                build_string: None,
            }),
            listeners: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::default()),
        });
        let reaper = Reaper::start(&inner);
        inner.lifecycle.lock().unwrap().reaper = Some(reaper);
        Self { inner }
    }

    /// Connects to a cluster node, authenticates, and adds the connection to
    /// the pool.
    ///
    /// The first successful connection captures the cluster identity; every
    /// later connection must present the same identity or this fails with
    /// [`ErrorKind::ClusterIdentityMismatch`] and the new socket is closed.
    pub async fn create_connection(
        &self,
        host: &str,
        username: &str,
        hashed_password: &[u8; 32],
        port: u16,
    ) -> Result<()> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(ErrorKind::Shutdown.into());
        }
        let connection =
            NodeConnection::new(Arc::downgrade(&self.inner), host.to_string(), port);
        let handler: Arc<dyn ConnectionHandler> = connection.clone();
        let login = LoginRequest::new(username, *hashed_password);
        let established = self
            .inner
            .reactor
            .connect(host, port, &login, handler)
            .await?;
        let channel = established.channel.clone();
        let info = established.info.clone();
        connection.attach(established)?;

        let admitted = {
            let mut pool = self.inner.pool.lock().unwrap();
            match pool.identity {
                Some(expected) if expected != info.cluster => {
                    Err(Error::from(ErrorKind::ClusterIdentityMismatch {
                        expected,
                        actual: info.cluster,
                    }))
                }
                _ => {
                    if pool.identity.is_none() {
                        pool.identity = Some(info.cluster);
                        pool.build_string = Some(info.build_string.clone());
                    }
                    pool.connections.push(connection.clone());
                    Ok(())
                }
            }
        };
        match admitted {
            Ok(()) => {
                debug!(
                    host,
                    port,
                    connection_id = info.connection_id,
                    host_id = info.host_id,
                    "connection established"
                );
                Ok(())
            }
            Err(e) => {
                warn!(host, port, error = %e, "rejecting connection");
                channel.unregister();
                Err(e)
            }
        }
    }

    /// Queues `invocation` for execution and registers `callback` for its
    /// response.
    ///
    /// Connections are chosen round-robin, skipping any under backpressure
    /// unless `ignore_backpressure` is set. If every connection is under
    /// backpressure, nothing is queued: this returns `Ok(false)` and notifies
    /// listeners with `backpressure(true)`. Fails with
    /// [`ErrorKind::NoConnections`] on an empty pool.
    ///
    /// This method never blocks: serialization happens inline and the frame
    /// is handed to the chosen connection's write queue.
    pub fn queue<F>(
        &self,
        invocation: Invocation,
        callback: F,
        ignore_backpressure: bool,
    ) -> Result<bool>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        if invocation.client_handle() == HEARTBEAT_HANDLE {
            return Err(Error::invalid_argument(
                "the maximum 64-bit handle is reserved for heartbeats",
            ));
        }
        let chosen = {
            let mut pool = self.inner.pool.lock().unwrap();
            if pool.connections.is_empty() {
                return Err(ErrorKind::NoConnections.into());
            }
            let len = pool.connections.len();
            let mut chosen = None;
            // The cursor advances once per attempt, not once per dispatch,
            // so skipped connections still spread subsequent load.
            for _ in 0..len {
                pool.cursor = pool.cursor.wrapping_add(1);
                let index = index_for(pool.cursor, len);
                let candidate = &pool.connections[index];
                if ignore_backpressure || !candidate.has_backpressure() {
                    chosen = Some(candidate.clone());
                    break;
                }
            }
            match chosen {
                Some(connection) => connection,
                None => {
                    // Reported under the pool lock so the notification cannot
                    // cross a concurrent drain's backpressure(false).
                    self.inner.notify_listeners(|l| l.backpressure(true));
                    return Ok(false);
                }
            }
        };
        // Serialization is deliberately outside the pool lock.
        let frame = wire::invocation::encode(&invocation)?;
        chosen.create_work(
            invocation.client_handle(),
            invocation.procedure(),
            frame,
            Box::new(callback),
        );
        Ok(true)
    }

    /// Waits until every connection reports zero outstanding callbacks.
    /// Connections stay open.
    pub async fn drain(&self) {
        loop {
            let outstanding: u64 = self
                .inner
                .pool_snapshot()
                .iter()
                .map(|c| c.outstanding())
                .sum();
            if outstanding == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stops the reaper and the statistics loader, then shuts the reactor
    /// down: all sockets close and the I/O threads stop. Subsequent calls
    /// are no-ops.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let (reaper, stats_loader) = {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            (lifecycle.reaper.take(), lifecycle.stats_loader.take())
        };
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }
        if let Some(loader) = stats_loader {
            loader.stop().await;
        }
        self.inner.reactor.shutdown().await;
    }

    /// Registers a listener. Adding the same `Arc` twice is a no-op.
    pub fn add_listener(&self, listener: Arc<dyn StatusListener>) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Removes a previously registered listener. Removing a listener that is
    /// not registered is a no-op.
    pub fn remove_listener(&self, listener: &Arc<dyn StatusListener>) {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// The cluster identity captured from the first connection, if any
    /// connection has been made.
    pub fn instance_id(&self) -> Option<ClusterIdentity> {
        self.inner.pool.lock().unwrap().identity
    }

    /// The server build string captured from the first connection.
    pub fn build_string(&self) -> Option<String> {
        self.inner.pool.lock().unwrap().build_string.clone()
    }

    /// Describes the pooled connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .pool_snapshot()
            .iter()
            .map(|c| c.info())
            .collect()
    }

    /// Per-connection invocation and I/O counters, one row per connection
    /// plus a synthetic `GLOBAL` aggregate row with connection id -1.
    ///
    /// With `interval`, counters are deltas since the previous
    /// `interval = true` call and the underlying shadows reset.
    pub fn connection_stats(&self, interval: bool) -> Table {
        self.inner.connection_stats_table(interval)
    }

    /// Per-(connection, procedure) invocation counters and round-trip
    /// aggregates. Interval snapshots skip procedures with no invocations in
    /// the window.
    pub fn procedure_stats(&self, interval: bool) -> Table {
        self.inner.procedure_stats_table(interval)
    }

    /// Latency histograms per (connection, procedure), over client-observed
    /// round trips when `client_rtt` is set and cluster-reported ones
    /// otherwise.
    pub fn latency_histogram(&self, client_rtt: bool, interval: bool) -> Table {
        self.inner.latency_histogram_table(client_rtt, interval)
    }

    /// Starts a task that forwards interval statistics snapshots to `sink`
    /// every `poll_interval`. Stopped by [`shutdown`](Distributor::shutdown).
    pub fn start_stats_loader(
        &self,
        sink: Arc<dyn StatsSink>,
        poll_interval: Duration,
    ) -> Result<()> {
        if poll_interval.is_zero() {
            return Err(Error::invalid_argument(
                "statistics poll interval must be non-zero",
            ));
        }
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(ErrorKind::Shutdown.into());
        }
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        if lifecycle.stats_loader.is_some() {
            return Err(Error::invalid_argument(
                "a statistics loader is already running",
            ));
        }
        let weak = Arc::downgrade(&self.inner);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tick.tick() => {
                        let Some(shared) = weak.upgrade() else { break };
                        sink.connection_stats(shared.connection_stats_table(true));
                        sink.procedure_stats(shared.procedure_stats_table(true));
                    }
                }
            }
        });
        lifecycle.stats_loader = Some(TaskHandle::new(stop_tx, join));
        Ok(())
    }
}

/// Maps the round-robin cursor onto a pool index.
fn index_for(cursor: i64, len: usize) -> usize {
    #[allow(clippy::cast_possible_truncation)]
    {
        (cursor.unsigned_abs() % len as u64) as usize
    }
}

fn big(v: u64) -> Value {
    Value::BigInt(i64::try_from(v).unwrap_or(i64::MAX))
}

fn epoch_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn connection_schema() -> Vec<Column> {
    vec![
        Column::new("TIMESTAMP", ColumnType::Timestamp),
        Column::new("HOSTNAME", ColumnType::String),
        Column::new("CONNECTION_ID", ColumnType::BigInt),
        Column::new("SERVER_HOST_ID", ColumnType::Integer),
        Column::new("INVOCATIONS_COMPLETED", ColumnType::BigInt),
        Column::new("INVOCATIONS_ABORTED", ColumnType::BigInt),
        Column::new("INVOCATIONS_ERRORED", ColumnType::BigInt),
        Column::new("BYTES_READ", ColumnType::BigInt),
        Column::new("MESSAGES_READ", ColumnType::BigInt),
        Column::new("BYTES_WRITTEN", ColumnType::BigInt),
        Column::new("MESSAGES_WRITTEN", ColumnType::BigInt),
    ]
}

fn procedure_schema() -> Vec<Column> {
    vec![
        Column::new("TIMESTAMP", ColumnType::Timestamp),
        Column::new("HOSTNAME", ColumnType::String),
        Column::new("CONNECTION_ID", ColumnType::BigInt),
        Column::new("PROCEDURE", ColumnType::String),
        Column::new("INVOCATIONS_COMPLETED", ColumnType::BigInt),
        Column::new("INVOCATIONS_ABORTED", ColumnType::BigInt),
        Column::new("INVOCATIONS_ERRORED", ColumnType::BigInt),
        Column::new("AVG_CLIENT_RTT", ColumnType::BigInt),
        Column::new("MIN_CLIENT_RTT", ColumnType::BigInt),
        Column::new("MAX_CLIENT_RTT", ColumnType::BigInt),
        Column::new("AVG_CLUSTER_RTT", ColumnType::BigInt),
        Column::new("MIN_CLUSTER_RTT", ColumnType::BigInt),
        Column::new("MAX_CLUSTER_RTT", ColumnType::BigInt),
    ]
}

fn histogram_schema(bucket_count: usize) -> Vec<Column> {
    let mut columns = vec![
        Column::new("TIMESTAMP", ColumnType::Timestamp),
        Column::new("HOSTNAME", ColumnType::String),
        Column::new("CONNECTION_ID", ColumnType::BigInt),
        Column::new("PROCEDURE", ColumnType::String),
        Column::new("BUCKET_WIDTH_MS", ColumnType::Integer),
    ];
    for i in 0..bucket_count {
        columns.push(Column::new(format!("BUCKET_{}", i), ColumnType::BigInt));
    }
    columns
}
