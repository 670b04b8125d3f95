use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
        Mutex,
        Weak,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::{debug, warn};

use super::{
    stats::{InvocationCounters, ProcedureStats, ProcedureSummary},
    ConnectionInfo,
    Shared,
};
use crate::{
    error::{Error, Result},
    event::DisconnectCause,
    reactor::{ConnectionHandler, EstablishedConnection, NetworkConnection},
    wire::{self, Invocation, Response, ResponseStatus, HEARTBEAT_HANDLE},
    ProcedureCallback,
};

/// One in-flight invocation: when it was submitted, who to tell, and which
/// procedure it named.
struct CallBookkeeping {
    since: Instant,
    callback: ProcedureCallback,
    procedure: String,
}

struct ConnectionState {
    /// True between `attach` and `stopping`. `create_work` is legal only
    /// while set.
    connected: bool,
    /// Set once `stopping` has run; the connection never leaves this state.
    stopped: bool,
    channel: Option<NetworkConnection>,
    host_id: i32,
    connection_id: i64,
    last_response: Instant,
    outstanding_ping: bool,
    close_cause: Option<DisconnectCause>,
    calls: HashMap<i64, CallBookkeeping>,
    queued_bytes: usize,
    stats: HashMap<String, ProcedureStats>,
}

/// One cluster endpoint: the bookkeeping table for its in-flight calls, its
/// heartbeat state, its write-queue accounting, and its per-procedure
/// statistics.
///
/// Lock discipline: the state mutex here is the connection lock. It may be
/// held while taking the pool lock (`stopping`, backpressure-off), never the
/// other way around. Completion callbacks are always invoked with no lock
/// held. The backpressure flag and outstanding-callback counter are atomics
/// so the dispatch path can scan connections under the pool lock alone.
pub(crate) struct NodeConnection {
    shared: Weak<Shared>,
    hostname: String,
    port: u16,
    outstanding: AtomicU64,
    backpressure: AtomicBool,
    state: Mutex<ConnectionState>,
}

impl NodeConnection {
    pub(crate) fn new(shared: Weak<Shared>, hostname: String, port: u16) -> Arc<Self> {
        Arc::new(Self {
            shared,
            hostname,
            port,
            outstanding: AtomicU64::new(0),
            backpressure: AtomicBool::new(false),
            state: Mutex::new(ConnectionState {
                connected: false,
                stopped: false,
                channel: None,
                host_id: -1,
                connection_id: -1,
                last_response: Instant::now(),
                outstanding_ping: false,
                close_cause: None,
                calls: HashMap::new(),
                queued_bytes: 0,
                stats: HashMap::new(),
            }),
        })
    }

    /// Binds the connection to its registered socket. Fails if the socket
    /// already died between registration and here.
    pub(crate) fn attach(&self, established: EstablishedConnection) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return Err(Error::internal("connection closed during registration"));
        }
        state.connected = true;
        state.channel = Some(established.channel);
        state.host_id = established.info.host_id;
        state.connection_id = established.info.connection_id;
        state.last_response = Instant::now();
        Ok(())
    }

    pub(crate) fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Callbacks accepted but not yet run to completion.
    pub(crate) fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Whether the write queue is over its high-water mark. Readable without
    /// the connection lock.
    pub(crate) fn has_backpressure(&self) -> bool {
        self.backpressure.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn set_backpressure_for_test(&self, on: bool) {
        self.backpressure.store(on, Ordering::SeqCst);
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        let state = self.state.lock().unwrap();
        ConnectionInfo {
            hostname: self.hostname.clone(),
            port: self.port,
            server_host_id: state.host_id,
            connection_id: state.connection_id,
            outstanding: self.outstanding(),
        }
    }

    /// Records the invocation under `handle` and enqueues its frame.
    ///
    /// If the connection is no longer connected, the callback is invoked
    /// synchronously with a `ConnectionLost` response instead. `handle` must
    /// not be the reserved heartbeat handle and must not already be in
    /// flight on this connection.
    pub(crate) fn create_work(
        &self,
        handle: i64,
        procedure: &str,
        frame: Bytes,
        callback: ProcedureCallback,
    ) {
        debug_assert_ne!(handle, HEARTBEAT_HANDLE);
        let frame_len = frame.len();
        let channel = {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                drop(state);
                let response = Response::synthesized(
                    handle,
                    ResponseStatus::ConnectionLost,
                    format!("connection to {}:{} was lost", self.hostname, self.port),
                    Duration::ZERO,
                );
                self.fire_callback(callback, response);
                return;
            }
            debug_assert!(
                !state.calls.contains_key(&handle),
                "client handle {} reused while in flight",
                handle
            );
            state.calls.insert(
                handle,
                CallBookkeeping {
                    since: Instant::now(),
                    callback,
                    procedure: procedure.to_string(),
                },
            );
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            state.channel.clone()
        };
        if let Some(channel) = channel {
            // Enqueue outside the connection lock. If the writer is already
            // gone, stopping() is in flight and will complete the entry.
            if channel.enqueue(frame).is_ok() {
                self.queue_write(frame_len);
            }
        }
    }

    /// Probes liveness with the internal heartbeat procedure. No bookkeeping
    /// entry is created; the inbound path recognizes the reserved handle.
    pub(crate) fn send_heartbeat(&self) {
        let frame = match wire::invocation::encode(&Invocation::heartbeat()) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        let frame_len = frame.len();
        let channel = {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return;
            }
            state.outstanding_ping = true;
            state.channel.clone()
        };
        if let Some(channel) = channel {
            if channel.enqueue(frame).is_ok() {
                self.queue_write(frame_len);
            }
        }
    }

    /// Write-queue accounting, invoked after a frame is enqueued. Returns
    /// true once the accumulator is over the high-water mark.
    fn queue_write(&self, bytes: usize) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = self.state.lock().unwrap();
        state.queued_bytes += bytes;
        let over = state.queued_bytes > shared.options.backpressure_high_water;
        if over {
            self.backpressure.store(true, Ordering::SeqCst);
        }
        over
    }

    /// The reaper's per-tick walk: heartbeat the connection if it has gone
    /// quiet, close it if a heartbeat went unanswered too long, and complete
    /// every call whose deadline elapsed with a synthetic timeout response.
    pub(crate) fn expire(&self, now: Instant) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let response_timeout = shared.options.connection_response_timeout;
        let call_timeout = shared.options.procedure_call_timeout;

        enum Liveness {
            Fine,
            SendHeartbeat,
            Close(Option<NetworkConnection>),
        }

        let mut expired = Vec::new();
        let liveness = {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return;
            }

            let idle = now.saturating_duration_since(state.last_response);
            let liveness = if state.outstanding_ping && idle > response_timeout {
                state.close_cause = Some(DisconnectCause::Timeout);
                Liveness::Close(state.channel.clone())
            } else if !state.outstanding_ping && idle > response_timeout / 3 {
                Liveness::SendHeartbeat
            } else {
                Liveness::Fine
            };

            let deadline_elapsed: Vec<i64> = state
                .calls
                .iter()
                .filter(|(_, call)| now.saturating_duration_since(call.since) > call_timeout)
                .map(|(handle, _)| *handle)
                .collect();
            for handle in deadline_elapsed {
                if let Some(call) = state.calls.remove(&handle) {
                    let elapsed = now.saturating_duration_since(call.since);
                    Self::stats_entry(&mut state, &shared, &call.procedure).record(
                        elapsed, elapsed, false, true,
                    );
                    expired.push((handle, call, elapsed));
                }
            }
            liveness
        };

        match liveness {
            Liveness::Fine => {}
            Liveness::SendHeartbeat => self.send_heartbeat(),
            Liveness::Close(channel) => {
                warn!(
                    hostname = %self.hostname,
                    port = self.port,
                    "heartbeat unanswered past the connection-response timeout, closing"
                );
                if let Some(channel) = channel {
                    channel.unregister();
                }
            }
        }

        let timeout_ms = shared.options.procedure_call_timeout.as_millis();
        for (handle, call, elapsed) in expired {
            debug!(
                handle,
                procedure = %call.procedure,
                "completing expired invocation with a timeout response"
            );
            let response = Response::synthesized(
                handle,
                ResponseStatus::ConnectionTimeout,
                format!("no response received in {} ms", timeout_ms),
                elapsed,
            );
            self.complete(call.callback, response);
        }
    }

    fn stats_entry<'a>(
        state: &'a mut ConnectionState,
        shared: &Shared,
        procedure: &str,
    ) -> &'a mut ProcedureStats {
        state
            .stats
            .entry(procedure.to_string())
            .or_insert_with(|| {
                ProcedureStats::new(
                    shared.options.latency_bucket_count,
                    shared.options.latency_bucket_width,
                )
            })
    }

    /// Invokes `callback`, containing any panic it raises, and retires its
    /// slot in the outstanding-callback counter.
    fn complete(&self, callback: ProcedureCallback, response: Response) {
        self.fire_callback(callback, response);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    fn fire_callback(&self, callback: ProcedureCallback, response: Response) {
        let snapshot = response.clone();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(move || callback(response))) {
            warn!(
                handle = snapshot.client_handle(),
                "completion callback panicked"
            );
            if let Some(shared) = self.shared.upgrade() {
                shared.notify_listeners(|l| l.uncaught_exception(&snapshot, panic.as_ref()));
            }
        }
    }

    // Statistics assembly hooks. Each takes the connection lock briefly and
    // returns plain data for the facade to tabulate.

    pub(crate) fn connection_summary(&self, interval: bool) -> (ConnectionInfo, InvocationCounters) {
        let mut state = self.state.lock().unwrap();
        let mut counters = InvocationCounters::default();
        for stats in state.stats.values_mut() {
            counters.accumulate(stats.connection_delta(interval));
        }
        let info = ConnectionInfo {
            hostname: self.hostname.clone(),
            port: self.port,
            server_host_id: state.host_id,
            connection_id: state.connection_id,
            outstanding: self.outstanding(),
        };
        (info, counters)
    }

    pub(crate) fn procedure_summaries(
        &self,
        interval: bool,
    ) -> (i64, Vec<(String, ProcedureSummary)>) {
        let mut state = self.state.lock().unwrap();
        let connection_id = state.connection_id;
        let mut rows: Vec<(String, ProcedureSummary)> = state
            .stats
            .iter_mut()
            .map(|(name, stats)| (name.clone(), stats.procedure_summary(interval)))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        (connection_id, rows)
    }

    pub(crate) fn histograms(
        &self,
        client: bool,
        interval: bool,
    ) -> (i64, Vec<(String, u64, Vec<u64>)>) {
        let mut state = self.state.lock().unwrap();
        let connection_id = state.connection_id;
        let mut rows: Vec<(String, u64, Vec<u64>)> = state
            .stats
            .iter_mut()
            .map(|(name, stats)| {
                let width = stats.bucket_width_ms();
                (name.clone(), width, stats.histogram(client, interval))
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        (connection_id, rows)
    }
}

impl ConnectionHandler for NodeConnection {
    fn handle_frame(&self, body: Bytes) {
        let mut response = match Response::decode(body) {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    hostname = %self.hostname,
                    error = %e,
                    "dropping undecodable frame"
                );
                return;
            }
        };
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let now = Instant::now();

        enum Inbound {
            Heartbeat,
            Late,
            Deliver(ProcedureCallback, Duration),
        }

        let inbound = {
            let mut state = self.state.lock().unwrap();
            state.last_response = now;
            if response.client_handle() == HEARTBEAT_HANDLE {
                state.outstanding_ping = false;
                Inbound::Heartbeat
            } else {
                match state.calls.remove(&response.client_handle()) {
                    None => Inbound::Late,
                    Some(call) => {
                        let client_rtt = now.saturating_duration_since(call.since);
                        let abort = response.status().is_abort();
                        let error = !abort && response.status() != ResponseStatus::Success;
                        Self::stats_entry(&mut state, &shared, &call.procedure).record(
                            client_rtt,
                            response.cluster_round_trip(),
                            abort,
                            error,
                        );
                        Inbound::Deliver(call.callback, client_rtt)
                    }
                }
            }
        };

        match inbound {
            Inbound::Heartbeat => {}
            Inbound::Late => {
                debug!(
                    handle = response.client_handle(),
                    hostname = %self.hostname,
                    "response arrived for a call that is no longer in flight"
                );
                shared.notify_listeners(|l| {
                    l.late_procedure_response(&response, &self.hostname, self.port)
                });
            }
            Inbound::Deliver(callback, client_rtt) => {
                response.set_client_round_trip(client_rtt);
                self.complete(callback, response);
            }
        }
    }

    fn drained(&self, bytes: usize) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        state.queued_bytes = state.queued_bytes.saturating_sub(bytes);
        if self.has_backpressure() && state.queued_bytes <= shared.options.backpressure_high_water
        {
            // The pool lock is held across the notification so a concurrent
            // dispatch cannot observe the queue as full after listeners were
            // told it drained.
            let listeners = shared.listeners_snapshot();
            let _pool = shared.pool.lock().unwrap();
            self.backpressure.store(false, Ordering::SeqCst);
            for listener in &listeners {
                listener.backpressure(false);
            }
        }
    }

    fn stopping(&self) {
        let (stranded, cause, was_pooled, remaining) = {
            let mut state = self.state.lock().unwrap();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.connected = false;
            state.channel = None;
            state.outstanding_ping = false;
            let cause = state.close_cause.take().unwrap_or(DisconnectCause::Closed);
            let stranded: Vec<(i64, CallBookkeeping)> = state.calls.drain().collect();
            // The pool lock nests inside the connection lock here, as it does
            // in drained(); those are the only two compounded acquisitions,
            // and both nest in this direction.
            let (was_pooled, remaining) = match self.shared.upgrade() {
                Some(shared) => {
                    let mut pool = shared.pool.lock().unwrap();
                    let before = pool.connections.len();
                    pool.connections
                        .retain(|c| !std::ptr::eq(Arc::as_ptr(c), self as *const _));
                    (pool.connections.len() < before, pool.connections.len())
                }
                None => (false, 0),
            };
            (stranded, cause, was_pooled, remaining)
        };

        self.backpressure.store(false, Ordering::SeqCst);
        if was_pooled {
            debug!(
                hostname = %self.hostname,
                port = self.port,
                ?cause,
                stranded = stranded.len(),
                "connection lost"
            );
            if let Some(shared) = self.shared.upgrade() {
                shared.notify_listeners(|l| {
                    l.connection_lost(&self.hostname, self.port, remaining, cause)
                });
            }
        }
        for (handle, call) in stranded {
            let response = Response::synthesized(
                handle,
                ResponseStatus::ConnectionLost,
                format!("connection to {}:{} was lost", self.hostname, self.port),
                Duration::ZERO,
            );
            self.complete(call.callback, response);
        }
    }
}
