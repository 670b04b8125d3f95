//! Shared test fixtures: a scripted reactor and listener/callback plumbing.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use bytes::{Buf, Bytes};
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::Result,
    event::{DisconnectCause, StatusListener},
    reactor::{
        ConnectionHandler,
        EstablishedConnection,
        IoCounters,
        IoRegistry,
        IoStats,
        NetworkConnection,
        Reactor,
    },
    wire::{
        hash_password,
        invocation,
        ClusterIdentity,
        ConnectInfo,
        Invocation,
        LoginRequest,
        Response,
        FRAME_HEADER_LEN,
        HEARTBEAT_HANDLE,
    },
    BoxFuture,
    Distributor,
    DistributorOptions,
};

/// A reactor whose connections terminate in the test instead of a socket.
///
/// By default every `connect` succeeds with a scripted (or generated) login
/// result, enqueued frames are considered written immediately, and nothing
/// responds. Tests flip `auto_respond` to answer every invocation with an
/// empty success response, or `hold_writes` to park frames in the write
/// queue until [`MockConnection::release_held`].
pub(crate) struct MockReactor {
    state: Mutex<MockState>,
    auto_respond: Arc<AtomicBool>,
    hold_writes: Arc<AtomicBool>,
    next_connection_id: AtomicI64,
    registry: Arc<IoRegistry>,
}

struct MockState {
    scripted: VecDeque<Result<ConnectInfo>>,
    connections: Vec<Arc<MockConnection>>,
}

pub(crate) const MOCK_CLUSTER: ClusterIdentity = ClusterIdentity {
    timestamp: 1_000,
    leader_address: 0xAABB,
};

impl MockReactor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                scripted: VecDeque::new(),
                connections: Vec::new(),
            }),
            auto_respond: Arc::new(AtomicBool::new(false)),
            hold_writes: Arc::new(AtomicBool::new(false)),
            next_connection_id: AtomicI64::new(0),
            registry: Arc::new(IoRegistry::default()),
        })
    }

    pub(crate) fn script_connect(&self, info: ConnectInfo) {
        self.state.lock().unwrap().scripted.push_back(Ok(info));
    }

    pub(crate) fn set_auto_respond(&self, on: bool) {
        self.auto_respond.store(on, Ordering::SeqCst);
    }

    pub(crate) fn set_hold_writes(&self, on: bool) {
        self.hold_writes.store(on, Ordering::SeqCst);
    }

    pub(crate) fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.state.lock().unwrap().connections[index].clone()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    pub(crate) fn total_sent(&self) -> usize {
        let connections = self.state.lock().unwrap().connections.clone();
        connections.iter().map(|c| c.sent_count()).sum()
    }

    /// Spins (in virtual time) until the pump tasks have seen `n` frames.
    pub(crate) async fn wait_for_sent(&self, n: usize) {
        while self.total_sent() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn default_info(&self) -> ConnectInfo {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        ConnectInfo {
            host_id: i32::try_from(id).unwrap_or(i32::MAX),
            connection_id: id,
            cluster: MOCK_CLUSTER,
            build_string: "mock-build".to_string(),
        }
    }
}

impl Reactor for MockReactor {
    fn connect<'a>(
        &'a self,
        hostname: &'a str,
        _port: u16,
        _login: &'a LoginRequest,
        handler: Arc<dyn ConnectionHandler>,
    ) -> BoxFuture<'a, Result<EstablishedConnection>> {
        let result = (|| {
            let scripted = self.state.lock().unwrap().scripted.pop_front();
            let info = match scripted {
                Some(Ok(info)) => info,
                Some(Err(e)) => return Err(e),
                None => self.default_info(),
            };
            let counters = self
                .registry
                .register(info.connection_id, hostname.to_string());
            let cancel = CancellationToken::new();
            let (sender, receiver) = mpsc::unbounded_channel();
            let connection = Arc::new(MockConnection {
                handler,
                info: info.clone(),
                counters,
                cancel: cancel.clone(),
                held: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
                auto_respond: self.auto_respond.clone(),
                hold_writes: self.hold_writes.clone(),
            });
            self.state
                .lock()
                .unwrap()
                .connections
                .push(connection.clone());
            tokio::spawn(pump(connection, receiver, self.registry.clone()));
            Ok(EstablishedConnection {
                info,
                channel: NetworkConnection::new(sender, cancel),
            })
        })();
        async move { result }.boxed()
    }

    fn io_stats(&self, interval: bool) -> std::collections::HashMap<i64, IoStats> {
        self.registry.snapshot(interval)
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        let connections = self.state.lock().unwrap().connections.clone();
        async move {
            for connection in connections {
                connection.cancel.cancel();
            }
        }
        .boxed()
    }
}

/// One registered mock connection: what was sent through it, and knobs for
/// driving the other side.
pub(crate) struct MockConnection {
    handler: Arc<dyn ConnectionHandler>,
    pub(crate) info: ConnectInfo,
    counters: Arc<IoCounters>,
    cancel: CancellationToken,
    held: Mutex<VecDeque<Bytes>>,
    sent: Mutex<Vec<Invocation>>,
    auto_respond: Arc<AtomicBool>,
    hold_writes: Arc<AtomicBool>,
}

impl MockConnection {
    /// Invocations the pump has consumed from the write queue, in order.
    pub(crate) fn sent_invocations(&self) -> Vec<Invocation> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Frames parked by `hold_writes`, not yet considered written.
    pub(crate) fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Delivers a response frame to the connection's handler, as the reactor
    /// would after de-framing.
    pub(crate) fn deliver(&self, response: &Response) {
        let mut frame = response.encode().unwrap();
        self.counters.record_read(frame.len());
        frame.advance(FRAME_HEADER_LEN);
        self.handler.handle_frame(frame);
    }

    pub(crate) fn respond_success(&self, handle: i64) {
        self.deliver(&Response::test_success(handle, Duration::from_millis(1)));
    }

    pub(crate) fn respond_heartbeat(&self) {
        self.deliver(&Response::test_success(
            HEARTBEAT_HANDLE,
            Duration::from_millis(1),
        ));
    }

    /// Marks every held frame as written, as a draining socket would.
    pub(crate) fn release_held(&self) {
        self.hold_writes.store(false, Ordering::SeqCst);
        let frames: Vec<Bytes> = self.held.lock().unwrap().drain(..).collect();
        for frame in frames {
            self.written(frame);
        }
    }

    /// Tears the connection down, as a closed socket would.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    fn written(&self, mut frame: Bytes) {
        let len = frame.len();
        self.counters.record_write(len);
        frame.advance(FRAME_HEADER_LEN);
        if let Ok(sent) = invocation::decode(frame) {
            let auto = self.auto_respond.load(Ordering::SeqCst);
            let handle = sent.client_handle();
            self.sent.lock().unwrap().push(sent);
            self.handler.drained(len);
            if auto {
                self.deliver(&Response::test_success(handle, Duration::from_millis(1)));
            }
        } else {
            self.handler.drained(len);
        }
    }
}

async fn pump(
    connection: Arc<MockConnection>,
    mut receiver: mpsc::UnboundedReceiver<Bytes>,
    registry: Arc<IoRegistry>,
) {
    loop {
        tokio::select! {
            _ = connection.cancel.cancelled() => break,
            frame = receiver.recv() => {
                let Some(frame) = frame else { break };
                if connection.hold_writes.load(Ordering::SeqCst) {
                    connection.held.lock().unwrap().push_back(frame);
                } else {
                    connection.written(frame);
                }
            }
        }
    }
    connection.cancel.cancel();
    connection.handler.stopping();
    registry.deregister(connection.info.connection_id);
}

/// Builds a distributor over a mock reactor with `connections` pooled
/// connections.
pub(crate) async fn mock_distributor(
    options: DistributorOptions,
    connections: usize,
) -> (Distributor, Arc<MockReactor>) {
    let mock = MockReactor::new();
    let distributor = Distributor::with_reactor(options, mock.clone());
    for _ in 0..connections {
        distributor
            .create_connection("node", "tester", &hash_password("sekrit"), 21212)
            .await
            .unwrap();
    }
    (distributor, mock)
}

/// What a [`RecordingListener`] saw.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ListenerEvent {
    ConnectionLost {
        hostname: String,
        port: u16,
        remaining: usize,
        cause: DisconnectCause,
    },
    Backpressure(bool),
    LateResponse(i64),
    UncaughtException(i64),
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, matcher: impl Fn(&ListenerEvent) -> bool) -> usize {
        self.events().iter().filter(|e| matcher(e)).count()
    }
}

impl StatusListener for RecordingListener {
    fn connection_lost(
        &self,
        hostname: &str,
        port: u16,
        connections_left: usize,
        cause: DisconnectCause,
    ) {
        self.events.lock().unwrap().push(ListenerEvent::ConnectionLost {
            hostname: hostname.to_string(),
            port,
            remaining: connections_left,
            cause,
        });
    }

    fn backpressure(&self, on: bool) {
        self.events
            .lock()
            .unwrap()
            .push(ListenerEvent::Backpressure(on));
    }

    fn late_procedure_response(&self, response: &Response, _hostname: &str, _port: u16) {
        self.events
            .lock()
            .unwrap()
            .push(ListenerEvent::LateResponse(response.client_handle()));
    }

    fn uncaught_exception(&self, response: &Response, _panic: &(dyn std::any::Any + Send)) {
        self.events
            .lock()
            .unwrap()
            .push(ListenerEvent::UncaughtException(response.client_handle()));
    }
}
