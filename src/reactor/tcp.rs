use std::{collections::HashMap, sync::Arc, sync::Mutex, time::Duration};

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    ConnectionHandler,
    EstablishedConnection,
    IoCounters,
    IoRegistry,
    IoStats,
    NetworkConnection,
    Reactor,
};
use crate::{
    error::{Error, ErrorKind, Result},
    wire::{ConnectInfo, FrameHeader, LoginRequest, FRAME_HEADER_LEN},
    BoxFuture,
};

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The production reactor: a dedicated multi-thread runtime whose tasks own
/// the sockets. Each connection runs one reader task (de-framing inbound
/// bytes) and one writer task (draining the write queue), joined by a
/// cancellation token for ordered teardown.
pub(crate) struct TcpReactor {
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    handle: tokio::runtime::Handle,
    registry: Arc<IoRegistry>,
}

impl TcpReactor {
    pub(crate) fn new(threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("gridlink-reactor")
            .enable_io()
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            registry: Arc::new(IoRegistry::default()),
        })
    }
}

impl Drop for TcpReactor {
    fn drop(&mut self) {
        // A plain Runtime drop panics inside async contexts; background
        // shutdown is legal anywhere.
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_background();
        }
    }
}

impl Reactor for TcpReactor {
    fn connect<'a>(
        &'a self,
        hostname: &'a str,
        port: u16,
        login: &'a LoginRequest,
        handler: Arc<dyn ConnectionHandler>,
    ) -> BoxFuture<'a, Result<EstablishedConnection>> {
        let hostname = hostname.to_string();
        let login = login.clone();
        let registry = self.registry.clone();
        // Establish on the reactor runtime so the socket is driven by the
        // reactor's threads for its whole life.
        let task = self
            .handle
            .spawn(establish(hostname, port, login, handler, registry));
        async move {
            task.await
                .map_err(|e| Error::internal(format!("reactor task terminated: {}", e)))?
        }
        .boxed()
    }

    fn io_stats(&self, interval: bool) -> HashMap<i64, IoStats> {
        self.registry.snapshot(interval)
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        async move {
            if let Some(runtime) = self.runtime.lock().unwrap().take() {
                // Closes every socket owned by the reader/writer tasks and
                // releases their buffers; safe to call from async context.
                runtime.shutdown_background();
            }
        }
        .boxed()
    }
}

async fn establish(
    hostname: String,
    port: u16,
    login: LoginRequest,
    handler: Arc<dyn ConnectionHandler>,
    registry: Arc<IoRegistry>,
) -> Result<EstablishedConnection> {
    let addrs: Vec<_> = tokio::net::lookup_host((hostname.as_str(), port))
        .await
        .map_err(|e| {
            Error::from(ErrorKind::UnknownHost {
                message: format!("{}: {}", hostname, e),
            })
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ErrorKind::UnknownHost {
            message: format!("{}: no addresses resolved", hostname),
        }
        .into());
    }

    let mut stream = None;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let mut stream = match (stream, last_err) {
        (Some(s), _) => s,
        (None, Some(e)) => return Err(e.into()),
        (None, None) => unreachable!("addrs is non-empty"),
    };
    stream.set_nodelay(true)?;

    let info = tokio::time::timeout(LOGIN_TIMEOUT, run_login(&mut stream, &login))
        .await
        .map_err(|_| Error::from(std::io::ErrorKind::TimedOut))??;

    let counters = registry.register(info.connection_id, hostname.clone());
    let cancel = CancellationToken::new();
    let (sender, receiver) = mpsc::unbounded_channel();
    let (read_half, write_half) = stream.into_split();

    tokio::spawn(read_loop(
        read_half,
        handler.clone(),
        counters.clone(),
        cancel.clone(),
        registry,
        info.connection_id,
    ));
    tokio::spawn(write_loop(write_half, receiver, handler, counters, cancel.clone()));

    Ok(EstablishedConnection {
        info,
        channel: NetworkConnection::new(sender, cancel),
    })
}

async fn run_login(stream: &mut TcpStream, login: &LoginRequest) -> Result<ConnectInfo> {
    stream.write_all(&login.encode()?).await?;
    let header = FrameHeader::read_from(stream).await?;
    let mut body = vec![0u8; header.body_len()];
    stream.read_exact(&mut body).await?;
    ConnectInfo::decode(Bytes::from(body))
}

/// De-frames inbound bytes and delivers bodies to the handler. Owns the
/// teardown notification: whichever way the connection dies, this task calls
/// `stopping` exactly once on its way out.
async fn read_loop(
    mut read_half: OwnedReadHalf,
    handler: Arc<dyn ConnectionHandler>,
    counters: Arc<IoCounters>,
    cancel: CancellationToken,
    registry: Arc<IoRegistry>,
    connection_id: i64,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            header = FrameHeader::read_from(&mut read_half) => {
                let header = match header {
                    Ok(header) => header,
                    Err(e) => {
                        debug!(error = %e, "connection read ended");
                        break;
                    }
                };
                let mut body = vec![0u8; header.body_len()];
                if let Err(e) = read_half.read_exact(&mut body).await {
                    debug!(error = %e, "connection read ended mid-frame");
                    break;
                }
                counters.record_read(FRAME_HEADER_LEN + body.len());
                handler.handle_frame(Bytes::from(body));
            }
        }
    }
    cancel.cancel();
    handler.stopping();
    registry.deregister(connection_id);
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<Bytes>,
    handler: Arc<dyn ConnectionHandler>,
    counters: Arc<IoCounters>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = receiver.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!(error = %e, "connection write failed");
                    break;
                }
                counters.record_write(frame.len());
                handler.drained(frame.len());
            }
        }
    }
    cancel.cancel();
}
