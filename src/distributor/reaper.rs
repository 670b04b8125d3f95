use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use tokio::sync::oneshot;

use super::Shared;

const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Periodic task that enforces liveness: sends heartbeats on idle
/// connections, closes connections whose heartbeat went unanswered, and
/// completes calls whose deadline elapsed.
///
/// Owns no long-term state. Holds only a weak reference to the shared state,
/// so an abandoned distributor lets it wind down on its own.
pub(crate) struct Reaper {
    shared: Weak<Shared>,
    stop: oneshot::Receiver<()>,
}

impl Reaper {
    pub(crate) fn start(shared: &Arc<Shared>) -> TaskHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let reaper = Self {
            shared: Arc::downgrade(shared),
            stop: stop_rx,
        };
        let join = tokio::spawn(reaper.execute());
        TaskHandle {
            stop: stop_tx,
            join,
        }
    }

    async fn execute(mut self) {
        let mut tick = tokio::time::interval(REAPER_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut self.stop => break,
                _ = tick.tick() => {
                    let Some(shared) = self.shared.upgrade() else { break };
                    // Snapshot under the pool lock, walk with it released:
                    // expire() takes each connection's own lock.
                    let connections = shared.pool.lock().unwrap().connections.clone();
                    let now = Instant::now();
                    for connection in connections {
                        connection.expire(now);
                    }
                }
            }
        }
    }
}

/// Stop handle for a background task: signal it, then wait for it to finish.
pub(crate) struct TaskHandle {
    stop: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl TaskHandle {
    pub(crate) fn new(stop: oneshot::Sender<()>, join: tokio::task::JoinHandle<()>) -> Self {
        Self { stop, join }
    }

    pub(crate) async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.join.await;
    }
}
