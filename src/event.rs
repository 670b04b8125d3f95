//! Contains the types for monitoring the health of a
//! [`Distributor`](crate::Distributor)'s connections.

use std::any::Any;

use crate::wire::Response;

/// The reasons a connection may be torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectCause {
    /// The socket was closed, either by the peer or by shutdown.
    Closed,

    /// A heartbeat went unanswered past the connection-response timeout.
    Timeout,
}

/// Callback surface through which a [`Distributor`](crate::Distributor)
/// reports conditions the embedding application should know about.
///
/// All methods have no-op default implementations; implement the ones of
/// interest and register the listener with
/// [`Distributor::add_listener`](crate::Distributor::add_listener).
///
/// Listeners are invoked on the transport's internal threads, in some cases
/// while transport locks are held: a listener must return promptly and must
/// not call back into the `Distributor`.
#[allow(unused_variables)]
pub trait StatusListener: Send + Sync {
    /// A connection was lost. `connections_left` is the pool size after the
    /// loss.
    fn connection_lost(
        &self,
        hostname: &str,
        port: u16,
        connections_left: usize,
        cause: DisconnectCause,
    ) {
    }

    /// Backpressure changed. `on = true` is reported when an invocation could
    /// not be queued because every connection's write queue was over its
    /// high-water mark; `on = false` is reported once the draining queue
    /// falls back below it.
    fn backpressure(&self, on: bool) {}

    /// A response arrived for an invocation that no longer has a bookkeeping
    /// entry, because its deadline already elapsed or its connection was torn
    /// down. The original callback is not invoked.
    fn late_procedure_response(&self, response: &Response, hostname: &str, port: u16) {}

    /// A completion callback panicked. The panic payload is the value the
    /// callback panicked with; `response` is the response it was invoked
    /// with.
    fn uncaught_exception(&self, response: &Response, panic: &(dyn Any + Send)) {}
}
