#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]

mod distributor;
pub mod error;
pub mod event;
mod options;
pub(crate) mod reactor;
pub mod table;
#[cfg(test)]
pub(crate) mod test_util;
pub mod wire;

pub use crate::{
    distributor::{ConnectionInfo, Distributor, StatsSink},
    options::DistributorOptions,
    table::{Column, ColumnType, Table, Value},
    wire::{
        hash_password,
        ClusterIdentity,
        Invocation,
        Response,
        ResponseStatus,
        HEARTBEAT_HANDLE,
        HEARTBEAT_PROCEDURE,
    },
};

/// A boxed future.
pub(crate) type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Completion callback invoked with the response to a queued invocation.
///
/// Callbacks run on the reactor's delivery threads (or on the reaper task for
/// synthesized timeout responses) and are invoked exactly once per accepted
/// invocation. A panic raised by a callback is caught and reported through
/// [`event::StatusListener::uncaught_exception`]; it never crosses back into
/// the transport.
pub type ProcedureCallback = Box<dyn FnOnce(Response) + Send>;
