//! Contains the `Error` and `Result` types that `gridlink` uses.

use std::sync::Arc;

use thiserror::Error;

use crate::wire::ClusterIdentity;

/// The result type for all methods that can return an error in the `gridlink`
/// crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `gridlink` crate. The inner
/// [`ErrorKind`] is boxed to keep the type small on the happy path; I/O
/// sources are reference-counted so the error stays `Clone`.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn authentication_error(reason: impl Into<String>) -> Error {
        ErrorKind::Authentication {
            message: reason.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    /// Whether this error was caused by the pool being empty.
    pub fn is_no_connections(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::NoConnections)
    }

    /// Whether this error was caused by a cluster identity mismatch.
    pub fn is_cluster_identity_mismatch(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ClusterIdentityMismatch { .. })
    }

    /// Whether this error originated in the authentication handshake.
    pub fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    /// Whether this error is a network error.
    pub fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self {
            kind: Box::new(err.into()),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The server rejected the login handshake.
    #[error("authentication failed: {message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// An invocation was queued while the pool contained no connections.
    #[error("no connections")]
    NoConnections,

    /// A connection presented a cluster identity that disagrees with the one
    /// captured from the first connection.
    #[error(
        "cluster identity mismatch: pool is bound to {expected}, server presented {actual}"
    )]
    #[non_exhaustive]
    ClusterIdentityMismatch {
        expected: ClusterIdentity,
        actual: ClusterIdentity,
    },

    /// The hostname could not be resolved.
    #[error("unknown host: {message}")]
    #[non_exhaustive]
    UnknownHost { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server returned a frame that could not be decoded.
    #[error("invalid response from server: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// An invocation could not be serialized.
    #[error("serialization failed: {message}")]
    #[non_exhaustive]
    Serialization { message: String },

    #[error("internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// A method was called on a distributor that was shut down.
    #[error("distributor has been shut down")]
    Shutdown,
}
