//! Error types for taskrelay operations.
//!
//! Errors are split along the lines the dispatch fabric cares about:
//!
//! - [`StoreError`] - the shared key/value engine failed. Always propagated,
//!   never retried inside the store client.
//! - [`TransportError`] - the RPC transport failed in a way the client's own
//!   retry loop could not absorb (bind failures, protocol violations).
//! - [`Error`] - the crate-level error that wraps both and adds the
//!   business-layer conditions (unknown task id, rejected state transition).
//!
//! A task that fails while executing is *not* an error here: it is a
//! terminal `FAILED` record with an exception payload.

use std::fmt;

use crate::task::TaskStatus;

/// Crate-level result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur during taskrelay operations.
///
/// # Examples
///
/// ```
/// use taskrelay::Error;
///
/// let err = Error::UnknownTask { task_id: "t-1".to_string() };
/// assert!(err.to_string().contains("t-1"));
/// assert!(!err.is_infrastructure());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The store could not be reached or rejected a command.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The RPC transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No record (or no required field) exists for this task id. Covers
    /// expired records: callers cannot tell "never existed" from "expired".
    #[error("unknown task id: {task_id}")]
    UnknownTask {
        /// The task id that could not be resolved.
        task_id: String,
    },

    /// A task group lookup found no owning user.
    #[error("unknown task group: {group_id}")]
    UnknownGroup {
        /// The group id that could not be resolved.
        group_id: String,
    },

    /// Attempted a status transition the state machine does not allow.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        /// The task being transitioned.
        task_id: String,
        /// Current status.
        from: TaskStatus,
        /// Rejected target status.
        to: TaskStatus,
    },

    /// Attempted to mutate a record that already reached SUCCESS or FAILED.
    #[error("task {task_id} is terminal ({status}) and cannot be modified")]
    TerminalState {
        /// The task id.
        task_id: String,
        /// The terminal status it holds.
        status: TaskStatus,
    },

    /// A stored field could not be decoded.
    #[error("malformed field {field} on {key}: {message}")]
    MalformedField {
        /// The store key.
        key: String,
        /// The hash field.
        field: String,
        /// What was wrong with it.
        message: String,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` for infrastructure failures (store or transport), as
    /// opposed to business-layer outcomes like an unknown task id.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Transport(_))
    }

    pub(crate) fn unknown_task(task_id: impl Into<String>) -> Self {
        Self::UnknownTask {
            task_id: task_id.into(),
        }
    }
}

/// Errors raised by a [`Store`](crate::store::Store) implementation.
///
/// These are low-level failures from the key/value engine. They are never
/// retried inside the store client; the calling operation fails with them.
#[derive(Debug)]
pub enum StoreError {
    /// The engine could not be reached, or the connection dropped.
    Connection {
        /// Human-readable description.
        message: String,
        /// Underlying cause, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A command was issued against a key holding a different data type.
    WrongType {
        /// The offending key.
        key: String,
    },

    /// The engine returned a reply the client could not interpret.
    Protocol {
        /// Human-readable description.
        message: String,
    },

    /// Any other backend failure.
    Backend {
        /// Human-readable description.
        message: String,
        /// Underlying cause, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    /// Returns `true` if the engine itself is unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection { message, .. } => write!(f, "store connection error: {message}"),
            Self::WrongType { key } => {
                write!(f, "operation against a key holding the wrong kind of value: {key}")
            },
            Self::Protocol { message } => write!(f, "store protocol error: {message}"),
            Self::Backend { message, .. } => write!(f, "store backend error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection {
                source: Some(src), ..
            }
            | Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Errors raised by the RPC transport.
///
/// A request that simply receives no reply after all retries is *not* an
/// error: [`RpcClient::send`](crate::rpc::RpcClient::send) returns `Ok(None)`
/// and the caller decides what that means.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket-level I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A listener could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// The address that could not be bound.
        address: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The peer sent a message that violates the framing protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,
}
