//! # taskrelay
//!
//! Task dispatch fabric for remote function execution.
//!
//! A submitted task is a small record in a shared store. The submission path
//! hands its id to a [`Dispatcher`](dispatch::Dispatcher), which publishes it
//! to whichever [`Forwarder`](forwarder::Forwarder) currently serves the
//! target endpoint, or parks it in a durable per-endpoint backlog when nobody
//! is listening. The forwarder submits the payload to an
//! [`ExecutionBackend`](forwarder::ExecutionBackend), records the outcome on
//! the task record when it arrives and keeps a heartbeat log for the
//! endpoint. The bundled backend talks to remote workers over a small
//! request/reply transport relayed by a [`RelayBroker`](rpc::RelayBroker).
//!
//! # Module Organization
//!
//! - [`store`] - the shared key/value engine (in-memory and Redis)
//! - [`task`] - task records, groups and the status state machine
//! - [`dispatch`] - pub/sub dispatch with backlog fallback
//! - [`queue`] - direct per-endpoint queues
//! - [`forwarder`] - the per-endpoint bridge to an execution backend
//! - [`rpc`] - client, relay broker and worker
//! - [`status_log`] - heartbeats, liveness and compute-hours accounting
//! - [`submit`] - submission helper and result retrieval
//! - [`cache`] - bounded read-through cache
//! - [`config`], [`logging`] - ambient setup for binaries
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use taskrelay::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> taskrelay::Result<()> {
//! let store: SharedStore = Arc::new(MemoryStore::new());
//! let submitter = Submitter::new(store.clone(), Keyspace::default());
//!
//! let task = submitter
//!     .submit(SubmitRequest::new("user-1", "fn-1", "ep-1", b"payload".to_vec()))
//!     .await?;
//! assert_eq!(task.status().await?, TaskStatus::WaitingForEp);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forwarder;
pub mod keys;
pub mod logging;
pub mod queue;
pub mod rpc;
pub mod status_log;
pub mod store;
pub mod submit;
pub mod task;

pub use error::{Error, Result, StoreError, TransportError};
pub use keys::Keyspace;
pub use task::{InternalStatus, TaskGroup, TaskOutcome, TaskRecord, TaskStatus};

/// Commonly used types.
pub mod prelude {
    pub use crate::config::RelayConfig;
    pub use crate::dispatch::{Dispatcher, TaskPublisher};
    pub use crate::error::{Error, Result};
    pub use crate::forwarder::{
        DispatchSource, ExecutionBackend, Forwarder, ForwarderConfig, ForwarderState, RpcBackend,
        TaskSource,
    };
    pub use crate::keys::Keyspace;
    pub use crate::queue::EndpointQueue;
    pub use crate::status_log::EndpointStatusLog;
    pub use crate::store::{MemoryStore, SharedStore, Store};
    pub use crate::submit::{SubmitRequest, Submitter, TaskResult};
    pub use crate::task::{NewTask, TaskGroup, TaskOutcome, TaskRecord, TaskStatus};
}
