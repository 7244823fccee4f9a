//! Asynchronous request/reply transport.
//!
//! # Architecture
//!
//! ```text
//! RpcClient ──► frontend ┐                ┌ backend ◄── RpcWorker
//! RpcClient ──► frontend ┤  RelayBroker   ├ backend ◄── RpcWorker
//!                        └────────────────┘
//! ```
//!
//! Clients send `[HEADER, service, body...]`. The broker prepends an
//! 8-byte connection identity and hands the message to a worker; the worker
//! replies `[identity, HEADER, service, reply...]` and the broker routes the
//! reply back by identity, stripping it. The broker keeps no state beyond
//! live connections and never retries: reliability is entirely the client's
//! job (timeout, reconnect, resend, give up after a bounded number of tries).
//!
//! The forwarder talks to this layer only through [`RpcTransport`] and
//! [`Connector`], so any equivalent messaging transport can stand in.

pub mod broker;
pub mod client;
pub mod frame;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

pub use broker::RelayBroker;
pub use client::{RpcClient, TcpConnector};
pub use frame::{FrameCodec, Multipart};
pub use worker::{RequestHandler, RpcWorker};

/// Protocol header carried as the first frame of every request and reply.
pub const HEADER: &[u8] = b"TRC01";

/// Service name for task submissions.
pub const TASK_SERVICE: &str = "task";

/// Service name for liveness probes.
pub const STATUS_SERVICE: &str = "status";

/// Length of the routing identity the broker prepends.
pub const IDENTITY_LEN: usize = 8;

/// A typed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    /// Target service.
    pub service: String,
    /// Body frames.
    pub body: Vec<Bytes>,
    /// Per-attempt timeout; the transport default when `None`.
    pub timeout: Option<Duration>,
    /// Attempt count; the transport default when `None`. Requests that must
    /// not run twice use `Some(1)`.
    pub retries: Option<u32>,
}

impl RpcRequest {
    /// Creates a request with the transport's default timeout.
    pub fn new(service: impl Into<String>, body: Vec<Bytes>) -> Self {
        Self {
            service: service.into(),
            body,
            timeout: None,
            retries: None,
        }
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the attempt count (at least one).
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries.max(1));
        self
    }
}

/// A typed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    /// Service that answered; always equal to the request's.
    pub service: String,
    /// Body frames.
    pub body: Vec<Bytes>,
}

/// One request/reply channel.
#[async_trait]
pub trait RpcTransport: Send {
    /// Sends `request` and waits for the reply.
    ///
    /// `Ok(None)` means every attempt went unanswered; callers must treat it
    /// as a failure.
    async fn request(&mut self, request: RpcRequest) -> Result<Option<RpcReply>, TransportError>;
}

/// Opens [`RpcTransport`]s on demand.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns a new transport. Implementations may connect lazily.
    async fn connect(&self) -> Result<Box<dyn RpcTransport>, TransportError>;
}

/// Builds `[HEADER, service, body...]`.
pub(crate) fn envelope(service: &str, body: Vec<Bytes>) -> Multipart {
    let mut frames = Vec::with_capacity(body.len() + 2);
    frames.push(Bytes::from_static(HEADER));
    frames.push(Bytes::copy_from_slice(service.as_bytes()));
    frames.extend(body);
    frames
}

/// Splits `[HEADER, service, body...]`, validating the header.
pub(crate) fn open_envelope(mut frames: Multipart) -> Result<(String, Vec<Bytes>), TransportError> {
    if frames.len() < 2 {
        return Err(TransportError::Protocol(format!(
            "expected at least 2 frames, got {}",
            frames.len()
        )));
    }
    let body = frames.split_off(2);
    if frames[0].as_ref() != HEADER {
        return Err(TransportError::Protocol("unknown protocol header".into()));
    }
    let service = String::from_utf8(frames[1].to_vec())
        .map_err(|_| TransportError::Protocol("service name is not UTF-8".into()))?;
    Ok((service, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let frames = envelope("task", vec![Bytes::from_static(b"id"), Bytes::from_static(b"p")]);
        assert_eq!(frames[0].as_ref(), HEADER);
        let (service, body) = open_envelope(frames).unwrap();
        assert_eq!(service, "task");
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn bad_envelopes_are_protocol_errors() {
        assert!(open_envelope(vec![Bytes::from_static(HEADER)]).is_err());
        assert!(open_envelope(vec![Bytes::from_static(b"XXX"), Bytes::from_static(b"task")]).is_err());
    }
}
