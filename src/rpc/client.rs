//! Request/reply client with bounded retries.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::frame::FrameCodec;
use super::{envelope, open_envelope, Connector, RpcReply, RpcRequest, RpcTransport};
use crate::error::TransportError;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2500);

/// Default number of attempts.
pub const DEFAULT_RETRIES: u32 = 3;

type Connection = Framed<TcpStream, FrameCodec>;

/// Client for a [`RelayBroker`](super::RelayBroker) frontend.
///
/// Each [`send`](Self::send) transmits the request and waits up to `timeout`
/// for the reply. If none arrives (or the connection fails), the socket is
/// dropped, reopened and the request resent, up to `retries` attempts in
/// total. After that `send` returns `Ok(None)`.
///
/// Dropping the socket on timeout guarantees a late reply to an abandoned
/// attempt can never be mistaken for the reply to a later request.
///
/// # Examples
///
/// ```rust,no_run
/// use bytes::Bytes;
/// use taskrelay::rpc::RpcClient;
///
/// # async fn example() -> Result<(), taskrelay::TransportError> {
/// let mut client = RpcClient::new("127.0.0.1:50001");
/// match client.send("status", vec![]).await? {
///     Some(reply) => println!("{} frames", reply.len()),
///     None => println!("no reply"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RpcClient {
    address: String,
    timeout: Duration,
    retries: u32,
    connection: Option<Connection>,
}

enum Attempt {
    Reply(Vec<Bytes>),
    Retry(&'static str),
}

impl RpcClient {
    /// Creates a client for `address` with default timeout and retries. The
    /// socket is opened on first use.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            connection: None,
        }
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the number of attempts (at least one).
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    /// The broker frontend address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sends `body` to `service` and returns the reply body.
    ///
    /// # Errors
    ///
    /// [`TransportError::Protocol`] if a reply arrives with a bad header or
    /// for a different service.
    pub async fn send(
        &mut self,
        service: &str,
        body: Vec<Bytes>,
    ) -> Result<Option<Vec<Bytes>>, TransportError> {
        self.send_with(service, body, self.timeout, self.retries).await
    }

    async fn send_with(
        &mut self,
        service: &str,
        body: Vec<Bytes>,
        timeout: Duration,
        retries: u32,
    ) -> Result<Option<Vec<Bytes>>, TransportError> {
        let request = envelope(service, body);
        for attempt in 1..=retries {
            let deadline = Instant::now() + timeout;
            match self.attempt(request.clone(), deadline).await? {
                Attempt::Reply(frames) => {
                    let (replied, body) = open_envelope(frames)?;
                    if replied != service {
                        return Err(TransportError::Protocol(format!(
                            "reply for service {replied}, expected {service}"
                        )));
                    }
                    return Ok(Some(body));
                },
                Attempt::Retry(reason) => {
                    warn!(address = %self.address, service, attempt, reason, "no reply, reconnecting");
                    self.connection = None;
                    tokio::time::sleep_until(deadline).await;
                },
            }
        }
        warn!(address = %self.address, service, retries, "retries exhausted, abandoning request");
        Ok(None)
    }

    async fn attempt(
        &mut self,
        request: Vec<Bytes>,
        deadline: Instant,
    ) -> Result<Attempt, TransportError> {
        if self.connection.is_none() {
            let connect = TcpStream::connect(self.address.as_str());
            match tokio::time::timeout_at(deadline, connect).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    debug!(address = %self.address, "connected");
                    self.connection = Some(Framed::new(stream, FrameCodec::new()));
                },
                Ok(Err(_)) => return Ok(Attempt::Retry("connect failed")),
                Err(_) => return Ok(Attempt::Retry("connect timed out")),
            }
        }
        let Some(connection) = self.connection.as_mut() else {
            return Ok(Attempt::Retry("not connected"));
        };

        if connection.send(request).await.is_err() {
            return Ok(Attempt::Retry("send failed"));
        }
        let received = tokio::time::timeout_at(deadline, connection.next()).await;
        Ok(match received {
            Ok(Some(Ok(frames))) => Attempt::Reply(frames),
            Ok(Some(Err(TransportError::Protocol(message)))) => {
                return Err(TransportError::Protocol(message))
            },
            Ok(Some(Err(_))) => Attempt::Retry("receive failed"),
            Ok(None) => Attempt::Retry("connection closed"),
            Err(_) => Attempt::Retry("timed out"),
        })
    }
}

#[async_trait]
impl RpcTransport for RpcClient {
    async fn request(&mut self, request: RpcRequest) -> Result<Option<RpcReply>, TransportError> {
        let timeout = request.timeout.unwrap_or(self.timeout);
        let retries = request.retries.unwrap_or(self.retries);
        let body = self
            .send_with(&request.service, request.body, timeout, retries)
            .await?;
        Ok(body.map(|body| RpcReply {
            service: request.service,
            body,
        }))
    }
}

/// [`Connector`] producing [`RpcClient`]s for one address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    timeout: Duration,
    retries: u32,
}

impl TcpConnector {
    /// Creates a connector with default timeout and retries.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    /// Sets the per-attempt timeout of produced clients.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the attempt count of produced clients.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn RpcTransport>, TransportError> {
        Ok(Box::new(
            RpcClient::new(self.address.clone())
                .with_timeout(self.timeout)
                .with_retries(self.retries),
        ))
    }
}
