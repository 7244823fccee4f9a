//! Worker side of the relay: serves requests arriving on the broker backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::frame::{FrameCodec, Multipart};
use super::{envelope, open_envelope, IDENTITY_LEN};
use crate::error::TransportError;

/// Serves one service request.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles `body` sent to `service`. Returning `None` sends no reply.
    async fn handle(&self, service: &str, body: Vec<Bytes>) -> Option<Vec<Bytes>>;
}

/// Connects to a broker backend and answers requests with a
/// [`RequestHandler`].
///
/// Requests are handled concurrently; each reply is routed back through the
/// identity the broker attached. A lost broker connection is re-established
/// after `reconnect_delay` until shutdown.
pub struct RpcWorker<H> {
    address: String,
    handler: Arc<H>,
    reconnect_delay: Duration,
}

impl<H> std::fmt::Debug for RpcWorker<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcWorker")
            .field("address", &self.address)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish_non_exhaustive()
    }
}

impl<H: RequestHandler> RpcWorker<H> {
    /// Creates a worker for the broker backend at `address`.
    pub fn new(address: impl Into<String>, handler: H) -> Self {
        Self {
            address: address.into(),
            handler: Arc::new(handler),
            reconnect_delay: Duration::from_millis(500),
        }
    }

    /// Sets the delay between reconnection attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Serves until `shutdown` is cancelled.
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TransportError> {
        while !shutdown.is_cancelled() {
            match TcpStream::connect(self.address.as_str()).await {
                Ok(stream) => {
                    info!("connected to broker");
                    if let Err(e) = self.serve(stream, &shutdown).await {
                        warn!(error = %e, "broker connection lost");
                    }
                },
                Err(e) => debug!(error = %e, "broker not reachable"),
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.reconnect_delay) => {},
            }
        }
        Ok(())
    }

    async fn serve(&self, stream: TcpStream, shutdown: &CancellationToken) -> Result<(), TransportError> {
        stream.set_nodelay(true)?;
        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Multipart>();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                Some(reply) = rx.recv() => sink.send(reply).await?,
                message = frames.next() => match message {
                    Some(message) => self.dispatch(message?, &tx),
                    None => return Err(TransportError::ConnectionClosed),
                },
            }
        }
    }

    fn dispatch(&self, mut message: Multipart, replies: &mpsc::UnboundedSender<Multipart>) {
        if message.is_empty() || message[0].len() != IDENTITY_LEN {
            warn!("dropping request without routing identity");
            return;
        }
        let request = message.split_off(1);
        let identity = message.swap_remove(0);
        let (service, body) = match open_envelope(request) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "dropping malformed request");
                return;
            },
        };

        let handler = self.handler.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            let Some(reply) = handler.handle(&service, body).await else {
                debug!(%service, "handler produced no reply");
                return;
            };
            let mut routed = Vec::with_capacity(reply.len() + 3);
            routed.push(identity);
            routed.extend(envelope(&service, reply));
            let _ = replies.send(routed);
        });
    }
}
