//! Stateless relay between client connections and worker connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use super::frame::{FrameCodec, Multipart};
use super::{HEADER, IDENTITY_LEN};
use crate::error::TransportError;

type Outbox = mpsc::UnboundedSender<Multipart>;

#[derive(Default)]
struct Routes {
    clients: HashMap<u64, Outbox>,
    workers: Vec<(u64, Outbox)>,
    next_worker: usize,
}

impl Routes {
    fn pick_worker(&mut self) -> Option<Outbox> {
        self.workers.retain(|(_, tx)| !tx.is_closed());
        if self.workers.is_empty() {
            return None;
        }
        let index = self.next_worker % self.workers.len();
        self.next_worker = self.next_worker.wrapping_add(1);
        Some(self.workers[index].1.clone())
    }
}

#[derive(Default)]
struct Hub {
    routes: Mutex<Routes>,
    next_id: AtomicU64,
}

/// Relays client requests to workers and worker replies back to clients.
///
/// The broker adds nothing but routing: a request with no connected worker,
/// or a reply for a client that has gone away, is dropped, and the client's
/// own timeout and retry handle it.
///
/// # Examples
///
/// ```rust,no_run
/// use taskrelay::rpc::RelayBroker;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), taskrelay::TransportError> {
/// let broker = RelayBroker::bind("0.0.0.0:50001", "0.0.0.0:50002").await?;
/// broker.run(CancellationToken::new()).await
/// # }
/// ```
#[derive(Debug)]
pub struct RelayBroker {
    frontend: TcpListener,
    backend: TcpListener,
}

async fn bind(address: &str) -> Result<TcpListener, TransportError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| TransportError::Bind {
            address: address.to_string(),
            source,
        })
}

impl RelayBroker {
    /// Binds the client-facing `frontend` and worker-facing `backend`.
    pub async fn bind(frontend: &str, backend: &str) -> Result<Self, TransportError> {
        Ok(Self {
            frontend: bind(frontend).await?,
            backend: bind(backend).await?,
        })
    }

    /// Actual frontend address (useful when bound to port 0).
    pub fn frontend_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.frontend.local_addr()?)
    }

    /// Actual backend address.
    pub fn backend_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.backend.local_addr()?)
    }

    /// Relays until `shutdown` is cancelled.
    #[instrument(skip_all, name = "relay_broker")]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TransportError> {
        let hub = Arc::new(Hub::default());
        let tracker = TaskTracker::new();
        info!(
            frontend = ?self.frontend.local_addr().ok(),
            backend = ?self.backend.local_addr().ok(),
            "broker running"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.frontend.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracker.spawn(serve_client(stream, peer, hub.clone(), shutdown.child_token()));
                    },
                    Err(e) => warn!(error = %e, "frontend accept failed"),
                },
                accepted = self.backend.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracker.spawn(serve_worker(stream, peer, hub.clone(), shutdown.child_token()));
                    },
                    Err(e) => warn!(error = %e, "backend accept failed"),
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("broker stopped");
        Ok(())
    }
}

/// Splits a connection into a frame stream and an outbox drained by a
/// writer task.
fn split_connection(
    stream: TcpStream,
) -> (
    futures::stream::SplitStream<Framed<TcpStream, FrameCodec>>,
    Outbox,
    tokio::task::JoinHandle<()>,
) {
    let _ = stream.set_nodelay(true);
    let (mut sink, frames) = Framed::new(stream, FrameCodec::new()).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Multipart>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });
    (frames, tx, writer)
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, hub: Arc<Hub>, shutdown: CancellationToken) {
    let id = hub.next_id.fetch_add(1, Ordering::Relaxed);
    let (mut frames, outbox, writer) = split_connection(stream);
    hub.routes.lock().clients.insert(id, outbox);
    debug!(%peer, id, "client connected");

    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = frames.next() => message,
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(%peer, error = %e, "client stream error");
                break;
            },
            None => break,
        };
        if message.first().map(|h| h.as_ref()) != Some(HEADER) {
            warn!(%peer, "dropping request with unknown header");
            continue;
        }
        let worker = hub.routes.lock().pick_worker();
        let Some(worker) = worker else {
            trace!(id, "no worker connected, dropping request");
            continue;
        };
        let mut routed = Vec::with_capacity(message.len() + 1);
        routed.push(Bytes::copy_from_slice(&id.to_be_bytes()));
        routed.extend(message);
        let _ = worker.send(routed);
    }

    hub.routes.lock().clients.remove(&id);
    writer.abort();
    debug!(%peer, id, "client disconnected");
}

async fn serve_worker(stream: TcpStream, peer: SocketAddr, hub: Arc<Hub>, shutdown: CancellationToken) {
    let id = hub.next_id.fetch_add(1, Ordering::Relaxed);
    let (mut frames, outbox, writer) = split_connection(stream);
    hub.routes.lock().workers.push((id, outbox));
    info!(%peer, id, "worker connected");

    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = frames.next() => message,
        };
        let mut message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(%peer, error = %e, "worker stream error");
                break;
            },
            None => break,
        };
        if message.is_empty() || message[0].len() != IDENTITY_LEN {
            warn!(%peer, "dropping worker reply without routing identity");
            continue;
        }
        let reply = message.split_off(1);
        let mut identity = [0u8; IDENTITY_LEN];
        identity.copy_from_slice(&message[0]);
        let client = u64::from_be_bytes(identity);

        let outbox = hub.routes.lock().clients.get(&client).cloned();
        match outbox {
            Some(outbox) => {
                let _ = outbox.send(reply);
            },
            None => trace!(client, "client gone, dropping reply"),
        }
    }

    hub.routes.lock().workers.retain(|(worker, _)| *worker != id);
    writer.abort();
    info!(%peer, id, "worker disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_skips_closed_workers() {
        let mut routes = Routes::default();
        let (a, _a_rx) = mpsc::unbounded_channel();
        let (b, b_rx) = mpsc::unbounded_channel();
        let (c, _c_rx) = mpsc::unbounded_channel();
        routes.workers = vec![(1, a.clone()), (2, b), (3, c.clone())];
        drop(b_rx);

        let first = routes.pick_worker().unwrap();
        let second = routes.pick_worker().unwrap();
        let third = routes.pick_worker().unwrap();
        assert!(first.same_channel(&a));
        assert!(second.same_channel(&c));
        assert!(third.same_channel(&a));
    }

    #[tokio::test]
    async fn bind_failure_names_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap().to_string();
        let err = RelayBroker::bind(&address, "127.0.0.1:0").await.unwrap_err();
        assert!(matches!(err, TransportError::Bind { address: a, .. } if a == address));
    }
}
