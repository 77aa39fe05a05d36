//! Connected-client registry
//!
//! Every connection owns a bounded outbound queue drained by its own writer
//! task. Broadcasts never wait on a slow client: a full queue loses that one
//! frame for that one client, and a closed queue removes the client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// One serialized JSON line, without the trailing newline
pub type Frame = Arc<str>;

pub type ClientId = u64;

struct ClientEntry {
    addr: SocketAddr,
    tx: mpsc::Sender<Frame>,
}

pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl ClientRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Add a client; the returned receiver feeds its writer task
    pub async fn register(&self, addr: SocketAddr) -> (ClientId, mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().await.insert(
            id,
            ClientEntry {
                addr,
                tx: tx.clone(),
            },
        );
        info!(client = id, %addr, "Client registered");
        (id, tx, rx)
    }

    pub async fn unregister(&self, id: ClientId) {
        if let Some(entry) = self.clients.lock().await.remove(&id) {
            info!(client = id, addr = %entry.addr, "Client unregistered");
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Queue `frame` for every client. Returns how many accepted it.
    pub async fn broadcast(&self, frame: &Frame) -> usize {
        let mut clients = self.clients.lock().await;
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, entry) in clients.iter() {
            match entry.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(client = *id, "Outbound queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }

        for id in dead {
            if let Some(entry) = clients.remove(&id) {
                info!(client = id, addr = %entry.addr, "Removed disconnected client");
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all() {
        let registry = ClientRegistry::new(4);
        let (_, _tx1, mut rx1) = registry.register(addr()).await;
        let (_, _tx2, mut rx2) = registry.register(addr()).await;

        let frame: Frame = Arc::from("{\"x\":1}");
        assert_eq!(registry.broadcast(&frame).await, 2);
        assert_eq!(&*rx1.recv().await.unwrap(), "{\"x\":1}");
        assert_eq!(&*rx2.recv().await.unwrap(), "{\"x\":1}");
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_for_that_client() {
        let registry = ClientRegistry::new(1);
        let (_, _slow_tx, _slow_rx) = registry.register(addr()).await;
        let (_, _fast_tx, mut fast_rx) = registry.register(addr()).await;

        let first: Frame = Arc::from("1");
        let second: Frame = Arc::from("2");
        assert_eq!(registry.broadcast(&first).await, 2);
        fast_rx.recv().await.unwrap();
        // Slow client's queue is still full
        assert_eq!(registry.broadcast(&second).await, 1);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_closed_client_is_removed() {
        let registry = ClientRegistry::new(4);
        let (_, tx, rx) = registry.register(addr()).await;
        let (_, _keep_tx, mut keep_rx) = registry.register(addr()).await;
        drop(rx);
        drop(tx);

        let frame: Frame = Arc::from("{}");
        assert_eq!(registry.broadcast(&frame).await, 1);
        assert_eq!(registry.len().await, 1);
        assert!(keep_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = ClientRegistry::new(4);
        let (id, _tx, _rx) = registry.register(addr()).await;
        registry.unregister(id).await;
        assert!(registry.is_empty().await);
    }
}
