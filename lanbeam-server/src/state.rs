//! Shared server state: the presence directory and the open relay sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::Message as WsMessage;
use lanbeam_core::PresenceDirectory;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Frames queued per relay socket. Forwarding to a full queue waits, which
/// stalls the sending socket's reader rather than growing memory.
pub const SOCKET_QUEUE: usize = 32;

/// Outbound queue of one relay socket.
pub type SocketTx = mpsc::Sender<WsMessage>;

struct RelaySocket {
    conn_id: u64,
    tx: SocketTx,
    kick: oneshot::Sender<()>,
}

/// A registered relay socket. `replaced` resolves when a newer socket for
/// the same peer takes over.
pub struct Attached {
    pub conn_id: u64,
    pub replaced: oneshot::Receiver<()>,
}

#[derive(Clone, Default)]
pub struct AppState {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    directory: Mutex<PresenceDirectory>,
    sockets: Mutex<HashMap<String, RelaySocket>>,
    next_conn: AtomicU64,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn directory(&self) -> tokio::sync::MutexGuard<'_, PresenceDirectory> {
        self.inner.directory.lock().await
    }

    /// Register the socket for `peer_id`, replacing any previous one. The
    /// previous socket is told to close.
    pub async fn attach(&self, peer_id: &str, tx: SocketTx) -> Attached {
        let conn_id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let (kick, replaced) = oneshot::channel();
        let old = self
            .inner
            .sockets
            .lock()
            .await
            .insert(peer_id.to_string(), RelaySocket { conn_id, tx, kick });
        if let Some(old) = old {
            let _ = old.kick.send(());
        }
        Attached { conn_id, replaced }
    }

    /// Drop the socket if it is still the current one for `peer_id`, and the
    /// peer's presence record with it. Returns whether anything was removed.
    pub async fn detach(&self, peer_id: &str, conn_id: u64) -> bool {
        {
            let mut sockets = self.inner.sockets.lock().await;
            match sockets.get(peer_id) {
                Some(s) if s.conn_id == conn_id => {
                    sockets.remove(peer_id);
                }
                _ => return false,
            }
        }
        self.directory().await.forget(peer_id)
    }

    /// Queue a frame for `target`, waiting while its queue is full. Dropped
    /// when no socket is open.
    pub async fn deliver(&self, target: &str, msg: WsMessage) -> bool {
        let tx = self
            .inner
            .sockets
            .lock()
            .await
            .get(target)
            .map(|s| s.tx.clone());
        match tx {
            Some(tx) => tx.send(msg).await.is_ok(),
            None => false,
        }
    }

    pub async fn socket_count(&self) -> usize {
        self.inner.sockets.lock().await.len()
    }
}

/// Wall clock in epoch millis, as stored in peer records.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanbeam_core::{DeviceClass, Registration};
    use std::time::Duration;

    #[tokio::test]
    async fn detach_only_removes_current_connection() {
        let state = AppState::new();
        state
            .directory()
            .await
            .register(Registration::new("p", "P", DeviceClass::Desktop), now_ms())
            .unwrap();
        let (tx1, _rx1) = mpsc::channel(SOCKET_QUEUE);
        let (tx2, mut rx2) = mpsc::channel(SOCKET_QUEUE);
        let old = state.attach("p", tx1).await;
        let new = state.attach("p", tx2).await;
        // The replaced socket is told to go.
        assert!(old.replaced.await.is_ok());
        assert!(!state.detach("p", old.conn_id).await);
        assert_eq!(state.socket_count().await, 1);
        assert!(state.directory().await.get("p").is_some());

        assert!(state.deliver("p", WsMessage::Text("x".into())).await);
        assert!(matches!(rx2.recv().await, Some(WsMessage::Text(_))));

        assert!(state.detach("p", new.conn_id).await);
        assert!(state.directory().await.get("p").is_none());
        assert!(!state.deliver("p", WsMessage::Text("x".into())).await);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_holds_the_forwarder() {
        let state = AppState::new();
        let (tx, mut rx) = mpsc::channel(SOCKET_QUEUE);
        let _attached = state.attach("slow", tx).await;
        for _ in 0..SOCKET_QUEUE {
            assert!(state.deliver("slow", WsMessage::Binary(vec![0; 8])).await);
        }
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            state.deliver("slow", WsMessage::Binary(vec![1])),
        )
        .await;
        assert!(blocked.is_err());

        rx.recv().await;
        assert!(state.deliver("slow", WsMessage::Binary(vec![2])).await);
    }
}
