//! One interface over the direct (data channel) and relay transports.

use async_trait::async_trait;
use lanbeam_core::config::QUALITY_GOOD_BUFFERED;
use lanbeam_core::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Relay,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Direct => "direct",
            TransportKind::Relay => "relay",
        }
    }
}

/// How a transport reports that its send buffer drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// `buffer_low` resolves when buffered bytes fall to the low-water mark.
    Event,
    /// No drain event; the sender counts chunks in flight and polls.
    Polling,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
    #[error("encode: {0}")]
    Encode(String),
}

/// A bidirectional channel to one remote peer.
#[async_trait]
pub trait Transport: Send + Sync {
    fn peer_id(&self) -> &str;
    fn kind(&self) -> TransportKind;
    /// Chunk size the sender should plan with on this transport.
    fn chunk_size(&self) -> u32;
    fn backpressure(&self) -> Backpressure;
    fn is_open(&self) -> bool;

    async fn send_message(&self, message: &Message) -> Result<(), TransportError>;
    async fn send_chunk(&self, index: u32, ciphertext: &[u8]) -> Result<(), TransportError>;
    /// Bytes queued but not yet written to the network.
    async fn buffered_amount(&self) -> usize;
    /// Resolves once buffered bytes fall to the low-water mark. Only
    /// meaningful for [`Backpressure::Event`] transports.
    async fn buffer_low(&self);
    /// Resolves once the transport is closed.
    async fn closed(&self);
    async fn close(&self);
}

/// What arrives from any transport, for the node's dispatcher.
#[derive(Debug)]
pub enum Inbound {
    Control { peer_id: String, message: Message },
    Chunk { peer_id: String, index: u32, payload: Vec<u8> },
    /// A direct transport to `peer_id` closed.
    Closed { peer_id: String },
    /// The relay socket to the server is gone.
    RelayLost,
}

/// Connection quality in `[0, 1]`: 0.5 when not open, 0.8 when open, 0.9
/// when open and nearly idle.
pub fn quality_sample(is_open: bool, buffered: usize) -> f32 {
    match (is_open, buffered < QUALITY_GOOD_BUFFERED) {
        (false, _) => 0.5,
        (true, true) => 0.9,
        (true, false) => 0.8,
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport with a controllable drain rate.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use lanbeam_core::config::BUFFERED_AMOUNT_LOW;
    use tokio::sync::{watch, Notify};

    pub struct MockTransport {
        pub peer: String,
        pub kind: TransportKind,
        pub chunk_size: u32,
        pub buffered: AtomicUsize,
        pub max_buffered: AtomicUsize,
        pub sent_chunks: Mutex<Vec<u32>>,
        pub sent_messages: Mutex<Vec<Message>>,
        low: Notify,
        open: AtomicBool,
        closed_tx: watch::Sender<bool>,
    }

    impl MockTransport {
        pub fn new(kind: TransportKind, chunk_size: u32) -> Arc<Self> {
            let (closed_tx, _) = watch::channel(false);
            Arc::new(Self {
                peer: "remote".into(),
                kind,
                chunk_size,
                buffered: AtomicUsize::new(0),
                max_buffered: AtomicUsize::new(0),
                sent_chunks: Mutex::new(Vec::new()),
                sent_messages: Mutex::new(Vec::new()),
                low: Notify::new(),
                open: AtomicBool::new(true),
                closed_tx,
            })
        }

        /// Drain `bytes_per_tick` every `tick`, firing the low event when the
        /// buffer crosses the low-water mark.
        pub fn start_draining(self: &Arc<Self>, bytes_per_tick: usize, tick: Duration) {
            let me = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(tick).await;
                    let before = me.buffered.load(Ordering::SeqCst);
                    let after = before.saturating_sub(bytes_per_tick);
                    me.buffered.store(after, Ordering::SeqCst);
                    if before > BUFFERED_AMOUNT_LOW && after <= BUFFERED_AMOUNT_LOW {
                        me.low.notify_one();
                    }
                }
            });
        }

        pub fn shut(&self) {
            self.open.store(false, Ordering::SeqCst);
            self.closed_tx.send_replace(true);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn peer_id(&self) -> &str {
            &self.peer
        }
        fn kind(&self) -> TransportKind {
            self.kind
        }
        fn chunk_size(&self) -> u32 {
            self.chunk_size
        }
        fn backpressure(&self) -> Backpressure {
            match self.kind {
                TransportKind::Direct => Backpressure::Event,
                TransportKind::Relay => Backpressure::Polling,
            }
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        async fn send_message(&self, message: &Message) -> Result<(), TransportError> {
            if !self.is_open() {
                return Err(TransportError::Closed);
            }
            self.sent_messages.lock().unwrap().push(message.clone());
            Ok(())
        }
        async fn send_chunk(&self, index: u32, ciphertext: &[u8]) -> Result<(), TransportError> {
            if !self.is_open() {
                return Err(TransportError::Closed);
            }
            let now = self.buffered.fetch_add(ciphertext.len(), Ordering::SeqCst) + ciphertext.len();
            self.max_buffered.fetch_max(now, Ordering::SeqCst);
            self.sent_chunks.lock().unwrap().push(index);
            Ok(())
        }
        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }
        async fn buffer_low(&self) {
            self.low.notified().await
        }
        async fn closed(&self) {
            let mut rx = self.closed_tx.subscribe();
            let _ = rx.wait_for(|c| *c).await;
        }
        async fn close(&self) {
            self.shut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_levels() {
        assert_eq!(quality_sample(false, 0), 0.5);
        assert_eq!(quality_sample(true, 10), 0.9);
        assert_eq!(quality_sample(true, QUALITY_GOOD_BUFFERED), 0.8);
    }
}
