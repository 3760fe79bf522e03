//! Peer runtime: owns the transfer engine and executes its actions against
//! live transports, crypto workers and the collaborator's event stream.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lanbeam_core::config::{
    ACCEPT_POLL_INTERVAL, ACCEPT_TIMEOUT, QUALITY_SAMPLE_INTERVAL,
};
use lanbeam_core::{
    generate_peer_id, Action, Direction, Event, PeerRecord, Phase, SessionError, Signal,
    TransferEngine, TransferError, TransferKey,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, TransportMode};
use crate::crypto_worker::{CryptoWorker, Op, Output};
use crate::direct::{DirectConnector, RtcSignaling};
use crate::negotiator::{Connector, NegotiationError, Negotiator};
use crate::presence::PresenceClient;
use crate::relay::{RelayConnector, RelayHub};
use crate::sender::{send_chunks, SendError};
use crate::transport::{Inbound, Transport, TransportError, TransportKind};

/// Decrypt jobs queued per inbound transfer before the dispatcher waits.
const DECRYPT_QUEUE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// What a collaborator can send to a peer.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    /// Sent one after another, each as its own transfer.
    Files(Vec<PathBuf>),
}

type Decrypted = Output<TransferKey>;

pub struct PeerNode {
    engine: Mutex<TransferEngine>,
    negotiator: Negotiator,
    /// Used for control messages to a peer with no negotiated transport.
    fallback: Option<Arc<dyn Connector>>,
    decryptors: std::sync::Mutex<HashMap<TransferKey, CryptoWorker>>,
    decrypted_tx: mpsc::UnboundedSender<Decrypted>,
    events: mpsc::UnboundedSender<Event>,
    busy: Arc<AtomicBool>,
}

/// Receiving ends handed back by [`PeerNode::new`].
pub struct NodeChannels {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub decrypted: mpsc::UnboundedReceiver<Decrypted>,
}

impl PeerNode {
    pub fn new(
        local_name: &str,
        connector: Arc<dyn Connector>,
        fallback: Option<Arc<dyn Connector>>,
    ) -> (Arc<Self>, NodeChannels) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (decrypted_tx, decrypted) = mpsc::unbounded_channel();
        let node = Arc::new(Self {
            engine: Mutex::new(TransferEngine::new(local_name)),
            negotiator: Negotiator::new(connector),
            fallback,
            decryptors: std::sync::Mutex::new(HashMap::new()),
            decrypted_tx,
            events: events_tx,
            busy: Arc::new(AtomicBool::new(false)),
        });
        (node, NodeChannels { events, decrypted })
    }

    /// Set while a transfer or negotiation is active; device polling pauses.
    pub fn busy_flag(&self) -> Arc<AtomicBool> {
        self.busy.clone()
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    // ── Collaborator calls ───────────────────────────────────────────────────

    pub async fn connect_to_peer(&self, peer_id: &str) -> Result<Arc<dyn Transport>, NodeError> {
        self.busy.store(true, Ordering::SeqCst);
        let res = self.negotiator.connect(peer_id).await;
        self.refresh_busy().await;
        res.map_err(|e| {
            let err = negotiation_failure(e);
            self.emit(Event::Error {
                key: None,
                error: err.clone(),
            });
            err.into()
        })
    }

    pub async fn send_payload(&self, peer_id: &str, payload: Payload) -> Result<(), NodeError> {
        match payload {
            Payload::Text(text) => {
                let transport = self.open_transport(peer_id, None).await?;
                let actions = self.engine.lock().await.send_text(peer_id, &text);
                self.execute_via(&transport, actions).await
            }
            Payload::Files(paths) => {
                for path in paths {
                    let data = tokio::fs::read(&path).await.map_err(|source| NodeError::Read {
                        path: path.clone(),
                        source,
                    })?;
                    let name = file_name(&path);
                    let mime = mime_for(&path);
                    self.send_file(peer_id, &name, Bytes::from(data), mime).await?;
                }
                Ok(())
            }
        }
    }

    /// Offer one in-memory file, wait for consent, then stream it. Any
    /// failure after the offer is recorded purges the outbound session.
    pub async fn send_file(
        &self,
        peer_id: &str,
        file_name: &str,
        data: Bytes,
        mime_type: &str,
    ) -> Result<(), NodeError> {
        let key = TransferKey::new(peer_id, file_name);
        let transport = self.open_transport(peer_id, Some(&key)).await?;

        let offer = self
            .engine
            .lock()
            .await
            .offer_file(peer_id, file_name, data.len() as u64)?;
        if let Err(e) = self.execute_via(&transport, offer).await {
            self.abort_outbound(&key, TransferError::TransportClosed).await;
            return Err(e);
        }
        info!(event = "offer_sent", peer = %peer_id, file = %file_name, size = data.len(), "Waiting for recipient");

        self.await_consent(&key).await?;

        let begun = self.engine.lock().await.begin_transfer(
            &key,
            transport.chunk_size(),
            mime_type,
        );
        let (plan, metadata) = match begun {
            Ok(b) => b,
            Err(e) => {
                self.abort_outbound(&key, TransferError::TransportClosed).await;
                return Err(e.into());
            }
        };
        self.busy.store(true, Ordering::SeqCst);
        if let Err(e) = self.execute_via(&transport, metadata).await {
            self.abort_outbound(&key, TransferError::TransportClosed).await;
            return Err(e);
        }

        match send_chunks(transport.clone(), &key, plan, data, &self.events).await {
            Ok(()) => {
                let actions = self.engine.lock().await.complete_outbound(&key);
                self.execute(actions).await;
                self.refresh_busy().await;
                Ok(())
            }
            Err(e) => {
                warn!(event = "send_failed", peer = %peer_id, file = %file_name, error = %e, "Transfer aborted");
                self.abort_outbound(&key, e.transfer_error()).await;
                Err(e.into())
            }
        }
    }

    pub async fn accept_transfer(&self, key: &TransferKey) -> Result<(), NodeError> {
        let actions = self.engine.lock().await.accept(key)?;
        info!(event = "accepted", peer = %key.peer_id, file = %key.file_name, "Transfer accepted");
        self.execute(actions).await;
        Ok(())
    }

    pub async fn decline_transfer(&self, key: &TransferKey) -> Result<(), NodeError> {
        let actions = self.engine.lock().await.decline(key)?;
        info!(event = "declined", peer = %key.peer_id, file = %key.file_name, "Transfer declined");
        self.execute(actions).await;
        Ok(())
    }

    // ── Sending helpers ──────────────────────────────────────────────────────

    async fn open_transport(
        &self,
        peer_id: &str,
        key: Option<&TransferKey>,
    ) -> Result<Arc<dyn Transport>, NodeError> {
        self.busy.store(true, Ordering::SeqCst);
        let res = self.negotiator.open_transport(peer_id).await;
        self.refresh_busy().await;
        res.map_err(|e| {
            let err = negotiation_failure(e);
            self.emit(Event::Error {
                key: key.cloned(),
                error: err.clone(),
            });
            err.into()
        })
    }

    async fn abort_outbound(&self, key: &TransferKey, error: TransferError) {
        let actions = self
            .engine
            .lock()
            .await
            .fail(Direction::Outbound, key, error);
        self.execute(actions).await;
        self.refresh_busy().await;
    }

    /// Poll the outbound session until the recipient answers or the accept
    /// window closes. Nothing beyond the offer is sent on failure.
    async fn await_consent(&self, key: &TransferKey) -> Result<(), NodeError> {
        let deadline = tokio::time::Instant::now() + ACCEPT_TIMEOUT;
        loop {
            let phase = self.engine.lock().await.phase(Direction::Outbound, key);
            let failure = match phase {
                Some(Phase::Accepted) => return Ok(()),
                Some(Phase::Pending) if tokio::time::Instant::now() < deadline => None,
                Some(Phase::Pending) => Some(TransferError::HandshakeTimeout(ACCEPT_TIMEOUT)),
                Some(Phase::Declined) => Some(TransferError::Declined),
                // Purged by a transport close, which already reported it.
                Some(Phase::Transferring) | None => return Err(TransferError::TransportClosed.into()),
            };
            if let Some(error) = failure {
                info!(event = "offer_failed", peer = %key.peer_id, file = %key.file_name, error = %error, "Offer not accepted");
                let actions = self
                    .engine
                    .lock()
                    .await
                    .fail(Direction::Outbound, key, error.clone());
                self.execute(actions).await;
                return Err(error.into());
            }
            tokio::time::sleep(ACCEPT_POLL_INTERVAL).await;
        }
    }

    /// Run actions, sending control messages over `transport`, so they stay
    /// ordered with chunks that follow on the same path.
    async fn execute_via(
        &self,
        transport: &Arc<dyn Transport>,
        actions: Vec<Action>,
    ) -> Result<(), NodeError> {
        for action in actions {
            match action {
                Action::Send { message, .. } => transport.send_message(&message).await?,
                other => self.execute_one(other).await,
            }
        }
        Ok(())
    }

    async fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            self.execute_one(action).await;
        }
    }

    async fn execute_one(&self, action: Action) {
        match action {
            Action::Send { peer_id, message } => {
                let transport = match self.negotiator.transport(&peer_id).await {
                    Some(t) => Some(t),
                    None => match &self.fallback {
                        Some(f) => f.connect(&peer_id).await.ok(),
                        None => None,
                    },
                };
                match transport {
                    Some(t) => {
                        if let Err(e) = t.send_message(&message).await {
                            warn!(event = "control_send_failed", peer = %peer_id, kind = message.kind(), error = %e, "Could not send control message");
                        }
                    }
                    None => warn!(event = "no_transport", peer = %peer_id, kind = message.kind(), "Dropping control message"),
                }
            }
            Action::Emit(event) => self.emit(event),
            Action::OpenInbound { key, cipher } => {
                debug!(event = "decryptor_open", peer = %key.peer_id, file = %key.file_name, "Receiving");
                let worker = CryptoWorker::spawn(
                    cipher,
                    Op::Decrypt,
                    key.clone(),
                    self.decrypted_tx.clone(),
                    DECRYPT_QUEUE,
                );
                if let Ok(mut map) = self.decryptors.lock() {
                    map.insert(key, worker);
                }
                self.busy.store(true, Ordering::SeqCst);
            }
            Action::CloseInbound { key } => {
                if let Ok(mut map) = self.decryptors.lock() {
                    map.remove(&key);
                }
            }
        }
    }

    fn emit(&self, event: Event) {
        if let Event::Completed(d) = &event {
            info!(
                event = "received",
                peer = %d.key.peer_id,
                file = %d.key.file_name,
                bytes = d.payload.len(),
                sha256 = %d.sha256_hex(),
                "Transfer complete"
            );
        }
        let _ = self.events.send(event);
    }

    async fn refresh_busy(&self) {
        let active = self.engine.lock().await.has_active_transfers();
        let negotiating = self.negotiator.is_negotiating().await;
        self.busy.store(active || negotiating, Ordering::SeqCst);
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    pub async fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Control { peer_id, message } => {
                debug!(event = "control", peer = %peer_id, kind = message.kind(), "Control message");
                let now = now();
                let actions = self.engine.lock().await.on_message(&peer_id, message, now);
                self.execute(actions).await;
            }
            Inbound::Chunk {
                peer_id,
                index,
                payload,
            } => {
                let Some(key) = self.engine.lock().await.route_chunk(&peer_id) else {
                    debug!(event = "chunk_unrouted", peer = %peer_id, index, "No receiving session for chunk");
                    return;
                };
                let jobs = self
                    .decryptors
                    .lock()
                    .ok()
                    .and_then(|m| m.get(&key).map(|w| w.jobs()));
                let Some(jobs) = jobs else { return };
                let job = crate::crypto_worker::Job {
                    index,
                    data: Bytes::from(payload),
                };
                if jobs.send(job).await.is_err() {
                    debug!(event = "decryptor_gone", peer = %peer_id, index, "Dropping chunk");
                }
            }
            Inbound::Closed { peer_id } => {
                if self.negotiator.forget_closed(&peer_id).await {
                    self.fail_peer(&peer_id).await;
                }
            }
            Inbound::RelayLost => {
                warn!(event = "relay_lost", "Relay socket closed");
                let mut peers = self.negotiator.forget_relayed().await;
                // Sessions opened through the fallback have no negotiated
                // record; anything not backed by an open direct link rode the relay.
                let with_sessions = self.engine.lock().await.peers_with_sessions();
                for peer_id in with_sessions {
                    if !peers.contains(&peer_id) && !self.has_direct_link(&peer_id).await {
                        peers.push(peer_id);
                    }
                }
                for peer_id in peers {
                    self.fail_peer(&peer_id).await;
                }
            }
        }
    }

    async fn has_direct_link(&self, peer_id: &str) -> bool {
        self.negotiator
            .transport(peer_id)
            .await
            .is_some_and(|t| t.kind() == TransportKind::Direct && t.is_open())
    }

    async fn fail_peer(&self, peer_id: &str) {
        let actions = self.engine.lock().await.on_transport_closed(peer_id);
        if !actions.is_empty() {
            warn!(event = "sessions_failed", peer = %peer_id, "Transport closed mid-transfer");
        }
        self.execute(actions).await;
        self.refresh_busy().await;
    }

    pub async fn handle_decrypted(&self, out: Decrypted) {
        let now = now();
        let actions = self
            .engine
            .lock()
            .await
            .on_chunk_decrypted(&out.tag, out.index, out.result, now);
        let finished = actions
            .iter()
            .any(|a| matches!(a, Action::CloseInbound { .. }));
        self.execute(actions).await;
        if finished {
            self.refresh_busy().await;
        }
    }

    /// Drain transport input, decrypted chunks and remotely opened
    /// transports until every source is gone.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut decrypted: mpsc::UnboundedReceiver<Decrypted>,
        mut adopted: mpsc::UnboundedReceiver<Arc<dyn Transport>>,
    ) {
        loop {
            tokio::select! {
                Some(msg) = inbound.recv() => self.handle_inbound(msg).await,
                Some(out) = decrypted.recv() => self.handle_decrypted(out).await,
                Some(t) = adopted.recv() => {
                    info!(event = "adopted", peer = %t.peer_id(), transport = t.kind().as_str(), "Remote peer opened a transport");
                    self.negotiator.adopt(t).await;
                }
                else => break,
            }
        }
        debug!(event = "dispatcher_exit", "Dispatcher stopped");
    }
}

fn negotiation_failure(e: NegotiationError) -> TransferError {
    match e {
        NegotiationError::Exhausted { peer, attempts } => TransferError::Negotiation { peer, attempts },
        NegotiationError::InProgress(_) => TransferError::HandshakeTimeout(lanbeam_core::config::OPEN_TIMEOUT),
        NegotiationError::OpenTimeout { waited, .. } => TransferError::HandshakeTimeout(waited),
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Relay when the server is on loopback: both peers share a host and a
/// direct channel buys nothing.
pub fn resolve_mode(mode: TransportMode, server_url: &str) -> TransportMode {
    if mode != TransportMode::Auto {
        return mode;
    }
    let loopback = reqwest::Url::parse(server_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .map(|h| {
            let h = h.trim_start_matches('[').trim_end_matches(']');
            h.eq_ignore_ascii_case("localhost")
                || h.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
        })
        .unwrap_or(false);
    if loopback {
        TransportMode::Relay
    } else {
        TransportMode::Direct
    }
}

/// A started peer: registered, relay socket up, dispatcher running.
pub struct Runtime {
    pub node: Arc<PeerNode>,
    pub peer_id: String,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub peers: watch::Receiver<Vec<PeerRecord>>,
    presence: Arc<PresenceClient>,
    hub: Arc<RelayHub>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub async fn start(cfg: &Config) -> anyhow::Result<Self> {
        let peer_id = generate_peer_id();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel::<(String, Signal)>();
        let (adopted_tx, adopted_rx) = mpsc::unbounded_channel();

        let hub = RelayHub::connect(&cfg.server_url, &peer_id, inbound_tx.clone(), signals_tx).await?;
        let signaling = RtcSignaling::new(hub.clone(), &cfg.stun_servers, inbound_tx, adopted_tx);

        let mode = resolve_mode(cfg.transport, &cfg.server_url);
        let relay: Arc<dyn Connector> = Arc::new(RelayConnector::new(hub.clone()));
        let connector: Arc<dyn Connector> = match mode {
            TransportMode::Relay => relay.clone(),
            _ => Arc::new(DirectConnector::new(signaling.clone())),
        };
        info!(event = "starting", peer = %peer_id, name = %cfg.device_name, ?mode, "Peer starting");

        let (node, channels) = PeerNode::new(&cfg.device_name, connector, Some(relay));

        let presence = Arc::new(PresenceClient::new(
            &cfg.server_url,
            &peer_id,
            &cfg.device_name,
            cfg.device_type,
        )?);
        presence.register().await?;
        let (peers_tx, peers) = watch::channel(Vec::new());

        let mut tasks = vec![
            presence.spawn_heartbeat(),
            presence.spawn_polling(node.busy_flag(), peers_tx),
            tokio::spawn(node.clone().run_dispatcher(inbound_rx, channels.decrypted, adopted_rx)),
        ];
        // Signals are handled in arrival order: a candidate must not overtake its offer.
        tasks.push(tokio::spawn(async move {
            while let Some((peer, signal)) = signals_rx.recv().await {
                signaling.handle_signal(peer, signal).await;
            }
        }));
        {
            // The server drops a peer's presence with its relay socket.
            let presence = presence.clone();
            let mut reconnects = hub.reconnects();
            tasks.push(tokio::spawn(async move {
                while reconnects.changed().await.is_ok() {
                    match presence.register().await {
                        Ok(()) => info!(event = "reregistered", peer = %presence.peer_id(), "Registered again after relay reconnect"),
                        Err(e) => warn!(event = "reregister_failed", error = %e, "Could not register after relay reconnect"),
                    }
                }
            }));
        }
        {
            let node = node.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(QUALITY_SAMPLE_INTERVAL);
                loop {
                    tick.tick().await;
                    for (peer, q) in node.negotiator.sample_quality().await {
                        debug!(event = "quality", peer = %peer, quality = q, "Connection quality");
                    }
                }
            }));
        }

        Ok(Self {
            node,
            peer_id,
            events: channels.events,
            peers,
            presence,
            hub,
            tasks,
        })
    }

    pub async fn devices(&self) -> anyhow::Result<Vec<PeerRecord>> {
        self.presence.devices().await
    }

    /// Leave the directory and close every connection.
    pub async fn shutdown(self) {
        if let Err(e) = self.presence.unregister().await {
            warn!(event = "unregister_failed", error = %e, "Could not unregister");
        }
        for (_, t) in self.node.negotiator.open_peers().await {
            t.close().await;
        }
        self.hub.close();
        for t in self.tasks {
            t.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::transport::{Backpressure, TransportKind};
    use async_trait::async_trait;
    use lanbeam_core::{ErrorKind, Message};
    use sha2::{Digest, Sha256};
    use std::time::Duration;

    struct Fixed(Arc<dyn Transport>);

    #[async_trait]
    impl Connector for Fixed {
        async fn connect(&self, _peer_id: &str) -> anyhow::Result<Arc<dyn Transport>> {
            Ok(self.0.clone())
        }
    }

    fn node_with(mock: &Arc<MockTransport>) -> (Arc<PeerNode>, NodeChannels) {
        PeerNode::new("Alice", Arc::new(Fixed(mock.clone())), None)
    }

    fn kinds(mock: &MockTransport) -> Vec<&'static str> {
        mock.sent_messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.kind())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_offer_times_out_with_nothing_sent() {
        let mock = MockTransport::new(TransportKind::Direct, 1024);
        let (node, mut ch) = node_with(&mock);
        let started = tokio::time::Instant::now();
        let err = node
            .send_file("remote", "a.bin", Bytes::from(vec![1u8; 5000]), "application/octet-stream")
            .await
            .unwrap_err();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(14) && waited <= Duration::from_secs(16));
        assert!(matches!(
            err,
            NodeError::Transfer(TransferError::HandshakeTimeout(_))
        ));
        assert_eq!(kinds(&mock), ["file-offer"]);
        assert!(mock.sent_chunks.lock().unwrap().is_empty());
        assert_eq!(node.engine.lock().await.session_count(), 0);
        match ch.events.try_recv().unwrap() {
            Event::Error { error, .. } => assert_eq!(error.kind(), ErrorKind::HandshakeTimeout),
            _ => panic!("expected an error event"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn decline_stops_before_metadata() {
        let mock = MockTransport::new(TransportKind::Direct, 1024);
        let (node, mut ch) = node_with(&mock);
        let sending = {
            let node = node.clone();
            tokio::spawn(async move {
                node.send_file("remote", "a.bin", Bytes::from_static(b"hello"), "text/plain")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        let started = tokio::time::Instant::now();
        node.handle_inbound(Inbound::Control {
            peer_id: "remote".into(),
            message: Message::TransferDeclined {
                file_name: "a.bin".into(),
            },
        })
        .await;
        let err = sending.await.unwrap().unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, NodeError::Transfer(TransferError::Declined)));
        assert_eq!(kinds(&mock), ["file-offer"]);

        let mut saw_declined = false;
        while let Ok(ev) = ch.events.try_recv() {
            if let Event::Error { error, .. } = ev {
                assert!(!error.kind().is_fault());
                saw_declined = true;
            }
        }
        assert!(saw_declined);
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_offer_streams_metadata_then_chunks() {
        let mock = MockTransport::new(TransportKind::Direct, 1024);
        let (node, mut ch) = node_with(&mock);
        let sending = {
            let node = node.clone();
            tokio::spawn(async move {
                node.send_file("remote", "a.bin", Bytes::from(vec![7u8; 4000]), "application/octet-stream")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        node.handle_inbound(Inbound::Control {
            peer_id: "remote".into(),
            message: Message::TransferAccepted {
                file_name: "a.bin".into(),
            },
        })
        .await;
        sending.await.unwrap().unwrap();
        assert_eq!(kinds(&mock), ["file-offer", "file-metadata"]);
        assert_eq!(*mock.sent_chunks.lock().unwrap(), [0, 1, 2, 3]);
        assert_eq!(node.engine.lock().await.session_count(), 0);
        let mut sent = false;
        while let Ok(ev) = ch.events.try_recv() {
            sent |= matches!(ev, Event::Sent { .. });
        }
        assert!(sent);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_offer_send_leaves_no_session_behind() {
        let mock = MockTransport::new(TransportKind::Direct, 1024);
        mock.shut();
        let (node, mut ch) = node_with(&mock);
        for _ in 0..2 {
            let err = node
                .send_file("remote", "a.bin", Bytes::from_static(b"abc"), "text/plain")
                .await
                .unwrap_err();
            assert!(matches!(err, NodeError::Transport(TransportError::Closed)));
            assert_eq!(node.engine.lock().await.session_count(), 0);
        }
        match ch.events.try_recv().unwrap() {
            Event::Error { key, error } => {
                assert_eq!(key, Some(TransferKey::new("remote", "a.bin")));
                assert_eq!(error.kind(), ErrorKind::TransportClosed);
            }
            _ => panic!("expected an error event"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_metadata_send_clears_session_and_busy() {
        let mock = MockTransport::new(TransportKind::Direct, 1024);
        let (node, _ch) = node_with(&mock);
        let sending = {
            let node = node.clone();
            tokio::spawn(async move {
                node.send_file("remote", "a.bin", Bytes::from(vec![1u8; 3000]), "text/plain")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        mock.shut();
        node.handle_inbound(Inbound::Control {
            peer_id: "remote".into(),
            message: Message::TransferAccepted {
                file_name: "a.bin".into(),
            },
        })
        .await;
        let err = sending.await.unwrap().unwrap_err();
        assert!(matches!(err, NodeError::Transport(TransportError::Closed)));
        assert_eq!(kinds(&mock), ["file-offer"]);
        assert_eq!(node.engine.lock().await.session_count(), 0);
        assert!(!node.busy_flag().load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn relay_loss_fails_sessions_reached_through_fallback() {
        let mock = MockTransport::new(TransportKind::Relay, 1024);
        let fallback: Arc<dyn Connector> = Arc::new(Fixed(mock.clone()));
        let (node, mut ch) = PeerNode::new("Bob", Arc::new(Fixed(mock.clone())), Some(fallback));
        node.handle_inbound(Inbound::Control {
            peer_id: "remote".into(),
            message: Message::FileOffer {
                file_name: "in.bin".into(),
                file_size: 4000,
                sender_name: "Alice".into(),
            },
        })
        .await;
        let key = TransferKey::new("remote", "in.bin");
        node.accept_transfer(&key).await.unwrap();
        assert_eq!(kinds(&mock), ["transfer-accepted"]);

        let (_, session_key, iv) = lanbeam_core::ChunkCipher::generate();
        node.handle_inbound(Inbound::Control {
            peer_id: "remote".into(),
            message: Message::FileMetadata {
                file_name: "in.bin".into(),
                total_chunks: 4,
                key: session_key,
                iv,
                mime_type: "application/octet-stream".into(),
                file_size: 4000,
            },
        })
        .await;
        assert_eq!(node.decryptors.lock().unwrap().len(), 1);
        assert!(node.busy_flag().load(Ordering::SeqCst));

        node.handle_inbound(Inbound::RelayLost).await;

        assert_eq!(node.engine.lock().await.session_count(), 0);
        assert!(node.decryptors.lock().unwrap().is_empty());
        assert!(!node.busy_flag().load(Ordering::SeqCst));
        let mut failed = false;
        while let Ok(ev) = ch.events.try_recv() {
            if let Event::Error { key: Some(k), error } = ev {
                assert_eq!(k, key);
                assert_eq!(error.kind(), ErrorKind::TransportClosed);
                failed = true;
            }
        }
        assert!(failed);
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_failure_is_reported() {
        struct Refuse;
        #[async_trait]
        impl Connector for Refuse {
            async fn connect(&self, _peer_id: &str) -> anyhow::Result<Arc<dyn Transport>> {
                anyhow::bail!("unreachable")
            }
        }
        let (node, mut ch) = PeerNode::new("Alice", Arc::new(Refuse), None);
        let err = node
            .send_payload("ghost", Payload::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::Transfer(TransferError::Negotiation { attempts: 4, .. })
        ));
        assert!(matches!(ch.events.try_recv(), Ok(Event::Error { .. })));
        assert!(!node.busy_flag().load(Ordering::SeqCst));
    }

    /// Delivers everything it is given into the other node's inbound queue.
    struct LoopTransport {
        remote: String,
        local: String,
        to: mpsc::UnboundedSender<Inbound>,
    }

    #[async_trait]
    impl Transport for LoopTransport {
        fn peer_id(&self) -> &str {
            &self.remote
        }
        fn kind(&self) -> TransportKind {
            TransportKind::Direct
        }
        fn chunk_size(&self) -> u32 {
            64 * 1024
        }
        fn backpressure(&self) -> Backpressure {
            Backpressure::Event
        }
        fn is_open(&self) -> bool {
            !self.to.is_closed()
        }
        async fn send_message(&self, message: &Message) -> Result<(), TransportError> {
            self.to
                .send(Inbound::Control {
                    peer_id: self.local.clone(),
                    message: message.clone(),
                })
                .map_err(|_| TransportError::Closed)
        }
        async fn send_chunk(&self, index: u32, ciphertext: &[u8]) -> Result<(), TransportError> {
            self.to
                .send(Inbound::Chunk {
                    peer_id: self.local.clone(),
                    index,
                    payload: ciphertext.to_vec(),
                })
                .map_err(|_| TransportError::Closed)
        }
        async fn buffered_amount(&self) -> usize {
            0
        }
        async fn buffer_low(&self) {}
        async fn closed(&self) {
            std::future::pending::<()>().await
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn two_nodes_transfer_a_file_end_to_end() {
        let (to_alice, alice_in) = mpsc::unbounded_channel();
        let (to_bob, bob_in) = mpsc::unbounded_channel();
        let alice_link: Arc<dyn Transport> = Arc::new(LoopTransport {
            remote: "bob".into(),
            local: "alice".into(),
            to: to_bob,
        });
        let bob_link: Arc<dyn Transport> = Arc::new(LoopTransport {
            remote: "alice".into(),
            local: "bob".into(),
            to: to_alice,
        });
        let (alice, a_ch) = PeerNode::new("Alice", Arc::new(Fixed(alice_link)), None);
        let (bob, mut b_ch) = PeerNode::new("Bob", Arc::new(Fixed(bob_link.clone())), None);
        bob.negotiator().adopt(bob_link).await;

        let (_a_adopt_tx, a_adopt) = mpsc::unbounded_channel();
        let (_b_adopt_tx, b_adopt) = mpsc::unbounded_channel();
        tokio::spawn(alice.clone().run_dispatcher(alice_in, a_ch.decrypted, a_adopt));
        tokio::spawn(bob.clone().run_dispatcher(bob_in, b_ch.decrypted, b_adopt));

        let payload: Vec<u8> = (0..1_000_003u32).map(|i| (i * 31 % 256) as u8).collect();
        let digest: String = Sha256::digest(&payload)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        let sending = {
            let alice = alice.clone();
            let payload = Bytes::from(payload.clone());
            tokio::spawn(async move {
                alice
                    .send_file("bob", "photo.raw", payload, "application/octet-stream")
                    .await
            })
        };

        let delivery = tokio::time::timeout(Duration::from_secs(20), async {
            while let Some(ev) = b_ch.events.recv().await {
                match ev {
                    Event::IncomingOffer { key, file_size, sender_name } => {
                        assert_eq!(file_size, 1_000_003);
                        assert_eq!(sender_name, "Alice");
                        bob.accept_transfer(&key).await.unwrap();
                    }
                    Event::Completed(d) => return d,
                    _ => {}
                }
            }
            panic!("bob's event stream ended");
        })
        .await
        .unwrap();

        sending.await.unwrap().unwrap();
        assert_eq!(delivery.key, TransferKey::new("alice", "photo.raw"));
        assert_eq!(delivery.sender_name, "Alice");
        assert_eq!(delivery.sha256_hex(), digest);
        assert_eq!(bob.engine.lock().await.session_count(), 0);
        assert_eq!(alice.engine.lock().await.session_count(), 0);
        assert!(bob.decryptors.lock().unwrap().is_empty());
    }

    #[test]
    fn auto_mode_picks_relay_on_loopback() {
        assert_eq!(
            resolve_mode(TransportMode::Auto, "http://127.0.0.1:9000"),
            TransportMode::Relay
        );
        assert_eq!(
            resolve_mode(TransportMode::Auto, "http://localhost:9000"),
            TransportMode::Relay
        );
        assert_eq!(
            resolve_mode(TransportMode::Auto, "http://192.168.1.20:9000"),
            TransportMode::Direct
        );
        assert_eq!(
            resolve_mode(TransportMode::Direct, "http://127.0.0.1:9000"),
            TransportMode::Direct
        );
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_for(Path::new("a/b.PNG")), "image/png");
        assert_eq!(mime_for(Path::new("noext")), "application/octet-stream");
        assert_eq!(file_name(Path::new("/tmp/x/report.pdf")), "report.pdf");
    }
}
