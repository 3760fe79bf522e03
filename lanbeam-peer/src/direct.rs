//! Direct transport: a WebRTC data channel per peer, negotiated by trickling
//! offer, answer and candidates through the relay socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use lanbeam_core::config::{BUFFERED_AMOUNT_LOW, DIRECT_ATTEMPT_TIMEOUT, DIRECT_CHUNK_SIZE};
use lanbeam_core::relay::{decode_chunk_frame, encode_direct_chunk};
use lanbeam_core::{CandidateKind, Message, Signal};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::negotiator::Connector;
use crate::transport::{Backpressure, Inbound, Transport, TransportError, TransportKind};

const CHANNEL_LABEL: &str = "lanbeam";

/// Where offers, answers and candidates for a remote peer are sent.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send_signal(&self, target: &str, signal: Signal) -> Result<(), TransportError>;
}

/// Shared between the data channel callbacks and the transport handle.
struct LinkState {
    peer_id: String,
    closed: AtomicBool,
    low: Notify,
    closed_tx: watch::Sender<bool>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl LinkState {
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closed_tx.send_replace(true);
            let _ = self.inbound.send(Inbound::Closed {
                peer_id: self.peer_id.clone(),
            });
        }
    }
}

/// Attach message, close and buffer-low handlers to `dc`.
async fn wire_channel(
    peer_id: &str,
    dc: &Arc<RTCDataChannel>,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> Arc<LinkState> {
    let (closed_tx, _) = watch::channel(false);
    let state = Arc::new(LinkState {
        peer_id: peer_id.to_string(),
        closed: AtomicBool::new(false),
        low: Notify::new(),
        closed_tx,
        inbound,
    });

    let s = state.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let s = s.clone();
        Box::pin(async move { dispatch(&s, msg) })
    }));

    let s = state.clone();
    dc.on_close(Box::new(move || {
        let s = s.clone();
        Box::pin(async move {
            warn!(event = "dc_closed", peer = %s.peer_id, "Data channel closed");
            s.mark_closed();
        })
    }));

    dc.set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW).await;
    let s = state.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        s.low.notify_one();
        Box::pin(async {})
    }))
    .await;

    state
}

fn dispatch(state: &LinkState, msg: DataChannelMessage) {
    let peer_id = state.peer_id.clone();
    if msg.is_string {
        let parsed = std::str::from_utf8(&msg.data)
            .map_err(|e| e.to_string())
            .and_then(|t| Message::from_json(t).map_err(|e| e.to_string()));
        match parsed {
            Ok(message) => {
                let _ = state.inbound.send(Inbound::Control { peer_id, message });
            }
            Err(e) => warn!(event = "dc_bad_text", peer = %peer_id, error = %e, "Ignoring undecodable message"),
        }
        return;
    }
    match decode_chunk_frame(&msg.data) {
        Ok(frame) => {
            let _ = state.inbound.send(Inbound::Chunk {
                peer_id,
                index: frame.chunk_index,
                payload: frame.payload,
            });
        }
        Err(e) => warn!(event = "dc_bad_frame", peer = %peer_id, error = %e, "Ignoring malformed chunk frame"),
    }
}

fn watch_connection_state(pc: &Arc<RTCPeerConnection>, state: Arc<LinkState>) {
    pc.on_peer_connection_state_change(Box::new(move |s| {
        let state = state.clone();
        Box::pin(async move {
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", peer = %state.peer_id, "Peer connection established");
                }
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    warn!(event = "webrtc_down", peer = %state.peer_id, ?s, "Peer connection down");
                    state.mark_closed();
                }
                _ => {}
            }
        })
    }));
}

/// Data channel transport to one peer.
pub struct DirectTransport {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    state: Arc<LinkState>,
}

#[async_trait]
impl Transport for DirectTransport {
    fn peer_id(&self) -> &str {
        &self.state.peer_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn chunk_size(&self) -> u32 {
        DIRECT_CHUNK_SIZE
    }

    fn backpressure(&self) -> Backpressure {
        Backpressure::Event
    }

    fn is_open(&self) -> bool {
        !self.state.closed.load(Ordering::SeqCst)
            && self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let text = message
            .to_json()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn send_chunk(&self, index: u32, ciphertext: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let frame = Bytes::from(encode_direct_chunk(index, ciphertext));
        self.dc
            .send(&frame)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn buffer_low(&self) {
        self.state.low.notified().await
    }

    async fn closed(&self) {
        let mut rx = self.state.closed_tx.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(event = "webrtc_close_error", peer = %self.state.peer_id, error = %e, "Error closing peer connection");
        }
        self.state.mark_closed();
    }
}

/// One peer connection being negotiated.
struct Negotiation {
    pc: Arc<RTCPeerConnection>,
    remote_set: AtomicBool,
    pending: Mutex<Vec<RTCIceCandidateInit>>,
}

impl Negotiation {
    async fn set_remote(&self, desc: RTCSessionDescription) -> anyhow::Result<()> {
        self.pc.set_remote_description(desc).await?;
        let queued = {
            let mut pending = self.pending.lock().await;
            self.remote_set.store(true, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };
        for c in queued {
            self.pc.add_ice_candidate(c).await?;
        }
        Ok(())
    }

    /// Candidates that beat the remote description are queued until it lands.
    async fn add_candidate(&self, c: RTCIceCandidateInit) -> anyhow::Result<()> {
        {
            let mut pending = self.pending.lock().await;
            if !self.remote_set.load(Ordering::SeqCst) {
                pending.push(c);
                return Ok(());
            }
        }
        self.pc.add_ice_candidate(c).await?;
        Ok(())
    }
}

type Links = Arc<Mutex<HashMap<String, Arc<Negotiation>>>>;

/// Drop `peer_id`'s entry if it is still `neg`.
async fn forget_link(links: &Links, peer_id: &str, neg: &Arc<Negotiation>) {
    let mut links = links.lock().await;
    if links.get(peer_id).is_some_and(|cur| Arc::ptr_eq(cur, neg)) {
        links.remove(peer_id);
        debug!(event = "link_pruned", peer = %peer_id, "Forgot closed peer connection");
    }
}

/// Forget the negotiation once its channel closes.
fn prune_on_close(links: &Links, peer_id: &str, neg: &Arc<Negotiation>, state: &LinkState) {
    let links = links.clone();
    let peer_id = peer_id.to_string();
    let neg = neg.clone();
    let mut closed = state.closed_tx.subscribe();
    tokio::spawn(async move {
        let _ = closed.wait_for(|c| *c).await;
        forget_link(&links, &peer_id, &neg).await;
    });
}

/// Offer/answer/candidate exchange over a [`SignalSink`] (the relay socket).
pub struct RtcSignaling {
    hub: Arc<dyn SignalSink>,
    ice_servers: Vec<RTCIceServer>,
    include_loopback: AtomicBool,
    inbound: mpsc::UnboundedSender<Inbound>,
    adopted: mpsc::UnboundedSender<Arc<dyn Transport>>,
    links: Links,
}

impl RtcSignaling {
    /// Transports opened by remote offers are delivered on `adopted`.
    pub fn new(
        hub: Arc<dyn SignalSink>,
        stun_servers: &[String],
        inbound: mpsc::UnboundedSender<Inbound>,
        adopted: mpsc::UnboundedSender<Arc<dyn Transport>>,
    ) -> Arc<Self> {
        let ice_servers = stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        Arc::new(Self {
            hub,
            ice_servers,
            include_loopback: AtomicBool::new(false),
            inbound,
            adopted,
            links: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Gather loopback candidates too, for peers on the same host.
    pub fn set_include_loopback(&self, include: bool) {
        self.include_loopback.store(include, Ordering::SeqCst);
    }

    async fn peer_connection(&self, peer_id: &str) -> anyhow::Result<Arc<Negotiation>> {
        let mut me = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut me)?;
        let mut settings = SettingEngine::default();
        settings.set_include_loopback_candidate(self.include_loopback.load(Ordering::SeqCst));
        let api = APIBuilder::new()
            .with_media_engine(me)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await?,
        );

        let hub = self.hub.clone();
        let target = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let hub = hub.clone();
            let target = target.clone();
            Box::pin(async move {
                let Some(c) = c else { return };
                let init = match c.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(event = "candidate_encode_failed", error = %e, "Skipping local candidate");
                        return;
                    }
                };
                let kind = CandidateKind::classify(&init.candidate);
                if kind.is_degraded() {
                    warn!(event = "candidate_relayed", peer = %target, "Only a relayed (TURN) path; throughput will suffer");
                } else {
                    debug!(event = "candidate", peer = %target, kind = kind.as_str(), "Local candidate");
                }
                let signal = Signal::RtcCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                };
                if let Err(e) = hub.send_signal(&target, signal).await {
                    warn!(event = "candidate_send_failed", peer = %target, error = %e, "Could not trickle candidate");
                }
            })
        }));

        let neg = Arc::new(Negotiation {
            pc,
            remote_set: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        });
        let replaced = self
            .links
            .lock()
            .await
            .insert(peer_id.to_string(), neg.clone());
        if let Some(old) = replaced {
            let _ = old.pc.close().await;
        }
        Ok(neg)
    }

    /// Offerer side: one attempt at a direct channel to `peer_id`.
    pub async fn dial(&self, peer_id: &str) -> anyhow::Result<Arc<dyn Transport>> {
        let neg = self.peer_connection(peer_id).await?;
        let pc = neg.pc.clone();
        let dc = pc
            .create_data_channel(
                CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        let state = wire_channel(peer_id, &dc, self.inbound.clone()).await;

        let (open_tx, open_rx) = oneshot::channel::<()>();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(());
            Box::pin(async {})
        }));

        // The offer goes out before gathering starts, so no candidate can
        // reach the peer ahead of it.
        let offer = pc.create_offer(None).await?;
        self.hub
            .send_signal(peer_id, Signal::RtcOffer { sdp: offer.sdp.clone() })
            .await
            .map_err(|e| anyhow!("sending offer: {e}"))?;
        pc.set_local_description(offer).await?;

        match tokio::time::timeout(DIRECT_ATTEMPT_TIMEOUT, open_rx).await {
            Ok(Ok(())) => {
                watch_connection_state(&pc, state.clone());
                prune_on_close(&self.links, peer_id, &neg, &state);
                Ok(Arc::new(DirectTransport { pc, dc, state }))
            }
            _ => {
                forget_link(&self.links, peer_id, &neg).await;
                let _ = pc.close().await;
                Err(anyhow!("data channel to {peer_id} did not open"))
            }
        }
    }

    /// Handle a signal relayed from `peer_id`.
    pub async fn handle_signal(&self, peer_id: String, signal: Signal) {
        let res = match signal {
            Signal::RtcOffer { sdp } => self.answer(&peer_id, sdp).await,
            Signal::RtcAnswer { sdp } => self.on_answer(&peer_id, sdp).await,
            Signal::RtcCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let kind = CandidateKind::classify(&candidate);
                debug!(event = "remote_candidate", peer = %peer_id, kind = kind.as_str(), "Remote candidate");
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    username_fragment: None,
                };
                let neg = self.links.lock().await.get(&peer_id).cloned();
                match neg {
                    Some(neg) => neg.add_candidate(init).await,
                    None => Ok(()),
                }
            }
        };
        if let Err(e) = res {
            error!(event = "signal_failed", peer = %peer_id, error = %e, "Negotiation signal failed");
        }
    }

    async fn on_answer(&self, peer_id: &str, sdp: String) -> anyhow::Result<()> {
        let neg = self
            .links
            .lock()
            .await
            .get(peer_id)
            .cloned()
            .with_context(|| format!("answer from {peer_id} without an offer"))?;
        neg.set_remote(RTCSessionDescription::answer(sdp)?).await
    }

    /// Answerer side: accept a remote offer; the transport is adopted once
    /// its data channel opens.
    async fn answer(&self, peer_id: &str, sdp: String) -> anyhow::Result<()> {
        let neg = self.peer_connection(peer_id).await?;
        let pc = neg.pc.clone();

        let inbound = self.inbound.clone();
        let adopted = self.adopted.clone();
        let remote = peer_id.to_string();
        let pc_for_dc = pc.clone();
        let links = self.links.clone();
        let neg_for_dc = neg.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let inbound = inbound.clone();
            let adopted = adopted.clone();
            let remote = remote.clone();
            let pc = pc_for_dc.clone();
            let links = links.clone();
            let neg = neg_for_dc.clone();
            Box::pin(async move {
                let state = wire_channel(&remote, &dc, inbound).await;
                watch_connection_state(&pc, state.clone());
                prune_on_close(&links, &remote, &neg, &state);
                let transport: Arc<dyn Transport> = Arc::new(DirectTransport {
                    pc,
                    dc: dc.clone(),
                    state,
                });
                dc.on_open(Box::new(move || {
                    let _ = adopted.send(transport);
                    Box::pin(async {})
                }));
            })
        }));

        neg.set_remote(RTCSessionDescription::offer(sdp)?).await?;
        let answer = pc.create_answer(None).await?;
        self.hub
            .send_signal(peer_id, Signal::RtcAnswer { sdp: answer.sdp.clone() })
            .await
            .map_err(|e| anyhow!("sending answer: {e}"))?;
        pc.set_local_description(answer).await?;
        Ok(())
    }
}

/// Connector for the primary path.
pub struct DirectConnector {
    signaling: Arc<RtcSignaling>,
}

impl DirectConnector {
    pub fn new(signaling: Arc<RtcSignaling>) -> Self {
        Self { signaling }
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self, peer_id: &str) -> anyhow::Result<Arc<dyn Transport>> {
        self.signaling.dial(peer_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Hands every signal to the other side's queue, tagged with our id.
    struct LoopSink {
        from: String,
        to: mpsc::UnboundedSender<(String, Signal)>,
    }

    #[async_trait]
    impl SignalSink for LoopSink {
        async fn send_signal(&self, _target: &str, signal: Signal) -> Result<(), TransportError> {
            self.to
                .send((self.from.clone(), signal))
                .map_err(|_| TransportError::Closed)
        }
    }

    struct Side {
        signaling: Arc<RtcSignaling>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        adopted: mpsc::UnboundedReceiver<Arc<dyn Transport>>,
    }

    fn side(me: &str, to: mpsc::UnboundedSender<(String, Signal)>) -> Side {
        let (in_tx, inbound) = mpsc::unbounded_channel();
        let (ad_tx, adopted) = mpsc::unbounded_channel();
        let sink = Arc::new(LoopSink {
            from: me.to_string(),
            to,
        });
        let signaling = RtcSignaling::new(sink, &[], in_tx, ad_tx);
        signaling.set_include_loopback(true);
        Side {
            signaling,
            inbound,
            adopted,
        }
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !check().await {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn pending_candidates(signaling: &RtcSignaling, peer: &str) -> usize {
        let neg = signaling.links.lock().await.get(peer).cloned();
        match neg {
            Some(neg) => neg.pending.lock().await.len(),
            None => 0,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loopback_channel_carries_messages_and_chunks() {
        let (to_alice, mut alice_signals) = mpsc::unbounded_channel();
        let (to_bob, mut bob_signals) = mpsc::unbounded_channel();
        let mut alice = side("alice", to_bob);
        let mut bob = side("bob", to_alice);

        {
            let bob = bob.signaling.clone();
            tokio::spawn(async move {
                while let Some((peer, signal)) = bob_signals.recv().await {
                    bob.handle_signal(peer, signal).await;
                }
            });
        }
        // Alice's answer is held back; Bob's candidates reach her first.
        let (held_tx, held_rx) = oneshot::channel();
        {
            let alice = alice.signaling.clone();
            tokio::spawn(async move {
                let mut held_tx = Some(held_tx);
                while let Some((peer, signal)) = alice_signals.recv().await {
                    match (signal, held_tx.take()) {
                        (answer @ Signal::RtcAnswer { .. }, Some(tx)) => {
                            let _ = tx.send((peer, answer));
                        }
                        (other, tx) => {
                            held_tx = tx;
                            alice.handle_signal(peer, other).await;
                        }
                    }
                }
            });
        }

        let dialing = {
            let alice = alice.signaling.clone();
            tokio::spawn(async move { alice.dial("bob").await })
        };
        let (peer, answer) = tokio::time::timeout(Duration::from_secs(10), held_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer, "bob");
        eventually("queued candidates", || {
            let s = alice.signaling.clone();
            async move { pending_candidates(&s, "bob").await > 0 }
        })
        .await;

        alice.signaling.handle_signal(peer, answer).await;
        assert_eq!(pending_candidates(&alice.signaling, "bob").await, 0);

        let to_bob = dialing.await.unwrap().unwrap();
        assert_eq!(to_bob.kind(), TransportKind::Direct);
        let to_alice = tokio::time::timeout(Duration::from_secs(10), bob.adopted.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(to_alice.peer_id(), "alice");

        to_bob
            .send_message(&Message::TextMessage {
                text: "hi".into(),
                sender_name: "Alice".into(),
            })
            .await
            .unwrap();
        to_bob.send_chunk(3, b"sealed bytes").await.unwrap();

        match tokio::time::timeout(Duration::from_secs(5), bob.inbound.recv()).await.unwrap() {
            Some(Inbound::Control { peer_id, message }) => {
                assert_eq!(peer_id, "alice");
                assert_eq!(message.kind(), "text-message");
            }
            other => panic!("unexpected {other:?}"),
        }
        match tokio::time::timeout(Duration::from_secs(5), bob.inbound.recv()).await.unwrap() {
            Some(Inbound::Chunk { peer_id, index, payload }) => {
                assert_eq!(peer_id, "alice");
                assert_eq!(index, 3);
                assert_eq!(payload, b"sealed bytes");
            }
            other => panic!("unexpected {other:?}"),
        }

        to_bob.close().await;
        assert!(!to_bob.is_open());
        match tokio::time::timeout(Duration::from_secs(5), alice.inbound.recv()).await.unwrap() {
            Some(Inbound::Closed { peer_id }) => assert_eq!(peer_id, "bob"),
            other => panic!("unexpected {other:?}"),
        }
        eventually("link pruned", || {
            let s = alice.signaling.clone();
            async move { !s.links.lock().await.contains_key("bob") }
        })
        .await;
        to_alice.close().await;
    }
}
