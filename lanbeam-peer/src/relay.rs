//! Relay transport: all peer traffic multiplexed over one socket to the server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use lanbeam_core::config::{
    BUFFERED_AMOUNT_LOW, RELAY_BUFFER_POLL, RELAY_CHUNK_SIZE, RELAY_RECONNECT_DELAY,
};
use lanbeam_core::relay::{decode_chunk_frame, encode_relay_chunk, DeliveredEnvelope, ForwardEnvelope};
use lanbeam_core::{Control, Message, Signal};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::direct::SignalSink;
use crate::negotiator::Connector;
use crate::transport::{Backpressure, Inbound, Transport, TransportError, TransportKind};

/// Relay socket URL for `server_url` (`http` → `ws`, `https` → `wss`).
pub fn relay_url(server_url: &str, peer_id: &str) -> anyhow::Result<String> {
    let base = server_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        bail!("unsupported server url: {server_url}");
    };
    Ok(format!("{ws}/ws?peerId={peer_id}"))
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state shared by the hub handle and its supervisor task.
struct Link {
    buffered: AtomicUsize,
    open: AtomicBool,
    stopping: AtomicBool,
    /// `true` while the socket is down.
    down_tx: watch::Sender<bool>,
    /// Bumped on every successful reconnect.
    generation_tx: watch::Sender<u64>,
}

impl Link {
    fn up(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.down_tx.send_replace(false);
    }

    /// Discard whatever was queued for the dead socket.
    fn down(&self, out_rx: &mut mpsc::UnboundedReceiver<WsMessage>) {
        self.open.store(false, Ordering::SeqCst);
        while out_rx.try_recv().is_ok() {}
        self.buffered.store(0, Ordering::SeqCst);
        self.down_tx.send_replace(true);
    }
}

/// The one socket to the server. Carries relayed chunks, relayed control
/// messages and negotiation signals. A dropped socket is re-opened under the
/// same peer id after [`RELAY_RECONNECT_DELAY`] until [`RelayHub::close`].
pub struct RelayHub {
    out_tx: mpsc::UnboundedSender<WsMessage>,
    link: Arc<Link>,
}

impl RelayHub {
    /// Connect and start the supervisor task. Control messages and chunks go
    /// to `inbound`; signals go to `signals`. Only the first connection
    /// attempt is reported as an error.
    pub async fn connect(
        server_url: &str,
        peer_id: &str,
        inbound: mpsc::UnboundedSender<Inbound>,
        signals: mpsc::UnboundedSender<(String, Signal)>,
    ) -> anyhow::Result<Arc<Self>> {
        let url = relay_url(server_url, peer_id)?;
        let ws = open_socket(&url).await?;

        let (out_tx, out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (down_tx, _) = watch::channel(false);
        let (generation_tx, _) = watch::channel(0);
        let link = Arc::new(Link {
            buffered: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            down_tx,
            generation_tx,
        });
        tokio::spawn(supervise(url, ws, out_rx, link.clone(), inbound, signals));
        Ok(Arc::new(Self { out_tx, link }))
    }

    pub fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    /// Binary bytes queued for the socket but not yet written.
    pub fn buffered_amount(&self) -> usize {
        self.link.buffered.load(Ordering::SeqCst)
    }

    /// Changes each time the socket is re-opened after a drop.
    pub fn reconnects(&self) -> watch::Receiver<u64> {
        self.link.generation_tx.subscribe()
    }

    pub async fn send_control(&self, target: &str, control: &Control) -> Result<(), TransportError> {
        let env = ForwardEnvelope::wrap(target, control)
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        let text = serde_json::to_string(&env).map_err(|e| TransportError::Encode(e.to_string()))?;
        self.enqueue(WsMessage::Text(text))
    }

    pub async fn send_signal(&self, target: &str, signal: Signal) -> Result<(), TransportError> {
        self.send_control(target, &Control::Signal(signal)).await
    }

    fn send_binary(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let len = frame.len();
        self.link.buffered.fetch_add(len, Ordering::SeqCst);
        self.enqueue(WsMessage::Binary(frame)).inspect_err(|_| {
            self.link.buffered.fetch_sub(len, Ordering::SeqCst);
        })
    }

    fn enqueue(&self, msg: WsMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.out_tx.send(msg).map_err(|_| TransportError::Closed)
    }

    /// Resolves once the current socket is down.
    pub async fn closed(&self) {
        let mut rx = self.link.down_tx.subscribe();
        let _ = rx.wait_for(|down| *down).await;
    }

    /// Close the socket for good.
    pub fn close(&self) {
        self.link.stopping.store(true, Ordering::SeqCst);
        let _ = self.out_tx.send(WsMessage::Close(None));
    }
}

#[async_trait]
impl SignalSink for RelayHub {
    async fn send_signal(&self, target: &str, signal: Signal) -> Result<(), TransportError> {
        RelayHub::send_signal(self, target, signal).await
    }
}

async fn open_socket(url: &str) -> anyhow::Result<WsStream> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("connecting relay socket {url}"))?;
    info!(event = "relay_connected", url = %url, "Relay socket open");
    Ok(ws)
}

/// Run sockets back to back: serve one until it drops, report the loss,
/// wait, reconnect.
async fn supervise(
    url: String,
    mut ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<WsMessage>,
    link: Arc<Link>,
    inbound: mpsc::UnboundedSender<Inbound>,
    signals: mpsc::UnboundedSender<(String, Signal)>,
) {
    loop {
        serve(ws, &mut out_rx, &link, &inbound, &signals).await;
        link.down(&mut out_rx);
        if link.stopping.load(Ordering::SeqCst) || inbound.is_closed() {
            break;
        }
        let _ = inbound.send(Inbound::RelayLost);
        ws = loop {
            tokio::time::sleep(RELAY_RECONNECT_DELAY).await;
            if link.stopping.load(Ordering::SeqCst) {
                debug!(event = "relay_stopped", "Relay hub closed");
                return;
            }
            match open_socket(&url).await {
                Ok(ws) => break ws,
                Err(e) => warn!(event = "relay_reconnect_failed", error = %e, "Relay reconnect failed"),
            }
        };
        link.up();
        link.generation_tx.send_modify(|g| *g += 1);
    }
    debug!(event = "relay_stopped", "Relay hub closed");
}

/// Pump one socket until either direction fails or a close is sent.
async fn serve(
    ws: WsStream,
    out_rx: &mut mpsc::UnboundedReceiver<WsMessage>,
    link: &Link,
    inbound: &mpsc::UnboundedSender<Inbound>,
    signals: &mpsc::UnboundedSender<(String, Signal)>,
) {
    let (mut sink, mut stream) = ws.split();
    let writer = async {
        while let Some(msg) = out_rx.recv().await {
            let (len, closing) = match &msg {
                WsMessage::Binary(b) => (b.len(), false),
                WsMessage::Close(_) => (0, true),
                _ => (0, false),
            };
            let res = sink.send(msg).await;
            link.buffered.fetch_sub(len, Ordering::SeqCst);
            if let Err(e) = res {
                warn!(event = "relay_write_failed", error = %e, "Relay socket write failed");
                return;
            }
            if closing {
                return;
            }
        }
        // Every hub handle is gone.
        link.stopping.store(true, Ordering::SeqCst);
    };
    let reader = async {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => dispatch_text(&text, inbound, signals),
                Ok(WsMessage::Binary(bytes)) => dispatch_binary(&bytes, inbound),
                Ok(WsMessage::Close(frame)) => {
                    debug!(event = "relay_close_frame", ?frame, "Server closed relay socket");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(event = "relay_read_failed", error = %e, "Relay socket read failed");
                    return;
                }
            }
        }
    };
    // Reading and writing proceed independently; either ending drops the socket.
    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
}

fn dispatch_text(
    text: &str,
    inbound: &mpsc::UnboundedSender<Inbound>,
    signals: &mpsc::UnboundedSender<(String, Signal)>,
) {
    let parsed = serde_json::from_str::<DeliveredEnvelope>(text)
        .map_err(|e| e.to_string())
        .and_then(|env| env.into_control().map_err(|e| e.to_string()));
    match parsed {
        Ok((peer_id, Control::Transfer(message))) => {
            let _ = inbound.send(Inbound::Control { peer_id, message });
        }
        Ok((peer_id, Control::Signal(signal))) => {
            let _ = signals.send((peer_id, signal));
        }
        Err(e) => warn!(event = "relay_bad_text", error = %e, "Ignoring undecodable relay message"),
    }
}

fn dispatch_binary(bytes: &[u8], inbound: &mpsc::UnboundedSender<Inbound>) {
    match decode_chunk_frame(bytes) {
        Ok(frame) => match frame.peer_id {
            Some(peer_id) => {
                let _ = inbound.send(Inbound::Chunk {
                    peer_id,
                    index: frame.chunk_index,
                    payload: frame.payload,
                });
            }
            None => warn!(event = "relay_bad_frame", "Direct chunk frame on relay socket"),
        },
        Err(e) => warn!(event = "relay_bad_frame", error = %e, "Ignoring malformed relay frame"),
    }
}

/// Relay transport to one peer, sharing the hub's socket.
pub struct RelayTransport {
    hub: Arc<RelayHub>,
    peer_id: String,
}

impl RelayTransport {
    pub fn new(hub: Arc<RelayHub>, peer_id: impl Into<String>) -> Self {
        Self {
            hub,
            peer_id: peer_id.into(),
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn chunk_size(&self) -> u32 {
        RELAY_CHUNK_SIZE
    }

    fn backpressure(&self) -> Backpressure {
        Backpressure::Polling
    }

    fn is_open(&self) -> bool {
        self.hub.is_open()
    }

    async fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        self.hub
            .send_control(&self.peer_id, &Control::Transfer(message.clone()))
            .await
    }

    async fn send_chunk(&self, index: u32, ciphertext: &[u8]) -> Result<(), TransportError> {
        let frame = encode_relay_chunk(&self.peer_id, index, ciphertext)
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.hub.send_binary(frame)
    }

    async fn buffered_amount(&self) -> usize {
        self.hub.buffered_amount()
    }

    async fn buffer_low(&self) {
        while self.hub.is_open() && self.hub.buffered_amount() > BUFFERED_AMOUNT_LOW {
            tokio::time::sleep(RELAY_BUFFER_POLL).await;
        }
    }

    async fn closed(&self) {
        self.hub.closed().await
    }

    /// The hub is shared; closing one peer's relay transport leaves it up.
    async fn close(&self) {}
}

/// Connector for the fallback path: always succeeds while the hub is up.
pub struct RelayConnector {
    hub: Arc<RelayHub>,
}

impl RelayConnector {
    pub fn new(hub: Arc<RelayHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Connector for RelayConnector {
    async fn connect(&self, peer_id: &str) -> anyhow::Result<Arc<dyn Transport>> {
        if !self.hub.is_open() {
            bail!("relay socket is closed");
        }
        Ok(Arc::new(RelayTransport::new(self.hub.clone(), peer_id)))
    }
}
