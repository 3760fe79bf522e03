//! Transport negotiation: one connection record per remote peer, bounded
//! retries with backoff, reuse of open transports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lanbeam_core::config::{CONNECT_MAX_RETRIES, CONNECT_RETRY_DELAYS, OPEN_POLL_INTERVAL, OPEN_TIMEOUT};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::transport::{quality_sample, Transport, TransportKind};

/// Establishes one transport to a peer; a single attempt, no retries.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, peer_id: &str) -> anyhow::Result<Arc<dyn Transport>>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("could not connect to {peer} after {attempts} attempts")]
    Exhausted { peer: String, attempts: u32 },
    #[error("connection to {0} already being negotiated")]
    InProgress(String),
    #[error("no open connection to {peer} within {waited:?}")]
    OpenTimeout { peer: String, waited: Duration },
}

/// Per-peer negotiation state.
#[derive(Default)]
pub struct ConnectionRecord {
    pub transport: Option<Arc<dyn Transport>>,
    pub quality: f32,
    pub retries: u32,
    pub connecting: bool,
}

impl ConnectionRecord {
    fn open_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.as_ref().filter(|t| t.is_open()).cloned()
    }
}

pub struct Negotiator {
    connector: Arc<dyn Connector>,
    records: Mutex<HashMap<String, ConnectionRecord>>,
}

impl Negotiator {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to `peer_id`, reusing an open transport. A concurrent call for
    /// the same peer gets [`NegotiationError::InProgress`].
    pub async fn connect(&self, peer_id: &str) -> Result<Arc<dyn Transport>, NegotiationError> {
        {
            let mut records = self.records.lock().await;
            let rec = records.entry(peer_id.to_string()).or_default();
            if let Some(t) = rec.open_transport() {
                return Ok(t);
            }
            if rec.connecting {
                return Err(NegotiationError::InProgress(peer_id.to_string()));
            }
            rec.connecting = true;
            rec.transport = None;
        }

        let attempts = CONNECT_MAX_RETRIES + 1;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = CONNECT_RETRY_DELAYS[(attempt - 1) as usize];
                debug!(event = "connect_backoff", peer = %peer_id, attempt, ?delay, "Retrying connection");
                tokio::time::sleep(delay).await;
            }
            match self.connector.connect(peer_id).await {
                Ok(t) => {
                    info!(event = "connected", peer = %peer_id, transport = t.kind().as_str(), attempt, "Transport open");
                    let mut records = self.records.lock().await;
                    let rec = records.entry(peer_id.to_string()).or_default();
                    rec.connecting = false;
                    rec.retries = attempt;
                    rec.quality = quality_sample(true, 0);
                    rec.transport = Some(t.clone());
                    return Ok(t);
                }
                Err(e) => {
                    warn!(event = "connect_failed", peer = %peer_id, attempt, error = %e, "Connection attempt failed");
                    if let Some(rec) = self.records.lock().await.get_mut(peer_id) {
                        rec.retries = attempt + 1;
                    }
                }
            }
        }

        if let Some(rec) = self.records.lock().await.get_mut(peer_id) {
            rec.connecting = false;
        }
        Err(NegotiationError::Exhausted {
            peer: peer_id.to_string(),
            attempts,
        })
    }

    /// Transport for sending to `peer_id`: connect, or wait up to
    /// [`OPEN_TIMEOUT`] for a negotiation already in flight.
    pub async fn open_transport(&self, peer_id: &str) -> Result<Arc<dyn Transport>, NegotiationError> {
        match self.connect(peer_id).await {
            Err(NegotiationError::InProgress(_)) => {}
            other => return other,
        }
        let deadline = tokio::time::Instant::now() + OPEN_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(OPEN_POLL_INTERVAL).await;
            let records = self.records.lock().await;
            let Some(rec) = records.get(peer_id) else {
                break;
            };
            if let Some(t) = rec.open_transport() {
                return Ok(t);
            }
            if !rec.connecting {
                break;
            }
        }
        Err(NegotiationError::OpenTimeout {
            peer: peer_id.to_string(),
            waited: OPEN_TIMEOUT,
        })
    }

    /// Install a transport the remote side opened to us.
    pub async fn adopt(&self, transport: Arc<dyn Transport>) {
        let peer_id = transport.peer_id().to_string();
        let mut records = self.records.lock().await;
        let rec = records.entry(peer_id).or_default();
        rec.quality = quality_sample(transport.is_open(), 0);
        rec.transport = Some(transport);
    }

    /// A transport to `peer_id` reported closed. The record is dropped unless
    /// a newer transport is already open or being negotiated; returns whether
    /// it was dropped.
    pub async fn forget_closed(&self, peer_id: &str) -> bool {
        let mut records = self.records.lock().await;
        match records.get(peer_id) {
            Some(r) if r.connecting || r.open_transport().is_some() => false,
            Some(_) => {
                records.remove(peer_id);
                true
            }
            None => false,
        }
    }

    /// The relay socket is gone: drop every relayed record, returning the peers.
    pub async fn forget_relayed(&self) -> Vec<String> {
        let mut records = self.records.lock().await;
        let gone: Vec<String> = records
            .iter()
            .filter(|(_, r)| {
                !r.connecting
                    && r.transport
                        .as_ref()
                        .is_some_and(|t| t.kind() == TransportKind::Relay)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &gone {
            records.remove(id);
        }
        gone
    }

    pub async fn transport(&self, peer_id: &str) -> Option<Arc<dyn Transport>> {
        self.records.lock().await.get(peer_id).and_then(|r| r.open_transport())
    }

    pub async fn is_negotiating(&self) -> bool {
        self.records.lock().await.values().any(|r| r.connecting)
    }

    /// Peers whose transport is open, with its kind.
    pub async fn open_peers(&self) -> Vec<(String, Arc<dyn Transport>)> {
        self.records
            .lock()
            .await
            .iter()
            .filter_map(|(id, r)| r.open_transport().map(|t| (id.clone(), t)))
            .collect()
    }

    /// Re-sample connection quality for every record.
    pub async fn sample_quality(&self) -> Vec<(String, f32)> {
        let transports: Vec<(String, Option<Arc<dyn Transport>>)> = self
            .records
            .lock()
            .await
            .iter()
            .map(|(id, r)| (id.clone(), r.transport.clone()))
            .collect();
        let mut samples = Vec::with_capacity(transports.len());
        for (id, t) in transports {
            let q = match t {
                Some(t) => quality_sample(t.is_open(), t.buffered_amount().await),
                None => quality_sample(false, 0),
            };
            samples.push((id, q));
        }
        let mut records = self.records.lock().await;
        for (id, q) in &samples {
            if let Some(rec) = records.get_mut(id) {
                rec.quality = *q;
            }
        }
        samples
    }

    pub async fn quality(&self, peer_id: &str) -> Option<f32> {
        self.records.lock().await.get(peer_id).map(|r| r.quality)
    }

    pub async fn retries(&self, peer_id: &str) -> Option<u32> {
        self.records.lock().await.get(peer_id).map(|r| r.retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts, then succeeds after `delay`.
    struct FlakyConnector {
        failures: u32,
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, _peer_id: &str) -> anyhow::Result<Arc<dyn Transport>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if n < self.failures {
                anyhow::bail!("attempt {n} refused");
            }
            Ok(MockTransport::new(TransportKind::Direct, 1024))
        }
    }

    fn negotiator(failures: u32, delay: Duration) -> (Negotiator, Arc<FlakyConnector>) {
        let c = Arc::new(FlakyConnector {
            failures,
            delay,
            calls: AtomicU32::new(0),
        });
        (Negotiator::new(c.clone()), c)
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_retries() {
        let (n, c) = negotiator(u32::MAX, Duration::ZERO);
        let started = tokio::time::Instant::now();
        let err = n.connect("p").await.err().unwrap();
        assert_eq!(
            err,
            NegotiationError::Exhausted {
                peer: "p".into(),
                attempts: 4
            }
        );
        assert_eq!(c.calls.load(Ordering::SeqCst), 4);
        // 500 + 1000 + 2000 ms of backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(3500));
        assert!(!n.is_negotiating().await);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_retry_and_reuses_open_transport() {
        let (n, c) = negotiator(2, Duration::ZERO);
        let t = n.connect("p").await.unwrap();
        assert_eq!(n.retries("p").await, Some(2));
        let again = n.connect("p").await.unwrap();
        assert!(Arc::ptr_eq(&t, &again));
        assert_eq!(c.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_negotiation_suppressed_and_waiter_gets_transport() {
        let (n, c) = negotiator(0, Duration::from_secs(2));
        let n = Arc::new(n);
        let first = {
            let n = n.clone();
            tokio::spawn(async move { n.connect("p").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(n.is_negotiating().await);
        assert!(matches!(
            n.connect("p").await,
            Err(NegotiationError::InProgress(_))
        ));
        let waited = n.open_transport("p").await.unwrap();
        let opened = first.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&waited, &opened));
        assert_eq!(c.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_transport_is_renegotiated() {
        let (n, c) = negotiator(0, Duration::ZERO);
        let _first = n.connect("p").await.unwrap();
        let records = n.records.lock().await;
        let mock = records["p"].transport.clone().unwrap();
        drop(records);
        mock.close().await;
        n.connect("p").await.unwrap();
        assert_eq!(c.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_record_dropped_only_when_not_replaced() {
        let (n, _) = negotiator(0, Duration::ZERO);
        let t = n.connect("p").await.unwrap();
        assert!(!n.forget_closed("p").await);
        t.close().await;
        assert!(n.forget_closed("p").await);
        assert!(n.transport("p").await.is_none());

        let relayed = MockTransport::new(TransportKind::Relay, 1024);
        n.adopt(relayed).await;
        assert_eq!(n.forget_relayed().await, vec!["remote".to_string()]);
        assert!(n.open_peers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn quality_sampled_from_transport_state() {
        let (n, _) = negotiator(0, Duration::ZERO);
        let mock = MockTransport::new(TransportKind::Direct, 1024);
        n.adopt(mock.clone()).await;
        assert_eq!(n.sample_quality().await, vec![("remote".to_string(), 0.9)]);
        mock.buffered.store(200_000, Ordering::SeqCst);
        n.sample_quality().await;
        assert_eq!(n.quality("remote").await, Some(0.8));
        mock.shut();
        n.sample_quality().await;
        assert_eq!(n.quality("remote").await, Some(0.5));
    }
}
