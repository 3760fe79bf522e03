//! Presence client: register with the server, heartbeat, and keep a merged
//! view of the other peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use lanbeam_core::config::{DEVICE_POLL_INTERVAL, HEARTBEAT_INTERVAL};
use lanbeam_core::{DeviceClass, PeerRecord, Registration};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct Ack {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct Unregister<'a> {
    id: &'a str,
}

pub struct PresenceClient {
    http: reqwest::Client,
    base: String,
    peer_id: String,
    name: String,
    class: DeviceClass,
}

impl PresenceClient {
    pub fn new(server_url: &str, peer_id: &str, name: &str, class: DeviceClass) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            base: format!("{}/api", server_url.trim_end_matches('/')),
            peer_id: peer_id.to_string(),
            name: name.to_string(),
            class,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn register(&self) -> anyhow::Result<()> {
        let body = Registration::new(&self.peer_id, &self.name, self.class);
        let ack: Ack = self
            .http
            .post(format!("{}/register", self.base))
            .json(&body)
            .send()
            .await
            .context("register request")?
            .json()
            .await
            .context("register response")?;
        if !ack.success {
            bail!("register rejected: {}", ack.error.unwrap_or_default());
        }
        Ok(())
    }

    pub async fn unregister(&self) -> anyhow::Result<()> {
        self.http
            .post(format!("{}/unregister", self.base))
            .json(&Unregister { id: &self.peer_id })
            .send()
            .await
            .context("unregister request")?
            .error_for_status()?;
        info!(event = "unregistered", peer = %self.peer_id, "Left presence directory");
        Ok(())
    }

    /// Every other present peer.
    pub async fn devices(&self) -> anyhow::Result<Vec<PeerRecord>> {
        let list = self
            .http
            .get(format!("{}/devices", self.base))
            .query(&[("exclude", self.peer_id.as_str())])
            .send()
            .await
            .context("devices request")?
            .error_for_status()?
            .json()
            .await
            .context("devices response")?;
        Ok(list)
    }

    /// Re-register every [`HEARTBEAT_INTERVAL`].
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let me = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                match me.register().await {
                    Ok(()) => debug!(event = "heartbeat", peer = %me.peer_id, "Re-registered"),
                    Err(e) => warn!(event = "heartbeat_failed", error = %e, "Heartbeat failed"),
                }
            }
        })
    }

    /// Poll the device list every [`DEVICE_POLL_INTERVAL`] and publish the
    /// merged view on `peers`. Skips a tick while `busy` is set.
    pub fn spawn_polling(
        self: &Arc<Self>,
        busy: Arc<AtomicBool>,
        peers: watch::Sender<Vec<PeerRecord>>,
    ) -> JoinHandle<()> {
        let me = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DEVICE_POLL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if busy.load(Ordering::SeqCst) {
                    continue;
                }
                match me.devices().await {
                    Ok(fresh) => {
                        peers.send_if_modified(|current| merge(current, fresh));
                    }
                    Err(e) => debug!(event = "poll_failed", error = %e, "Device poll failed"),
                }
            }
        })
    }
}

/// Replace `current` with `fresh`, keyed by id, keeping the existing order of
/// peers that are still present. Returns whether anything a user would see changed.
pub fn merge(current: &mut Vec<PeerRecord>, fresh: Vec<PeerRecord>) -> bool {
    let mut changed = false;
    let before = current.len();
    current.retain(|p| fresh.iter().any(|f| f.id == p.id));
    changed |= current.len() != before;
    for f in fresh {
        match current.iter_mut().find(|p| p.id == f.id) {
            Some(p) => {
                if p.name != f.name || p.device_class != f.device_class {
                    changed = true;
                }
                *p = f;
            }
            None => {
                changed = true;
                current.push(f);
            }
        }
    }
    changed
}

/// Look a peer up by exact id, then by case-insensitive display name.
pub fn find_peer<'a>(peers: &'a [PeerRecord], query: &str) -> Option<&'a PeerRecord> {
    peers
        .iter()
        .find(|p| p.id == query)
        .or_else(|| peers.iter().find(|p| p.name.eq_ignore_ascii_case(query)))
}
