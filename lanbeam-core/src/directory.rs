//! Presence directory: registry of active peers with debounce, TTL expiry and
//! duplicate-name reconciliation. Time is passed in by the host (epoch millis).

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{DUPLICATE_NAME_STALENESS, PEER_TTL, REGISTRATION_DEBOUNCE};

/// Fresh opaque peer id for a new session of a device.
pub fn generate_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Display name used when a registration carries none.
pub const DEFAULT_DEVICE_NAME: &str = "Unknown Device";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    #[default]
    Desktop,
    Laptop,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Desktop => "desktop",
            DeviceClass::Laptop => "laptop",
        }
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mobile" => Ok(DeviceClass::Mobile),
            "desktop" => Ok(DeviceClass::Desktop),
            "laptop" => Ok(DeviceClass::Laptop),
            other => Err(format!("unknown device type: {other}")),
        }
    }
}

/// One present peer, as served by `GET /devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_class: DeviceClass,
    /// Epoch millis of the last accepted registration.
    #[serde(rename = "lastSeen")]
    pub last_seen: u64,
}

/// Body of `POST /register`. Every field is optional on the wire; only a
/// missing `id` is an error. An unrecognized `type` is treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub device_class: Option<String>,
}

impl Registration {
    pub fn new(id: impl Into<String>, name: impl Into<String>, class: DeviceClass) -> Self {
        Self {
            id: Some(id.into()),
            name: Some(name.into()),
            device_class: Some(class.as_str().to_string()),
        }
    }
}

/// What a `register` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Within the debounce window of the previous registration; nothing changed.
    Debounced,
    Created,
    Refreshed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReport {
    pub outcome: RegisterOutcome,
    /// Stale records evicted because they shared the registrant's display name.
    pub evicted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub peers: Vec<PeerRecord>,
    /// Records evicted by this call for exceeding the TTL.
    pub expired: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Missing device ID")]
    MissingId,
}

#[derive(Debug, Default)]
pub struct PresenceDirectory {
    peers: HashMap<String, PeerRecord>,
    last_registration: HashMap<String, u64>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a peer record. Fails only when the id is missing or empty.
    pub fn register(
        &mut self,
        reg: Registration,
        now_ms: u64,
    ) -> Result<RegisterReport, DirectoryError> {
        let id = match reg.id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(DirectoryError::MissingId),
        };

        if let Some(&last) = self.last_registration.get(&id) {
            if now_ms.saturating_sub(last) < REGISTRATION_DEBOUNCE.as_millis() as u64 {
                return Ok(RegisterReport {
                    outcome: RegisterOutcome::Debounced,
                    evicted: Vec::new(),
                });
            }
        }

        let name = reg.name.filter(|n| !n.is_empty());
        let class = reg
            .device_class
            .as_deref()
            .and_then(|s| DeviceClass::from_str(s).ok());

        let evicted = match &name {
            Some(name) => self.evict_stale_namesakes(&id, name, now_ms),
            None => Vec::new(),
        };

        let outcome = match self.peers.get_mut(&id) {
            Some(existing) => {
                if let Some(name) = name {
                    existing.name = name;
                }
                if let Some(class) = class {
                    existing.device_class = class;
                }
                existing.last_seen = now_ms;
                RegisterOutcome::Refreshed
            }
            None => {
                self.peers.insert(
                    id.clone(),
                    PeerRecord {
                        id: id.clone(),
                        name: name.unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string()),
                        device_class: class.unwrap_or_default(),
                        last_seen: now_ms,
                    },
                );
                RegisterOutcome::Created
            }
        };
        self.last_registration.insert(id, now_ms);
        Ok(RegisterReport { outcome, evicted })
    }

    // A device that reconnects under a new id leaves its old record behind;
    // same name plus staleness is taken as that case.
    fn evict_stale_namesakes(&mut self, id: &str, name: &str, now_ms: u64) -> Vec<String> {
        let staleness = DUPLICATE_NAME_STALENESS.as_millis() as u64;
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.id != id && p.name == name)
            .filter(|p| p.last_seen < now_ms.saturating_sub(staleness))
            .map(|p| p.id.clone())
            .collect();
        for stale_id in &stale {
            self.forget(stale_id);
        }
        stale
    }

    /// Idempotent removal. Returns whether a record existed.
    pub fn unregister(&mut self, id: Option<&str>) -> Result<bool, DirectoryError> {
        match id {
            Some(id) if !id.is_empty() => Ok(self.forget(id)),
            _ => Err(DirectoryError::MissingId),
        }
    }

    /// Drop a record and its debounce key (explicit unregister or relay disconnect).
    pub fn forget(&mut self, id: &str) -> bool {
        self.last_registration.remove(id);
        self.peers.remove(id).is_some()
    }

    /// Evict expired records, then list everyone except `exclude`, ordered by id.
    pub fn list(&mut self, exclude: Option<&str>, now_ms: u64) -> Listing {
        let ttl = PEER_TTL.as_millis() as u64;
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|p| now_ms.saturating_sub(p.last_seen) > ttl)
            .map(|p| p.id.clone())
            .collect();
        for id in &expired {
            self.forget(id);
        }
        let mut peers: Vec<PeerRecord> = self
            .peers
            .values()
            .filter(|p| Some(p.id.as_str()) != exclude)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Listing { peers, expired }
    }

    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
