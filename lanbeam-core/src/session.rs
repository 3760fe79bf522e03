//! Transfer sessions: one tagged state per `(direction, peer, file)`.

use std::collections::HashMap;
use std::fmt;

use crate::chunk::ChunkPlan;
use crate::cipher::ChunkCipher;
use crate::progress::ThroughputMeter;
use crate::reassembly::ChunkBuffer;

/// Session key: the remote peer and the offered file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub peer_id: String,
    pub file_name: String,
}

impl TransferKey {
    pub fn new(peer_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            file_name: file_name.into(),
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.peer_id, self.file_name)
    }
}

/// Sending and receiving the same file name with the same peer are separate sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Live phases. Completed and failed sessions are purged at once; the
/// outcome travels in the emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Accepted,
    Declined,
    Transferring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub file_size: u64,
    pub sender_name: String,
}

/// Receiver side of a session past metadata.
#[derive(Debug)]
pub struct InboundStream {
    pub sender_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub cipher: ChunkCipher,
    pub buffer: ChunkBuffer,
    pub meter: ThroughputMeter,
    /// Order in which metadata arrived; chunk frames carry no file name.
    pub seq: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct OutboundStream {
    pub plan: ChunkPlan,
}

#[derive(Debug)]
pub enum SessionState {
    Pending(Offer),
    Accepted(Offer),
    Declined,
    Receiving(Box<InboundStream>),
    Sending(OutboundStream),
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        match self {
            SessionState::Pending(_) => Phase::Pending,
            SessionState::Accepted(_) => Phase::Accepted,
            SessionState::Declined => Phase::Declined,
            SessionState::Receiving(_) | SessionState::Sending(_) => Phase::Transferring,
        }
    }

    /// Declined is the only stored terminal state; it blocks nothing.
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionState::Declined)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("transfer {0} already in progress")]
    DuplicateOffer(TransferKey),
    #[error("no session for {0}")]
    Unknown(TransferKey),
    #[error("session {key} is {actual:?}, expected {expected:?}")]
    WrongPhase {
        key: TransferKey,
        expected: Phase,
        actual: Phase,
    },
}

/// The single map of all sessions on this peer.
#[derive(Debug, Default)]
pub struct SessionMap {
    sessions: HashMap<(Direction, TransferKey), SessionState>,
    next_seq: u64,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dir: Direction, key: &TransferKey) -> Option<&SessionState> {
        self.sessions.get(&(dir, key.clone()))
    }

    pub fn get_mut(&mut self, dir: Direction, key: &TransferKey) -> Option<&mut SessionState> {
        self.sessions.get_mut(&(dir, key.clone()))
    }

    pub fn phase(&self, dir: Direction, key: &TransferKey) -> Option<Phase> {
        self.get(dir, key).map(SessionState::phase)
    }

    /// Open a new pending session. A live session under the same key blocks it;
    /// a declined one is replaced.
    pub fn open(&mut self, dir: Direction, key: TransferKey, offer: Offer) -> Result<(), SessionError> {
        if self.get(dir, &key).is_some_and(SessionState::is_live) {
            return Err(SessionError::DuplicateOffer(key));
        }
        self.sessions.insert((dir, key), SessionState::Pending(offer));
        Ok(())
    }

    pub fn set(&mut self, dir: Direction, key: TransferKey, state: SessionState) {
        self.sessions.insert((dir, key), state);
    }

    pub fn remove(&mut self, dir: Direction, key: &TransferKey) -> Option<SessionState> {
        self.sessions.remove(&(dir, key.clone()))
    }

    /// Hand out the next metadata sequence number.
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Every session with `peer_id`, in either direction.
    pub fn keys_for_peer(&self, peer_id: &str) -> Vec<(Direction, TransferKey)> {
        let mut keys: Vec<_> = self
            .sessions
            .keys()
            .filter(|(_, k)| k.peer_id == peer_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.1.cmp(&b.1));
        keys
    }

    /// Distinct peers with at least one session, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.sessions.keys().map(|(_, k)| k.peer_id.clone()).collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Receiving session with `peer_id` whose metadata arrived first.
    pub fn oldest_receiving(&self, peer_id: &str) -> Option<TransferKey> {
        self.sessions
            .iter()
            .filter_map(|((dir, key), state)| match (dir, state) {
                (Direction::Inbound, SessionState::Receiving(s)) if key.peer_id == peer_id => {
                    Some((s.seq, key))
                }
                _ => None,
            })
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, key)| key.clone())
    }

    pub fn any_transferring(&self) -> bool {
        self.sessions
            .values()
            .any(|s| s.phase() == Phase::Transferring)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
