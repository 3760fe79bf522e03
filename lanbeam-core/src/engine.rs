//! Host-driven API: TransferEngine receives events from the host, returns actions.
//!
//! The engine owns every transfer session on this peer. It never touches a
//! socket, a file or a clock; the host feeds it decoded messages, decrypted
//! chunks and `Instant`s, and executes the returned [`Action`]s.

use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::chunk::ChunkPlan;
use crate::cipher::{ChunkCipher, CryptoError};
use crate::error::TransferError;
use crate::progress::{Progress, ThroughputMeter};
use crate::protocol::Message;
use crate::config::RELAY_CHUNK_SIZE;
use crate::reassembly::{layout_is_valid, AssemblyError, ChunkBuffer, InsertOutcome};
use crate::session::{
    Direction, InboundStream, Offer, OutboundStream, Phase, SessionError, SessionMap,
    SessionState, TransferKey,
};

/// Something the host must do.
#[derive(Debug)]
pub enum Action {
    /// Send a control message to a peer over its transport.
    Send { peer_id: String, message: Message },
    /// Report to the collaborator.
    Emit(Event),
    /// Start a decrypt worker for an inbound session.
    OpenInbound { key: TransferKey, cipher: ChunkCipher },
    /// Stop the decrypt worker; the session is gone.
    CloseInbound { key: TransferKey },
}

/// Collaborator-facing event.
#[derive(Debug)]
pub enum Event {
    IncomingOffer {
        key: TransferKey,
        file_size: u64,
        sender_name: String,
    },
    AcceptResult {
        key: TransferKey,
        accepted: bool,
    },
    Progress {
        key: TransferKey,
        direction: Direction,
        progress: Progress,
    },
    Completed(Delivery),
    /// Every chunk of an outbound transfer was handed to the transport.
    Sent {
        key: TransferKey,
    },
    TextReceived {
        peer_id: String,
        sender_name: String,
        text: String,
    },
    Error {
        key: Option<TransferKey>,
        error: TransferError,
    },
}

/// A fully received payload with its provenance.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub key: TransferKey,
    pub sender_name: String,
    pub mime_type: String,
    pub payload: Vec<u8>,
}

impl Delivery {
    /// Hex SHA-256 of the payload, for logs and integrity checks by the collaborator.
    pub fn sha256_hex(&self) -> String {
        Sha256::digest(&self.payload)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// What the sender needs to stream an accepted transfer.
#[derive(Debug, Clone)]
pub struct OutboundPlan {
    pub cipher: ChunkCipher,
    pub plan: ChunkPlan,
}

pub struct TransferEngine {
    local_name: String,
    sessions: SessionMap,
}

impl TransferEngine {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            sessions: SessionMap::new(),
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn set_local_name(&mut self, name: impl Into<String>) {
        self.local_name = name.into();
    }

    pub fn phase(&self, direction: Direction, key: &TransferKey) -> Option<Phase> {
        self.sessions.phase(direction, key)
    }

    /// True while any session is streaming chunks in either direction.
    pub fn has_active_transfers(&self) -> bool {
        self.sessions.any_transferring()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn peers_with_sessions(&self) -> Vec<String> {
        self.sessions.peers()
    }

    // ── Sender side ──────────────────────────────────────────────────────────

    /// Open an outbound session and produce the `file-offer`.
    pub fn offer_file(
        &mut self,
        peer_id: &str,
        file_name: &str,
        file_size: u64,
    ) -> Result<Vec<Action>, SessionError> {
        let key = TransferKey::new(peer_id, file_name);
        let offer = Offer {
            file_size,
            sender_name: self.local_name.clone(),
        };
        self.sessions.open(Direction::Outbound, key, offer)?;
        Ok(vec![Action::Send {
            peer_id: peer_id.to_string(),
            message: Message::FileOffer {
                file_name: file_name.to_string(),
                file_size,
                sender_name: self.local_name.clone(),
            },
        }])
    }

    /// Move an accepted outbound session to streaming: fresh key and base IV,
    /// chunk plan, and the `file-metadata` message.
    pub fn begin_transfer(
        &mut self,
        key: &TransferKey,
        chunk_size: u32,
        mime_type: &str,
    ) -> Result<(OutboundPlan, Vec<Action>), SessionError> {
        let file_size = match self.sessions.get(Direction::Outbound, key) {
            Some(SessionState::Accepted(offer)) => offer.file_size,
            Some(other) => {
                return Err(SessionError::WrongPhase {
                    key: key.clone(),
                    expected: Phase::Accepted,
                    actual: other.phase(),
                })
            }
            None => return Err(SessionError::Unknown(key.clone())),
        };
        let (cipher, session_key, iv) = ChunkCipher::generate();
        let plan = ChunkPlan::new(file_size, chunk_size);
        self.sessions.set(
            Direction::Outbound,
            key.clone(),
            SessionState::Sending(OutboundStream { plan }),
        );
        let metadata = Message::FileMetadata {
            file_name: key.file_name.clone(),
            total_chunks: plan.total_chunks,
            key: session_key,
            iv,
            mime_type: mime_type.to_string(),
            file_size,
        };
        Ok((
            OutboundPlan { cipher, plan },
            vec![Action::Send {
                peer_id: key.peer_id.clone(),
                message: metadata,
            }],
        ))
    }

    /// All chunks handed to the transport; purge the outbound session.
    pub fn complete_outbound(&mut self, key: &TransferKey) -> Vec<Action> {
        match self.sessions.remove(Direction::Outbound, key) {
            Some(_) => vec![Action::Emit(Event::Sent { key: key.clone() })],
            None => Vec::new(),
        }
    }

    /// Abort a session in either direction and report `error`.
    pub fn fail(
        &mut self,
        direction: Direction,
        key: &TransferKey,
        error: TransferError,
    ) -> Vec<Action> {
        let Some(state) = self.sessions.remove(direction, key) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        if matches!(state, SessionState::Receiving(_)) {
            actions.push(Action::CloseInbound { key: key.clone() });
        }
        actions.push(Action::Emit(Event::Error {
            key: Some(key.clone()),
            error,
        }));
        actions
    }

    /// Drop a session without reporting anything (e.g. after a decline was seen).
    pub fn purge(&mut self, direction: Direction, key: &TransferKey) -> bool {
        self.sessions.remove(direction, key).is_some()
    }

    pub fn send_text(&self, peer_id: &str, text: &str) -> Vec<Action> {
        vec![Action::Send {
            peer_id: peer_id.to_string(),
            message: Message::TextMessage {
                text: text.to_string(),
                sender_name: self.local_name.clone(),
            },
        }]
    }

    // ── Receiver side ────────────────────────────────────────────────────────

    /// Consent to a pending inbound offer.
    pub fn accept(&mut self, key: &TransferKey) -> Result<Vec<Action>, SessionError> {
        let offer = self.take_pending_inbound(key)?;
        self.sessions
            .set(Direction::Inbound, key.clone(), SessionState::Accepted(offer));
        Ok(vec![Action::Send {
            peer_id: key.peer_id.clone(),
            message: Message::TransferAccepted {
                file_name: key.file_name.clone(),
            },
        }])
    }

    /// Refuse a pending inbound offer; the session is purged.
    pub fn decline(&mut self, key: &TransferKey) -> Result<Vec<Action>, SessionError> {
        self.take_pending_inbound(key)?;
        self.sessions.remove(Direction::Inbound, key);
        Ok(vec![Action::Send {
            peer_id: key.peer_id.clone(),
            message: Message::TransferDeclined {
                file_name: key.file_name.clone(),
            },
        }])
    }

    fn take_pending_inbound(&self, key: &TransferKey) -> Result<Offer, SessionError> {
        match self.sessions.get(Direction::Inbound, key) {
            Some(SessionState::Pending(offer)) => Ok(offer.clone()),
            Some(other) => Err(SessionError::WrongPhase {
                key: key.clone(),
                expected: Phase::Pending,
                actual: other.phase(),
            }),
            None => Err(SessionError::Unknown(key.clone())),
        }
    }

    /// Handle a control message from `peer_id`. Messages that do not fit the
    /// current session phase are dropped.
    pub fn on_message(&mut self, peer_id: &str, message: Message, now: Instant) -> Vec<Action> {
        match message {
            Message::FileOffer {
                file_name,
                file_size,
                sender_name,
            } => {
                let key = TransferKey::new(peer_id, file_name);
                let offer = Offer {
                    file_size,
                    sender_name: sender_name.clone(),
                };
                match self.sessions.open(Direction::Inbound, key.clone(), offer) {
                    Ok(()) => vec![Action::Emit(Event::IncomingOffer {
                        key,
                        file_size,
                        sender_name,
                    })],
                    Err(_) => Vec::new(),
                }
            }
            Message::TransferAccepted { file_name } => {
                self.on_answer(TransferKey::new(peer_id, file_name), true)
            }
            Message::TransferDeclined { file_name } => {
                self.on_answer(TransferKey::new(peer_id, file_name), false)
            }
            Message::FileMetadata {
                file_name,
                total_chunks,
                key,
                iv,
                mime_type,
                file_size,
            } => {
                let tkey = TransferKey::new(peer_id, file_name);
                let (sender_name, offered) = match self.sessions.get(Direction::Inbound, &tkey) {
                    Some(SessionState::Accepted(offer)) => (offer.sender_name.clone(), offer.file_size),
                    _ => return Vec::new(),
                };
                if file_size != offered {
                    let err = AssemblyError::SizeMismatch { offered, file_size };
                    return self.fail(Direction::Inbound, &tkey, err.into());
                }
                if !layout_is_valid(file_size, total_chunks, RELAY_CHUNK_SIZE) {
                    let err = AssemblyError::InvalidLayout {
                        file_size,
                        total_chunks,
                    };
                    return self.fail(Direction::Inbound, &tkey, err.into());
                }
                let cipher = ChunkCipher::new(&key, iv);
                let seq = self.sessions.next_seq();
                let stream = InboundStream {
                    sender_name,
                    mime_type,
                    file_size,
                    cipher: cipher.clone(),
                    buffer: ChunkBuffer::new(total_chunks),
                    meter: ThroughputMeter::new(total_chunks, file_size, now),
                    seq,
                };
                self.sessions.set(
                    Direction::Inbound,
                    tkey.clone(),
                    SessionState::Receiving(Box::new(stream)),
                );
                if total_chunks == 0 {
                    return self.finish_inbound(&tkey, now, false);
                }
                vec![Action::OpenInbound { key: tkey, cipher }]
            }
            Message::TextMessage { text, sender_name } => {
                vec![Action::Emit(Event::TextReceived {
                    peer_id: peer_id.to_string(),
                    sender_name,
                    text,
                })]
            }
        }
    }

    fn on_answer(&mut self, key: TransferKey, accepted: bool) -> Vec<Action> {
        let offer = match self.sessions.get(Direction::Outbound, &key) {
            Some(SessionState::Pending(offer)) => offer.clone(),
            _ => return Vec::new(),
        };
        let next = if accepted {
            SessionState::Accepted(offer)
        } else {
            SessionState::Declined
        };
        self.sessions.set(Direction::Outbound, key.clone(), next);
        vec![Action::Emit(Event::AcceptResult { key, accepted })]
    }

    /// Session a chunk from `peer_id` belongs to. Only sessions past metadata
    /// qualify; with several, the one whose metadata arrived first wins.
    pub fn route_chunk(&self, peer_id: &str) -> Option<TransferKey> {
        self.sessions.oldest_receiving(peer_id)
    }

    /// Cipher for a receiving session, for hosts that decrypt off-thread.
    pub fn inbound_cipher(&self, key: &TransferKey) -> Option<ChunkCipher> {
        match self.sessions.get(Direction::Inbound, key) {
            Some(SessionState::Receiving(s)) => Some(s.cipher.clone()),
            _ => None,
        }
    }

    /// Decrypt inline and store. Equivalent to `route_chunk` followed by
    /// `on_chunk_decrypted`.
    pub fn on_chunk(
        &mut self,
        peer_id: &str,
        index: u32,
        ciphertext: &[u8],
        now: Instant,
    ) -> Vec<Action> {
        let Some(key) = self.route_chunk(peer_id) else {
            return Vec::new();
        };
        let Some(cipher) = self.inbound_cipher(&key) else {
            return Vec::new();
        };
        let result = cipher.decrypt_chunk(index, ciphertext);
        self.on_chunk_decrypted(&key, index, result, now)
    }

    /// Store a chunk decrypted by a worker. A failed decrypt leaves the slot
    /// empty and is reported; the session stays open.
    pub fn on_chunk_decrypted(
        &mut self,
        key: &TransferKey,
        index: u32,
        result: Result<Vec<u8>, CryptoError>,
        now: Instant,
    ) -> Vec<Action> {
        let Some(SessionState::Receiving(stream)) = self.sessions.get_mut(Direction::Inbound, key)
        else {
            return Vec::new();
        };
        let plain = match result {
            Ok(plain) => plain,
            Err(e) => {
                return vec![Action::Emit(Event::Error {
                    key: Some(key.clone()),
                    error: TransferError::Crypto(e),
                })]
            }
        };
        let len = plain.len() as u64;
        match stream.buffer.insert(index, plain) {
            Ok(InsertOutcome::Duplicate) => Vec::new(),
            Ok(InsertOutcome::InProgress) => match stream.meter.record(len, now) {
                Some(progress) => vec![Action::Emit(Event::Progress {
                    key: key.clone(),
                    direction: Direction::Inbound,
                    progress,
                })],
                None => Vec::new(),
            },
            Ok(InsertOutcome::Complete) => {
                stream.meter.record(len, now);
                self.finish_inbound(key, now, true)
            }
            Err(e) => self.fail(Direction::Inbound, key, TransferError::Assembly(e)),
        }
    }

    fn finish_inbound(&mut self, key: &TransferKey, now: Instant, worker_open: bool) -> Vec<Action> {
        let Some(SessionState::Receiving(stream)) = self.sessions.remove(Direction::Inbound, key)
        else {
            return Vec::new();
        };
        let stream = *stream;
        let mut actions = Vec::new();
        if worker_open {
            actions.push(Action::CloseInbound { key: key.clone() });
        }
        let done = stream.meter.finish(now);
        match stream.buffer.assemble(stream.file_size) {
            Ok(payload) => {
                actions.push(Action::Emit(Event::Progress {
                    key: key.clone(),
                    direction: Direction::Inbound,
                    progress: done,
                }));
                actions.push(Action::Emit(Event::Completed(Delivery {
                    key: key.clone(),
                    sender_name: stream.sender_name,
                    mime_type: stream.mime_type,
                    payload,
                })));
            }
            Err(e) => actions.push(Action::Emit(Event::Error {
                key: Some(key.clone()),
                error: TransferError::Assembly(e),
            })),
        }
        actions
    }

    /// The transport to `peer_id` closed: every session with that peer fails.
    pub fn on_transport_closed(&mut self, peer_id: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        for (direction, key) in self.sessions.keys_for_peer(peer_id) {
            let declined = matches!(
                self.sessions.get(direction, &key),
                Some(SessionState::Declined)
            );
            if declined {
                self.sessions.remove(direction, &key);
                continue;
            }
            actions.extend(self.fail(direction, &key, TransferError::TransportClosed));
        }
        actions
    }
}
