//! Binary chunk framing and relay text envelopes.
//!
//! Direct channel chunk: `[1][index u32 LE][ciphertext]`.
//! Relay chunk: `[2][idLen u16 LE][id][index u32 LE][ciphertext]`, where `id` is
//! the target on the way in and is rewritten to the sender by the server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{Control, ProtocolError};

const TYPE_LEN: usize = 1;
const ID_LEN_SIZE: usize = 2;
const INDEX_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    DirectChunk = 1,
    RelayChunk = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            1 => Ok(FrameType::DirectChunk),
            2 => Ok(FrameType::RelayChunk),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// A decoded chunk frame. `peer_id` is set only for relay frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub peer_id: Option<String>,
    pub chunk_index: u32,
    pub payload: Vec<u8>,
}

pub fn encode_direct_chunk(chunk_index: u32, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TYPE_LEN + INDEX_LEN + ciphertext.len());
    out.push(FrameType::DirectChunk as u8);
    out.extend_from_slice(&chunk_index.to_le_bytes());
    out.extend_from_slice(ciphertext);
    out
}

/// Relay chunk addressed to `target`.
pub fn encode_relay_chunk(
    target: &str,
    chunk_index: u32,
    ciphertext: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let mut out = address_header(FrameType::RelayChunk as u8, target)?;
    out.reserve(INDEX_LEN + ciphertext.len());
    out.extend_from_slice(&chunk_index.to_le_bytes());
    out.extend_from_slice(ciphertext);
    Ok(out)
}

fn address_header(kind: u8, id: &str) -> Result<Vec<u8>, FrameError> {
    let id = id.as_bytes();
    let len = u16::try_from(id.len()).map_err(|_| FrameError::IdTooLong(id.len()))?;
    let mut out = Vec::with_capacity(TYPE_LEN + ID_LEN_SIZE + id.len());
    out.push(kind);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(id);
    Ok(out)
}

/// Split `[type][idLen][id]rest` into `(type, id, rest)`. Type is not checked;
/// the server forwards any type it is given.
pub fn split_address(bytes: &[u8]) -> Result<(u8, &str, &[u8]), FrameError> {
    if bytes.len() < TYPE_LEN + ID_LEN_SIZE {
        return Err(FrameError::Truncated);
    }
    let id_len = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
    let id_end = TYPE_LEN + ID_LEN_SIZE + id_len;
    if bytes.len() < id_end {
        return Err(FrameError::Truncated);
    }
    let id = std::str::from_utf8(&bytes[TYPE_LEN + ID_LEN_SIZE..id_end])
        .map_err(|_| FrameError::InvalidId)?;
    Ok((bytes[0], id, &bytes[id_end..]))
}

/// Server-side rewrite: replace the target id with `sender`, keep the rest
/// byte for byte. Returns the target id and the frame to forward.
pub fn rewrite_address(bytes: &[u8], sender: &str) -> Result<(String, Vec<u8>), FrameError> {
    let (kind, target, rest) = split_address(bytes)?;
    let mut out = address_header(kind, sender)?;
    out.extend_from_slice(rest);
    Ok((target.to_string(), out))
}

/// Decode a chunk frame received on either transport.
pub fn decode_chunk_frame(bytes: &[u8]) -> Result<ChunkFrame, FrameError> {
    let first = *bytes.first().ok_or(FrameError::Truncated)?;
    let (peer_id, rest) = match FrameType::try_from(first)? {
        FrameType::DirectChunk => (None, &bytes[TYPE_LEN..]),
        FrameType::RelayChunk => {
            let (_, id, rest) = split_address(bytes)?;
            (Some(id.to_string()), rest)
        }
    };
    if rest.len() < INDEX_LEN {
        return Err(FrameError::Truncated);
    }
    let chunk_index = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
    Ok(ChunkFrame {
        peer_id,
        chunk_index,
        payload: rest[INDEX_LEN..].to_vec(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("peer id is not valid utf-8")]
    InvalidId,
    #[error("peer id too long ({0} bytes)")]
    IdTooLong(usize),
}

pub const FORWARD_TYPE: &str = "forward";

/// Text frame a peer sends to the server: `{type:"forward", targetPeerId, forwardType, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub target_peer_id: String,
    pub forward_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Text frame the server delivers: `{type: forwardType, data, senderPeerId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    pub sender_peer_id: String,
}

impl ForwardEnvelope {
    pub fn wrap(target: &str, control: &Control) -> Result<Self, ProtocolError> {
        let (forward_type, data) = control.split()?;
        Ok(Self {
            kind: FORWARD_TYPE.to_string(),
            target_peer_id: target.to_string(),
            forward_type,
            data,
        })
    }

    pub fn is_forward(&self) -> bool {
        self.kind == FORWARD_TYPE && !self.target_peer_id.is_empty()
    }

    /// Server-side rebox. The target is returned alongside the delivered frame.
    pub fn rebox(self, sender: &str) -> (String, DeliveredEnvelope) {
        (
            self.target_peer_id,
            DeliveredEnvelope {
                kind: self.forward_type,
                data: self.data,
                sender_peer_id: sender.to_string(),
            },
        )
    }
}

impl DeliveredEnvelope {
    pub fn into_control(self) -> Result<(String, Control), ProtocolError> {
        let control = Control::join(&self.kind, self.data)?;
        Ok((self.sender_peer_id, control))
    }
}
