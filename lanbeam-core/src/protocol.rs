//! Control messages exchanged between peers, and negotiation signals.
//!
//! Both travel as JSON objects tagged by `type`. Over the relay socket the tag
//! becomes the envelope's `forwardType` and the rest becomes `data`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cipher::{BaseIv, SessionKey};

/// Transfer control message. Sent as a text frame on a direct channel, or
/// inside a forward envelope on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Message {
    FileOffer {
        file_name: String,
        file_size: u64,
        sender_name: String,
    },
    TransferAccepted {
        file_name: String,
    },
    TransferDeclined {
        file_name: String,
    },
    FileMetadata {
        file_name: String,
        total_chunks: u32,
        key: SessionKey,
        iv: BaseIv,
        mime_type: String,
        file_size: u64,
    },
    TextMessage {
        text: String,
        sender_name: String,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::FileOffer { .. } => "file-offer",
            Message::TransferAccepted { .. } => "transfer-accepted",
            Message::TransferDeclined { .. } => "transfer-declined",
            Message::FileMetadata { .. } => "file-metadata",
            Message::TextMessage { .. } => "text-message",
        }
    }

    /// File name of the session this message belongs to, if any.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Message::FileOffer { file_name, .. }
            | Message::TransferAccepted { file_name }
            | Message::TransferDeclined { file_name }
            | Message::FileMetadata { file_name, .. } => Some(file_name),
            Message::TextMessage { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Connection negotiation signal (offer/answer/trickled candidate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Signal {
    RtcOffer {
        sdp: String,
    },
    RtcAnswer {
        sdp: String,
    },
    RtcCandidate {
        candidate: String,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default, rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
    },
}

const SIGNAL_PREFIX: &str = "rtc-";

/// Anything that rides the relay's text framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Transfer(Message),
    Signal(Signal),
}

impl Control {
    /// Split into `(forwardType, data)` for a forward envelope.
    pub fn split(&self) -> Result<(String, Value), ProtocolError> {
        let value = match self {
            Control::Transfer(m) => serde_json::to_value(m)?,
            Control::Signal(s) => serde_json::to_value(s)?,
        };
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ProtocolError::NotAnObject),
        };
        Ok((kind, Value::Object(fields)))
    }

    /// Rebuild from a delivered envelope's `type` and `data`.
    pub fn join(kind: &str, data: Value) -> Result<Self, ProtocolError> {
        let mut fields = match data {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            _ => return Err(ProtocolError::NotAnObject),
        };
        fields.insert("type".to_string(), Value::String(kind.to_string()));
        let value = Value::Object(fields);
        if kind.starts_with(SIGNAL_PREFIX) {
            Ok(Control::Signal(serde_json::from_value(value)?))
        } else {
            Ok(Control::Transfer(serde_json::from_value(value)?))
        }
    }
}

impl From<Message> for Control {
    fn from(m: Message) -> Self {
        Control::Transfer(m)
    }
}

impl From<Signal> for Control {
    fn from(s: Signal) -> Self {
        Control::Signal(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control payload is not a JSON object")]
    NotAnObject,
}
