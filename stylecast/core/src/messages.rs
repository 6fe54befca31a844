//! Wire Messages
//!
//! Everything that crosses the WebSocket connection. Inbound traffic is
//! classified into frames (binary messages) and control messages (JSON text
//! messages); outbound traffic is result frames plus the occasional error
//! notice.
//!
//! # Wire Format
//!
//! ```text
//! client -> server   Binary            encoded video frame
//! client -> server   Text  {"type":"set_style","style":"<base64>"|null}
//! client -> server   Text  {"type":"set_model","model":"adain"}
//! server -> client   Binary            styled or passthrough frame
//! server -> client   Text  {"type":"error","message":"..."}
//! ```
//!
//! Style payloads may also be sent as `data:` URLs, which is what a browser
//! canvas produces.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::error::ControlError;

/// Control messages from the client
///
/// Applied to the session's control state as soon as they are received.
/// They are never rate limited and never queued.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Replace the active style image; `None` reverts to passthrough
    SetStyle {
        /// Raw style image bytes (base64 on the wire)
        #[serde(default, with = "base64_payload")]
        style: Option<Vec<u8>>,
    },

    /// Select the model used for subsequent frames
    SetModel {
        /// Model identifier
        model: String,
    },
}

impl ControlMessage {
    /// Parse a control message from JSON text
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to JSON text (used by clients and tests)
    pub fn to_json(&self) -> Result<String, ControlError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetStyle { .. } => "set_style",
            Self::SetModel { .. } => "set_model",
        }
    }
}

/// Inbound message after classification
#[derive(Debug)]
pub enum Inbound {
    /// An encoded video frame
    Frame(Vec<u8>),
    /// A well-formed control message
    Control(ControlMessage),
    /// A text message that failed to parse
    Invalid(ControlError),
    /// The peer started the closing handshake
    Close,
    /// Ping, pong and raw frames; handled by the WebSocket layer
    Ignore,
}

impl Inbound {
    /// Classify a raw WebSocket message
    #[must_use]
    pub fn classify(message: Message) -> Self {
        match message {
            Message::Binary(data) => Self::Frame(data),
            Message::Text(text) => match ControlMessage::parse(&text) {
                Ok(control) => Self::Control(control),
                Err(e) => Self::Invalid(e),
            },
            Message::Close(_) => Self::Close,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Self::Ignore,
        }
    }
}

/// Text notices sent from the server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerNotice {
    /// A control message was rejected; the session continues
    Error {
        /// Human-readable description
        message: String,
    },
}

/// Outbound message produced by the session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Result bytes for one processed frame
    Frame(Vec<u8>),
    /// A text notice
    Notice(ServerNotice),
}

impl Outbound {
    /// Build an error notice
    pub fn error(message: impl Into<String>) -> Self {
        Self::Notice(ServerNotice::Error {
            message: message.into(),
        })
    }

    /// Convert into a WebSocket message
    #[must_use]
    pub fn into_message(self) -> Message {
        match self {
            Self::Frame(data) => Message::Binary(data),
            // ServerNotice only holds strings, serialization cannot fail
            Self::Notice(notice) => {
                Message::Text(serde_json::to_string(&notice).unwrap_or_default())
            }
        }
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|text| {
            let payload = strip_data_url(text.trim());
            STANDARD
                .decode(payload.as_bytes())
                .map_err(|e| serde::de::Error::custom(format!("invalid base64 style payload: {e}")))
        })
        .transpose()
    }

    /// `data:image/png;base64,AAAA` -> `AAAA`
    fn strip_data_url(text: &str) -> &str {
        if text.starts_with("data:") {
            text.split_once(',').map_or(text, |(_, payload)| payload)
        } else {
            text
        }
    }
}
