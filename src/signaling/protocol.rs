//! Signaling command envelopes and close codes

use serde::{Deserialize, Serialize};

/// Authentication/open command sent after the transport-level open
pub const COMMAND_OPEN: &str = "open";

/// SDP offer forwarded to a peer
pub const COMMAND_OFFER_SDP: &str = "offersdp";

/// SDP answer forwarded to a peer
pub const COMMAND_ANSWER_SDP: &str = "answersdp";

/// ICE candidate forwarded to a peer
pub const COMMAND_ICE_CANDIDATE: &str = "ice_candidate";

/// Command envelope carried over the signaling connection
///
/// Per-peer commands carry the recipient in `id`; global commands omit it.
/// Inbound envelopes are decoded into the same shape and handed to the
/// single registered subscriber; dispatch by recipient is the control
/// layer's responsibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    /// Recipient peer ID, absent for global commands
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Command name
    pub command: String,

    /// Command payload
    pub data: serde_json::Value,
}

impl CommandEnvelope {
    /// Create a per-peer command envelope
    pub fn to_peer(id: &str, command: &str, data: serde_json::Value) -> Self {
        Self {
            id: Some(id.to_string()),
            command: command.to_string(),
            data,
        }
    }

    /// Create a global command envelope (no recipient)
    pub fn global(command: &str, data: serde_json::Value) -> Self {
        Self {
            id: None,
            command: command.to_string(),
            data,
        }
    }

    /// Convert envelope to a JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize command envelope: {}", e))
        })
    }

    /// Parse envelope from a JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize command envelope: {}",
                e
            ))
        })
    }
}

/// Payload of an `offersdp` command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferSdpData {
    /// SDP offer
    pub sdp: String,
}

/// Payload of an `answersdp` command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerSdpData {
    /// SDP answer
    pub sdp: String,
}

/// Payload of an `ice_candidate` command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceCandidateData {
    /// Media line identifier the candidate belongs to
    pub sdp_mid: String,

    /// Media line index the candidate belongs to
    pub sdp_mline_index: u16,

    /// Candidate description string
    pub candidate: String,
}

/// Payload of the outbound `open` command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenCommandData {
    /// Endpoint identity
    pub id: String,

    /// Endpoint password
    pub password: String,
}

/// Payload of the server's `open` acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenAckData {
    /// Session ID assigned by the signaling server
    pub session_id: String,
}

/// Close reason surfaced to the control layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Deliberate close
    Normal,

    /// Abnormal/unexpected peer loss
    GoingAway,

    /// Connection dropped without a close handshake
    Abnormal,
}

impl CloseCode {
    /// Numeric wire value (websocket-style close status)
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Abnormal => 1006,
        }
    }

    /// Map a numeric close status back to a close code
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            _ => CloseCode::Abnormal,
        }
    }
}
