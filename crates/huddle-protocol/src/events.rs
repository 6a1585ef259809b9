use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::ConnectionId;

/// An SDP offer or answer. The relay forwards it untouched; only the
/// endpoints' peer connection objects interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub Value);

impl SessionDescription {
    pub fn new(kind: &str, sdp: impl Into<String>) -> Self {
        Self(serde_json::json!({ "type": kind, "sdp": sdp.into() }))
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub email: String,
    pub room: String,
}

/// Join acknowledgement: the request echoed back plus the id the relay
/// assigned to the joining connection. Older relays omit the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAck {
    pub email: String,
    pub room: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOffer {
    pub to: ConnectionId,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAnswer {
    pub to: ConnectionId,
    pub ans: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRelay {
    pub from: ConnectionId,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRelay {
    pub from: ConnectionId,
    pub ans: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPresence {
    pub email: String,
    pub id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Events sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "room:join")]
    Join(JoinRequest),
    #[serde(rename = "user:call")]
    Call(CallOffer),
    #[serde(rename = "call:accepted")]
    AcceptCall(CallAnswer),
    #[serde(rename = "peer:nego:needed")]
    RenegotiationRequest(CallOffer),
    #[serde(rename = "peer:nego:done")]
    RenegotiationResponse(CallAnswer),
}

/// Events sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "room:join")]
    Joined(JoinAck),
    #[serde(rename = "room:error")]
    JoinFailed(JoinError),
    #[serde(rename = "user:joined")]
    PeerJoined(PeerPresence),
    #[serde(rename = "user:left")]
    PeerLeft(PeerPresence),
    // The misspelling is the deployed wire literal.
    #[serde(rename = "incomming:call")]
    IncomingCall(OfferRelay),
    #[serde(rename = "call:accepted")]
    CallAccepted(AnswerRelay),
    #[serde(rename = "peer:nego:needed")]
    RenegotiationOffer(OfferRelay),
    #[serde(rename = "peer:nego:final")]
    RenegotiationAnswer(AnswerRelay),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed signaling frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("signaling frame is not valid utf-8")]
    NotUtf8,
}

impl ClientEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
        Self::decode(text)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => "room:join",
            ClientEvent::Call(_) => "user:call",
            ClientEvent::AcceptCall(_) => "call:accepted",
            ClientEvent::RenegotiationRequest(_) => "peer:nego:needed",
            ClientEvent::RenegotiationResponse(_) => "peer:nego:done",
        }
    }
}

impl ServerEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
        Self::decode(text)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Joined(_) => "room:join",
            ServerEvent::JoinFailed(_) => "room:error",
            ServerEvent::PeerJoined(_) => "user:joined",
            ServerEvent::PeerLeft(_) => "user:left",
            ServerEvent::IncomingCall(_) => "incomming:call",
            ServerEvent::CallAccepted(_) => "call:accepted",
            ServerEvent::RenegotiationOffer(_) => "peer:nego:needed",
            ServerEvent::RenegotiationAnswer(_) => "peer:nego:final",
        }
    }
}
