use huddle_protocol::ConnectionId;
use thiserror::Error;

use crate::media::MediaKind;
use crate::session::NegotiationState;

/// Failure reported by the peer connection capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("{operation} failed: {message}")]
    Failed {
        operation: &'static str,
        message: String,
    },
    #[error("peer connection is closed")]
    Closed,
}

impl CapabilityError {
    pub fn failed(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            operation,
            message: message.into(),
        }
    }
}

/// Local capture failures. These never leave the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("no {0} device available")]
    NotFound(String),
    #[error("capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: NegotiationState,
    },
    #[error("no session with peer {0}")]
    UnknownPeer(ConnectionId),
    #[error("already in a call with peer {0}")]
    AlreadyInCall(ConnectionId),
    #[error("no local {0} track")]
    MissingTrack(MediaKind),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}
