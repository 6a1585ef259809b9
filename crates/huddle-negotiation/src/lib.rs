//! Client side of a Huddle call: the offer/answer state machine that runs
//! per remote peer, the agent that owns those sessions, and the WebSocket
//! client that carries their messages to the relay.
//!
//! The peer connection and capture devices are reached only through the
//! [`PeerCapability`] and [`MediaSource`] traits.

pub mod agent;
pub mod capability;
pub mod error;
pub mod media;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use agent::{CallAgent, CallEvent};
pub use capability::{CapabilityFactory, PeerCapability, SenderId};
pub use error::{CapabilityError, DeviceError, NegotiationError, SignalingError};
pub use media::{LocalTrack, MediaKind, MediaSource, RemoteTrack, TrackSource};
pub use session::{
    Exchange, NegotiationInput, NegotiationSession, NegotiationState, RenegotiationRole,
};
pub use signaling::{websocket_url, SignalSink, SignalingClient};
