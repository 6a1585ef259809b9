//! The peer connection seam. Description handling and transport live
//! behind [`PeerCapability`]; the negotiation code only sequences calls.

use async_trait::async_trait;
use huddle_protocol::{ConnectionId, SessionDescription};

use crate::error::CapabilityError;
use crate::media::LocalTrack;

/// Handle to one outgoing sender on a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

#[async_trait]
pub trait PeerCapability: Send {
    /// Create an offer and install it as the local description.
    async fn create_offer(&mut self) -> Result<SessionDescription, CapabilityError>;

    /// Create an answer to the applied remote offer and install it as the
    /// local description.
    async fn create_answer(&mut self) -> Result<SessionDescription, CapabilityError>;

    async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError>;

    /// Discard an unanswered local offer.
    async fn rollback(&mut self) -> Result<(), CapabilityError>;

    fn add_track(&mut self, track: &LocalTrack) -> Result<SenderId, CapabilityError>;

    fn replace_track(&mut self, sender: SenderId, track: &LocalTrack) -> Result<(), CapabilityError>;

    fn remove_track(&mut self, sender: SenderId) -> Result<(), CapabilityError>;

    fn close(&mut self);
}

pub trait CapabilityFactory: Send + Sync {
    fn create(&self, remote: &ConnectionId) -> Result<Box<dyn PeerCapability>, CapabilityError>;
}
