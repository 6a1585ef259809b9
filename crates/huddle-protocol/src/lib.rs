//! Shared message shapes for the Huddle signaling channel. The relay and
//! every client link against this crate so the event names and payload
//! layouts stay in one place.

pub mod events;
pub mod ids;

pub use events::{
    AnswerRelay, CallAnswer, CallOffer, ClientEvent, JoinAck, JoinError, JoinRequest, OfferRelay,
    PeerPresence, ProtocolError, ServerEvent, SessionDescription,
};
pub use ids::{ConnectionId, Email, IdentityError, RoomId};
