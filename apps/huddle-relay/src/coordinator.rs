//! Routes client events between live connections.
//!
//! Each public method is one logical step: it takes the state lock once,
//! applies at most one registry operation, queues the resulting outbound
//! events and returns. Nothing awaits while the lock is held, so events
//! from different connections interleave only between steps.

use std::collections::HashMap;

use huddle_protocol::{
    AnswerRelay, CallAnswer, CallOffer, ClientEvent, ConnectionId, JoinAck, JoinError,
    JoinRequest, OfferRelay, PeerPresence, ProtocolError, ServerEvent,
};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::Registry;

pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Tell the remaining room members when someone disconnects.
    pub announce_departures: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            announce_departures: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub active_connections: usize,
    pub identities: usize,
    pub rooms: Vec<RoomStatsEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStatsEntry {
    pub room: String,
    pub members: usize,
}

pub struct Coordinator {
    state: Mutex<RelayState>,
    options: RelayOptions,
}

struct RelayState {
    registry: Registry,
    connections: HashMap<ConnectionId, Outbound>,
}

impl RelayState {
    /// Queue `event` for `to`. A target that is gone is not an error.
    fn unicast(&self, to: &ConnectionId, event: ServerEvent) -> bool {
        let name = event.name();
        match self.connections.get(to) {
            Some(outbound) if outbound.send(event).is_ok() => true,
            _ => {
                debug!(connection_id = %to, event = name, "dropping event for inactive connection");
                counter!("huddle_relay_unicast_misses_total", 1, "event" => name);
                false
            }
        }
    }
}

impl Coordinator {
    pub fn new(registry: Registry, options: RelayOptions) -> Self {
        Self {
            state: Mutex::new(RelayState {
                registry,
                connections: HashMap::new(),
            }),
            options,
        }
    }

    /// Register a freshly accepted socket and hand back its id plus the
    /// queue its writer task drains.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = ConnectionId::generate();
        let active = {
            let mut state = self.state.lock();
            state.connections.insert(connection_id.clone(), tx);
            state.connections.len()
        };
        counter!("huddle_relay_connections_total", 1);
        gauge!("huddle_relay_connections_active", active as f64);
        debug!(connection_id = %connection_id, "connection registered");
        (connection_id, rx)
    }

    pub fn handle(&self, from: &ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::Join(request) => self.join(from, request),
            ClientEvent::Call(CallOffer { to, offer }) => self.forward(
                from,
                &to,
                ServerEvent::IncomingCall(OfferRelay {
                    from: from.clone(),
                    offer,
                }),
            ),
            ClientEvent::AcceptCall(CallAnswer { to, ans }) => self.forward(
                from,
                &to,
                ServerEvent::CallAccepted(AnswerRelay {
                    from: from.clone(),
                    ans,
                }),
            ),
            ClientEvent::RenegotiationRequest(CallOffer { to, offer }) => self.forward(
                from,
                &to,
                ServerEvent::RenegotiationOffer(OfferRelay {
                    from: from.clone(),
                    offer,
                }),
            ),
            ClientEvent::RenegotiationResponse(CallAnswer { to, ans }) => self.forward(
                from,
                &to,
                ServerEvent::RenegotiationAnswer(AnswerRelay {
                    from: from.clone(),
                    ans,
                }),
            ),
        }
    }

    /// Answer an undecodable frame with an error event instead of dropping it.
    pub fn reject_frame(&self, from: &ConnectionId, error: &ProtocolError) {
        warn!(connection_id = %from, error = %error, "failed to parse client event");
        counter!("huddle_relay_invalid_frames_total", 1);
        let state = self.state.lock();
        state.unicast(
            from,
            ServerEvent::JoinFailed(JoinError {
                message: format!("Invalid message format: {error}"),
                code: Some("invalid_message".to_string()),
            }),
        );
    }

    /// Tear down everything held for `connection_id`. Runs once per socket,
    /// whether it closed cleanly or not; repeated calls are harmless.
    pub fn disconnect(&self, connection_id: &ConnectionId) {
        let mut state = self.state.lock();
        state.connections.remove(connection_id);
        let departed = state.registry.leave(connection_id);

        if let Some(departed) = &departed {
            info!(
                connection_id = %connection_id,
                email = %departed.email,
                room = %departed.room,
                remaining = departed.remaining.len(),
                "participant left"
            );
            if self.options.announce_departures {
                let presence = PeerPresence {
                    email: departed.email.to_string(),
                    id: connection_id.clone(),
                };
                for member in &departed.remaining {
                    state.unicast(member, ServerEvent::PeerLeft(presence.clone()));
                }
            }
        }

        gauge!("huddle_relay_connections_active", state.connections.len() as f64);
        gauge!("huddle_relay_rooms_active", state.registry.room_count() as f64);
        debug!(connection_id = %connection_id, "connection released");
    }

    pub fn stats(&self) -> RelayStats {
        let state = self.state.lock();
        RelayStats {
            active_connections: state.connections.len(),
            identities: state.registry.identity_count(),
            rooms: state
                .registry
                .snapshot()
                .into_iter()
                .map(|entry| RoomStatsEntry {
                    room: entry.room.to_string(),
                    members: entry.members,
                })
                .collect(),
        }
    }

    fn join(&self, from: &ConnectionId, request: JoinRequest) {
        let mut state = self.state.lock();
        match state.registry.join(&request.email, from, &request.room) {
            Ok(accepted) => {
                info!(
                    connection_id = %from,
                    email = %accepted.email,
                    room = %accepted.room,
                    peers = accepted.members.len(),
                    "participant joined"
                );
                counter!("huddle_relay_joins_total", 1);
                gauge!("huddle_relay_rooms_active", state.registry.room_count() as f64);

                let presence = PeerPresence {
                    email: accepted.email.to_string(),
                    id: from.clone(),
                };
                state.unicast(
                    from,
                    ServerEvent::Joined(JoinAck {
                        email: request.email,
                        room: request.room,
                        id: Some(from.clone()),
                    }),
                );
                if let Some(left) = &accepted.left {
                    if self.options.announce_departures {
                        let presence = PeerPresence {
                            email: left.email.to_string(),
                            id: from.clone(),
                        };
                        for member in &left.remaining {
                            state.unicast(member, ServerEvent::PeerLeft(presence.clone()));
                        }
                    }
                }
                if !accepted.unchanged {
                    for member in &accepted.members {
                        state.unicast(member, ServerEvent::PeerJoined(presence.clone()));
                    }
                }
            }
            Err(rejection) => {
                warn!(
                    connection_id = %from,
                    email = %request.email,
                    room = %request.room,
                    reason = rejection.code(),
                    "join rejected"
                );
                counter!("huddle_relay_join_rejections_total", 1, "reason" => rejection.code());
                state.unicast(
                    from,
                    ServerEvent::JoinFailed(JoinError {
                        message: rejection.to_string(),
                        code: Some(rejection.code().to_string()),
                    }),
                );
            }
        }
    }

    fn forward(&self, from: &ConnectionId, to: &ConnectionId, event: ServerEvent) {
        let name = event.name();
        let state = self.state.lock();
        if state.unicast(to, event) {
            debug!(from = %from, to = %to, event = name, "forwarded negotiation event");
            counter!("huddle_relay_messages_forwarded_total", 1, "event" => name);
        }
    }
}
