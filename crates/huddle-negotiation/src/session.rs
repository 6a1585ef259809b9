//! Per-peer offer/answer state machine.
//!
//! Every protocol step goes through [`NegotiationSession::handle`]. Inputs
//! that make no sense in the current state are logged and dropped; they
//! never move the session.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use huddle_protocol::{
    AnswerRelay, CallAnswer, CallOffer, ClientEvent, ConnectionId, OfferRelay, ServerEvent,
    SessionDescription,
};
use tracing::{debug, info, warn};

use crate::capability::{PeerCapability, SenderId};
use crate::error::NegotiationError;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::signaling::SignalSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenegotiationRole {
    Offering,
    Answering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Renegotiating(RenegotiationRole),
    Closed,
}

/// Which exchange a description belongs to. Decided by the event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Call,
    Renegotiation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationInput {
    InitiateCall,
    RemoteOffer {
        exchange: Exchange,
        offer: SessionDescription,
    },
    RemoteAnswer {
        exchange: Exchange,
        answer: SessionDescription,
    },
    LocalTracksChanged,
    TransportConnected,
    RemoteTrack(RemoteTrack),
}

impl NegotiationInput {
    /// Map a relayed negotiation event to the sending peer and the input
    /// it drives. Membership events return `None`.
    pub fn from_server_event(event: ServerEvent) -> Option<(ConnectionId, Self)> {
        match event {
            ServerEvent::IncomingCall(OfferRelay { from, offer }) => Some((
                from,
                Self::RemoteOffer {
                    exchange: Exchange::Call,
                    offer,
                },
            )),
            ServerEvent::CallAccepted(AnswerRelay { from, ans }) => Some((
                from,
                Self::RemoteAnswer {
                    exchange: Exchange::Call,
                    answer: ans,
                },
            )),
            ServerEvent::RenegotiationOffer(OfferRelay { from, offer }) => Some((
                from,
                Self::RemoteOffer {
                    exchange: Exchange::Renegotiation,
                    offer,
                },
            )),
            ServerEvent::RenegotiationAnswer(AnswerRelay { from, ans }) => Some((
                from,
                Self::RemoteAnswer {
                    exchange: Exchange::Renegotiation,
                    answer: ans,
                },
            )),
            ServerEvent::Joined(_)
            | ServerEvent::JoinFailed(_)
            | ServerEvent::PeerJoined(_)
            | ServerEvent::PeerLeft(_) => None,
        }
    }
}

struct OutgoingSender {
    id: SenderId,
    track: LocalTrack,
}

pub struct NegotiationSession {
    local: Option<ConnectionId>,
    remote: ConnectionId,
    capability: Box<dyn PeerCapability>,
    sink: Arc<dyn SignalSink>,
    state: NegotiationState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    // Tracks handed over before the first offer/answer; attached then.
    unattached: BTreeMap<MediaKind, LocalTrack>,
    senders: HashMap<MediaKind, OutgoingSender>,
    remote_tracks: Vec<RemoteTrack>,
    pending_renegotiation: bool,
    // Where a failing step lands once it has undone part of the exchange.
    recover_to: Option<NegotiationState>,
}

impl NegotiationSession {
    /// `local` is our own connection id when the relay reported it; it
    /// decides who yields when both sides offer at once. At most one track
    /// per media kind is kept from `tracks`.
    pub fn new(
        local: Option<ConnectionId>,
        remote: ConnectionId,
        capability: Box<dyn PeerCapability>,
        sink: Arc<dyn SignalSink>,
        tracks: Vec<LocalTrack>,
    ) -> Self {
        let unattached = tracks
            .into_iter()
            .map(|track| (track.kind(), track))
            .collect();
        Self {
            local,
            remote,
            capability,
            sink,
            state: NegotiationState::Idle,
            local_description: None,
            remote_description: None,
            unattached,
            senders: HashMap::new(),
            remote_tracks: Vec::new(),
            pending_renegotiation: false,
            recover_to: None,
        }
    }

    pub fn remote(&self) -> &ConnectionId {
        &self.remote
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn pending_renegotiation(&self) -> bool {
        self.pending_renegotiation
    }

    /// Track currently sent (or staged to be sent) for `kind`.
    pub fn outgoing(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.senders
            .get(&kind)
            .map(|sender| &sender.track)
            .or_else(|| self.unattached.get(&kind))
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// The side whose connection id sorts higher yields on collision.
    /// Without a known local id we always yield.
    pub fn is_polite(&self) -> bool {
        match &self.local {
            Some(local) => local > &self.remote,
            None => true,
        }
    }

    pub async fn handle(&mut self, input: NegotiationInput) -> Result<(), NegotiationError> {
        let before = self.state;
        self.recover_to = None;
        let result = match input {
            NegotiationInput::InitiateCall => self.initiate_call().await,
            NegotiationInput::RemoteOffer {
                exchange: Exchange::Call,
                offer,
            } => self.on_call_offer(offer).await,
            NegotiationInput::RemoteOffer {
                exchange: Exchange::Renegotiation,
                offer,
            } => self.on_renegotiation_offer(offer).await,
            NegotiationInput::RemoteAnswer {
                exchange: Exchange::Call,
                answer,
            } => self.on_call_answer(answer).await,
            NegotiationInput::RemoteAnswer {
                exchange: Exchange::Renegotiation,
                answer,
            } => self.on_renegotiation_answer(answer).await,
            NegotiationInput::LocalTracksChanged => {
                self.on_local_tracks_changed().await;
                Ok(())
            }
            NegotiationInput::TransportConnected => {
                if self.state == NegotiationState::AnswerExchanged {
                    self.enter_connected().await;
                }
                Ok(())
            }
            NegotiationInput::RemoteTrack(track) => {
                self.on_remote_track(track).await;
                Ok(())
            }
        };

        if let Err(err) = &result {
            warn!(remote = %self.remote, state = ?self.state, error = %err, "negotiation step failed");
            if self.state != NegotiationState::Closed {
                self.state = self.recover_to.take().unwrap_or(before);
            }
        }
        if self.state != before {
            debug!(remote = %self.remote, from = ?before, to = ?self.state, "negotiation state changed");
        }
        result
    }

    /// Send `track`, replacing whatever track of the same kind was being
    /// sent. Returns the displaced track so the caller can release it.
    pub async fn set_track(
        &mut self,
        track: LocalTrack,
    ) -> Result<Option<LocalTrack>, NegotiationError> {
        let kind = track.kind();
        match self.state {
            NegotiationState::Closed => {
                return Err(NegotiationError::InvalidState {
                    action: "change tracks",
                    state: self.state,
                })
            }
            NegotiationState::Idle if !self.senders.contains_key(&kind) => {
                return Ok(self.unattached.insert(kind, track))
            }
            _ => {}
        }

        let displaced = match self.senders.get_mut(&kind) {
            Some(sender) => {
                self.capability.replace_track(sender.id, &track)?;
                Some(std::mem::replace(&mut sender.track, track))
            }
            None => {
                let id = self.capability.add_track(&track)?;
                self.senders.insert(kind, OutgoingSender { id, track });
                None
            }
        };
        self.on_local_tracks_changed().await;
        Ok(displaced)
    }

    /// Stop sending `kind` altogether.
    pub async fn remove_track(
        &mut self,
        kind: MediaKind,
    ) -> Result<Option<LocalTrack>, NegotiationError> {
        match self.state {
            NegotiationState::Closed => {
                return Err(NegotiationError::InvalidState {
                    action: "change tracks",
                    state: self.state,
                })
            }
            NegotiationState::Idle if self.unattached.contains_key(&kind) => {
                return Ok(self.unattached.remove(&kind))
            }
            _ => {}
        }

        let Some(sender_id) = self.senders.get(&kind).map(|sender| sender.id) else {
            return Ok(None);
        };
        self.capability.remove_track(sender_id)?;
        let removed = self.senders.remove(&kind).map(|sender| sender.track);
        self.on_local_tracks_changed().await;
        Ok(removed)
    }

    /// Mute or unmute without touching the sender; no renegotiation.
    pub fn set_enabled(
        &mut self,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<LocalTrack, NegotiationError> {
        let track = match self.senders.get_mut(&kind) {
            Some(sender) => &mut sender.track,
            None => self
                .unattached
                .get_mut(&kind)
                .ok_or(NegotiationError::MissingTrack(kind))?,
        };
        track.enabled = enabled;
        Ok(track.clone())
    }

    /// Close the peer connection and hand back every local track for
    /// release. Calling it again returns nothing.
    pub fn close(&mut self) -> Vec<LocalTrack> {
        if self.state == NegotiationState::Closed {
            return Vec::new();
        }
        self.capability.close();
        self.state = NegotiationState::Closed;
        self.pending_renegotiation = false;
        self.remote_tracks.clear();
        info!(remote = %self.remote, "negotiation session closed");

        let mut tracks: Vec<LocalTrack> = self.senders.drain().map(|(_, sender)| sender.track).collect();
        tracks.extend(std::mem::take(&mut self.unattached).into_values());
        tracks
    }

    async fn initiate_call(&mut self) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::InvalidState {
                action: "start a call",
                state: self.state,
            });
        }
        self.attach_unattached()?;
        let offer = self.capability.create_offer().await?;
        self.local_description = Some(offer.clone());
        self.state = NegotiationState::OfferSent;
        self.sink.send(ClientEvent::Call(CallOffer {
            to: self.remote.clone(),
            offer,
        }));
        info!(remote = %self.remote, senders = self.senders.len(), "call offer sent");
        Ok(())
    }

    async fn on_call_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::Idle => {}
            NegotiationState::OfferSent if self.is_polite() => {
                info!(remote = %self.remote, "call offers collided; answering theirs");
                self.capability.rollback().await?;
                self.local_description = None;
                self.recover_to = Some(NegotiationState::Idle);
            }
            NegotiationState::OfferSent => {
                info!(remote = %self.remote, "call offers collided; ignoring theirs");
                return Ok(());
            }
            state => {
                warn!(remote = %self.remote, ?state, "ignoring call offer");
                return Ok(());
            }
        }

        self.state = NegotiationState::OfferReceived;
        self.capability
            .apply_remote_description(offer.clone())
            .await?;
        self.remote_description = Some(offer);
        self.attach_unattached()?;
        let answer = self.capability.create_answer().await?;
        self.local_description = Some(answer.clone());
        self.state = NegotiationState::AnswerExchanged;
        self.sink.send(ClientEvent::AcceptCall(CallAnswer {
            to: self.remote.clone(),
            ans: answer,
        }));
        info!(remote = %self.remote, "call answered");
        Ok(())
    }

    async fn on_call_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::OfferSent {
            warn!(remote = %self.remote, state = ?self.state, "ignoring call answer without an outstanding offer");
            return Ok(());
        }
        self.capability
            .apply_remote_description(answer.clone())
            .await?;
        self.remote_description = Some(answer);
        self.state = NegotiationState::AnswerExchanged;
        self.enter_connected().await;
        Ok(())
    }

    async fn on_renegotiation_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::Connected | NegotiationState::AnswerExchanged => {}
            NegotiationState::Renegotiating(RenegotiationRole::Offering) if self.is_polite() => {
                info!(remote = %self.remote, "renegotiation offers collided; answering theirs");
                self.capability.rollback().await?;
                self.pending_renegotiation = true;
                // Our offer is gone; a failure from here re-offers on the next change.
                self.recover_to = Some(NegotiationState::Connected);
            }
            NegotiationState::Renegotiating(RenegotiationRole::Offering) => {
                info!(remote = %self.remote, "renegotiation offers collided; ignoring theirs");
                return Ok(());
            }
            state => {
                warn!(remote = %self.remote, ?state, "ignoring renegotiation offer");
                return Ok(());
            }
        }

        self.state = NegotiationState::Renegotiating(RenegotiationRole::Answering);
        self.capability
            .apply_remote_description(offer.clone())
            .await?;
        self.remote_description = Some(offer);
        let answer = self.capability.create_answer().await?;
        self.local_description = Some(answer.clone());
        self.sink.send(ClientEvent::RenegotiationResponse(CallAnswer {
            to: self.remote.clone(),
            ans: answer,
        }));
        debug!(remote = %self.remote, "renegotiation answered");
        self.enter_connected().await;
        Ok(())
    }

    async fn on_renegotiation_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::Renegotiating(RenegotiationRole::Offering) {
            warn!(remote = %self.remote, state = ?self.state, "ignoring stale renegotiation answer");
            return Ok(());
        }
        self.capability
            .apply_remote_description(answer.clone())
            .await?;
        self.remote_description = Some(answer);
        self.enter_connected().await;
        Ok(())
    }

    async fn on_local_tracks_changed(&mut self) {
        match self.state {
            NegotiationState::Connected => {
                if let Err(err) = self.start_renegotiation().await {
                    warn!(remote = %self.remote, error = %err, "renegotiation offer failed; retrying on next change");
                    self.pending_renegotiation = true;
                }
            }
            // Staged tracks go out with the first offer or answer.
            NegotiationState::Idle | NegotiationState::Closed => {}
            _ => {
                debug!(remote = %self.remote, state = ?self.state, "deferring renegotiation");
                self.pending_renegotiation = true;
            }
        }
    }

    async fn on_remote_track(&mut self, track: RemoteTrack) {
        if self.state == NegotiationState::Closed {
            return;
        }
        if self.remote_description.is_none() {
            warn!(remote = %self.remote, track = %track.id, "remote track before any remote description");
            return;
        }
        if !self.remote_tracks.iter().any(|known| known.id == track.id) {
            debug!(remote = %self.remote, track = %track.id, kind = %track.kind, "remote track added");
            self.remote_tracks.push(track);
        }
        if self.state == NegotiationState::AnswerExchanged {
            self.enter_connected().await;
        }
    }

    async fn enter_connected(&mut self) {
        self.state = NegotiationState::Connected;
        if std::mem::take(&mut self.pending_renegotiation) {
            self.on_local_tracks_changed().await;
        }
    }

    async fn start_renegotiation(&mut self) -> Result<(), NegotiationError> {
        let offer = self.capability.create_offer().await?;
        self.local_description = Some(offer.clone());
        self.state = NegotiationState::Renegotiating(RenegotiationRole::Offering);
        self.pending_renegotiation = false;
        self.sink.send(ClientEvent::RenegotiationRequest(CallOffer {
            to: self.remote.clone(),
            offer,
        }));
        info!(remote = %self.remote, "renegotiation offer sent");
        Ok(())
    }

    fn attach_unattached(&mut self) -> Result<(), NegotiationError> {
        let kinds: Vec<MediaKind> = self.unattached.keys().copied().collect();
        for kind in kinds {
            let Some(track) = self.unattached.get(&kind) else {
                continue;
            };
            match self.senders.get_mut(&kind) {
                Some(sender) => {
                    self.capability.replace_track(sender.id, track)?;
                    if let Some(track) = self.unattached.remove(&kind) {
                        sender.track = track;
                    }
                }
                None => {
                    let id = self.capability.add_track(track)?;
                    if let Some(track) = self.unattached.remove(&kind) {
                        self.senders.insert(kind, OutgoingSender { id, track });
                    }
                }
            }
        }
        Ok(())
    }
}
