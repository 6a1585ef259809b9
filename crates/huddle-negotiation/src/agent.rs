//! One participant's side of a call: owns the per-peer sessions, the
//! capture devices and the signaling sink, and reports to the UI through a
//! [`CallEvent`] channel.

use std::collections::HashMap;
use std::sync::Arc;

use huddle_protocol::{ClientEvent, ConnectionId, JoinRequest, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capability::CapabilityFactory;
use crate::error::{DeviceError, NegotiationError};
use crate::media::{LocalTrack, MediaKind, MediaSource, RemoteTrack, TrackSource};
use crate::session::{Exchange, NegotiationInput, NegotiationSession, NegotiationState};
use crate::signaling::SignalSink;

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Joined {
        email: String,
        room: String,
    },
    JoinFailed {
        message: String,
        code: Option<String>,
    },
    PeerJoined {
        email: String,
        id: ConnectionId,
    },
    PeerLeft {
        email: String,
        id: ConnectionId,
    },
    StateChanged {
        remote: ConnectionId,
        state: NegotiationState,
    },
    RemoteTrackAdded {
        remote: ConnectionId,
        track: RemoteTrack,
    },
    DeviceFailed {
        remote: ConnectionId,
        error: DeviceError,
    },
    NegotiationFailed {
        remote: ConnectionId,
        reason: String,
    },
    CallEnded {
        remote: ConnectionId,
    },
}

struct CallSlot {
    session: NegotiationSession,
    // Camera set aside while the screen is shared.
    parked_camera: Option<LocalTrack>,
}

pub struct CallAgent {
    local_id: Option<ConnectionId>,
    sink: Arc<dyn SignalSink>,
    factory: Box<dyn CapabilityFactory>,
    media: Box<dyn MediaSource>,
    calls: HashMap<ConnectionId, CallSlot>,
    events: mpsc::UnboundedSender<CallEvent>,
}

impl CallAgent {
    pub fn new(
        sink: Arc<dyn SignalSink>,
        factory: Box<dyn CapabilityFactory>,
        media: Box<dyn MediaSource>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let agent = Self {
            local_id: None,
            sink,
            factory,
            media,
            calls: HashMap::new(),
            events,
        };
        (agent, events_rx)
    }

    /// Our own connection id, once the relay has acknowledged a join.
    pub fn local_id(&self) -> Option<&ConnectionId> {
        self.local_id.as_ref()
    }

    pub fn session(&self, remote: &ConnectionId) -> Option<&NegotiationSession> {
        self.calls.get(remote).map(|slot| &slot.session)
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn join(&mut self, email: impl Into<String>, room: impl Into<String>) {
        let request = JoinRequest {
            email: email.into(),
            room: room.into(),
        };
        info!(email = %request.email, room = %request.room, "joining room");
        self.sink.send(ClientEvent::Join(request));
    }

    pub async fn start_call(&mut self, remote: ConnectionId) -> Result<(), NegotiationError> {
        if self.calls.contains_key(&remote) {
            return Err(NegotiationError::AlreadyInCall(remote));
        }
        let tracks = self.acquire_user_media(&remote).await?;
        let mut session = self.open_session(&remote, tracks)?;
        if let Err(err) = session.handle(NegotiationInput::InitiateCall).await {
            self.discard(session);
            self.emit_failure(&remote, &err);
            return Err(err);
        }
        self.insert(remote, session);
        Ok(())
    }

    pub async fn handle_server_event(&mut self, event: ServerEvent) -> Result<(), NegotiationError> {
        match event {
            ServerEvent::Joined(ack) => {
                if ack.id.is_none() {
                    warn!("relay did not report our connection id; yielding on every offer collision");
                }
                self.local_id = ack.id;
                self.emit(CallEvent::Joined {
                    email: ack.email,
                    room: ack.room,
                });
                Ok(())
            }
            ServerEvent::JoinFailed(err) => {
                warn!(message = %err.message, code = ?err.code, "join rejected");
                self.emit(CallEvent::JoinFailed {
                    message: err.message,
                    code: err.code,
                });
                Ok(())
            }
            ServerEvent::PeerJoined(peer) => {
                self.emit(CallEvent::PeerJoined {
                    email: peer.email,
                    id: peer.id,
                });
                Ok(())
            }
            ServerEvent::PeerLeft(peer) => {
                self.end_call(&peer.id);
                self.emit(CallEvent::PeerLeft {
                    email: peer.email,
                    id: peer.id,
                });
                Ok(())
            }
            negotiation => match NegotiationInput::from_server_event(negotiation) {
                Some((from, input)) => self.route(from, input).await,
                None => Ok(()),
            },
        }
    }

    pub async fn start_screen_share(&mut self, remote: &ConnectionId) -> Result<(), NegotiationError> {
        if !self.calls.contains_key(remote) {
            return Err(NegotiationError::UnknownPeer(remote.clone()));
        }
        let display = match self.media.acquire_display_media().await {
            Ok(track) => track,
            Err(err) => {
                self.report_device_failure(remote, err.clone());
                return Err(err.into());
            }
        };

        let Some(slot) = self.calls.get_mut(remote) else {
            self.media.release(&display);
            return Err(NegotiationError::UnknownPeer(remote.clone()));
        };
        let displaced = match slot.session.set_track(display.clone()).await {
            Ok(displaced) => displaced,
            Err(err) => {
                self.media.release(&display);
                return Err(err);
            }
        };
        match displaced {
            Some(camera) if camera.source == TrackSource::Camera => {
                slot.parked_camera = Some(camera);
            }
            Some(previous) => self.media.release(&previous),
            None => {}
        }
        let track_id = &display.id;
        info!(remote = %remote, track = %track_id, "screen share started");
        self.emit_state(remote);
        Ok(())
    }

    /// Go back to the camera. A no-op when nothing is being shared.
    pub async fn stop_screen_share(&mut self, remote: &ConnectionId) -> Result<(), NegotiationError> {
        let slot = self
            .calls
            .get_mut(remote)
            .ok_or_else(|| NegotiationError::UnknownPeer(remote.clone()))?;
        let sharing = slot
            .session
            .outgoing(MediaKind::Video)
            .is_some_and(|track| track.source == TrackSource::Display);
        if !sharing {
            return Ok(());
        }

        let displaced = match slot.parked_camera.take() {
            Some(camera) => match slot.session.set_track(camera.clone()).await {
                Ok(displaced) => displaced,
                Err(err) => {
                    slot.parked_camera = Some(camera);
                    return Err(err);
                }
            },
            None => slot.session.remove_track(MediaKind::Video).await?,
        };
        if let Some(display) = displaced {
            self.media.release(&display);
        }
        info!(remote = %remote, "screen share stopped");
        self.emit_state(remote);
        Ok(())
    }

    pub fn toggle_audio(&mut self, remote: &ConnectionId, enabled: bool) -> Result<(), NegotiationError> {
        let slot = self
            .calls
            .get_mut(remote)
            .ok_or_else(|| NegotiationError::UnknownPeer(remote.clone()))?;
        let track = slot.session.set_enabled(MediaKind::Audio, enabled)?;
        self.media.set_enabled(&track, enabled);
        debug!(remote = %remote, enabled, "microphone toggled");
        Ok(())
    }

    /// Blank or restore whatever video is being sent; a shared screen
    /// counts as well as the camera.
    pub fn toggle_video(&mut self, remote: &ConnectionId, enabled: bool) -> Result<(), NegotiationError> {
        let slot = self
            .calls
            .get_mut(remote)
            .ok_or_else(|| NegotiationError::UnknownPeer(remote.clone()))?;
        let track = slot.session.set_enabled(MediaKind::Video, enabled)?;
        if let Some(camera) = slot.parked_camera.as_mut() {
            camera.enabled = enabled;
        }
        self.media.set_enabled(&track, enabled);
        debug!(remote = %remote, track = %track.id, enabled, "video toggled");
        Ok(())
    }

    /// Media from `remote` started flowing on the peer connection.
    pub async fn handle_remote_track(
        &mut self,
        remote: &ConnectionId,
        track: RemoteTrack,
    ) -> Result<(), NegotiationError> {
        let Some(slot) = self.calls.get_mut(remote) else {
            debug!(remote = %remote, track = %track.id, "remote track for unknown call");
            return Ok(());
        };
        let known = slot
            .session
            .remote_tracks()
            .iter()
            .any(|existing| existing.id == track.id);
        slot.session
            .handle(NegotiationInput::RemoteTrack(track.clone()))
            .await?;
        let accepted = slot
            .session
            .remote_tracks()
            .iter()
            .any(|existing| existing.id == track.id);
        if accepted && !known {
            self.emit(CallEvent::RemoteTrackAdded {
                remote: remote.clone(),
                track,
            });
        }
        self.emit_state(remote);
        Ok(())
    }

    pub async fn handle_transport_connected(&mut self, remote: &ConnectionId) -> Result<(), NegotiationError> {
        self.route(remote.clone(), NegotiationInput::TransportConnected)
            .await
    }

    /// Tear down the call with `remote`. Safe to call repeatedly.
    pub fn end_call(&mut self, remote: &ConnectionId) {
        let Some(slot) = self.calls.remove(remote) else {
            return;
        };
        let CallSlot {
            mut session,
            parked_camera,
        } = slot;
        for track in session.close().iter().chain(parked_camera.iter()) {
            self.media.release(track);
        }
        info!(remote = %remote, "call ended");
        self.emit(CallEvent::CallEnded {
            remote: remote.clone(),
        });
    }

    /// The signaling channel is gone; no session can make progress.
    pub fn connection_lost(&mut self) {
        let remotes: Vec<ConnectionId> = self.calls.keys().cloned().collect();
        for remote in remotes {
            self.end_call(&remote);
        }
        self.local_id = None;
    }

    async fn route(&mut self, from: ConnectionId, input: NegotiationInput) -> Result<(), NegotiationError> {
        let new_call = matches!(
            input,
            NegotiationInput::RemoteOffer {
                exchange: Exchange::Call,
                ..
            }
        );
        let stale = self.calls.get(&from).is_some_and(|slot| {
            !matches!(
                slot.session.state(),
                NegotiationState::Idle | NegotiationState::OfferSent
            )
        });
        if new_call && stale {
            // The peer hung up on its side and is calling again.
            info!(remote = %from, "call offer replaces existing call");
            self.end_call(&from);
        }

        if let Some(slot) = self.calls.get_mut(&from) {
            let before = slot.session.state();
            let result = slot.session.handle(input).await;
            if let Err(err) = &result {
                self.emit_failure(&from, err);
                if before_media_flows(before) {
                    self.end_call(&from);
                }
                return result;
            }
            self.emit_state(&from);
            return Ok(());
        }

        match input {
            NegotiationInput::RemoteOffer { .. } => self.accept_call(from, input).await,
            other => {
                warn!(remote = %from, input = ?other, "negotiation event for unknown call");
                Ok(())
            }
        }
    }

    async fn accept_call(&mut self, from: ConnectionId, offer: NegotiationInput) -> Result<(), NegotiationError> {
        info!(remote = %from, "incoming call");
        let tracks = self.acquire_user_media(&from).await?;
        let mut session = self.open_session(&from, tracks)?;
        if let Err(err) = session.handle(offer).await {
            self.discard(session);
            self.emit_failure(&from, &err);
            return Err(err);
        }
        self.insert(from, session);
        Ok(())
    }

    async fn acquire_user_media(&mut self, remote: &ConnectionId) -> Result<Vec<LocalTrack>, NegotiationError> {
        match self.media.acquire_user_media().await {
            Ok(tracks) => Ok(tracks),
            Err(err) => {
                self.report_device_failure(remote, err.clone());
                Err(err.into())
            }
        }
    }

    /// On failure the tracks are released before returning.
    fn open_session(
        &mut self,
        remote: &ConnectionId,
        tracks: Vec<LocalTrack>,
    ) -> Result<NegotiationSession, NegotiationError> {
        match self.factory.create(remote) {
            Ok(capability) => Ok(NegotiationSession::new(
                self.local_id.clone(),
                remote.clone(),
                capability,
                Arc::clone(&self.sink),
                tracks,
            )),
            Err(err) => {
                for track in &tracks {
                    self.media.release(track);
                }
                let err = NegotiationError::from(err);
                self.emit_failure(remote, &err);
                Err(err)
            }
        }
    }

    fn insert(&mut self, remote: ConnectionId, session: NegotiationSession) {
        self.calls.insert(
            remote.clone(),
            CallSlot {
                session,
                parked_camera: None,
            },
        );
        self.emit_state(&remote);
    }

    fn discard(&mut self, mut session: NegotiationSession) {
        for track in session.close() {
            self.media.release(&track);
        }
    }

    fn report_device_failure(&self, remote: &ConnectionId, error: DeviceError) {
        warn!(remote = %remote, error = %error, "media device unavailable");
        self.emit(CallEvent::DeviceFailed {
            remote: remote.clone(),
            error,
        });
    }

    fn emit_failure(&self, remote: &ConnectionId, err: &NegotiationError) {
        self.emit(CallEvent::NegotiationFailed {
            remote: remote.clone(),
            reason: err.to_string(),
        });
    }

    fn emit_state(&self, remote: &ConnectionId) {
        if let Some(slot) = self.calls.get(remote) {
            self.emit(CallEvent::StateChanged {
                remote: remote.clone(),
                state: slot.session.state(),
            });
        }
    }

    fn emit(&self, event: CallEvent) {
        if self.events.send(event).is_err() {
            debug!("call event receiver dropped");
        }
    }
}

fn before_media_flows(state: NegotiationState) -> bool {
    matches!(
        state,
        NegotiationState::Idle | NegotiationState::OfferSent | NegotiationState::OfferReceived
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{relay_as, MockFactory, MockMedia, RecordingSink};
    use huddle_protocol::{
        AnswerRelay, CallOffer, JoinAck, OfferRelay, PeerPresence, SessionDescription,
    };

    struct Harness {
        agent: CallAgent,
        events: mpsc::UnboundedReceiver<CallEvent>,
        sink: Arc<RecordingSink>,
        factory: MockFactory,
        media: MockMedia,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(MockFactory::default(), MockMedia::default())
        }

        fn with(factory: MockFactory, media: MockMedia) -> Self {
            let sink = Arc::new(RecordingSink::default());
            let (agent, events) = CallAgent::new(
                sink.clone(),
                Box::new(factory.clone()),
                Box::new(media.clone()),
            );
            Self {
                agent,
                events,
                sink,
                factory,
                media,
            }
        }

        async fn joined_as(mut self, id: &str) -> Self {
            self.agent
                .handle_server_event(ServerEvent::Joined(JoinAck {
                    email: format!("{id}@x.com"),
                    room: "room-42".into(),
                    id: Some(ConnectionId::from(id)),
                }))
                .await
                .unwrap();
            self.drain();
            self
        }

        fn drain(&mut self) -> Vec<CallEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn state(&self, remote: &ConnectionId) -> Option<NegotiationState> {
            self.agent.session(remote).map(|session| session.state())
        }

        /// Deliver everything `from` has sent, as the relay would.
        async fn receive_from(&mut self, from: &Harness) {
            let sender = from.agent.local_id().cloned().unwrap();
            for event in from.sink.take() {
                self.agent
                    .handle_server_event(relay_as(&sender, event))
                    .await
                    .unwrap();
            }
        }
    }

    fn peer(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_sends_request_and_ack_records_local_id() {
        let mut h = Harness::new();
        h.agent.join("a@x.com", "room-42");
        assert_eq!(
            h.sink.take(),
            vec![ClientEvent::Join(JoinRequest {
                email: "a@x.com".into(),
                room: "room-42".into(),
            })]
        );

        h.agent
            .handle_server_event(ServerEvent::Joined(JoinAck {
                email: "a@x.com".into(),
                room: "room-42".into(),
                id: Some(peer("conn-a")),
            }))
            .await
            .unwrap();
        assert_eq!(h.agent.local_id(), Some(&peer("conn-a")));
        assert_eq!(
            h.drain(),
            vec![CallEvent::Joined {
                email: "a@x.com".into(),
                room: "room-42".into(),
            }]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn device_failure_aborts_call_without_signaling() {
        let mut h = Harness::with(MockFactory::default(), MockMedia::denying_user_media());
        let err = h.agent.start_call(peer("b")).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Device(DeviceError::PermissionDenied(_))));
        assert!(h.sink.take().is_empty());
        assert_eq!(h.factory.created(), 0);
        assert_eq!(h.agent.active_calls(), 0);
        assert!(matches!(
            h.drain().as_slice(),
            [CallEvent::DeviceFailed { .. }]
        ));

        // An incoming call hits the same wall.
        let err = h
            .agent
            .handle_server_event(ServerEvent::IncomingCall(OfferRelay {
                from: peer("c"),
                offer: SessionDescription::new("offer", "x"),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Device(_)));
        assert!(h.sink.take().is_empty());
        assert_eq!(h.agent.active_calls(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn outgoing_call_connects_on_answer() {
        let mut h = Harness::new().joined_as("a").await;
        h.agent.start_call(peer("b")).await.unwrap();
        assert_eq!(h.state(&peer("b")), Some(NegotiationState::OfferSent));
        assert!(matches!(
            h.sink.take().as_slice(),
            [ClientEvent::Call(CallOffer { to, .. })] if to == &peer("b")
        ));
        assert!(matches!(
            h.agent.start_call(peer("b")).await,
            Err(NegotiationError::AlreadyInCall(_))
        ));

        h.agent
            .handle_server_event(ServerEvent::CallAccepted(AnswerRelay {
                from: peer("b"),
                ans: SessionDescription::new("answer", "b"),
            }))
            .await
            .unwrap();
        assert_eq!(h.state(&peer("b")), Some(NegotiationState::Connected));
        assert!(h.drain().contains(&CallEvent::StateChanged {
            remote: peer("b"),
            state: NegotiationState::Connected,
        }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn incoming_call_is_answered_with_local_media() {
        let mut h = Harness::new().joined_as("b").await;
        h.agent
            .handle_server_event(ServerEvent::IncomingCall(OfferRelay {
                from: peer("a"),
                offer: SessionDescription::new("offer", "a"),
            }))
            .await
            .unwrap();

        assert_eq!(h.state(&peer("b")), None);
        assert_eq!(h.state(&peer("a")), Some(NegotiationState::AnswerExchanged));
        assert!(matches!(h.sink.take().as_slice(), [ClientEvent::AcceptCall(_)]));
        assert_eq!(h.media.live().len(), 2);
        assert_eq!(h.factory.log_for(&peer("a")).unwrap().snapshot().senders.len(), 2);

        h.agent
            .handle_remote_track(
                &peer("a"),
                RemoteTrack {
                    id: "a-cam".into(),
                    kind: MediaKind::Video,
                },
            )
            .await
            .unwrap();
        assert_eq!(h.state(&peer("a")), Some(NegotiationState::Connected));
        assert!(h.drain().contains(&CallEvent::RemoteTrackAdded {
            remote: peer("a"),
            track: RemoteTrack {
                id: "a-cam".into(),
                kind: MediaKind::Video,
            },
        }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn answers_for_unknown_calls_are_ignored() {
        let mut h = Harness::new();
        h.agent
            .handle_server_event(ServerEvent::CallAccepted(AnswerRelay {
                from: peer("ghost"),
                ans: SessionDescription::new("answer", "x"),
            }))
            .await
            .unwrap();
        assert_eq!(h.agent.active_calls(), 0);
        assert_eq!(h.factory.created(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn capability_failure_releases_acquired_media() {
        let mut h = Harness::with(MockFactory::failing("create_offer"), MockMedia::default());
        assert!(h.agent.start_call(peer("b")).await.is_err());
        assert_eq!(h.agent.active_calls(), 0);
        assert!(h.media.live().is_empty());
        assert!(h.sink.take().is_empty());
        assert!(h
            .drain()
            .iter()
            .any(|event| matches!(event, CallEvent::NegotiationFailed { .. })));
    }

    #[test_timeout::tokio_timeout_test]
    async fn screen_share_keeps_a_single_video_sender() {
        let mut h = Harness::new().joined_as("a").await;
        h.agent.start_call(peer("b")).await.unwrap();
        h.agent
            .handle_server_event(ServerEvent::CallAccepted(AnswerRelay {
                from: peer("b"),
                ans: SessionDescription::new("answer", "b"),
            }))
            .await
            .unwrap();
        let log = h.factory.log_for(&peer("b")).unwrap();

        h.agent.start_screen_share(&peer("b")).await.unwrap();
        h.agent.start_screen_share(&peer("b")).await.unwrap();
        assert_eq!(log.video_senders(), 1);
        let session = h.agent.session(&peer("b")).unwrap();
        assert_eq!(
            session.outgoing(MediaKind::Video).map(|track| track.source),
            Some(TrackSource::Display)
        );
        // The first screen track was released, the camera is kept aside.
        let media = h.media.snapshot();
        assert_eq!(media.released, vec!["screen-3".to_string()]);

        h.agent.stop_screen_share(&peer("b")).await.unwrap();
        assert_eq!(log.video_senders(), 1);
        let session = h.agent.session(&peer("b")).unwrap();
        assert_eq!(
            session.outgoing(MediaKind::Video).map(|track| track.id.clone()),
            Some("cam-2".to_string())
        );
        let mut live = h.media.live();
        live.sort();
        assert_eq!(live, vec!["cam-2".to_string(), "mic-1".to_string()]);

        // Stopping again changes nothing.
        h.agent.stop_screen_share(&peer("b")).await.unwrap();
        assert_eq!(h.media.live().len(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn denied_screen_capture_leaves_call_untouched() {
        let mut h = Harness::with(MockFactory::default(), MockMedia::denying_display_media())
            .joined_as("a")
            .await;
        h.agent.start_call(peer("b")).await.unwrap();
        h.sink.take();
        h.drain();

        assert!(h.agent.start_screen_share(&peer("b")).await.is_err());
        assert!(h.sink.take().is_empty());
        assert_eq!(h.state(&peer("b")), Some(NegotiationState::OfferSent));
        assert!(matches!(h.drain().as_slice(), [CallEvent::DeviceFailed { .. }]));
    }

    #[test_timeout::tokio_timeout_test]
    async fn end_call_is_idempotent_and_releases_everything() {
        let mut h = Harness::new().joined_as("a").await;
        h.agent.start_call(peer("b")).await.unwrap();
        h.agent.start_screen_share(&peer("b")).await.unwrap();
        h.drain();

        h.agent.end_call(&peer("b"));
        h.agent.end_call(&peer("b"));

        assert!(h.media.live().is_empty());
        assert_eq!(h.media.snapshot().released.len(), 3);
        assert!(h.factory.log_for(&peer("b")).unwrap().snapshot().closed);
        assert_eq!(h.drain(), vec![CallEvent::CallEnded { remote: peer("b") }]);
        assert_eq!(h.agent.active_calls(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn toggling_audio_only_touches_the_device() {
        let mut h = Harness::new().joined_as("a").await;
        h.agent.start_call(peer("b")).await.unwrap();
        h.sink.take();

        h.agent.toggle_audio(&peer("b"), false).unwrap();
        assert_eq!(h.media.snapshot().enabled.get("mic-1"), Some(&false));
        assert!(h.sink.take().is_empty());
        assert!(matches!(
            h.agent.toggle_audio(&peer("nobody"), true),
            Err(NegotiationError::UnknownPeer(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn peer_departure_and_lost_connection_end_calls() {
        let mut h = Harness::new().joined_as("a").await;
        h.agent.start_call(peer("b")).await.unwrap();
        h.agent.start_call(peer("c")).await.unwrap();
        h.drain();

        h.agent
            .handle_server_event(ServerEvent::PeerLeft(PeerPresence {
                email: "b@x.com".into(),
                id: peer("b"),
            }))
            .await
            .unwrap();
        assert_eq!(
            h.drain(),
            vec![
                CallEvent::CallEnded { remote: peer("b") },
                CallEvent::PeerLeft {
                    email: "b@x.com".into(),
                    id: peer("b"),
                },
            ]
        );

        h.agent.connection_lost();
        assert_eq!(h.agent.active_calls(), 0);
        assert_eq!(h.agent.local_id(), None);
        assert!(h.media.live().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn two_agents_call_and_renegotiate_screen_share() {
        let mut a = Harness::new().joined_as("a").await;
        let mut b = Harness::new().joined_as("b").await;

        a.agent.start_call(peer("b")).await.unwrap();
        b.receive_from(&a).await;
        a.receive_from(&b).await;
        b.agent.handle_transport_connected(&peer("a")).await.unwrap();
        assert_eq!(a.state(&peer("b")), Some(NegotiationState::Connected));
        assert_eq!(b.state(&peer("a")), Some(NegotiationState::Connected));

        a.agent.start_screen_share(&peer("b")).await.unwrap();
        assert_eq!(a.sink.pending(), 1);
        b.receive_from(&a).await;
        a.receive_from(&b).await;
        assert_eq!(a.state(&peer("b")), Some(NegotiationState::Connected));
        assert_eq!(b.state(&peer("a")), Some(NegotiationState::Connected));
        assert_eq!(
            b.factory.log_for(&peer("a")).unwrap().snapshot().applied.len(),
            2
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn simultaneous_screen_shares_settle_on_both_sides() {
        let mut a = Harness::new().joined_as("a").await;
        let mut b = Harness::new().joined_as("b").await;
        a.agent.start_call(peer("b")).await.unwrap();
        b.receive_from(&a).await;
        a.receive_from(&b).await;
        b.agent.handle_transport_connected(&peer("a")).await.unwrap();

        a.agent.start_screen_share(&peer("b")).await.unwrap();
        b.agent.start_screen_share(&peer("a")).await.unwrap();
        // Both offers are on the wire before either side reads.
        let from_a = a.sink.take();
        let from_b = b.sink.take();
        for event in from_b {
            a.agent
                .handle_server_event(relay_as(&peer("b"), event))
                .await
                .unwrap();
        }
        for event in from_a {
            b.agent
                .handle_server_event(relay_as(&peer("a"), event))
                .await
                .unwrap();
        }
        // Keep exchanging until both sides go quiet.
        for _ in 0..4 {
            b.receive_from(&a).await;
            a.receive_from(&b).await;
        }

        assert_eq!(a.state(&peer("b")), Some(NegotiationState::Connected));
        assert_eq!(b.state(&peer("a")), Some(NegotiationState::Connected));
        assert_eq!(a.factory.log_for(&peer("b")).unwrap().snapshot().rollbacks, 0);
        assert_eq!(b.factory.log_for(&peer("a")).unwrap().snapshot().rollbacks, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn toggling_video_only_touches_the_device() {
        let mut h = Harness::new().joined_as("a").await;
        h.agent.start_call(peer("b")).await.unwrap();
        h.sink.take();

        h.agent.toggle_video(&peer("b"), false).unwrap();
        assert_eq!(h.media.snapshot().enabled.get("cam-2"), Some(&false));
        assert_eq!(
            h.agent
                .session(&peer("b"))
                .and_then(|session| session.outgoing(MediaKind::Video))
                .map(|track| track.enabled),
            Some(false)
        );
        h.agent.toggle_video(&peer("b"), true).unwrap();
        assert_eq!(h.media.snapshot().enabled.get("cam-2"), Some(&true));
        assert!(h.sink.take().is_empty());
        assert!(matches!(
            h.agent.toggle_video(&peer("nobody"), false),
            Err(NegotiationError::UnknownPeer(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn calling_again_after_hanging_up_replaces_the_old_call() {
        let mut a = Harness::new().joined_as("a").await;
        let mut b = Harness::new().joined_as("b").await;
        a.agent.start_call(peer("b")).await.unwrap();
        b.receive_from(&a).await;
        a.receive_from(&b).await;
        b.agent.handle_transport_connected(&peer("a")).await.unwrap();
        assert_eq!(b.state(&peer("a")), Some(NegotiationState::Connected));

        // Nothing goes over the wire on hang-up, so B still holds the call.
        a.agent.end_call(&peer("b"));
        assert!(a.sink.take().is_empty());
        b.drain();

        a.agent.start_call(peer("b")).await.unwrap();
        b.receive_from(&a).await;
        assert!(b.drain().contains(&CallEvent::CallEnded { remote: peer("a") }));
        assert_eq!(b.state(&peer("a")), Some(NegotiationState::AnswerExchanged));
        assert_eq!(b.sink.pending(), 1);
        assert_eq!(b.media.live(), vec!["mic-3".to_string(), "cam-4".to_string()]);

        a.receive_from(&b).await;
        assert_eq!(a.state(&peer("b")), Some(NegotiationState::Connected));
    }
}
