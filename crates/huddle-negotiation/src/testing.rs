//! In-memory stand-ins for the peer connection, capture devices and the
//! signaling socket.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use huddle_protocol::{
    AnswerRelay, CallAnswer, CallOffer, ClientEvent, ConnectionId, OfferRelay, ServerEvent,
    SessionDescription,
};

use crate::capability::{CapabilityFactory, PeerCapability, SenderId};
use crate::error::{CapabilityError, DeviceError};
use crate::media::{LocalTrack, MediaSource, TrackSource};
use crate::signaling::SignalSink;

/// What the relay would deliver to the other side for `event` sent by `from`.
pub fn relay_as(from: &ConnectionId, event: ClientEvent) -> ServerEvent {
    let from = from.clone();
    match event {
        ClientEvent::Call(CallOffer { offer, .. }) => {
            ServerEvent::IncomingCall(OfferRelay { from, offer })
        }
        ClientEvent::AcceptCall(CallAnswer { ans, .. }) => {
            ServerEvent::CallAccepted(AnswerRelay { from, ans })
        }
        ClientEvent::RenegotiationRequest(CallOffer { offer, .. }) => {
            ServerEvent::RenegotiationOffer(OfferRelay { from, offer })
        }
        ClientEvent::RenegotiationResponse(CallAnswer { ans, .. }) => {
            ServerEvent::RenegotiationAnswer(AnswerRelay { from, ans })
        }
        ClientEvent::Join(request) => panic!("join is not peer traffic: {request:?}"),
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<ClientEvent>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn pending(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, event: ClientEvent) {
        self.sent.lock().unwrap().push(event);
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityState {
    pub offers: u32,
    pub answers: u32,
    pub rollbacks: u32,
    pub applied: Vec<SessionDescription>,
    pub senders: BTreeMap<u64, LocalTrack>,
    pub next_sender: u64,
    pub closed: bool,
    pub fail_on: Option<&'static str>,
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityLog(Arc<Mutex<CapabilityState>>);

impl CapabilityLog {
    pub fn snapshot(&self) -> CapabilityState {
        self.0.lock().unwrap().clone()
    }

    pub fn video_senders(&self) -> usize {
        self.snapshot()
            .senders
            .values()
            .filter(|track| track.kind() == crate::media::MediaKind::Video)
            .count()
    }

    /// Make `operation` fail from now on; `None` heals the capability.
    pub fn fail_on(&self, operation: Option<&'static str>) {
        self.0.lock().unwrap().fail_on = operation;
    }
}

#[derive(Debug, Default)]
pub struct MockCapability {
    log: CapabilityLog,
}

impl MockCapability {
    pub fn failing(operation: &'static str) -> Self {
        let capability = Self::default();
        capability.log.fail_on(Some(operation));
        capability
    }

    pub fn log(&self) -> CapabilityLog {
        self.log.clone()
    }

    fn check(&self, operation: &'static str) -> Result<(), CapabilityError> {
        let state = self.log.0.lock().unwrap();
        if state.closed {
            return Err(CapabilityError::Closed);
        }
        match state.fail_on {
            Some(failing) if failing == operation => {
                Err(CapabilityError::failed(operation, "injected failure"))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PeerCapability for MockCapability {
    async fn create_offer(&mut self) -> Result<SessionDescription, CapabilityError> {
        self.check("create_offer")?;
        let mut state = self.log.0.lock().unwrap();
        state.offers += 1;
        Ok(SessionDescription::new("offer", format!("offer-{}", state.offers)))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, CapabilityError> {
        self.check("create_answer")?;
        let mut state = self.log.0.lock().unwrap();
        state.answers += 1;
        Ok(SessionDescription::new("answer", format!("answer-{}", state.answers)))
    }

    async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError> {
        self.check("apply_remote_description")?;
        self.log.0.lock().unwrap().applied.push(description);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), CapabilityError> {
        self.check("rollback")?;
        self.log.0.lock().unwrap().rollbacks += 1;
        Ok(())
    }

    fn add_track(&mut self, track: &LocalTrack) -> Result<SenderId, CapabilityError> {
        self.check("add_track")?;
        let mut state = self.log.0.lock().unwrap();
        state.next_sender += 1;
        let id = state.next_sender;
        state.senders.insert(id, track.clone());
        Ok(SenderId(id))
    }

    fn replace_track(&mut self, sender: SenderId, track: &LocalTrack) -> Result<(), CapabilityError> {
        self.check("replace_track")?;
        let mut state = self.log.0.lock().unwrap();
        match state.senders.get_mut(&sender.0) {
            Some(slot) => {
                *slot = track.clone();
                Ok(())
            }
            None => Err(CapabilityError::failed("replace_track", "unknown sender")),
        }
    }

    fn remove_track(&mut self, sender: SenderId) -> Result<(), CapabilityError> {
        self.check("remove_track")?;
        self.log.0.lock().unwrap().senders.remove(&sender.0);
        Ok(())
    }

    fn close(&mut self) {
        self.log.0.lock().unwrap().closed = true;
    }
}

/// Hands out [`MockCapability`]s and keeps their logs by remote peer.
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    logs: Arc<Mutex<HashMap<ConnectionId, CapabilityLog>>>,
    fail_on: Option<&'static str>,
}

impl MockFactory {
    pub fn failing(operation: &'static str) -> Self {
        Self {
            logs: Arc::default(),
            fail_on: Some(operation),
        }
    }

    pub fn log_for(&self, remote: &ConnectionId) -> Option<CapabilityLog> {
        self.logs.lock().unwrap().get(remote).cloned()
    }

    pub fn created(&self) -> usize {
        self.logs.lock().unwrap().len()
    }
}

impl CapabilityFactory for MockFactory {
    fn create(&self, remote: &ConnectionId) -> Result<Box<dyn PeerCapability>, CapabilityError> {
        let capability = MockCapability::default();
        capability.log.fail_on(self.fail_on);
        self.logs
            .lock()
            .unwrap()
            .insert(remote.clone(), capability.log());
        Ok(Box::new(capability))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaState {
    pub acquired: Vec<String>,
    pub released: Vec<String>,
    pub enabled: HashMap<String, bool>,
}

#[derive(Debug, Clone, Default)]
pub struct MockMedia {
    state: Arc<Mutex<MediaState>>,
    deny_user_media: bool,
    deny_display_media: bool,
    counter: Arc<Mutex<u32>>,
}

impl MockMedia {
    pub fn denying_user_media() -> Self {
        Self {
            deny_user_media: true,
            ..Self::default()
        }
    }

    pub fn denying_display_media() -> Self {
        Self {
            deny_display_media: true,
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> MediaState {
        self.state.lock().unwrap().clone()
    }

    /// Tracks handed out and not yet released.
    pub fn live(&self) -> Vec<String> {
        let state = self.snapshot();
        state
            .acquired
            .iter()
            .filter(|id| !state.released.contains(id))
            .cloned()
            .collect()
    }

    fn issue(&self, source: TrackSource) -> LocalTrack {
        let counter = {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            *counter
        };
        let prefix = match source {
            TrackSource::Microphone => "mic",
            TrackSource::Camera => "cam",
            TrackSource::Display => "screen",
        };
        let track = LocalTrack::new(format!("{prefix}-{counter}"), source);
        self.state.lock().unwrap().acquired.push(track.id.clone());
        track
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire_user_media(&mut self) -> Result<Vec<LocalTrack>, DeviceError> {
        if self.deny_user_media {
            return Err(DeviceError::PermissionDenied("camera".into()));
        }
        Ok(vec![
            self.issue(TrackSource::Microphone),
            self.issue(TrackSource::Camera),
        ])
    }

    async fn acquire_display_media(&mut self) -> Result<LocalTrack, DeviceError> {
        if self.deny_display_media {
            return Err(DeviceError::PermissionDenied("screen".into()));
        }
        Ok(self.issue(TrackSource::Display))
    }

    fn set_enabled(&mut self, track: &LocalTrack, enabled: bool) {
        self.state
            .lock()
            .unwrap()
            .enabled
            .insert(track.id.clone(), enabled);
    }

    fn release(&mut self, track: &LocalTrack) {
        self.state.lock().unwrap().released.push(track.id.clone());
    }
}
