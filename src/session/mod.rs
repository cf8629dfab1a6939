use crate::{
    config::Config,
    error::CallError,
    event::{EventReceiver, EventSender, SessionEvent},
    get_timestamp,
    media::{
        capture::CaptureSource,
        peer::{IceState, PeerEvent, PeerFactory},
        MediaSession, MediaSessionBuilder, RtcPeerFactory, StaticCaptureSource,
    },
    model::{CallKind, CallRecord, CallStatus, CallUpdate, RecordChange},
    transport::{
        CallStore, MemoryCallStore, MemoryRosterStore, MemorySignalingBus, RosterStore,
        SignalEnvelope, SignalPayload, SignalingBus,
    },
    CallId, UserId,
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};
use tokio::{
    select,
    sync::{broadcast, mpsc, Mutex as AsyncMutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod features;
pub mod group;
pub mod guard;
pub mod recovery;

pub use features::{AttendedTransfer, FeatureController};
pub use group::GroupFanout;
pub use guard::{HostBridge, NoopHostBridge, PresenceGuard, SharedHostBridge};
pub use recovery::{QualityTier, RecoveryCommand, RecoverySupervisor};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    Dialing,
    /// Outbound call waiting for the partner to pick up
    RingingRemote,
    /// Inbound call waiting for the local user to pick up
    RingingLocal,
    Negotiating,
    Connected,
    Reconnecting,
    Ended,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Receiver,
}

/// One live call from this device's point of view. The generation counter
/// stamps every async operation; a result observed under a stale generation
/// is discarded instead of applied.
pub struct CallSession {
    pub call_id: CallId,
    pub role: Role,
    /// re-targetable: transfer moves the far end to a new user
    partner: Mutex<UserId>,
    kind: Mutex<CallKind>,
    state: Mutex<SessionState>,
    generation: AtomicU64,
    /// set once the active status has been (or must not be) written
    activated: AtomicBool,
    supervised: AtomicBool,
    ice_ok: AtomicBool,
    flow_ok: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    media: Mutex<Option<Arc<MediaSession>>>,
    /// remote offer that arrived before the local user answered
    pending_remote_sdp: Mutex<Option<String>>,
    /// losing leg of a simultaneous dial, closed missed once this one is active
    tie_loser: Mutex<Option<CallId>>,
    pub cancel_token: CancellationToken,
}

impl CallSession {
    fn new(call_id: CallId, role: Role, partner_id: UserId, kind: CallKind) -> Arc<Self> {
        Arc::new(Self {
            call_id,
            role,
            partner: Mutex::new(partner_id),
            kind: Mutex::new(kind),
            state: Mutex::new(SessionState::Idle),
            generation: AtomicU64::new(0),
            activated: AtomicBool::new(false),
            supervised: AtomicBool::new(false),
            ice_ok: AtomicBool::new(false),
            flow_ok: AtomicBool::new(false),
            started_at: Mutex::new(None),
            media: Mutex::new(None),
            pending_remote_sdp: Mutex::new(None),
            tie_loser: Mutex::new(None),
            cancel_token: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn partner_id(&self) -> UserId {
        self.partner.lock().unwrap().clone()
    }

    fn set_partner(&self, partner: UserId) {
        *self.partner.lock().unwrap() = partner;
    }

    pub fn kind(&self) -> CallKind {
        *self.kind.lock().unwrap()
    }

    pub(crate) fn set_kind(&self, kind: CallKind) {
        *self.kind.lock().unwrap() = kind;
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidate every in-flight async operation on this session.
    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn media(&self) -> Option<Arc<MediaSession>> {
        self.media.lock().unwrap().clone()
    }

    fn set_media(&self, media: Arc<MediaSession>) {
        *self.media.lock().unwrap() = Some(media);
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap()
    }

    fn set_tie_loser(&self, call_id: CallId) {
        *self.tie_loser.lock().unwrap() = Some(call_id);
    }

    fn take_tie_loser(&self) -> Option<CallId> {
        self.tie_loser.lock().unwrap().take()
    }

    /// Move to `to`. Terminal states latch: once ended or failed, every
    /// further transition is refused. Returns whether the state changed.
    pub(crate) fn transition(&self, to: SessionState) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            if to != *state {
                debug!(
                    call_id = self.call_id,
                    from = ?*state,
                    to = ?to,
                    "transition refused, session is terminal"
                );
            }
            return false;
        }
        if *state == to {
            return false;
        }
        info!(call_id = self.call_id, from = ?*state, to = ?to, "session state");
        *state = to;
        true
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(call_id: &str, partner: &str) -> Arc<Self> {
        Self::new(
            call_id.to_string(),
            Role::Initiator,
            partner.to_string(),
            CallKind::Voice,
        )
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("role", &self.role)
            .field("partner", &self.partner_id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Drives every call on this device: dialing, answering, negotiation,
/// recovery, and teardown. All state mutation funnels through here; UI
/// layers observe the event stream and call the verbs.
pub struct Orchestrator {
    config: Arc<Config>,
    identity: RwLock<Option<UserId>>,
    bus: Arc<dyn SignalingBus>,
    store: Arc<dyn CallStore>,
    roster: Arc<dyn RosterStore>,
    guard: Arc<PresenceGuard>,
    /// strong owner of every live session; the guard only mirrors existence
    sessions: Mutex<HashMap<CallId, Arc<CallSession>>>,
    capture: Arc<dyn CaptureSource>,
    peers: Arc<dyn PeerFactory>,
    events: EventSender,
    recovery_tx: mpsc::UnboundedSender<RecoveryCommand>,
    recovery_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<RecoveryCommand>>>,
    /// offers that arrived before any session existed for their call
    pending_offers: Mutex<HashMap<CallId, String>>,
    pub cancel_token: CancellationToken,
}

pub struct OrchestratorBuilder {
    config: Option<Arc<Config>>,
    bus: Option<Arc<dyn SignalingBus>>,
    store: Option<Arc<dyn CallStore>>,
    roster: Option<Arc<dyn RosterStore>>,
    host_bridge: Option<Arc<dyn HostBridge>>,
    capture: Option<Arc<dyn CaptureSource>>,
    peers: Option<Arc<dyn PeerFactory>>,
    cancel_token: Option<CancellationToken>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            bus: None,
            store: None,
            roster: None,
            host_bridge: None,
            capture: None,
            peers: None,
            cancel_token: None,
        }
    }

    pub fn with_config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn SignalingBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CallStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_roster(mut self, roster: Arc<dyn RosterStore>) -> Self {
        self.roster = Some(roster);
        self
    }

    pub fn with_host_bridge(mut self, host_bridge: Arc<dyn HostBridge>) -> Self {
        self.host_bridge = Some(host_bridge);
        self
    }

    pub fn with_capture(mut self, capture: Arc<dyn CaptureSource>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_peers(mut self, peers: Arc<dyn PeerFactory>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn build(self) -> Arc<Orchestrator> {
        let config = self.config.unwrap_or_default();
        let (events, _) = broadcast::channel(64);
        let (recovery_tx, recovery_rx) = mpsc::unbounded_channel();
        let host_bridge: Arc<dyn HostBridge> = self
            .host_bridge
            .unwrap_or_else(|| Arc::new(NoopHostBridge));
        let peers: Arc<dyn PeerFactory> = self
            .peers
            .unwrap_or_else(|| RtcPeerFactory::new(config.ice_urls()));
        let bus: Arc<dyn SignalingBus> =
            self.bus.unwrap_or_else(|| MemorySignalingBus::new());
        let store: Arc<dyn CallStore> = self.store.unwrap_or_else(|| MemoryCallStore::new());
        let roster: Arc<dyn RosterStore> =
            self.roster.unwrap_or_else(|| MemoryRosterStore::new());
        let capture: Arc<dyn CaptureSource> =
            self.capture.unwrap_or_else(|| StaticCaptureSource::new());
        Arc::new(Orchestrator {
            bus,
            store,
            roster,
            guard: PresenceGuard::new(host_bridge),
            sessions: Mutex::new(HashMap::new()),
            capture,
            peers,
            config,
            identity: RwLock::new(None),
            events,
            recovery_tx,
            recovery_rx: AsyncMutex::new(Some(recovery_rx)),
            pending_offers: Mutex::new(HashMap::new()),
            cancel_token: self.cancel_token.unwrap_or_default(),
        })
    }
}

impl Orchestrator {
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn set_identity(&self, user_id: UserId) {
        *self.identity.write().unwrap() = Some(user_id);
    }

    pub fn identity(&self) -> Option<UserId> {
        self.identity.read().unwrap().clone()
    }

    pub fn guard(&self) -> &Arc<PresenceGuard> {
        &self.guard
    }

    pub fn session(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        self.guard.get_existing(call_id)
    }

    /// Take ownership of a freshly built session. The strong reference lives
    /// here until `finish`; the guard keeps only its weak existence view.
    fn adopt_session(&self, session: &Arc<CallSession>) -> Result<(), Arc<CallSession>> {
        self.guard.register(session.clone())?;
        self.sessions
            .lock()
            .unwrap()
            .insert(session.call_id.clone(), session.clone());
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    fn emit(&self, event: SessionEvent) {
        self.events.send(event).ok();
    }

    /// Run the inbound loops: signaling envelopes, call-record changes and
    /// recovery commands. Returns when the orchestrator is stopped.
    pub async fn serve(self: &Arc<Self>) -> Result<(), CallError> {
        let me = self.identity().ok_or(CallError::AuthRequired)?;
        let mut signals = self.bus.subscribe(&me);
        let mut changes = self.store.subscribe(&me);
        let mut recovery = self
            .recovery_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| CallError::Other(anyhow!("serve may only be called once")))?;
        info!(user_id = me, "orchestrator serving");
        loop {
            select! {
                _ = self.cancel_token.cancelled() => break,
                envelope = signals.recv() => match envelope {
                    Some(envelope) => self.handle_signal(envelope).await,
                    None => break,
                },
                change = changes.recv() => match change {
                    Some(change) => self.handle_record_change(change).await,
                    None => break,
                },
                command = recovery.recv() => {
                    if let Some(command) = command {
                        self.handle_recovery_command(command).await;
                    }
                }
            }
        }
        info!(user_id = me, "orchestrator stopped");
        Ok(())
    }

    /// Start an outbound call. One ringing-or-active call per partner: a
    /// second initiate toward the same user resumes the existing session,
    /// retrying capture when an earlier attempt failed retryably.
    pub async fn initiate(
        self: &Arc<Self>,
        partner_id: &UserId,
        kind: CallKind,
    ) -> Result<Arc<CallSession>, CallError> {
        let me = self.identity().ok_or(CallError::AuthRequired)?;
        if let Some(existing) = self.guard.find_by_partner(partner_id) {
            debug!(
                call_id = existing.call_id,
                partner_id, "resuming existing session toward partner"
            );
            if existing.media().is_none() && existing.role == Role::Initiator {
                self.start_outbound(&me, &existing).await?;
            }
            return Ok(existing);
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        let session = CallSession::new(call_id.clone(), Role::Initiator, partner_id.clone(), kind);
        session.transition(SessionState::Dialing);
        if let Err(existing) = self.adopt_session(&session) {
            return Ok(existing);
        }

        let record = CallRecord::new(call_id.clone(), me.clone(), partner_id.clone(), kind);
        if let Err(e) = self.store.insert(record).await {
            // the in-memory session stays authoritative; record sync catches
            // up on the next successful write
            warn!(call_id, "call record insert failed: {}", e);
        }
        self.start_outbound(&me, &session).await?;
        Ok(session)
    }

    async fn start_outbound(
        self: &Arc<Self>,
        me: &UserId,
        session: &Arc<CallSession>,
    ) -> Result<(), CallError> {
        let media = match self.attach_media(session).await {
            Ok(media) => media,
            Err(CallError::MediaUnavailable(e)) if !e.is_retryable() => {
                self.finish(
                    session,
                    SessionState::Failed,
                    Some(CallStatus::Ended),
                    Some(e.to_string()),
                )
                .await;
                return Err(CallError::MediaUnavailable(e));
            }
            // retryable: session stays registered and dialing
            Err(e) => return Err(e),
        };
        let generation = session.generation();
        let offer = media.peer().create_offer().await.map_err(CallError::Other)?;
        if session.generation() != generation || session.state().is_terminal() {
            return Err(CallError::Other(anyhow!("call ended during negotiation")));
        }
        self.bus
            .publish(SignalEnvelope::new(
                session.call_id.clone(),
                me.clone(),
                session.partner_id(),
                SignalPayload::Offer { sdp: offer },
            ))
            .await?;
        session.transition(SessionState::RingingRemote);
        Ok(())
    }

    /// Accept an inbound call. Capture is shared by reference, so answering
    /// a call a co-located stack already picked up reuses its tracks.
    pub async fn answer(
        self: &Arc<Self>,
        call_id: &CallId,
    ) -> Result<Arc<CallSession>, CallError> {
        let me = self.identity().ok_or(CallError::AuthRequired)?;
        let session = match self.guard.get_existing(call_id) {
            Some(session) => session,
            None => {
                let record = self
                    .store
                    .get(call_id)
                    .await?
                    .ok_or_else(|| CallError::UnknownCall(call_id.clone()))?;
                if record.status.is_terminal() {
                    return Err(CallError::UnknownCall(call_id.clone()));
                }
                let session = CallSession::new(
                    call_id.clone(),
                    Role::Receiver,
                    record.partner_of(&me).clone(),
                    record.kind,
                );
                session.transition(SessionState::RingingLocal);
                match self.adopt_session(&session) {
                    Ok(()) => session,
                    Err(existing) => existing,
                }
            }
        };
        if session.state().is_terminal() {
            // the partner hung up first; answering a dead call does nothing
            return Err(CallError::UnknownCall(call_id.clone()));
        }
        if session.media().is_some()
            && matches!(
                session.state(),
                SessionState::Negotiating | SessionState::Connected | SessionState::Reconnecting
            )
        {
            return Ok(session);
        }
        if self.guard.accepted_by_host(call_id) {
            // a co-located stack answered first and owns the record writes
            session.activated.store(true, Ordering::Release);
        }

        let media = match self.attach_media(&session).await {
            Ok(media) => media,
            Err(CallError::MediaUnavailable(e)) if e.is_retryable() => {
                // stays ringing; the user can answer again
                return Err(CallError::MediaUnavailable(e));
            }
            Err(CallError::MediaUnavailable(e)) => {
                self.finish(
                    &session,
                    SessionState::Failed,
                    Some(CallStatus::Ended),
                    Some(e.to_string()),
                )
                .await;
                return Err(CallError::MediaUnavailable(e));
            }
            Err(e) => return Err(e),
        };

        let offer_sdp = self.wait_for_offer(&session).await?;
        session.transition(SessionState::Negotiating);
        let generation = session.generation();
        let answer_sdp = media
            .peer()
            .create_answer(&offer_sdp)
            .await
            .map_err(CallError::Other)?;
        if session.generation() != generation || session.state().is_terminal() {
            return Err(CallError::Other(anyhow!("call ended during negotiation")));
        }
        self.bus
            .publish(SignalEnvelope::new(
                call_id.clone(),
                me,
                session.partner_id(),
                SignalPayload::Answer {
                    sdp: Some(answer_sdp),
                    rejected: false,
                },
            ))
            .await?;
        Ok(session)
    }

    /// Decline an inbound call without answering.
    pub async fn reject(self: &Arc<Self>, call_id: &CallId) -> Result<(), CallError> {
        let me = self.identity().ok_or(CallError::AuthRequired)?;
        let (partner, record) = match self.guard.get_existing(call_id) {
            Some(session) => (session.partner_id(), None),
            None => {
                let record = self
                    .store
                    .get(call_id)
                    .await?
                    .ok_or_else(|| CallError::UnknownCall(call_id.clone()))?;
                (record.partner_of(&me).clone(), Some(record))
            }
        };
        // notify first, then tear down; delivery stays best-effort
        if let Err(e) = self
            .bus
            .publish(SignalEnvelope::new(
                call_id.clone(),
                me,
                partner,
                SignalPayload::Answer {
                    sdp: None,
                    rejected: true,
                },
            ))
            .await
        {
            debug!(call_id, "reject notify failed: {}", e);
        }
        match self.guard.get_existing(call_id) {
            Some(session) => {
                self.finish(
                    &session,
                    SessionState::Ended,
                    Some(CallStatus::Rejected),
                    Some("rejected".to_string()),
                )
                .await;
            }
            None => {
                // a terminal row already carries its one terminal status
                if record.as_ref().is_some_and(|record| !record.status.is_terminal()) {
                    self.store
                        .update(call_id, CallUpdate::terminated(CallStatus::Rejected, None))
                        .await
                        .ok();
                }
            }
        }
        Ok(())
    }

    /// Hang up. The partner is notified before local teardown; a failed
    /// notification never blocks the teardown.
    pub async fn end(
        self: &Arc<Self>,
        call_id: &CallId,
        reason: Option<String>,
    ) -> Result<(), CallError> {
        let me = self.identity().ok_or(CallError::AuthRequired)?;
        let session = self.guard.get_existing(call_id);
        let record = match &session {
            Some(_) => None,
            None => self.store.get(call_id).await.ok().flatten(),
        };
        let partner = match &session {
            Some(session) => Some(session.partner_id()),
            None => record
                .as_ref()
                .filter(|record| !record.status.is_terminal())
                .map(|record| record.partner_of(&me).clone()),
        };
        if let Some(partner) = partner {
            if let Err(e) = self
                .bus
                .publish(SignalEnvelope::new(
                    call_id.clone(),
                    me,
                    partner,
                    SignalPayload::End {
                        reason: reason.clone(),
                    },
                ))
                .await
            {
                debug!(call_id, "end notify failed: {}", e);
            }
        }
        match session {
            Some(session) => {
                self.finish(&session, SessionState::Ended, Some(CallStatus::Ended), reason)
                    .await;
            }
            None => {
                // a terminal row already carries its one terminal status
                if record.as_ref().is_some_and(|record| !record.status.is_terminal()) {
                    self.store
                        .update(call_id, CallUpdate::terminated(CallStatus::Ended, None))
                        .await
                        .ok();
                }
            }
        }
        Ok(())
    }

    /// Add a camera track to a connected voice call and renegotiate.
    pub async fn upgrade_to_video(self: &Arc<Self>, call_id: &CallId) -> Result<(), CallError> {
        let me = self.identity().ok_or(CallError::AuthRequired)?;
        let session = self
            .guard
            .get_existing(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.clone()))?;
        if session.state() != SessionState::Connected {
            return Err(CallError::Other(anyhow!(
                "video upgrade requires a connected call"
            )));
        }
        let media = session
            .media()
            .ok_or_else(|| CallError::Other(anyhow!("session has no media")))?;
        if media.has_video() {
            return Ok(());
        }
        let track = self
            .capture
            .acquire_video(call_id, self.config.media.profile, "camera")
            .await?;
        media.add_video(track).await.map_err(CallError::Other)?;
        let generation = session.generation();
        let sdp = media.peer().create_offer().await.map_err(CallError::Other)?;
        if session.generation() != generation || session.state().is_terminal() {
            return Ok(());
        }
        session.set_kind(CallKind::Video);
        self.store
            .update(
                call_id,
                CallUpdate {
                    kind: Some(CallKind::Video),
                    ..Default::default()
                },
            )
            .await
            .ok();
        self.bus
            .publish(SignalEnvelope::new(
                call_id.clone(),
                me,
                session.partner_id(),
                SignalPayload::VideoUpgrade { sdp },
            ))
            .await?;
        Ok(())
    }

    /// Build the fan-out for a group call, sharing one local capture set
    /// across every participant link.
    pub async fn create_group(
        self: &Arc<Self>,
        call_id: &CallId,
        kind: CallKind,
    ) -> Result<GroupFanout, CallError> {
        let local = self
            .capture
            .acquire(call_id, kind, self.config.media.profile)
            .await?;
        Ok(GroupFanout::new(
            call_id.clone(),
            local,
            self.roster.clone(),
            self.peers.clone(),
            self.events.clone(),
            self.cancel_token.child_token(),
        ))
    }

    async fn attach_media(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
    ) -> Result<Arc<MediaSession>, CallError> {
        if let Some(media) = session.media() {
            return Ok(media);
        }
        let generation = session.generation();
        let local = self
            .capture
            .acquire(&session.call_id, session.kind(), self.config.media.profile)
            .await?;
        if session.generation() != generation || session.state().is_terminal() {
            // the call went away while the devices were spinning up
            self.capture.release(&session.call_id);
            return Err(CallError::Other(anyhow!("call ended during capture")));
        }
        let peer = self
            .peers
            .create(&session.call_id)
            .await
            .map_err(CallError::Other)?;
        let media = Arc::new(
            MediaSessionBuilder::new(session.call_id.clone(), peer, local)
                .with_zoom_bounds(self.config.media.zoom_min, self.config.media.zoom_max)
                .with_noise_suppression(self.config.media.noise_suppression_level)
                .with_cancel_token(session.cancel_token.child_token())
                .build(),
        );
        media.start().await.map_err(CallError::Other)?;
        session.set_media(media.clone());
        self.spawn_session_pumps(session.clone(), media.clone());
        self.emit(SessionEvent::LocalStream {
            call_id: session.call_id.clone(),
            timestamp: get_timestamp(),
            track_ids: media.local_track_ids(),
        });
        Ok(media)
    }

    fn spawn_session_pumps(self: &Arc<Self>, session: Arc<CallSession>, media: Arc<MediaSession>) {
        let orchestrator = self.clone();
        let mut peer_events = media.subscribe_peer();
        let pump_session = session.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = pump_session.cancel_token.cancelled() => break,
                    event = peer_events.recv() => match event {
                        Ok(PeerEvent::IceState(state)) => {
                            pump_session
                                .ice_ok
                                .store(state == IceState::Connected, Ordering::Release);
                            if state == IceState::Connected {
                                orchestrator.confirm_media_flow(&pump_session).await;
                            }
                        }
                        Ok(PeerEvent::RemoteTrack { track_id, video }) => {
                            pump_session.flow_ok.store(true, Ordering::Release);
                            orchestrator.emit(SessionEvent::RemoteStream {
                                call_id: pump_session.call_id.clone(),
                                timestamp: get_timestamp(),
                                track_id,
                                video,
                            });
                            orchestrator.confirm_media_flow(&pump_session).await;
                        }
                        // track changes are always driven by an explicit verb
                        Ok(PeerEvent::NegotiationNeeded) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                call_id = pump_session.call_id,
                                skipped, "peer event stream lagged"
                            );
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        if let Some(mut dtmf) = media.take_dtmf_receiver() {
            let orchestrator = self.clone();
            tokio::spawn(async move {
                loop {
                    select! {
                        _ = session.cancel_token.cancelled() => break,
                        digit = dtmf.recv() => match digit {
                            Some(digit) => {
                                let Some(me) = orchestrator.identity() else { continue };
                                let envelope = SignalEnvelope::new(
                                    session.call_id.clone(),
                                    me,
                                    session.partner_id(),
                                    SignalPayload::Dtmf { digit },
                                );
                                if let Err(e) = orchestrator.bus.publish(envelope).await {
                                    debug!(call_id = session.call_id, "dtmf publish failed: {}", e);
                                }
                            }
                            None => break,
                        }
                    }
                }
            });
        }
    }

    /// Connected requires both ICE up and at least one remote track flowing.
    /// The first confirmation writes the active status exactly once; a
    /// reconnect confirmation only restores the session state.
    async fn confirm_media_flow(self: &Arc<Self>, session: &Arc<CallSession>) {
        if !(session.ice_ok.load(Ordering::Acquire) && session.flow_ok.load(Ordering::Acquire)) {
            return;
        }
        let moved = match session.state() {
            SessionState::Dialing
            | SessionState::RingingRemote
            | SessionState::Negotiating
            | SessionState::Reconnecting => session.transition(SessionState::Connected),
            _ => false,
        };
        if !moved {
            return;
        }
        self.emit(SessionEvent::Connected {
            call_id: session.call_id.clone(),
            timestamp: get_timestamp(),
        });

        if !session.activated.swap(true, Ordering::AcqRel) {
            let now = Utc::now();
            *session.started_at.lock().unwrap() = Some(now);
            let already_active = matches!(
                self.store.get(&session.call_id).await,
                Ok(Some(record)) if record.status == CallStatus::Active
            );
            if !already_active {
                let update = CallUpdate {
                    status: Some(CallStatus::Active),
                    transport_state: Some(crate::model::TransportState::Connected),
                    started_at: Some(now),
                    ..Default::default()
                };
                if let Err(e) = self.store.update(&session.call_id, update).await {
                    warn!(call_id = session.call_id, "active record write failed: {}", e);
                }
            }
            if let Some(loser) = session.take_tie_loser() {
                match self.guard.get_existing(&loser) {
                    Some(loser_session) => {
                        self.finish(
                            &loser_session,
                            SessionState::Ended,
                            Some(CallStatus::Missed),
                            Some("superseded".to_string()),
                        )
                        .await;
                    }
                    None => {
                        self.store
                            .update(&loser, CallUpdate::terminated(CallStatus::Missed, None))
                            .await
                            .ok();
                    }
                }
            }
        }
        if !session.supervised.swap(true, Ordering::AcqRel) {
            RecoverySupervisor::spawn(
                session.clone(),
                self.store.clone(),
                self.config.recovery.clone(),
                self.recovery_tx.clone(),
                self.events.clone(),
            );
        }
    }

    async fn wait_for_offer(&self, session: &Arc<CallSession>) -> Result<String, CallError> {
        let deadline = Duration::from_millis(self.config.recovery.negotiation_timeout_ms);
        let start = Instant::now();
        loop {
            if let Some(sdp) = session.pending_remote_sdp.lock().unwrap().take() {
                return Ok(sdp);
            }
            if let Some(sdp) = self.pending_offers.lock().unwrap().remove(&session.call_id) {
                return Ok(sdp);
            }
            if session.state().is_terminal() {
                return Err(CallError::UnknownCall(session.call_id.clone()));
            }
            if start.elapsed() >= deadline {
                return Err(CallError::NegotiationTimeout(deadline));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn handle_signal(self: &Arc<Self>, envelope: SignalEnvelope) {
        let call_id = envelope.call_id;
        let session = self.guard.get_existing(&call_id);
        match envelope.payload {
            SignalPayload::Offer { sdp } => match session {
                Some(session)
                    if session.media().is_some()
                        && matches!(
                            session.state(),
                            SessionState::Connected
                                | SessionState::Reconnecting
                                | SessionState::Negotiating
                        ) =>
                {
                    // renegotiation from the partner (ice restart); answer in place
                    if let Err(e) = self.answer_renegotiation(&session, &sdp).await {
                        warn!(call_id = session.call_id, "renegotiation answer failed: {}", e);
                    }
                }
                Some(session) => {
                    *session.pending_remote_sdp.lock().unwrap() = Some(sdp);
                }
                None => {
                    // the offer beat the record notification; keep it for answer()
                    self.pending_offers.lock().unwrap().insert(call_id, sdp);
                }
            },
            SignalPayload::Answer { rejected: true, .. } | SignalPayload::Reject {} => {
                if let Some(session) = session {
                    self.finish(
                        &session,
                        SessionState::Ended,
                        Some(CallStatus::Rejected),
                        Some("rejected".to_string()),
                    )
                    .await;
                }
            }
            SignalPayload::Answer { sdp: Some(sdp), .. } => {
                let Some(session) = session else {
                    debug!(call_id, "answer for unknown call, dropped");
                    return;
                };
                if session.state().is_terminal() {
                    return;
                }
                session.transition(SessionState::Negotiating);
                let Some(media) = session.media() else { return };
                if let Err(e) = media.peer().accept_answer(&sdp).await {
                    warn!(call_id = session.call_id, "accept answer failed: {}", e);
                }
            }
            SignalPayload::Answer { sdp: None, .. } => {
                debug!(call_id, "empty answer, dropped");
            }
            SignalPayload::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                // candidates for unknown calls are dropped, not queued
                if let Some(session) = session {
                    if let Some(media) = session.media() {
                        if let Err(e) = media
                            .peer()
                            .add_ice_candidate(&candidate, sdp_mid, sdp_mline_index)
                            .await
                        {
                            debug!(call_id = session.call_id, "ice candidate rejected: {}", e);
                        }
                    }
                }
            }
            SignalPayload::End { reason } => {
                if let Some(session) = session {
                    // the ending side owns the terminal record write
                    self.finish(
                        &session,
                        SessionState::Ended,
                        None,
                        reason.or_else(|| Some("ended".to_string())),
                    )
                    .await;
                }
            }
            SignalPayload::Dtmf { digit } => {
                debug!(call_id, digit = %digit, "dtmf received");
            }
            SignalPayload::VideoUpgrade { sdp } => {
                let Some(session) = session else { return };
                let Some(media) = session.media() else { return };
                session.set_kind(CallKind::Video);
                match media.peer().create_answer(&sdp).await {
                    Ok(answer) => {
                        let Some(me) = self.identity() else { return };
                        self.bus
                            .publish(SignalEnvelope::new(
                                call_id,
                                me,
                                session.partner_id(),
                                SignalPayload::Answer {
                                    sdp: Some(answer),
                                    rejected: false,
                                },
                            ))
                            .await
                            .ok();
                    }
                    Err(e) => {
                        warn!(call_id = session.call_id, "video upgrade answer failed: {}", e);
                    }
                }
            }
        }
    }

    async fn answer_renegotiation(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        offer_sdp: &str,
    ) -> Result<(), CallError> {
        let me = self.identity().ok_or(CallError::AuthRequired)?;
        let media = session
            .media()
            .ok_or_else(|| CallError::Other(anyhow!("session has no media")))?;
        let answer = media
            .peer()
            .create_answer(offer_sdp)
            .await
            .map_err(CallError::Other)?;
        self.bus
            .publish(SignalEnvelope::new(
                session.call_id.clone(),
                me,
                session.partner_id(),
                SignalPayload::Answer {
                    sdp: Some(answer),
                    rejected: false,
                },
            ))
            .await?;
        Ok(())
    }

    async fn handle_record_change(self: &Arc<Self>, change: RecordChange) {
        let Some(me) = self.identity() else { return };
        let record = change.record().clone();

        if record.status.is_terminal() {
            if let Some(session) = self.guard.get_existing(&record.id) {
                if !session.state().is_terminal() {
                    let reason = match record.status {
                        CallStatus::Rejected => "rejected",
                        CallStatus::Missed => "missed",
                        _ => "ended",
                    };
                    // the terminal status is already persisted; sync locally
                    self.finish(&session, SessionState::Ended, None, Some(reason.to_string()))
                        .await;
                }
            }
            return;
        }

        // transfer: the far end moved to a new receiver while our leg lives
        // on; re-invite the new party off the updated row
        if record.caller_id == me && record.status == CallStatus::Ringing {
            if let Some(session) = self.guard.get_existing(&record.id) {
                if !session.state().is_terminal() && session.partner_id() != record.receiver_id {
                    self.retarget(&session, record.receiver_id.clone()).await;
                }
                return;
            }
        }

        if record.receiver_id == me && record.status == CallStatus::Ringing && !record.is_group {
            self.handle_inbound_ring(record).await;
        }
    }

    /// Point an established leg at a new partner and re-invite them.
    async fn retarget(self: &Arc<Self>, session: &Arc<CallSession>, new_partner: UserId) {
        let Some(me) = self.identity() else { return };
        info!(
            call_id = session.call_id,
            new_partner, "re-targeting call leg"
        );
        session.set_partner(new_partner.clone());
        session.flow_ok.store(false, Ordering::Release);
        session.transition(SessionState::RingingRemote);
        let generation = session.bump_generation();
        let Some(media) = session.media() else { return };
        let offer = match media.peer().create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(call_id = session.call_id, "re-invite offer failed: {}", e);
                return;
            }
        };
        if session.generation() != generation {
            return;
        }
        if let Err(e) = self
            .bus
            .publish(SignalEnvelope::new(
                session.call_id.clone(),
                me,
                new_partner,
                SignalPayload::Offer { sdp: offer },
            ))
            .await
        {
            warn!(call_id = session.call_id, "re-invite publish failed: {}", e);
        }
    }

    async fn handle_inbound_ring(self: &Arc<Self>, record: CallRecord) {
        if self.guard.get_existing(&record.id).is_some() {
            return;
        }
        let mut tie_loser = None;
        if let Some(mine) = self.guard.find_by_partner(&record.caller_id) {
            let dialing_out = mine.role == Role::Initiator
                && matches!(
                    mine.state(),
                    SessionState::Dialing | SessionState::RingingRemote
                );
            if !dialing_out {
                // already ringing or talking with this partner; drop the dup
                debug!(call_id = record.id, "duplicate ring toward busy partner");
                return;
            }
            // simultaneous dial: the lower call id wins, the loser is closed
            // missed once the winner goes active
            if record.id < mine.call_id {
                info!(
                    winner = record.id,
                    loser = mine.call_id,
                    "simultaneous dial, inbound call wins"
                );
                tie_loser = Some(mine.call_id.clone());
            } else {
                info!(
                    winner = mine.call_id,
                    loser = record.id,
                    "simultaneous dial, outbound call wins"
                );
                mine.set_tie_loser(record.id.clone());
                return;
            }
        }

        let session = CallSession::new(
            record.id.clone(),
            Role::Receiver,
            record.caller_id.clone(),
            record.kind,
        );
        session.transition(SessionState::RingingLocal);
        if let Some(loser) = tie_loser {
            session.set_tie_loser(loser);
        }
        if self.adopt_session(&session).is_err() {
            return;
        }
        if let Some(sdp) = self.pending_offers.lock().unwrap().remove(&record.id) {
            *session.pending_remote_sdp.lock().unwrap() = Some(sdp);
        }
        self.emit(SessionEvent::Ringing {
            call_id: record.id,
            timestamp: get_timestamp(),
            partner_id: record.caller_id,
            video: record.kind == CallKind::Video,
        });
    }

    async fn handle_recovery_command(self: &Arc<Self>, command: RecoveryCommand) {
        match command {
            RecoveryCommand::Renegotiate {
                call_id,
                generation,
                attempt,
            } => {
                let Some(session) = self.guard.get_existing(&call_id) else { return };
                if session.state().is_terminal() || session.generation() != generation {
                    debug!(call_id, "stale renegotiation command, dropped");
                    return;
                }
                session.transition(SessionState::Reconnecting);
                self.emit(SessionEvent::Reconnecting {
                    call_id: call_id.clone(),
                    timestamp: get_timestamp(),
                    attempt,
                });
                let Some(media) = session.media() else { return };
                let generation = session.bump_generation();
                let offer = match media.peer().create_offer().await {
                    Ok(offer) => offer,
                    Err(e) => {
                        warn!(call_id, attempt, "reconnect offer failed: {}", e);
                        return;
                    }
                };
                if session.generation() != generation {
                    return;
                }
                let Some(me) = self.identity() else { return };
                if let Err(e) = self
                    .bus
                    .publish(SignalEnvelope::new(
                        call_id.clone(),
                        me,
                        session.partner_id(),
                        SignalPayload::Offer { sdp: offer },
                    ))
                    .await
                {
                    // the supervisor retries after its backoff window
                    warn!(call_id, attempt, "reconnect offer publish failed: {}", e);
                }
            }
            RecoveryCommand::Fail { call_id, reason } => {
                let Some(session) = self.guard.get_existing(&call_id) else { return };
                self.finish(
                    &session,
                    SessionState::Failed,
                    Some(CallStatus::Ended),
                    Some(reason),
                )
                .await;
            }
        }
    }

    /// Terminal teardown. Latches the state, invalidates in-flight async
    /// work, optionally writes the terminal record status, and releases
    /// media and registry entries. Safe to race: only the first caller acts.
    pub(crate) async fn finish(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        state: SessionState,
        status: Option<CallStatus>,
        reason: Option<String>,
    ) {
        if !session.transition(state) {
            return;
        }
        session.bump_generation();
        session.cancel_token.cancel();
        if let Some(status) = status {
            let started_at = session.started_at();
            if let Err(e) = self
                .store
                .update(&session.call_id, CallUpdate::terminated(status, started_at))
                .await
            {
                warn!(call_id = session.call_id, "terminal record write failed: {}", e);
            }
        }
        if let Some(media) = session.media() {
            media.close().await;
        }
        self.capture.release(&session.call_id);
        self.sessions.lock().unwrap().remove(&session.call_id);
        self.guard.clear(&session.call_id);
        self.pending_offers.lock().unwrap().remove(&session.call_id);
        let event = match state {
            SessionState::Failed => SessionEvent::Failed {
                call_id: session.call_id.clone(),
                timestamp: get_timestamp(),
                reason: reason.unwrap_or_else(|| "failed".to_string()),
            },
            _ => SessionEvent::Ended {
                call_id: session.call_id.clone(),
                timestamp: get_timestamp(),
                reason,
            },
        };
        self.emit(event);
    }

    /// Tear the session down locally without touching the record; used when
    /// the record lives on under a new owner (transfer, park).
    pub(crate) async fn finish_local(self: &Arc<Self>, session: &Arc<CallSession>, reason: &str) {
        self.finish(session, SessionState::Ended, None, Some(reason.to_string()))
            .await;
    }
}
