//! Call session facade
//!
//! [`CallSession`] is the single entry point consumers hold: it owns the
//! registry, the peer links, the local media and the synchronizer, consumes
//! the shared event log, and exposes typed operations plus a broadcast
//! event stream. One instance per session per client; `leave()` is the sole
//! teardown path and is idempotent.

mod events;
mod metadata;

pub use events::SessionEvent;
pub use metadata::{CoWatchState, SessionMetadata};

use crate::channels::{ControlChannel, ControlMessage, CONTROL_CHANNEL_LABEL};
use crate::config::CoordinatorConfig;
use crate::media::LocalMedia;
use crate::participant::{ConnectionHealth, Participant, ParticipantRegistry, RemoteTrack, Role};
use crate::peer::{is_initiator, PeerLink, PeerLinkManager};
use crate::signaling::{
    CandidatePayload, EventLog, EventStream, JoinPayload, RoomEvent, SdpPayload, Signal,
    SignalKind, StateSnapshot,
};
use crate::stage::{self, derive_stage, StageAction, StageState};
use crate::sync::SessionSynchronizer;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

const EVENT_CAPACITY: usize = 64;

/// Parameters for joining or starting a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Shared log identifier (for example a room id)
    pub session_id: String,

    /// Local user id, comparable across clients
    pub user_id: String,

    /// Local display name
    pub display_name: String,

    /// Optional avatar URL
    pub avatar_url: Option<String>,

    /// Role to join with
    pub role: Role,

    /// Coordinator configuration
    pub config: CoordinatorConfig,
}

/// One group-call session on one client
pub struct CallSession {
    session_id: String,
    local_id: String,
    config: CoordinatorConfig,
    event_log: Arc<dyn EventLog>,
    registry: Arc<RwLock<ParticipantRegistry>>,
    metadata: Arc<RwLock<SessionMetadata>>,
    peers: Arc<PeerLinkManager>,
    media: Arc<LocalMedia>,
    sync: Arc<SessionSynchronizer>,
    events: broadcast::Sender<SessionEvent>,
    disposed: AtomicBool,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    // Handed to connection callbacks so they never keep the session alive
    weak_self: Weak<CallSession>,
}

impl CallSession {
    /// Join (or start) a session on the given event log.
    ///
    /// Local media failure is fatal: no partial session is left running.
    #[instrument(skip(event_log, options), fields(session_id = %options.session_id, user_id = %options.user_id))]
    pub async fn create(
        event_log: Arc<dyn EventLog>,
        options: SessionOptions,
    ) -> crate::Result<Arc<Self>> {
        options.config.validate()?;

        let media = Arc::new(LocalMedia::acquire(&options.user_id)?);

        let mut local = Participant::new(
            options.user_id.clone(),
            options.display_name.clone(),
            options.role,
        );
        local.avatar_url = options.avatar_url.clone();
        let registry = Arc::new(RwLock::new(ParticipantRegistry::new(local)));

        let metadata = Arc::new(RwLock::new(SessionMetadata::new(
            &options.user_id,
            &options.config.session_kind,
        )));

        let peers = Arc::new(PeerLinkManager::new(options.config.max_participants as usize));

        let sync = Arc::new(SessionSynchronizer::new(
            Arc::clone(&event_log),
            &options.session_id,
            Arc::clone(&registry),
            Arc::clone(&metadata),
            Arc::clone(&peers),
            options.config.sync_debounce_ms,
        ));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let session = Arc::new_cyclic(|weak| Self {
            session_id: options.session_id.clone(),
            local_id: options.user_id.clone(),
            config: options.config,
            event_log: Arc::clone(&event_log),
            registry,
            metadata,
            peers,
            media,
            sync,
            events,
            disposed: AtomicBool::new(false),
            dispatch: Mutex::new(None),
            weak_self: weak.clone(),
        });

        let stream = event_log.subscribe(&options.session_id).await?;
        let task = tokio::spawn(dispatch_events(Arc::downgrade(&session), stream));
        *session.dispatch.lock().await = Some(task);

        // Announce ourselves; peers that sort higher will offer toward us
        let payload = serde_json::to_value(JoinPayload {
            display_name: options.display_name,
            avatar_url: options.avatar_url,
            role: options.role,
        })
        .map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize join payload: {}", e))
        })?;
        session
            .publish_signal(Signal::broadcast(
                &session.session_id,
                &session.local_id,
                SignalKind::Join,
                payload,
            ))
            .await?;

        session.publish_state_logged().await;
        info!("session joined");
        Ok(session)
    }

    /// Session identifier
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Local user id
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Whether `leave()` has run
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Snapshot of all participants, ordered by user id
    pub async fn participants(&self) -> Vec<Participant> {
        self.registry.read().await.participants()
    }

    /// Current derived stage partition
    pub async fn stage(&self) -> StageState {
        derive_stage(&*self.registry.read().await)
    }

    /// Current session metadata
    pub async fn metadata(&self) -> SessionMetadata {
        self.metadata.read().await.clone()
    }

    // ------------------------------------------------------------------
    // Local media operations
    // ------------------------------------------------------------------

    /// Flip the local microphone mute flag. Returns the new value.
    pub async fn toggle_mute(&self) -> crate::Result<bool> {
        self.ensure_active()?;
        let mut muted = false;
        self.registry.write().await.update(&self.local_id, |p| {
            p.is_muted = !p.is_muted;
            muted = p.is_muted;
        });
        self.sync_now_logged().await;
        self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
        Ok(muted)
    }

    /// Flip the local camera mute flag. Returns the new value.
    pub async fn toggle_video(&self) -> crate::Result<bool> {
        self.ensure_active()?;
        let mut muted = false;
        self.registry.write().await.update(&self.local_id, |p| {
            p.is_video_muted = !p.is_video_muted;
            muted = p.is_video_muted;
        });
        self.sync_now_logged().await;
        self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
        Ok(muted)
    }

    /// Start or stop screen-sharing. Returns the new state.
    ///
    /// The screen track is attached to (or detached from) every link and
    /// each link is renegotiated.
    pub async fn toggle_screenshare(&self) -> crate::Result<bool> {
        self.ensure_active()?;
        let active = !self.registry.read().await.local().is_screensharing;

        if active {
            let track = self.media.start_screen(&self.local_id).await?;
            for link in self.peers.links().await {
                link.attach_screen_track(Arc::clone(&track)).await?;
            }
        } else {
            self.media.stop_screen().await;
            for link in self.peers.links().await {
                link.detach_screen_track().await;
            }
        }

        for link in self.peers.links().await {
            match link.create_offer().await {
                Ok(sdp) => {
                    self.publish_sdp(link.peer_id(), SignalKind::Offer, sdp).await;
                }
                Err(e) => {
                    warn!(peer_id = %link.peer_id(), "renegotiation failed: {}", e);
                    self.emit(SessionEvent::Error(e.to_string()));
                }
            }
        }

        self.registry
            .write()
            .await
            .update(&self.local_id, |p| p.is_screensharing = active);

        self.sync
            .broadcast_control(ControlMessage::ScreenshareToggle {
                user_id: self.local_id.clone(),
                active,
            })
            .await;
        self.sync_now_logged().await;
        self.emit(SessionEvent::ScreenshareChanged {
            user_id: self.local_id.clone(),
            active,
        });
        Ok(active)
    }

    /// Start or stop a co-watch. Starting requires a media URL.
    pub async fn toggle_co_watch(&self, url: Option<String>) -> crate::Result<()> {
        self.ensure_active()?;

        let currently_active = self
            .metadata
            .read()
            .await
            .co_watch
            .as_ref()
            .map(|c| c.active)
            .unwrap_or(false);

        let state = if currently_active {
            CoWatchState {
                active: false,
                url: None,
                started_by: self.local_id.clone(),
                started_at: Utc::now(),
            }
        } else {
            let url = url.ok_or_else(|| {
                crate::Error::SessionError("Starting a co-watch requires a url".to_string())
            })?;
            CoWatchState {
                active: true,
                url: Some(url),
                started_by: self.local_id.clone(),
                started_at: Utc::now(),
            }
        };

        self.metadata.write().await.co_watch = Some(state.clone());
        self.registry
            .write()
            .await
            .update(&self.local_id, |p| p.is_co_watching = state.active);

        self.sync
            .broadcast_control(ControlMessage::CowatchToggle {
                co_watch: state.clone(),
            })
            .await;
        self.publish_state_logged().await;
        self.emit(SessionEvent::CoWatchChanged(Some(state)));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stage operations
    // ------------------------------------------------------------------

    /// Raise (or re-raise, which lowers) the local hand
    pub async fn raise_hand(&self) -> crate::Result<()> {
        self.ensure_active()?;
        let action = {
            let mut registry = self.registry.write().await;
            stage::raise_hand(&mut registry, &self.local_id)
        };
        self.after_stage_action(action).await
    }

    /// Lower a hand; `None` targets the local participant. Idempotent.
    pub async fn lower_hand(&self, user_id: Option<&str>) -> crate::Result<()> {
        self.ensure_active()?;
        let target = user_id.unwrap_or(&self.local_id).to_string();
        self.require_participant(&target).await?;
        let action = {
            let mut registry = self.registry.write().await;
            stage::lower_hand(&mut registry, &target)
        };
        self.after_stage_action(action).await
    }

    /// Promote a participant to the stage; `None` grants `Participant`
    pub async fn bring_participant_to_stage(
        &self,
        user_id: &str,
        role: Option<Role>,
    ) -> crate::Result<()> {
        self.ensure_active()?;
        self.require_participant(user_id).await?;
        let action = {
            let mut registry = self.registry.write().await;
            stage::bring_to_stage(&mut registry, user_id, role.unwrap_or(Role::Participant))
        };
        self.after_stage_action(action).await
    }

    /// Demote a non-privileged speaker back to the audience
    pub async fn move_participant_to_audience(&self, user_id: &str) -> crate::Result<()> {
        self.ensure_active()?;
        self.require_participant(user_id).await?;
        let action = {
            let mut registry = self.registry.write().await;
            stage::send_to_audience(&mut registry, user_id)
        };
        self.after_stage_action(action).await
    }

    // ------------------------------------------------------------------
    // Moderation
    // ------------------------------------------------------------------

    /// Remove a remote participant locally and close their link.
    ///
    /// Removal is local only; the peer's other links are unaffected.
    pub async fn kick_participant(&self, user_id: &str) -> crate::Result<()> {
        self.ensure_active()?;
        if user_id == self.local_id {
            return Err(crate::Error::SessionError(
                "Cannot kick the local participant; use leave()".to_string(),
            ));
        }
        if self.registry.write().await.remove(user_id).is_none() {
            return Err(crate::Error::ParticipantNotFound(user_id.to_string()));
        }
        self.peers.remove(user_id).await;

        self.sync_now_logged().await;
        self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
        self.emit(SessionEvent::StageChanged(self.stage().await));
        Ok(())
    }

    /// Set a participant's microphone mute flag (moderation)
    pub async fn set_participant_muted(&self, user_id: &str, muted: bool) -> crate::Result<()> {
        self.ensure_active()?;
        if !self
            .registry
            .write()
            .await
            .update(user_id, |p| p.is_muted = muted)
        {
            return Err(crate::Error::ParticipantNotFound(user_id.to_string()));
        }
        self.sync_now_logged().await;
        self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
        Ok(())
    }

    /// Set a participant's camera mute flag (moderation)
    pub async fn set_participant_video_muted(
        &self,
        user_id: &str,
        muted: bool,
    ) -> crate::Result<()> {
        self.ensure_active()?;
        if !self
            .registry
            .write()
            .await
            .update(user_id, |p| p.is_video_muted = muted)
        {
            return Err(crate::Error::ParticipantNotFound(user_id.to_string()));
        }
        self.sync_now_logged().await;
        self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Leave the session. Idempotent; safe after a failed connection.
    pub async fn leave(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.session_id, "leaving session");

        let leave = Signal::broadcast(
            &self.session_id,
            &self.local_id,
            SignalKind::Leave,
            serde_json::json!({}),
        );
        if let Err(e) = self.event_log.publish(RoomEvent::Signal(leave)).await {
            warn!("Failed to publish leave signal: {}", e);
        }

        if let Some(task) = self.dispatch.lock().await.take() {
            task.abort();
        }

        self.peers.clear().await;
        self.media.stop().await;
        self.emit(SessionEvent::Disposed);
    }

    // ------------------------------------------------------------------
    // Event-log dispatch
    // ------------------------------------------------------------------

    async fn handle_event(&self, event: RoomEvent) {
        match event {
            // Own snapshots echo back through the log; re-applying them
            // would only churn timestamps and re-emit events
            RoomEvent::State(state) => {
                if state.from != self.local_id {
                    self.handle_state(state).await;
                }
            }
            RoomEvent::Participants(snapshot) => {
                if snapshot.from == self.local_id {
                    return;
                }
                self.registry
                    .write()
                    .await
                    .apply_snapshot(snapshot.participants);
                self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
                self.emit(SessionEvent::StageChanged(self.stage().await));
            }
            RoomEvent::Signal(signal) => {
                if signal.is_for(&self.local_id) {
                    self.handle_signal(signal).await;
                }
            }
            RoomEvent::Control {
                from, message, ..
            } => {
                if from != self.local_id {
                    self.handle_control(&from, message).await;
                }
            }
        }
    }

    async fn handle_state(&self, state: StateSnapshot) {
        let co_watch_changed = {
            let mut metadata = self.metadata.write().await;
            metadata.adopt_origin(&state.started_by, state.started_at, &state.kind);
            match state.co_watch {
                Some(incoming) => metadata.merge_co_watch(incoming),
                None => false,
            }
        };

        {
            let mut registry = self.registry.write().await;
            registry.apply_snapshot(state.participants);
            stage::apply_remote_stage(&mut registry, &state.stage);
        }

        if co_watch_changed {
            let co_watch = self.metadata.read().await.co_watch.clone();
            if let Some(state) = &co_watch {
                let started_by = state.started_by.clone();
                let active = state.active;
                self.registry
                    .write()
                    .await
                    .update(&started_by, |p| p.is_co_watching = active);
            }
            self.emit(SessionEvent::CoWatchChanged(co_watch));
        }

        self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
        self.emit(SessionEvent::StageChanged(self.stage().await));
    }

    async fn handle_signal(&self, signal: Signal) {
        match signal.kind {
            SignalKind::Join => self.handle_join(signal).await,
            SignalKind::Leave => self.handle_peer_left(&signal.from).await,
            SignalKind::Offer => self.handle_offer(signal).await,
            SignalKind::Answer => self.handle_answer(signal).await,
            SignalKind::IceCandidate => self.handle_candidate(signal).await,
        }
    }

    async fn handle_join(&self, signal: Signal) {
        let payload: JoinPayload = match serde_json::from_value(signal.payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(from = %signal.from, "Ignoring malformed join payload: {}", e);
                return;
            }
        };

        let mut participant =
            Participant::new(signal.from.as_str(), payload.display_name, payload.role);
        participant.avatar_url = payload.avatar_url;
        self.registry.write().await.upsert_remote(participant);
        self.emit(SessionEvent::ParticipantsChanged(self.participants().await));

        // Re-publish so the joiner converges without waiting for replay
        self.sync_now_logged().await;

        if is_initiator(&self.local_id, &signal.from) && !self.peers.contains(&signal.from).await {
            match self.connect_to_peer(&signal.from, true).await {
                Ok(link) => {
                    match link.create_offer().await {
                        Ok(sdp) => self.publish_sdp(&signal.from, SignalKind::Offer, sdp).await,
                        Err(e) => {
                            warn!(peer_id = %signal.from, "Failed to create offer: {}", e);
                            self.emit(SessionEvent::Error(e.to_string()));
                        }
                    }
                    self.drain_signals(&link).await;
                }
                Err(e) => {
                    warn!(peer_id = %signal.from, "Failed to create peer link: {}", e);
                    self.emit(SessionEvent::Error(e.to_string()));
                }
            }
        }
    }

    async fn handle_offer(&self, signal: Signal) {
        let payload: SdpPayload = match serde_json::from_value(signal.payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(from = %signal.from, "Ignoring malformed offer payload: {}", e);
                return;
            }
        };

        let link = match self.peers.get(&signal.from).await {
            Some(link) => link,
            None => match self.connect_to_peer(&signal.from, false).await {
                Ok(link) => link,
                Err(e) => {
                    warn!(peer_id = %signal.from, "Failed to create peer link: {}", e);
                    self.emit(SessionEvent::Error(e.to_string()));
                    return;
                }
            },
        };

        match link.accept_offer(payload.sdp).await {
            Ok(answer) => {
                self.publish_sdp(&signal.from, SignalKind::Answer, answer).await;
                self.drain_signals(&link).await;
            }
            Err(e) => {
                warn!(peer_id = %signal.from, "Failed to accept offer: {}", e);
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }
    }

    async fn handle_answer(&self, signal: Signal) {
        let link = match self.peers.get(&signal.from).await {
            Some(link) => link,
            None => {
                let from = signal.from.clone();
                self.peers.buffer_signal(&from, signal).await;
                return;
            }
        };

        let payload: SdpPayload = match serde_json::from_value(signal.payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(from = %signal.from, "Ignoring malformed answer payload: {}", e);
                return;
            }
        };

        if let Err(e) = link.accept_answer(payload.sdp).await {
            warn!(peer_id = %signal.from, "Failed to accept answer: {}", e);
            self.emit(SessionEvent::Error(e.to_string()));
            return;
        }
        self.drain_signals(&link).await;
    }

    async fn handle_candidate(&self, signal: Signal) {
        let link = match self.peers.get(&signal.from).await {
            Some(link) => link,
            None => {
                let from = signal.from.clone();
                self.peers.buffer_signal(&from, signal).await;
                return;
            }
        };

        // Hold candidates until a remote description exists
        if link.connection().remote_description().await.is_none() {
            let from = signal.from.clone();
            self.peers.buffer_signal(&from, signal).await;
            return;
        }

        let payload: CandidatePayload = match serde_json::from_value(signal.payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(from = %signal.from, "Ignoring malformed candidate payload: {}", e);
                return;
            }
        };

        if let Err(e) = link.add_ice_candidate(payload).await {
            warn!(peer_id = %signal.from, "Failed to add candidate: {}", e);
        }
    }

    /// Apply buffered answers/candidates in arrival order
    async fn drain_signals(&self, link: &Arc<PeerLink>) {
        for buffered in self.peers.drain_buffered(link.peer_id()).await {
            let outcome = match buffered.kind {
                SignalKind::Answer => {
                    match serde_json::from_value::<SdpPayload>(buffered.payload) {
                        Ok(p) => link.accept_answer(p.sdp).await,
                        Err(e) => Err(crate::Error::SerializationError(e.to_string())),
                    }
                }
                SignalKind::IceCandidate => {
                    match serde_json::from_value::<CandidatePayload>(buffered.payload) {
                        Ok(p) => link.add_ice_candidate(p).await,
                        Err(e) => Err(crate::Error::SerializationError(e.to_string())),
                    }
                }
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                warn!(peer_id = %link.peer_id(), "Failed to apply buffered signal: {}", e);
            }
        }
    }

    async fn handle_peer_left(&self, peer_id: &str) {
        debug!(peer_id, "peer left");
        let removed = self.registry.write().await.remove(peer_id).is_some();
        self.peers.remove(peer_id).await;

        if removed {
            self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
            self.emit(SessionEvent::StageChanged(self.stage().await));
        }
    }

    async fn handle_control(&self, from: &str, message: ControlMessage) {
        debug!(from, kind = message.kind(), "applying control message");
        match message {
            ControlMessage::ParticipantsSync { participants, .. } => {
                self.registry.write().await.apply_snapshot(participants);
                self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
                self.emit(SessionEvent::StageChanged(self.stage().await));
            }
            ControlMessage::ScreenshareToggle { user_id, active } => {
                self.registry
                    .write()
                    .await
                    .update(&user_id, |p| p.is_screensharing = active);
                self.emit(SessionEvent::ScreenshareChanged { user_id, active });
            }
            ControlMessage::StageUpdate { stage } => {
                stage::apply_remote_stage(&mut *self.registry.write().await, &stage);
                self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
                self.emit(SessionEvent::StageChanged(self.stage().await));
            }
            ControlMessage::StageInvite { user_id, role } => {
                stage::apply_invite(&mut *self.registry.write().await, &user_id, role);
                self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
                self.emit(SessionEvent::StageChanged(self.stage().await));
            }
            ControlMessage::HandRaise { user_id, raised_at } => {
                stage::apply_hand_raise(&mut *self.registry.write().await, &user_id, raised_at);
                self.emit(SessionEvent::StageChanged(self.stage().await));
            }
            ControlMessage::HandLower { user_id } => {
                stage::apply_hand_lower(&mut *self.registry.write().await, &user_id);
                self.emit(SessionEvent::StageChanged(self.stage().await));
            }
            ControlMessage::CowatchToggle { co_watch } => {
                let changed = self.metadata.write().await.merge_co_watch(co_watch);
                if changed {
                    let current = self.metadata.read().await.co_watch.clone();
                    if let Some(state) = &current {
                        let started_by = state.started_by.clone();
                        let active = state.active;
                        self.registry
                            .write()
                            .await
                            .update(&started_by, |p| p.is_co_watching = active);
                    }
                    self.emit(SessionEvent::CoWatchChanged(current));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Link wiring
    // ------------------------------------------------------------------

    async fn connect_to_peer(
        &self,
        peer_id: &str,
        initiator: bool,
    ) -> crate::Result<Arc<PeerLink>> {
        let link = Arc::new(PeerLink::connect(peer_id.to_string(), &self.config, &self.media).await?);
        self.wire_link(&link);

        if initiator {
            let channel = link.open_control_channel().await?;
            self.wire_control(peer_id, &channel);
        }

        self.registry.write().await.update(peer_id, |p| {
            p.connection = ConnectionHealth::Connecting;
        });
        self.peers.insert(Arc::clone(&link)).await?;
        Ok(link)
    }

    fn wire_link(&self, link: &Arc<PeerLink>) {
        let pc = link.connection();
        let peer_id = link.peer_id().to_string();

        {
            let weak = self.weak_self.clone();
            let weak_link = Arc::downgrade(link);
            let peer_id = peer_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                let weak_link = weak_link.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    if let Some(session) = weak.upgrade() {
                        session.on_peer_state(&peer_id, state, weak_link).await;
                    }
                })
            }));
        }

        {
            let weak = self.weak_self.clone();
            let peer_id = peer_id.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let (Some(session), Some(candidate)) = (weak.upgrade(), candidate) else {
                        return;
                    };
                    session.publish_candidate(&peer_id, candidate).await;
                })
            }));
        }

        {
            let weak = self.weak_self.clone();
            let weak_link = Arc::downgrade(link);
            let peer_id = peer_id.clone();
            pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let weak = weak.clone();
                let weak_link = weak_link.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    if channel.label() != CONTROL_CHANNEL_LABEL {
                        debug!(label = channel.label(), "ignoring unknown data channel");
                        return;
                    }
                    let (Some(session), Some(link)) = (weak.upgrade(), weak_link.upgrade()) else {
                        return;
                    };
                    let control = link.adopt_control_channel(channel).await;
                    session.wire_control(&peer_id, &control);
                })
            }));
        }

        {
            let weak = self.weak_self.clone();
            let peer_id = peer_id.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let weak = weak.clone();
                let peer_id = peer_id.clone();
                let remote = RemoteTrack {
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                    kind: track.kind().to_string(),
                };
                Box::pin(async move {
                    let Some(session) = weak.upgrade() else { return };
                    debug!(peer_id, track_id = %remote.track_id, kind = %remote.kind, "remote track arrived");
                    session.on_remote_track(&peer_id, remote).await;
                })
            }));
        }
    }

    fn wire_control(&self, peer_id: &str, channel: &ControlChannel) {
        let weak = self.weak_self.clone();
        let peer_id = peer_id.to_string();
        channel.on_message(move |message| {
            let weak = weak.clone();
            let peer_id = peer_id.clone();
            async move {
                if let Some(session) = weak.upgrade() {
                    session.handle_control(&peer_id, message).await;
                }
            }
        });
    }

    async fn on_peer_state(
        &self,
        peer_id: &str,
        state: RTCPeerConnectionState,
        weak_link: Weak<PeerLink>,
    ) {
        let health = match state {
            RTCPeerConnectionState::New => ConnectionHealth::New,
            RTCPeerConnectionState::Connecting => ConnectionHealth::Connecting,
            RTCPeerConnectionState::Connected => ConnectionHealth::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionHealth::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionHealth::Failed,
            RTCPeerConnectionState::Closed => ConnectionHealth::Closed,
            _ => return,
        };
        debug!(peer_id, ?health, "peer connection state changed");

        {
            let mut registry = self.registry.write().await;
            registry.update(peer_id, |p| p.connection = health);
            // Tracks belong to the connection that delivered them
            if matches!(
                health,
                ConnectionHealth::Disconnected | ConnectionHealth::Failed | ConnectionHealth::Closed
            ) {
                registry.clear_tracks(peer_id);
            }
        }
        self.emit(SessionEvent::ParticipantsChanged(self.participants().await));

        match health {
            ConnectionHealth::Connecting => {
                // A restart offer moved the connection out of failed; the
                // next failure is a new transition and may retry again,
                // still against the same attempt budget.
                if let Some(link) = weak_link.upgrade() {
                    link.restart_tracker().rearm();
                }
            }
            ConnectionHealth::Connected => {
                if let Some(link) = weak_link.upgrade() {
                    link.restart_tracker().clear_failure();
                }
                self.sync.clone().schedule_sync();
            }
            ConnectionHealth::Failed => {
                // Only the initiating side restarts, so both sides cannot
                // produce colliding restart offers
                if !is_initiator(&self.local_id, peer_id) {
                    return;
                }
                if let Some(link) = weak_link.upgrade() {
                    if link.restart_tracker().begin_failure() {
                        let weak = self.weak_self.clone();
                        tokio::spawn(async move {
                            if let Some(session) = weak.upgrade() {
                                session.restart_link(link).await;
                            }
                        });
                    }
                }
            }
            _ => {}
        }
    }

    async fn on_remote_track(&self, peer_id: &str, track: RemoteTrack) {
        let recorded = self.registry.write().await.record_track(peer_id, track);
        if recorded {
            self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
            // Track arrival is high-frequency; take the debounced path
            self.sync.clone().schedule_sync();
        }
    }

    async fn restart_link(&self, link: Arc<PeerLink>) {
        let attempt = link.restart_tracker().record_attempt();
        if !link.policy().should_retry(attempt) {
            warn!(peer_id = %link.peer_id(), attempt, "restart budget exhausted");
            self.emit(SessionEvent::Error(format!(
                "Connection to {} failed permanently",
                link.peer_id()
            )));
            return;
        }

        tokio::time::sleep(link.policy().backoff(attempt)).await;
        if self.is_disposed() {
            return;
        }

        match link.restart_ice().await {
            Ok(sdp) => {
                self.publish_sdp(link.peer_id(), SignalKind::Offer, sdp).await;
            }
            Err(e) => {
                warn!(peer_id = %link.peer_id(), "ICE restart failed: {}", e);
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn ensure_active(&self) -> crate::Result<()> {
        if self.is_disposed() {
            Err(crate::Error::Disposed)
        } else {
            Ok(())
        }
    }

    async fn require_participant(&self, user_id: &str) -> crate::Result<()> {
        if self.registry.read().await.contains(user_id) {
            Ok(())
        } else {
            Err(crate::Error::ParticipantNotFound(user_id.to_string()))
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn publish_signal(&self, signal: Signal) -> crate::Result<()> {
        self.event_log.publish(RoomEvent::Signal(signal)).await
    }

    async fn publish_sdp(&self, peer_id: &str, kind: SignalKind, sdp: String) {
        let payload = match serde_json::to_value(SdpPayload { sdp }) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to serialize SDP payload: {}", e);
                return;
            }
        };
        let signal = Signal::targeted(&self.session_id, &self.local_id, peer_id, kind, payload);
        if let Err(e) = self.publish_signal(signal).await {
            warn!(peer_id, "Failed to publish {:?}: {}", kind, e);
            self.emit(SessionEvent::Error(e.to_string()));
        }
    }

    async fn publish_candidate(&self, peer_id: &str, candidate: RTCIceCandidate) {
        let init = match candidate.to_json() {
            Ok(init) => init,
            Err(e) => {
                warn!(peer_id, "Failed to serialize candidate: {}", e);
                return;
            }
        };
        let payload = CandidatePayload {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        };
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(peer_id, "Failed to serialize candidate payload: {}", e);
                return;
            }
        };
        let signal = Signal::targeted(
            &self.session_id,
            &self.local_id,
            peer_id,
            SignalKind::IceCandidate,
            payload,
        );
        if let Err(e) = self.publish_signal(signal).await {
            warn!(peer_id, "Failed to publish candidate: {}", e);
        }
    }

    async fn after_stage_action(&self, action: StageAction) -> crate::Result<()> {
        let message = match action {
            StageAction::None => {
                return Ok(());
            }
            StageAction::HandRaised { user_id, raised_at } => {
                ControlMessage::HandRaise { user_id, raised_at }
            }
            StageAction::HandLowered { user_id } => ControlMessage::HandLower { user_id },
            StageAction::Invited { user_id, role } => ControlMessage::StageInvite { user_id, role },
        };

        self.sync.broadcast_control(message).await;
        self.sync
            .broadcast_control(ControlMessage::StageUpdate {
                stage: self.stage().await,
            })
            .await;
        self.sync_now_logged().await;

        self.emit(SessionEvent::ParticipantsChanged(self.participants().await));
        self.emit(SessionEvent::StageChanged(self.stage().await));
        Ok(())
    }

    async fn sync_now_logged(&self) {
        if let Err(e) = self.sync.sync_participants().await {
            warn!("Participant sync failed: {}", e);
            self.emit(SessionEvent::Error(e.to_string()));
        }
    }

    async fn publish_state_logged(&self) {
        if let Err(e) = self.sync.publish_state().await {
            warn!("State publication failed: {}", e);
            self.emit(SessionEvent::Error(e.to_string()));
        }
    }
}

async fn dispatch_events(session: Weak<CallSession>, mut stream: EventStream) {
    while let Some(event) = stream.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_event(event).await;
    }
    debug!("event stream closed");
}
