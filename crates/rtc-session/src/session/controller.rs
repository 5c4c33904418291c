//! Session controller
//!
//! Owns the peer connection, local media, the data channel and the signaling
//! channel of one two-party session. Every callback (transport state, ICE,
//! data channel, signaling, timers) is funnelled into a single dispatch task
//! that mutates the session under one lock, so handlers always see a
//! consistent state and can discard events that arrive late.

use super::candidates::IceCandidateBuffer;
use super::events::{SessionError, SessionEvent};
use super::heartbeat::{HeartbeatState, MonitorLoops, MonitorTick};
use super::quality::{QualityMonitor, QualityTier};
use super::reconnect::ReconnectState;
use super::state::{SessionState, Transition};
use super::turn::{augment_ice_servers, TurnCredentialsClient};
use super::{Role, SessionIdentity};
use crate::channels::{
    ChannelMessage, DataChannel, InboundPayload, MAX_MESSAGE_SIZE, SESSION_CHANNEL_LABEL,
};
use crate::config::SessionConfig;
use crate::media::{LocalStream, MediaBundle, MediaConstraints, MediaProvider, TrackKind};
use crate::peer::{
    ConnectionMetricsSample, IceCandidate, IceServer, OfferOptions, PeerConnection,
    NegotiationState, PeerConnectionFactory, PeerEvent, PeerEventEnvelope, PeerEventSink,
    SessionDescription, TransportState,
};
use crate::signaling::{
    SignalingChannel, SignalingConfig, SignalingConnector, SignalingState, WebSocketConnector,
};
use crate::{Error, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Capacity of the subscriber broadcast channel
const EVENT_CAPACITY: usize = 256;

/// Timeout for the TURN credential request
const TURN_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Participant key used for remote media before the peer is known by id
const UNKNOWN_PARTICIPANT: &str = "remote";

/// Signaling callbacks, re-posted to the dispatch task
#[derive(Debug)]
enum SignalingEvent {
    State(SignalingState),
    Join(String),
    Leave(String),
    Offer(String, SessionDescription),
    Answer(String, SessionDescription),
    Candidate(String, IceCandidate),
    ParticipantUpdate(String, Value),
    RemoteError(String, String),
}

/// Everything the dispatch task reacts to
#[derive(Debug)]
enum ControllerEvent {
    Signaling(SignalingEvent),
    Monitor(MonitorTick),
    FlushCandidates { generation: u64 },
    CandidatesUnsent { generation: u64, unsent: Vec<IceCandidate> },
    ReconnectDue { epoch: u64 },
    Shutdown,
}

/// A sorted batch for the candidate outbox
struct CandidateBatch {
    generation: u64,
    target: Option<String>,
    candidates: Vec<IceCandidate>,
}

/// Mutable session state, guarded by one lock
struct Core {
    state: SessionState,
    role: Role,
    ice_servers: Vec<IceServer>,
    peer: Option<Arc<dyn PeerConnection>>,
    data_channel: Option<Arc<dyn DataChannel>>,
    media: MediaBundle,
    candidates: IceCandidateBuffer,
    heartbeat: HeartbeatState,
    reconnect: ReconnectState,
    monitors: MonitorLoops,
    quality: QualityMonitor,
    transport_state: TransportState,
    offer_sent: bool,
    local_offer: Option<SessionDescription>,
    answered_offer: Option<String>,
    remote_participant: Option<String>,
    reconnect_epoch: u64,
    reconnect_pending: bool,
    audio_enabled: bool,
    video_enabled: bool,
    last_error: Option<SessionError>,
}

struct Inner {
    identity: SessionIdentity,
    config: SessionConfig,
    media_provider: Arc<dyn MediaProvider>,
    peer_factory: Arc<dyn PeerConnectionFactory>,
    signaling: SignalingChannel,
    turn: Option<TurnCredentialsClient>,
    events: broadcast::Sender<SessionEvent>,
    generation: AtomicU64,
    dispatch_tx: mpsc::UnboundedSender<ControllerEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEventEnvelope>,
    outbox_tx: mpsc::UnboundedSender<CandidateBatch>,
    receivers: parking_lot::Mutex<Option<Receivers>>,
    core: Mutex<Core>,
}

struct Receivers {
    dispatch: mpsc::UnboundedReceiver<ControllerEvent>,
    peer: mpsc::UnboundedReceiver<PeerEventEnvelope>,
    outbox: mpsc::UnboundedReceiver<CandidateBatch>,
}

/// Two-party session controller
///
/// # Example
///
/// ```no_run
/// use rtc_session::config::SessionConfig;
/// use rtc_session::rtc::{SampleMediaProvider, WebRtcPeerFactory};
/// use rtc_session::session::{SessionController, SessionIdentity};
/// use std::sync::Arc;
///
/// # async fn run() -> rtc_session::Result<()> {
/// let controller = SessionController::new(
///     SessionConfig::default(),
///     SessionIdentity::with_random_user("consult-42"),
///     Arc::new(SampleMediaProvider::default()),
///     Arc::new(WebRtcPeerFactory::new()),
/// )?;
///
/// let mut events = controller.subscribe();
/// controller.initialize("bearer-token", true).await?;
/// while let Ok(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// # Ok(())
/// # }
/// ```
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Controller using the WebSocket signaling transport
    pub fn new(
        config: SessionConfig,
        identity: SessionIdentity,
        media_provider: Arc<dyn MediaProvider>,
        peer_factory: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self> {
        Self::with_connector(
            config,
            identity,
            media_provider,
            peer_factory,
            Arc::new(WebSocketConnector::default()),
        )
    }

    /// Controller with a custom signaling transport
    pub fn with_connector(
        config: SessionConfig,
        identity: SessionIdentity,
        media_provider: Arc<dyn MediaProvider>,
        peer_factory: Arc<dyn PeerConnectionFactory>,
        connector: Arc<dyn SignalingConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let signaling = SignalingChannel::new(
            SignalingConfig::from_session(&config, &identity.session_id, &identity.user_id),
            connector,
        );
        let turn = config
            .turn_credentials_url
            .as_ref()
            .map(|url| TurnCredentialsClient::new(url.clone(), TURN_FETCH_TIMEOUT))
            .transpose()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        let options = &config.options;
        let core = Core {
            state: SessionState::New,
            role: Role::Responder,
            ice_servers: Vec::new(),
            peer: None,
            data_channel: None,
            media: MediaBundle::default(),
            candidates: IceCandidateBuffer::new(),
            heartbeat: HeartbeatState::new(
                options.heartbeat_interval(),
                options.heartbeat_timeout(),
                Instant::now(),
            ),
            reconnect: ReconnectState::new(config.reconnection_policy()),
            monitors: MonitorLoops::default(),
            quality: QualityMonitor::default(),
            transport_state: TransportState::New,
            offer_sent: false,
            local_offer: None,
            answered_offer: None,
            remote_participant: None,
            reconnect_epoch: 0,
            reconnect_pending: false,
            audio_enabled: true,
            video_enabled: true,
            last_error: None,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                config,
                media_provider,
                peer_factory,
                signaling,
                turn,
                events,
                generation: AtomicU64::new(0),
                dispatch_tx,
                peer_tx,
                outbox_tx,
                receivers: parking_lot::Mutex::new(Some(Receivers {
                    dispatch: dispatch_rx,
                    peer: peer_rx,
                    outbox: outbox_rx,
                })),
                core: Mutex::new(core),
            }),
        })
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Session identity
    pub fn identity(&self) -> &SessionIdentity {
        &self.inner.identity
    }

    /// Configuration in force
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Start the session
    ///
    /// Acquires local media, fetches TURN credentials (best effort), builds
    /// the peer connection and opens signaling. An initiator sends its offer
    /// as soon as signaling reports connected.
    ///
    /// # Errors
    ///
    /// - [`Error::Precondition`] if called twice or after `disconnect`
    /// - [`Error::PermissionDenied`] / [`Error::MediaAcquisition`] if local
    ///   media is unavailable (fatal)
    /// - [`Error::SignalingExhausted`] if the relay cannot be reached (fatal)
    #[instrument(skip(self, token), fields(session_id = %self.inner.identity.session_id))]
    pub async fn initialize(&self, token: &str, is_initiator: bool) -> Result<()> {
        let inner = &self.inner;

        {
            let mut core = inner.core.lock().await;
            if core.state != SessionState::New {
                return Err(Error::Precondition(format!(
                    "initialize called in state {}",
                    core.state
                )));
            }
            core.role = Role::from_initiator(is_initiator);
            inner.transition(&mut core, Transition::BeginMediaAcquisition);
            info!(role = %core.role, "Initializing session");
        }

        Inner::start_tasks(inner);
        inner.register_signaling_callbacks().await;

        let stream = match inner
            .media_provider
            .acquire(&MediaConstraints::default())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let err = match e {
                    Error::PermissionDenied(_) | Error::MediaAcquisition(_) => e,
                    other => Error::MediaAcquisition(other.to_string()),
                };
                error!("Local media unavailable: {}", err);
                let mut core = inner.core.lock().await;
                if inner.transition(&mut core, Transition::MediaDenied) {
                    inner.report(&mut core, SessionError::from(&err));
                }
                return Err(err);
            }
        };

        {
            let mut core = inner.core.lock().await;
            if core.state != SessionState::GatheringMedia {
                stream.stop();
                return Err(Error::Precondition(
                    "session closed during initialization".to_string(),
                ));
            }
            stream.set_enabled(TrackKind::Audio, core.audio_enabled);
            stream.set_enabled(TrackKind::Video, core.video_enabled);
            inner.emit(SessionEvent::LocalStreamReady {
                stream_id: stream.id().to_string(),
                audio_tracks: stream.tracks_of(TrackKind::Audio).count(),
                video_tracks: stream.tracks_of(TrackKind::Video).count(),
            });
            core.media.set_local(stream);
        }

        let ice_servers =
            augment_ice_servers(inner.config.ice_servers(), inner.turn.as_ref(), token).await;

        {
            let mut core = inner.core.lock().await;
            if core.state != SessionState::GatheringMedia {
                return Err(Error::Precondition(
                    "session closed during initialization".to_string(),
                ));
            }
            core.ice_servers = ice_servers;

            if let Err(e) = inner.build_peer(&mut core).await {
                error!("Failed to set up peer connection: {}", e);
                if inner.transition(&mut core, Transition::SetupFailed) {
                    inner.report(
                        &mut core,
                        SessionError::fatal(format!("Failed to set up peer connection: {}", e)),
                    );
                }
                return Err(e);
            }
            inner.transition(&mut core, Transition::MediaReady);
        }

        if let Err(e) = inner.signaling.connect(token).await {
            let mut core = inner.core.lock().await;
            if core.state == SessionState::Closed {
                debug!("Signaling connect ended by teardown: {}", e);
                return Err(Error::Precondition(
                    "session closed during initialization".to_string(),
                ));
            }
            error!("Signaling unavailable: {}", e);
            inner.on_signaling_lost(&mut core, &e);
            return Err(e);
        }

        let closed = inner.core.lock().await.state == SessionState::Closed;
        if closed {
            inner.signaling.disconnect().await;
            return Err(Error::Precondition(
                "session closed during initialization".to_string(),
            ));
        }

        Ok(())
    }

    /// Create, apply and send an offer
    ///
    /// # Errors
    ///
    /// [`Error::Precondition`] if there is no peer connection yet or the
    /// signaling channel is not connected. Not retried.
    pub async fn create_offer(&self) -> Result<()> {
        let inner = &self.inner;
        let mut core = inner.core.lock().await;
        if !core.state.has_peer() {
            return Err(Error::Precondition(format!(
                "cannot create an offer in state {}",
                core.state
            )));
        }
        if !inner.signaling.is_connected() {
            return Err(Error::Precondition(
                "signaling channel is not connected".to_string(),
            ));
        }
        inner.send_offer(&mut core).await
    }

    /// Enable or mute local audio without renegotiation
    pub async fn toggle_audio(&self, enabled: bool) {
        self.inner.toggle(TrackKind::Audio, enabled).await;
    }

    /// Enable or blank local video without renegotiation
    pub async fn toggle_video(&self, enabled: bool) {
        self.inner.toggle(TrackKind::Video, enabled).await;
    }

    /// Send an application message on the data channel
    pub async fn send_data(&self, text: &str) -> Result<()> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(Error::DataChannelError(format!(
                "Message size {} exceeds maximum {} bytes",
                text.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let channel = {
            let core = self.inner.core.lock().await;
            core.data_channel.clone()
        };
        match channel {
            Some(channel) if channel.is_open() => channel.send_text(text).await,
            _ => Err(Error::DataChannelError(
                "data channel is not open".to_string(),
            )),
        }
    }

    /// Publish participant metadata through the relay
    pub fn update_participant(&self, data: Value) -> Result<()> {
        self.inner.signaling.send_participant_update(data)
    }

    /// Tear everything down
    ///
    /// Stops timers, closes the data channel, stops local and remote tracks,
    /// closes the peer connection and the signaling channel. Safe to call
    /// repeatedly and before `initialize` has finished.
    #[instrument(skip(self), fields(session_id = %self.inner.identity.session_id))]
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        {
            let mut core = inner.core.lock().await;
            if core.state == SessionState::Closed {
                debug!("Session already closed");
                return;
            }

            core.monitors.stop();
            core.reconnect_pending = false;
            core.reconnect_epoch += 1;
            core.media.stop_all();
            inner.teardown_peer(&mut core).await;
            inner.transition(&mut core, Transition::Close);
        }

        inner.signaling.disconnect().await;
        let _ = inner.dispatch_tx.send(ControllerEvent::Shutdown);
        info!("Session closed");
    }

    /// Alias of [`SessionController::disconnect`]
    pub async fn cleanup(&self) {
        self.disconnect().await;
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SessionState {
        self.inner.core.lock().await.state
    }

    /// Role assigned at `initialize`
    pub async fn role(&self) -> Role {
        self.inner.core.lock().await.role
    }

    /// Signaling channel state
    pub fn signaling_state(&self) -> SignalingState {
        self.inner.signaling.state()
    }

    /// Reconnection attempts since the last successful connection
    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.core.lock().await.reconnect.attempt()
    }

    /// Video tier currently applied
    pub async fn quality_tier(&self) -> Option<QualityTier> {
        self.inner.core.lock().await.quality.current()
    }

    /// Most recent metrics sample
    pub async fn last_metrics(&self) -> Option<ConnectionMetricsSample> {
        self.inner.core.lock().await.quality.last_sample().cloned()
    }

    /// Most recent error reported to subscribers
    pub async fn last_error(&self) -> Option<SessionError> {
        self.inner.core.lock().await.last_error.clone()
    }

    /// Local capture stream, once acquired
    pub async fn local_stream(&self) -> Option<LocalStream> {
        self.inner.core.lock().await.media.local().cloned()
    }

    /// Current `(audio, video)` enabled flags
    pub async fn media_enabled(&self) -> (bool, bool) {
        let core = self.inner.core.lock().await;
        (core.audio_enabled, core.video_enabled)
    }

    /// True while any monitor loop, reconnect or candidate flush is pending
    pub async fn has_active_timers(&self) -> bool {
        let core = self.inner.core.lock().await;
        core.monitors.is_active() || core.reconnect_pending || core.candidates.is_flush_armed()
    }

    /// True while a peer connection object exists
    pub async fn has_peer_connection(&self) -> bool {
        self.inner.core.lock().await.peer.is_some()
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn report(&self, core: &mut Core, err: SessionError) {
        core.last_error = Some(err.clone());
        self.emit(SessionEvent::Error(err));
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Apply a transition; returns false (and logs) if it is not allowed
    fn transition(&self, core: &mut Core, transition: Transition) -> bool {
        match core.state.apply(transition) {
            Ok(next) => {
                if next != core.state {
                    info!(
                        session_id = %self.identity.session_id,
                        "Session state {} -> {} ({:?})",
                        core.state,
                        next,
                        transition
                    );
                    core.state = next;
                    self.emit(SessionEvent::ConnectionStateChanged(next));
                }
                true
            }
            Err(e) => {
                debug!("Ignoring transition: {}", e);
                false
            }
        }
    }

    fn start_tasks(this: &Arc<Self>) {
        let Some(receivers) = this.receivers.lock().take() else {
            return;
        };
        let stagger = this.config.options.ice_send_stagger();
        tokio::spawn(dispatch_loop(
            Arc::downgrade(this),
            receivers.dispatch,
            receivers.peer,
        ));
        tokio::spawn(candidate_outbox(
            Arc::downgrade(this),
            receivers.outbox,
            stagger,
        ));
    }

    async fn register_signaling_callbacks(&self) {
        let s = &self.signaling;

        let tx = self.dispatch_tx.clone();
        s.on_state_change(move |state| {
            let _ = tx.send(ControllerEvent::Signaling(SignalingEvent::State(state)));
        })
        .await;

        let tx = self.dispatch_tx.clone();
        s.on_join(move |user| {
            let _ = tx.send(ControllerEvent::Signaling(SignalingEvent::Join(user)));
        })
        .await;

        let tx = self.dispatch_tx.clone();
        s.on_leave(move |user| {
            let _ = tx.send(ControllerEvent::Signaling(SignalingEvent::Leave(user)));
        })
        .await;

        let tx = self.dispatch_tx.clone();
        s.on_offer(move |from, desc| {
            let _ = tx.send(ControllerEvent::Signaling(SignalingEvent::Offer(from, desc)));
        })
        .await;

        let tx = self.dispatch_tx.clone();
        s.on_answer(move |from, desc| {
            let _ = tx.send(ControllerEvent::Signaling(SignalingEvent::Answer(from, desc)));
        })
        .await;

        let tx = self.dispatch_tx.clone();
        s.on_ice_candidate(move |from, candidate| {
            let _ = tx.send(ControllerEvent::Signaling(SignalingEvent::Candidate(
                from, candidate,
            )));
        })
        .await;

        let tx = self.dispatch_tx.clone();
        s.on_participant_update(move |from, data| {
            let _ = tx.send(ControllerEvent::Signaling(
                SignalingEvent::ParticipantUpdate(from, data),
            ));
        })
        .await;

        let tx = self.dispatch_tx.clone();
        s.on_remote_error(move |from, message| {
            let _ = tx.send(ControllerEvent::Signaling(SignalingEvent::RemoteError(
                from, message,
            )));
        })
        .await;
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn handle(&self, event: ControllerEvent) {
        let mut core = self.core.lock().await;
        match event {
            ControllerEvent::Signaling(event) => self.on_signaling_event(&mut core, event).await,
            ControllerEvent::Monitor(MonitorTick::Heartbeat { epoch }) => {
                self.on_heartbeat_tick(&mut core, epoch).await
            }
            ControllerEvent::Monitor(MonitorTick::Quality { epoch }) => {
                self.on_quality_tick(&mut core, epoch).await
            }
            ControllerEvent::FlushCandidates { generation } => {
                if generation == self.current_generation() {
                    self.flush_local_candidates(&mut core);
                }
            }
            ControllerEvent::CandidatesUnsent { generation, unsent } => {
                if generation == self.current_generation() && !core.state.is_terminal() {
                    debug!("Requeueing {} unsent candidates", unsent.len());
                    core.candidates.requeue_local(unsent);
                }
            }
            ControllerEvent::ReconnectDue { epoch } => {
                if epoch == core.reconnect_epoch && core.reconnect_pending {
                    self.begin_reconnect(&mut core).await;
                }
            }
            ControllerEvent::Shutdown => {}
        }
    }

    async fn handle_peer(&self, envelope: PeerEventEnvelope) {
        let mut core = self.core.lock().await;
        let PeerEventEnvelope { generation, event } = envelope;

        if generation != self.current_generation() || core.state.is_terminal() {
            debug!(generation, "Ignoring event from a replaced peer connection: {:?}", event);
            return;
        }

        match event {
            PeerEvent::ConnectionState(transport) => {
                core.transport_state = transport;
                self.on_transport_state(&mut core, transport);
            }
            PeerEvent::IceConnectionState(ice) => {
                debug!("ICE connection state: {:?}", ice);
                self.emit(SessionEvent::IceStateChanged(ice));
            }
            PeerEvent::IceCandidate(candidate) => {
                if candidate.is_end_of_candidates() {
                    self.flush_local_candidates(&mut core);
                } else if core.candidates.push_local(candidate) {
                    self.arm_candidate_flush();
                }
            }
            PeerEvent::IceGatheringComplete => {
                debug!("ICE gathering complete");
                self.flush_local_candidates(&mut core);
            }
            PeerEvent::Track(track) => {
                let participant = core
                    .remote_participant
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_PARTICIPANT.to_string());
                info!(participant = %participant, kind = %track.kind, "Remote track received");
                core.media.add_remote_track(&participant, track.clone());
                self.emit(SessionEvent::RemoteStreamReady {
                    participant_id: participant,
                    stream_id: track.stream_id,
                    track_id: track.id,
                    kind: track.kind,
                });
            }
            PeerEvent::DataChannel(channel) => {
                if core.data_channel.is_none() {
                    info!("Remote opened data channel '{}'", channel.label());
                    core.data_channel = Some(channel);
                } else {
                    debug!("Ignoring extra data channel '{}'", channel.label());
                }
            }
            PeerEvent::DataChannelOpen { label } => {
                info!("Data channel '{}' open", label);
                core.heartbeat.touch(Instant::now());
                self.emit(SessionEvent::DataChannelOpen);
            }
            PeerEvent::DataChannelMessage { text, .. } => match InboundPayload::classify(&text) {
                InboundPayload::Heartbeat { .. } => core.heartbeat.touch(Instant::now()),
                InboundPayload::Application(text) => {
                    self.emit(SessionEvent::DataChannelMessage(text))
                }
            },
            PeerEvent::DataChannelClosed { label } => {
                debug!("Data channel '{}' closed", label);
            }
        }
    }

    fn on_transport_state(&self, core: &mut Core, transport: TransportState) {
        debug!("Transport state: {:?}", transport);
        match transport {
            TransportState::Connected => {
                if self.transition(core, Transition::PeerConnected) {
                    self.enter_connected(core);
                }
            }
            TransportState::Disconnected => {
                if self.transition(core, Transition::PeerDisconnected) {
                    self.enter_disconnected(core);
                }
            }
            TransportState::Failed => {
                if self.transition(core, Transition::PeerFailed) {
                    self.enter_disconnected(core);
                }
            }
            TransportState::Closed => {
                if core.state == SessionState::Connected
                    && self.transition(core, Transition::PeerDisconnected)
                {
                    self.enter_disconnected(core);
                }
            }
            TransportState::New | TransportState::Connecting => {}
        }
    }

    async fn on_signaling_event(&self, core: &mut Core, event: SignalingEvent) {
        match event {
            SignalingEvent::State(state) => {
                self.emit(SessionEvent::SignalingStateChanged(state));
                match state {
                    SignalingState::Connected => {
                        self.flush_local_candidates(core);
                        self.maybe_send_initial_offer(core).await;
                    }
                    SignalingState::Failed => {
                        let err = Error::SignalingExhausted(
                            self.config.options.signaling_max_reconnect_attempts,
                        );
                        self.on_signaling_lost(core, &err);
                    }
                    _ => {}
                }
            }
            SignalingEvent::Join(user) => {
                core.remote_participant = Some(user.clone());
                self.emit(SessionEvent::ParticipantJoined(user.clone()));
                self.repeat_offer_to(core, &user);
            }
            SignalingEvent::Leave(user) => {
                if core.media.end_remote(&user) {
                    debug!(participant = %user, "Remote stream ended");
                }
                self.emit(SessionEvent::ParticipantLeft(user));
            }
            SignalingEvent::Offer(from, description) => {
                self.on_remote_offer(core, from, description).await
            }
            SignalingEvent::Answer(from, description) => {
                self.on_remote_answer(core, from, description).await
            }
            SignalingEvent::Candidate(_, candidate) => {
                self.on_remote_candidate(core, candidate).await
            }
            SignalingEvent::ParticipantUpdate(from, data) => {
                self.emit(SessionEvent::ParticipantUpdated {
                    participant_id: from,
                    data,
                });
            }
            SignalingEvent::RemoteError(_, message) => {
                self.report(
                    core,
                    SessionError::recoverable(format!("Signaling relay error: {}", message)),
                );
            }
        }
    }

    fn on_signaling_lost(&self, core: &mut Core, err: &Error) {
        if !self.transition(core, Transition::SignalingLost) {
            return;
        }
        core.monitors.stop();
        core.reconnect_pending = false;
        core.reconnect_epoch += 1;
        self.report(core, SessionError::fatal(err.to_string()));
    }

    // ------------------------------------------------------------------
    // State-driven side effects
    // ------------------------------------------------------------------

    fn enter_connected(&self, core: &mut Core) {
        core.reconnect.reset();
        core.reconnect_pending = false;
        core.heartbeat.touch(Instant::now());

        let tx = self.dispatch_tx.clone();
        let options = &self.config.options;
        core.monitors.start(
            options.heartbeat_interval(),
            options.quality_interval(),
            move |tick| tx.send(ControllerEvent::Monitor(tick)).is_ok(),
        );
    }

    fn enter_disconnected(&self, core: &mut Core) {
        core.monitors.stop();
        self.schedule_reconnect(core);
    }

    fn schedule_reconnect(&self, core: &mut Core) {
        match core.reconnect.next_attempt() {
            Some((attempt, delay)) => {
                core.reconnect_epoch += 1;
                core.reconnect_pending = true;

                let epoch = core.reconnect_epoch;
                let tx = self.dispatch_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(ControllerEvent::ReconnectDue { epoch });
                });
                self.emit(SessionEvent::ReconnectScheduled { attempt, delay });
            }
            None => {
                let err = Error::ReconnectExhausted(core.reconnect.policy().max_attempts);
                error!(session_id = %self.identity.session_id, "{}", err);
                core.reconnect_pending = false;
                if self.transition(core, Transition::ReconnectExhausted) {
                    self.report(core, SessionError::from(&err));
                }
            }
        }
    }

    async fn begin_reconnect(&self, core: &mut Core) {
        core.reconnect_pending = false;
        if !self.transition(core, Transition::BeginReconnect) {
            return;
        }

        info!(
            attempt = core.reconnect.attempt(),
            "Rebuilding peer connection"
        );
        self.teardown_peer(core).await;
        match self.build_peer(core).await {
            Ok(()) => self.maybe_send_initial_offer(core).await,
            Err(e) => {
                warn!(
                    "Reconnection attempt {} failed: {}",
                    core.reconnect.attempt(),
                    e
                );
                if self.transition(core, Transition::PeerFailed) {
                    self.enter_disconnected(core);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer connection lifecycle
    // ------------------------------------------------------------------

    /// Build a connection for the current generation and attach local media
    async fn build_peer(&self, core: &mut Core) -> Result<()> {
        let generation = self.current_generation();
        let sink = PeerEventSink::new(generation, self.peer_tx.clone());
        let peer = self.peer_factory.create(&core.ice_servers, sink).await?;

        if let Err(e) = self.attach(core, &peer).await {
            if let Err(close_err) = peer.close().await {
                debug!("Closing half-built peer connection: {}", close_err);
            }
            return Err(e);
        }

        info!(peer_id = peer.id(), generation, "Peer connection created");
        core.peer = Some(peer);
        core.transport_state = TransportState::New;
        Ok(())
    }

    async fn attach(&self, core: &mut Core, peer: &Arc<dyn PeerConnection>) -> Result<()> {
        if let Some(local) = core.media.local() {
            for track in local.tracks() {
                peer.add_track(Arc::clone(track)).await?;
            }
        }

        if core.role == Role::Initiator {
            let channel = peer
                .create_data_channel(SESSION_CHANNEL_LABEL, self.config.data_channel_mode)
                .await?;
            core.data_channel = Some(channel);
        }
        Ok(())
    }

    /// Close and forget the current connection; local media is kept
    async fn teardown_peer(&self, core: &mut Core) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        core.candidates.clear();
        core.offer_sent = false;
        core.local_offer = None;
        core.answered_offer = None;
        core.transport_state = TransportState::New;
        core.quality.reset();
        core.media.clear_remote();

        if let Some(channel) = core.data_channel.take() {
            if let Err(e) = channel.close().await {
                debug!("Closing data channel: {}", e);
            }
        }
        if let Some(peer) = core.peer.take() {
            if let Err(e) = peer.close().await {
                warn!(peer_id = peer.id(), "Error closing peer connection: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Offer / answer
    // ------------------------------------------------------------------

    async fn maybe_send_initial_offer(&self, core: &mut Core) {
        if core.role != Role::Initiator
            || core.offer_sent
            || !matches!(
                core.state,
                SessionState::Connecting | SessionState::Reconnecting
            )
            || !self.signaling.is_connected()
        {
            return;
        }

        if let Err(e) = self.send_offer(core).await {
            warn!("Failed to send offer: {}", e);
        }
    }

    async fn send_offer(&self, core: &mut Core) -> Result<()> {
        let peer = core
            .peer
            .clone()
            .ok_or_else(|| Error::Precondition("no peer connection".to_string()))?;

        let offer = peer.create_offer(&OfferOptions::default()).await?;
        peer.set_local_description(offer.clone()).await?;
        self.signaling
            .send_offer(core.remote_participant.as_deref(), &offer)?;

        core.offer_sent = true;
        core.local_offer = Some(offer);
        info!(peer_id = peer.id(), "Offer sent");
        Ok(())
    }

    /// Repeat the outstanding offer to a participant that joined after it
    ///
    /// The relay does not buffer, so an offer sent before the responder
    /// connected never reached it.
    fn repeat_offer_to(&self, core: &Core, user: &str) {
        if core.role != Role::Initiator
            || !matches!(
                core.state,
                SessionState::Connecting | SessionState::Reconnecting
            )
        {
            return;
        }
        let (Some(peer), Some(offer)) = (core.peer.as_ref(), core.local_offer.as_ref()) else {
            return;
        };
        if peer.negotiation_state() != NegotiationState::HaveLocalOffer {
            return;
        }

        match self.signaling.send_offer(Some(user), offer) {
            Ok(()) => info!(participant = %user, "Offer repeated for joining participant"),
            Err(e) => warn!(participant = %user, "Failed to repeat offer: {}", e),
        }
    }

    async fn on_remote_offer(&self, core: &mut Core, from: String, description: SessionDescription) {
        // A responder waiting out its backoff rebuilds right away so the
        // initiator's fresh offer lands on a fresh connection.
        if core.state == SessionState::Disconnected
            && core.reconnect_pending
            && core.role == Role::Responder
        {
            self.begin_reconnect(core).await;
        }

        if !core.state.has_peer() {
            warn!(sender = %from, "Dropping offer in state {}", core.state);
            return;
        }
        let Some(peer) = core.peer.clone() else {
            return;
        };

        if core.answered_offer.as_deref() == Some(description.sdp.as_str()) {
            debug!(sender = %from, "Ignoring repeated offer");
            return;
        }

        let negotiation = peer.negotiation_state();
        if !negotiation.accepts_remote_offer() {
            warn!(
                sender = %from,
                "Dropping offer while negotiation is {:?}", negotiation
            );
            return;
        }

        core.remote_participant = Some(from.clone());
        if let Err(e) = self.answer_offer(core, &peer, &from, description).await {
            warn!(sender = %from, "Failed to answer offer: {}", e);
        }
    }

    async fn answer_offer(
        &self,
        core: &mut Core,
        peer: &Arc<dyn PeerConnection>,
        from: &str,
        description: SessionDescription,
    ) -> Result<()> {
        let sdp = description.sdp.clone();
        peer.set_remote_description(description).await?;
        core.answered_offer = Some(sdp);
        self.drain_remote_candidates(core, peer).await;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.signaling.send_answer(Some(from), &answer)?;

        info!(peer_id = peer.id(), "Answer sent to {}", from);
        Ok(())
    }

    async fn on_remote_answer(&self, core: &mut Core, from: String, description: SessionDescription) {
        let Some(peer) = core.peer.clone() else {
            debug!(sender = %from, "Dropping answer without a peer connection");
            return;
        };

        let negotiation = peer.negotiation_state();
        if !negotiation.accepts_remote_answer() {
            debug!(
                sender = %from,
                "Dropping unexpected answer while negotiation is {:?}", negotiation
            );
            return;
        }

        core.remote_participant = Some(from.clone());
        if let Err(e) = peer.set_remote_description(description).await {
            warn!(sender = %from, "Failed to apply answer: {}", e);
            return;
        }
        info!(peer_id = peer.id(), "Answer applied");
        self.drain_remote_candidates(core, &peer).await;
    }

    // ------------------------------------------------------------------
    // Candidates
    // ------------------------------------------------------------------

    async fn on_remote_candidate(&self, core: &mut Core, candidate: IceCandidate) {
        if candidate.is_end_of_candidates() {
            debug!("Remote end of candidates");
            return;
        }

        let peer = match core.peer.clone() {
            Some(peer) if peer.has_remote_description().await => peer,
            _ => {
                core.candidates.push_remote(candidate);
                debug!(
                    "Queued remote candidate ({} waiting for remote description)",
                    core.candidates.remote_len()
                );
                return;
            }
        };

        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!("Failed to apply remote candidate: {}", e);
        }
    }

    async fn drain_remote_candidates(&self, core: &mut Core, peer: &Arc<dyn PeerConnection>) {
        let queued = core.candidates.take_remote();
        if queued.is_empty() {
            return;
        }
        debug!("Applying {} queued remote candidates", queued.len());
        for candidate in queued {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("Failed to apply queued remote candidate: {}", e);
            }
        }
    }

    fn arm_candidate_flush(&self) {
        let generation = self.current_generation();
        let delay = self.config.options.ice_flush_debounce();
        let tx = self.dispatch_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ControllerEvent::FlushCandidates { generation });
        });
    }

    fn flush_local_candidates(&self, core: &mut Core) {
        if core.candidates.local_len() == 0 {
            return;
        }
        if !self.signaling.is_connected() {
            debug!(
                "Deferring {} local candidates until signaling connects",
                core.candidates.local_len()
            );
            return;
        }

        let candidates = core.candidates.take_local_batch();
        debug!("Flushing {} local candidates", candidates.len());
        let _ = self.outbox_tx.send(CandidateBatch {
            generation: self.current_generation(),
            target: core.remote_participant.clone(),
            candidates,
        });
    }

    /// Send one batch, spaced by `stagger`; unsent candidates are handed back
    async fn send_batch(&self, batch: CandidateBatch, stagger: Duration) {
        let CandidateBatch {
            generation,
            target,
            candidates,
        } = batch;
        let total = candidates.len();
        let mut pending = candidates.into_iter().enumerate();

        while let Some((index, candidate)) = pending.next() {
            if index > 0 {
                tokio::time::sleep(stagger).await;
            }
            if generation != self.current_generation() {
                debug!("Dropping candidates of a replaced peer connection");
                return;
            }
            if let Err(e) = self.signaling.send_ice_candidate(target.as_deref(), &candidate) {
                if !e.is_retryable() {
                    warn!("Dropping local candidate: {}", e);
                    continue;
                }
                debug!("Candidate send interrupted: {}", e);
                let mut unsent = vec![candidate];
                unsent.extend(pending.by_ref().map(|(_, c)| c));
                let _ = self
                    .dispatch_tx
                    .send(ControllerEvent::CandidatesUnsent { generation, unsent });
                return;
            }
        }
        debug!("Sent {} local candidates", total);
    }

    // ------------------------------------------------------------------
    // Monitors
    // ------------------------------------------------------------------

    /// Send a heartbeat, or force a reconnect after a silent partition
    ///
    /// A heartbeat that is accepted by the data channel counts as activity,
    /// as does one received from the remote side. The timeout therefore only
    /// fires while the transport reports connected but the channel is not
    /// open or refuses sends; it does not detect one-way media loss.
    async fn on_heartbeat_tick(&self, core: &mut Core, epoch: u64) {
        if !core.monitors.is_current(epoch) || core.state != SessionState::Connected {
            return;
        }

        let now = Instant::now();
        if core
            .heartbeat
            .is_timed_out(now, core.state, core.transport_state)
        {
            warn!(
                silence = ?core.heartbeat.silence(now),
                "No heartbeat activity while transport reports connected, forcing reconnection"
            );
            if self.transition(core, Transition::HeartbeatTimeout) {
                self.enter_disconnected(core);
            }
            return;
        }

        let Some(channel) = core.data_channel.clone() else {
            return;
        };
        if !channel.is_open() {
            return;
        }

        let text = match ChannelMessage::heartbeat_now().to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode heartbeat: {}", e);
                return;
            }
        };
        match channel.send_text(&text).await {
            Ok(()) => core.heartbeat.touch(now),
            Err(e) => debug!("Heartbeat not sent: {}", e),
        }
    }

    async fn on_quality_tick(&self, core: &mut Core, epoch: u64) {
        if !core.monitors.is_current(epoch) || core.state != SessionState::Connected {
            return;
        }
        let Some(peer) = core.peer.clone() else {
            return;
        };

        let sample = match peer.stats().await {
            Ok(sample) => sample,
            Err(e) => {
                debug!("Stats unavailable: {}", e);
                return;
            }
        };
        self.emit(SessionEvent::Metrics(sample.clone()));

        let changed = core.quality.observe(&sample);
        if !self.config.options.adaptive_quality_enabled {
            return;
        }
        if let Some(tier) = changed {
            if let Err(e) = peer.apply_video_preset(&tier.preset()).await {
                warn!("Failed to apply {} video preset: {}", tier, e);
                return;
            }
            self.emit(SessionEvent::QualityChanged(tier));
        }
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    async fn toggle(&self, kind: TrackKind, enabled: bool) {
        let mut core = self.core.lock().await;
        match kind {
            TrackKind::Audio => core.audio_enabled = enabled,
            TrackKind::Video => core.video_enabled = enabled,
        }
        if let Some(local) = core.media.local() {
            local.set_enabled(kind, enabled);
        }
        info!("Local {} {}", kind, if enabled { "enabled" } else { "disabled" });
    }
}

/// Single consumer of every controller event
async fn dispatch_loop(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<ControllerEvent>,
    mut peer_events: mpsc::UnboundedReceiver<PeerEventEnvelope>,
) {
    loop {
        let next = tokio::select! {
            Some(event) = events.recv() => Err(event),
            Some(envelope) = peer_events.recv() => Ok(envelope),
            else => break,
        };

        if let Err(ControllerEvent::Shutdown) = next {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match next {
            Ok(envelope) => inner.handle_peer(envelope).await,
            Err(event) => inner.handle(event).await,
        }
    }
    debug!("Dispatch loop terminated");
}

/// Sends candidate batches one at a time so batches never interleave
async fn candidate_outbox(
    inner: Weak<Inner>,
    mut batches: mpsc::UnboundedReceiver<CandidateBatch>,
    stagger: Duration,
) {
    while let Some(batch) = batches.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.send_batch(batch, stagger).await;
    }
    debug!("Candidate outbox terminated");
}
