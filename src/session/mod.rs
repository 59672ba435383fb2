//! Session client: lifecycle API, voice-chat state machine, event routing.
//!
//! Owns at most one transport connection and one audio engine at a time.
//! Inbound audio deltas flow to the engine's playback queue; captured
//! microphone frames flow out through the connection; every decoded server
//! event is republished to subscribers in addition to internal handling.
//!
//! Invalid lifecycle calls (pause while idle, resume while active, ...) log
//! a warning and leave state unchanged. They never fail: races between user
//! taps and async connects are expected in a live voice UI.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::audio::{
    AudioBackend, AudioEngine, AudioError, CapturePolicy, CpalBackend, EngineEvent, EngineState,
    HalfDuplexPolicy,
};
use crate::events::{ClientEvent, ServerEvent};
use crate::transport::{
    Connection, ConnectionState, PeerConnection, SocketConnection, TransportError, TransportKind,
};

/// Default socket endpoint; the model is appended as a query parameter.
const DEFAULT_SOCKET_ENDPOINT: &str = "wss://api.openai.com/v1/realtime";
/// Default SDP signaling endpoint for the peer transport.
const DEFAULT_SIGNALING_ENDPOINT: &str = "https://api.openai.com/v1/realtime";

/// Capacity of the server-event fan-out channel.
const EVENT_FANOUT_CAPACITY: usize = 256;

// =============================================================================
// Error Types
// =============================================================================

/// Errors surfaced by the session API.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Credential or model missing/empty; rejected before any state change
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Audio engine failure
    #[error(transparent)]
    Audio(#[from] AudioError),
}

// =============================================================================
// State and configuration
// =============================================================================

/// Externally visible voice-chat state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VoiceChatState {
    /// No session
    #[default]
    Idle,
    /// Transport handshake in progress
    Connecting,
    /// Session live, capture flowing
    Active,
    /// Session live, capture paused and outbound audio muted
    Paused,
    /// Terminal until the caller ends the session and starts a new one
    Error(String),
}

impl fmt::Display for VoiceChatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceChatState::Idle => write!(f, "Idle"),
            VoiceChatState::Connecting => write!(f, "Connecting"),
            VoiceChatState::Active => write!(f, "Active"),
            VoiceChatState::Paused => write!(f, "Paused"),
            VoiceChatState::Error(msg) => write!(f, "Error: {msg}"),
        }
    }
}

/// Immutable per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bearer credential for the remote service
    pub credential: String,
    /// Model identifier
    pub model: String,
    /// Which transport to open
    pub transport: TransportKind,
    /// Endpoint override (socket URL or signaling URL)
    pub endpoint: String,
    /// Abort a connect stuck in `Connecting` after this long. `None` leaves
    /// the session in `Connecting` until the caller ends it.
    pub connect_timeout: Option<Duration>,
}

impl SessionConfig {
    /// Configuration with the default endpoint for the chosen transport.
    pub fn new(
        credential: impl Into<String>,
        model: impl Into<String>,
        transport: TransportKind,
    ) -> Self {
        let endpoint = match transport {
            TransportKind::Socket => DEFAULT_SOCKET_ENDPOINT,
            TransportKind::Peer => DEFAULT_SIGNALING_ENDPOINT,
        };
        Self {
            credential: credential.into(),
            model: model.into(),
            transport,
            endpoint: endpoint.to_string(),
            connect_timeout: None,
        }
    }
}

/// Items republished to session subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A decoded server event, fanned out verbatim
    Event(ServerEvent),
    /// A receive-path failure (decode error, transport error)
    Failure(String),
}

// =============================================================================
// Connection factory
// =============================================================================

/// Creates the transport connection for a session. Tests inject fakes.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection for the given configuration.
    async fn connect(&self, config: &SessionConfig) -> Result<Arc<dyn Connection>, TransportError>;
}

/// Maps [`TransportKind`] to the two real transports.
pub struct DefaultConnectionFactory;

#[async_trait]
impl ConnectionFactory for DefaultConnectionFactory {
    async fn connect(&self, config: &SessionConfig) -> Result<Arc<dyn Connection>, TransportError> {
        let mut url = Url::parse(&config.endpoint)
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid endpoint: {e}")))?;
        url.query_pairs_mut().append_pair("model", &config.model);
        match config.transport {
            TransportKind::Socket => {
                let connection = SocketConnection::connect(url.as_str(), &config.credential).await?;
                Ok(Arc::new(connection))
            }
            TransportKind::Peer => {
                let connection = PeerConnection::connect(url.as_str(), &config.credential).await?;
                Ok(Arc::new(connection))
            }
        }
    }
}

// =============================================================================
// Session client
// =============================================================================

struct ActiveSession {
    id: String,
    connection: Arc<dyn Connection>,
    engine: Arc<AudioEngine>,
    tasks: Vec<JoinHandle<()>>,
}

struct SessionInner {
    factory: Arc<dyn ConnectionFactory>,
    backend: Arc<dyn AudioBackend>,
    policy: Arc<dyn CapturePolicy>,
    state_tx: watch::Sender<VoiceChatState>,
    state_rx: watch::Receiver<VoiceChatState>,
    events_tx: broadcast::Sender<SessionEvent>,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionInner {
    fn set_state(&self, state: VoiceChatState) {
        if *self.state_rx.borrow() != state {
            info!(state = %state, "voice chat state");
            let _ = self.state_tx.send(state);
        }
    }

    fn current_state(&self) -> VoiceChatState {
        self.state_rx.borrow().clone()
    }

    fn publish(&self, event: SessionEvent) {
        // Err just means no subscriber is listening right now.
        let _ = self.events_tx.send(event);
    }
}

/// The session client. Cheap to clone; clones share one session slot.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<SessionInner>,
}

impl SessionClient {
    /// Client over the real transports and hardware audio.
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(DefaultConnectionFactory),
            Arc::new(CpalBackend::new()),
            Arc::new(HalfDuplexPolicy::new()),
        )
    }

    /// Client with injected transport factory, audio backend, and capture
    /// policy.
    pub fn with_parts(
        factory: Arc<dyn ConnectionFactory>,
        backend: Arc<dyn AudioBackend>,
        policy: Arc<dyn CapturePolicy>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(VoiceChatState::Idle);
        let (events_tx, _) = broadcast::channel(EVENT_FANOUT_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                factory,
                backend,
                policy,
                state_tx,
                state_rx,
                events_tx,
                active: Mutex::new(None),
            }),
        }
    }

    /// Observe voice-chat state changes.
    pub fn state(&self) -> watch::Receiver<VoiceChatState> {
        self.inner.state_rx.clone()
    }

    /// Subscribe to the read-only fan-out of every decoded server event.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Start a session: validate the configuration, open the transport, and
    /// wire up routing. Returns once subscriptions are in place; readiness
    /// is observed on the state watch.
    pub async fn start_session(&self, config: SessionConfig) -> Result<(), SessionError> {
        if config.credential.trim().is_empty() {
            return Err(SessionError::InvalidConfiguration("empty credential".to_string()));
        }
        if config.model.trim().is_empty() {
            return Err(SessionError::InvalidConfiguration("empty model".to_string()));
        }

        let mut active = self.inner.active.lock().await;
        if self.inner.current_state() != VoiceChatState::Idle {
            warn!(state = %self.inner.current_state(), "start_session ignored: session already in progress");
            return Ok(());
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(session_id = %session_id, transport = %config.transport, model = %config.model, "starting session");
        self.inner.set_state(VoiceChatState::Connecting);

        let connection = match self.inner.factory.connect(&config).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "transport connect failed");
                self.inner.set_state(VoiceChatState::Error(e.to_string()));
                return Err(e.into());
            }
        };

        let (engine, engine_rx) =
            AudioEngine::new(Arc::clone(&self.inner.backend), Arc::clone(&self.inner.policy));
        let engine = Arc::new(engine);

        let tasks = vec![
            tokio::spawn(run_state_watch(
                Arc::clone(&self.inner),
                Arc::clone(&connection),
                Arc::clone(&engine),
                config.connect_timeout,
            )),
            tokio::spawn(run_event_router(
                Arc::clone(&self.inner),
                Arc::clone(&connection),
                Arc::clone(&engine),
            )),
            tokio::spawn(run_capture_router(
                Arc::clone(&self.inner),
                Arc::clone(&connection),
                Arc::clone(&engine),
                engine_rx,
            )),
        ];

        *active = Some(ActiveSession { id: session_id, connection, engine, tasks });
        Ok(())
    }

    /// Pause capture and mute outbound audio. Valid from `Active` only.
    pub async fn pause_chat(&self) {
        let active = self.inner.active.lock().await;
        if self.inner.current_state() != VoiceChatState::Active {
            warn!(state = %self.inner.current_state(), "pause_chat ignored");
            return;
        }
        if let Some(session) = active.as_ref() {
            session.engine.pause_recording();
            session.connection.mute();
            self.inner.set_state(VoiceChatState::Paused);
        }
    }

    /// Resume capture and unmute outbound audio. Valid from `Paused` only.
    pub async fn resume_chat(&self) {
        let active = self.inner.active.lock().await;
        if self.inner.current_state() != VoiceChatState::Paused {
            warn!(state = %self.inner.current_state(), "resume_chat ignored");
            return;
        }
        if let Some(session) = active.as_ref() {
            session.engine.resume_recording();
            session.connection.unmute();
            self.inner.set_state(VoiceChatState::Active);
        }
    }

    /// Send one client event through the active connection.
    pub async fn send(&self, event: ClientEvent) -> Result<(), SessionError> {
        let active = self.inner.active.lock().await;
        match active.as_ref() {
            Some(session) => Ok(session.connection.send(event).await?),
            None => Err(SessionError::Transport(TransportError::NotConnected)),
        }
    }

    /// Stop the engine, close the connection, and return to `Idle`. Callable
    /// from any state.
    pub async fn end_session(&self) {
        let mut active = self.inner.active.lock().await;
        if let Some(session) = active.take() {
            info!(session_id = %session.id, "ending session");
            for task in &session.tasks {
                task.abort();
            }
            if let Err(e) = session.engine.stop() {
                warn!(error = %e, "engine stop failed during teardown");
            }
            session.connection.close().await;
        }
        self.inner.set_state(VoiceChatState::Idle);
    }

    /// End the chat. From `Connecting` this returns to `Idle` without
    /// touching the not-yet-ready connection; from `Idle` it is a no-op;
    /// otherwise it behaves like [`end_session`](Self::end_session).
    pub async fn end_chat(&self) {
        match self.inner.current_state() {
            VoiceChatState::Idle => {
                debug!("end_chat ignored: already idle");
            }
            VoiceChatState::Connecting => {
                let mut active = self.inner.active.lock().await;
                if let Some(session) = active.take() {
                    for task in &session.tasks {
                        task.abort();
                    }
                    // Dropping the connection lets its receive loop wind
                    // down on its own.
                }
                self.inner.set_state(VoiceChatState::Idle);
            }
            _ => self.end_session().await,
        }
    }
}

impl Default for SessionClient {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Routing tasks
// =============================================================================

/// Follow the connection's state watch: start the engine on `Connected`,
/// escalate transport errors, and enforce the optional connect timeout.
async fn run_state_watch(
    inner: Arc<SessionInner>,
    connection: Arc<dyn Connection>,
    engine: Arc<AudioEngine>,
    connect_timeout: Option<Duration>,
) {
    let mut rx = connection.state();

    if let Some(limit) = connect_timeout {
        let wait_connected = async {
            while *rx.borrow() != ConnectionState::Connected {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(limit, wait_connected).await.is_err()
            && inner.current_state() == VoiceChatState::Connecting
        {
            warn!(timeout_ms = limit.as_millis() as u64, "connection attempt timed out");
            inner.set_state(VoiceChatState::Error("connection attempt timed out".to_string()));
            connection.close().await;
            return;
        }
    }

    loop {
        let connection_state = rx.borrow_and_update().clone();
        match connection_state {
            ConnectionState::Connected => {
                if inner.current_state() == VoiceChatState::Connecting {
                    match engine.setup() {
                        Ok(()) => {
                            engine.start_recording();
                            inner.set_state(VoiceChatState::Active);
                        }
                        Err(e) => {
                            error!(error = %e, "audio engine setup failed");
                            inner.set_state(VoiceChatState::Error(e.to_string()));
                            let _ = engine.stop();
                        }
                    }
                }
            }
            ConnectionState::Error(msg) => {
                inner.set_state(VoiceChatState::Error(msg));
                let _ = engine.stop();
            }
            ConnectionState::Disconnected => {
                if inner.current_state() != VoiceChatState::Idle {
                    let _ = engine.stop();
                    inner.set_state(VoiceChatState::Error("connection disconnected".to_string()));
                }
                break;
            }
            ConnectionState::Connecting => {}
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Route inbound server events: republish everything, feed audio deltas to
/// the engine, escalate error events, and interrupt playback when the remote
/// hears the user start speaking.
async fn run_event_router(
    inner: Arc<SessionInner>,
    connection: Arc<dyn Connection>,
    engine: Arc<AudioEngine>,
) {
    let mut events = connection.events();
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => {
                inner.publish(SessionEvent::Event(event.clone()));
                match event {
                    ServerEvent::Error { error } => {
                        error!(message = %error.message, "server reported an error");
                        inner.set_state(VoiceChatState::Error(error.message));
                        let _ = engine.stop();
                    }
                    ServerEvent::AudioDelta { item_id, delta, .. } => {
                        match ServerEvent::decode_audio_delta(&delta) {
                            Ok(payload) => engine.play_audio(Bytes::from(payload), item_id),
                            Err(e) => {
                                warn!(item_id = %item_id, error = %e, "skipping undecodable audio delta");
                            }
                        }
                    }
                    ServerEvent::SpeechStarted { .. } => {
                        truncate_interrupted_playback(&connection, &engine).await;
                    }
                    _ => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "receive-path failure");
                inner.publish(SessionEvent::Failure(e.to_string()));
            }
        }
    }
    debug!("event stream completed");
}

/// The user talked over the assistant: stop rendering, drop the queue, and
/// tell the server how much of the interrupted item was actually heard.
async fn truncate_interrupted_playback(connection: &Arc<dyn Connection>, engine: &Arc<AudioEngine>) {
    let Some(item_id) = engine.current_item() else {
        return;
    };
    let heard_ms = engine.playback_position_ms();
    engine.interrupt();
    // No timing available means we cannot claim a truncation point.
    if let Some(audio_end_ms) = heard_ms {
        let truncate = ClientEvent::ConversationItemTruncate {
            item_id,
            content_index: 0,
            audio_end_ms: audio_end_ms as u32,
        };
        if let Err(e) = connection.send(truncate).await {
            warn!(error = %e, "failed to send truncate for interrupted item");
        }
    }
}

/// Forward captured audio outward and map engine failures into session state.
async fn run_capture_router(
    inner: Arc<SessionInner>,
    connection: Arc<dyn Connection>,
    engine: Arc<AudioEngine>,
    mut engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
) {
    let state = connection.state();
    while let Some(event) = engine_rx.recv().await {
        match event {
            EngineEvent::Captured(audio) => {
                if *state.borrow() != ConnectionState::Connected {
                    // Dropped, not an error: the connection went away under
                    // us, so stop feeding the engine.
                    warn!("dropping captured audio: connection not ready");
                    let _ = engine.stop();
                    break;
                }
                if let Err(e) = connection.send_audio(audio).await {
                    warn!(error = %e, "outbound audio send failed");
                    let _ = engine.stop();
                    break;
                }
            }
            EngineEvent::State(EngineState::Error(msg)) => {
                error!(message = %msg, "audio engine error");
                inner.set_state(VoiceChatState::Error(msg));
                let _ = engine.stop();
            }
            EngineEvent::State(state) => {
                debug!(state = ?state, "engine state");
            }
        }
    }
    debug!("capture router exited");
}
