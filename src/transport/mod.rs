//! Transport connections for the voice session.
//!
//! Two interchangeable transports carry the same wire events: a full-duplex
//! message socket ([`socket::SocketConnection`]) and a WebRTC peer connection
//! with a data channel for events and a media track for audio
//! ([`peer::PeerConnection`]). The session client depends only on the
//! [`Connection`] trait; callers cannot tell the transports apart from the
//! event stream.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::sync::watch;

use crate::events::{ClientEvent, CodecError, ServerEvent};

pub mod peer;
pub mod socket;

pub use peer::PeerConnection;
pub use socket::SocketConnection;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur on a transport connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to the remote service failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// SDP offer/answer signaling failed
    #[error("Signaling failed: {0}")]
    SignalingFailed(String),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// Media track error
    #[error("Media error: {0}")]
    Media(String),

    /// Operation requires a connected transport
    #[error("Not connected")]
    NotConnected,

    /// The connection has been closed
    #[error("Connection closed")]
    Closed,

    /// Wire codec failure
    #[error(transparent)]
    Codec(#[from] CodecError),
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection state, independent per connection object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Handshake in progress
    #[default]
    Connecting,
    /// Connected and ready
    Connected,
    /// Closed, locally or remotely
    Disconnected,
    /// Failed
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Error(msg) => write!(f, "Error: {msg}"),
        }
    }
}

/// Which transport to open for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Full-duplex message socket
    Socket,
    /// WebRTC peer connection with data channel and media track
    Peer,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Socket => write!(f, "socket"),
            TransportKind::Peer => write!(f, "peer"),
        }
    }
}

// =============================================================================
// Connection Trait
// =============================================================================

/// Inbound event stream of a connection. Yields decode and receive failures
/// as `Err` items and completes when the connection closes.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ServerEvent, TransportError>> + Send>>;

/// A duplex transport carrying session events.
///
/// Connections are one-shot: created per session, never reused. `send` may be
/// called from multiple producers; implementations serialize writes through a
/// single writer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one client event.
    async fn send(&self, event: ClientEvent) -> Result<(), TransportError>;

    /// Send one chunk of outbound capture audio (PCM16 at the capture rate).
    /// The socket transport wraps it into an append event; the peer transport
    /// writes it to the media track.
    async fn send_audio(&self, audio: bytes::Bytes) -> Result<(), TransportError>;

    /// Take the inbound event stream. Intended to be taken once, by the
    /// session client.
    fn events(&self) -> EventStream;

    /// Observe connection state changes.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Stop sending audio payloads. A no-op on transports that carry audio
    /// as discrete events.
    fn mute(&self);

    /// Resume sending audio payloads.
    fn unmute(&self);

    /// Close the connection, cancel its receive loop, and complete both the
    /// event and state streams.
    async fn close(&self);
}
