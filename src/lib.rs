//! voxlink: realtime duplex voice session client.
//!
//! Establishes a session with a remote conversational-AI service over one of
//! two transports (WebSocket message socket, or WebRTC data channel with an
//! Opus media track), exchanges tagged JSON events, and pumps microphone
//! audio out / remote audio in with strict playback ordering.
//!
//! # Example
//!
//! ```rust,ignore
//! use voxlink::session::{SessionClient, SessionConfig};
//! use voxlink::transport::TransportKind;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SessionClient::new();
//!     let mut state = client.state();
//!     let mut events = client.events();
//!
//!     client
//!         .start_session(SessionConfig::new("sk-...", "model-x", TransportKind::Socket))
//!         .await?;
//!
//!     while events.recv().await.is_ok() {
//!         // handle transcripts, audio, errors...
//!     }
//!
//!     client.end_session().await;
//!     let _ = state.changed().await;
//!     Ok(())
//! }
//! ```

pub mod audio;
pub mod events;
pub mod session;
pub mod transport;

// Re-export the session surface for convenience
pub use session::{
    ConnectionFactory, DefaultConnectionFactory, SessionClient, SessionConfig, SessionError,
    SessionEvent, VoiceChatState,
};
pub use transport::{Connection, ConnectionState, TransportError, TransportKind};
