//! Wire event model for the realtime voice protocol.
//!
//! All events are JSON objects with a snake_case `type` tag, exchanged over
//! whichever transport the session was opened with. Client events flow out,
//! server events flow in; audio payloads inside control events are
//! base64-encoded PCM16.
//!
//! # Protocol Overview
//!
//! Client events (sent to server):
//! - session.update - Update session configuration
//! - input_audio_buffer.append - Append audio to the input buffer
//! - input_audio_buffer.commit - Commit the input buffer
//! - input_audio_buffer.clear - Clear the input buffer
//! - conversation.item.truncate - Truncate an already-played item
//! - response.create - Request a response
//! - response.cancel - Cancel the in-flight response
//!
//! Server events (received from server):
//! - session.created / session.updated - Session lifecycle
//! - input_audio_buffer.speech_started / speech_stopped - VAD events
//! - input_audio_buffer.committed - Buffer committed
//! - response.created / response.done - Response lifecycle
//! - response.audio.delta / response.audio.done - Audio chunks
//! - response.audio_transcript.delta / done - Transcript chunks
//! - rate_limits.updated - Quota information
//! - error - Error occurred

mod client;
mod codec;
mod server;

pub use client::{ClientEvent, SessionUpdate, TurnDetection};
pub use codec::{CodecError, decode, encode};
pub use server::{ApiError, RateLimit, ServerEvent, SessionInfo};
