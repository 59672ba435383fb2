//! JSON encode/decode for wire events.
//!
//! Decode failures carry the serde diagnostic (what was missing or
//! mismatched, and where) together with the raw text, and are logged before
//! being surfaced; a malformed frame is never silently dropped.

use thiserror::Error;

use super::{ClientEvent, ServerEvent};

/// Errors produced by the event codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed (programmer error; should be rare)
    #[error("failed to encode client event: {0}")]
    Encode(#[source] serde_json::Error),

    /// Deserialization failed
    #[error("failed to decode server event at line {line}, column {column}: {detail}")]
    Decode {
        /// Serde diagnostic (missing field, type mismatch, unknown tag, ...)
        detail: String,
        /// Line within the raw text
        line: usize,
        /// Column within the raw text
        column: usize,
        /// The raw frame, for forensics
        raw: String,
    },
}

/// Encode a client event to its wire form.
pub fn encode(event: &ClientEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(CodecError::Encode)
}

/// Decode a server event from its wire form.
pub fn decode(raw: &str) -> Result<ServerEvent, CodecError> {
    serde_json::from_str::<ServerEvent>(raw).map_err(|e| {
        tracing::warn!(
            detail = %e,
            line = e.line(),
            column = e.column(),
            raw,
            "failed to decode server event"
        );
        CodecError::Decode {
            detail: e.to_string(),
            line: e.line(),
            column: e.column(),
            raw: raw.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ApiError, RateLimit, SessionInfo, SessionUpdate, TurnDetection};

    fn session_info() -> SessionInfo {
        SessionInfo {
            id: "sess_1".to_string(),
            model: "model-x".to_string(),
            voice: Some("alloy".to_string()),
        }
    }

    #[test]
    fn every_client_variant_round_trips() {
        let events = vec![
            ClientEvent::SessionUpdate {
                session: SessionUpdate {
                    voice: Some("alloy".to_string()),
                    instructions: Some("be brief".to_string()),
                    input_audio_format: Some("pcm16".to_string()),
                    output_audio_format: Some("pcm16".to_string()),
                    turn_detection: Some(TurnDetection::ServerVad {
                        threshold: Some(0.5),
                        silence_duration_ms: Some(500),
                    }),
                },
            },
            ClientEvent::audio_append(&[1, 2, 3, 4]),
            ClientEvent::InputAudioBufferCommit,
            ClientEvent::InputAudioBufferClear,
            ClientEvent::ConversationItemTruncate {
                item_id: "item_1".to_string(),
                content_index: 0,
                audio_end_ms: 1200,
            },
            ClientEvent::ResponseCreate,
            ClientEvent::ResponseCancel,
        ];
        for event in events {
            let wire = encode(&event).unwrap();
            let back: ClientEvent = serde_json::from_str(&wire).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn every_server_variant_round_trips() {
        let events = vec![
            ServerEvent::Error {
                error: ApiError {
                    error_type: "server_error".to_string(),
                    code: Some("internal".to_string()),
                    message: "boom".to_string(),
                    param: None,
                    event_id: None,
                },
            },
            ServerEvent::SessionCreated { session: session_info() },
            ServerEvent::SessionUpdated { session: session_info() },
            ServerEvent::SpeechStarted { audio_start_ms: 10, item_id: "i1".to_string() },
            ServerEvent::SpeechStopped { audio_end_ms: 90, item_id: "i1".to_string() },
            ServerEvent::InputAudioBufferCommitted {
                previous_item_id: None,
                item_id: "i2".to_string(),
            },
            ServerEvent::ResponseCreated { response_id: "r1".to_string() },
            ServerEvent::AudioDelta {
                response_id: "r1".to_string(),
                item_id: "i3".to_string(),
                delta: "AAEC".to_string(),
            },
            ServerEvent::AudioDone { response_id: "r1".to_string(), item_id: "i3".to_string() },
            ServerEvent::AudioTranscriptDelta {
                response_id: "r1".to_string(),
                item_id: "i3".to_string(),
                delta: "hel".to_string(),
            },
            ServerEvent::AudioTranscriptDone {
                response_id: "r1".to_string(),
                item_id: "i3".to_string(),
                transcript: "hello".to_string(),
            },
            ServerEvent::ResponseDone { response_id: "r1".to_string() },
            ServerEvent::RateLimitsUpdated {
                rate_limits: vec![RateLimit {
                    name: "requests".to_string(),
                    limit: 100,
                    remaining: 99,
                    reset_seconds: 1.5,
                }],
            },
            ServerEvent::Pong,
        ];
        for event in events {
            let wire = serde_json::to_string(&event).unwrap();
            let back = decode(&wire).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn decode_failure_reports_position_and_raw_text() {
        let raw = r#"{"type": "response.audio.delta", "response_id": "r1"}"#;
        match decode(raw) {
            Err(CodecError::Decode { detail, raw: captured, .. }) => {
                assert!(detail.contains("item_id"), "detail was: {detail}");
                assert_eq!(captured, raw);
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn decode_failure_on_non_json() {
        assert!(decode("this is not json").is_err());
    }
}
