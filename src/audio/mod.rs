//! Audio capture, playback, and sample conversion.

pub mod backend;
pub mod convert;
pub mod engine;

pub use backend::{AudioBackend, AudioError, CpalBackend};
pub use convert::{AudioFormat, ConversionError, SampleBuffer, SampleKind};
pub use engine::{
    AudioEngine, CapturePolicy, EngineEvent, EngineState, HalfDuplexPolicy,
    CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE,
};
