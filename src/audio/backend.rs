//! Hardware audio abstraction.
//!
//! The engine talks to hardware through [`AudioBackend`], so tests inject a
//! fake and the production path uses [`CpalBackend`]. cpal streams are not
//! `Send`, so the cpal backend parks them on a dedicated audio thread and
//! forwards lifecycle commands over a channel; render state lives in a shared
//! structure the output callback and the engine both reach.

use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::convert::{AudioFormat, ConversionError, SampleBuffer};

/// Errors produced by the audio engine and its hardware backend.
#[derive(Debug, Error)]
pub enum AudioError {
    /// Configuring the hardware session failed
    #[error("audio engine setup failed: {0}")]
    Setup(String),

    /// The backend device or stream failed
    #[error("audio backend error: {0}")]
    Backend(String),

    /// An operation needs a configured engine
    #[error("audio engine is not set up")]
    NotSetUp,

    /// Sample conversion failed
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// Capture/playback hardware primitives.
///
/// One backend instance serves one engine. `begin_render` schedules a single
/// buffer and resolves the returned receiver when the buffer has been fully
/// rendered (or dropped without a value if rendering was stopped early).
pub trait AudioBackend: Send + Sync {
    /// Configure the hardware for simultaneous capture and playback.
    fn configure(&self, capture: AudioFormat, playback: AudioFormat) -> Result<(), AudioError>;

    /// Start delivering captured frames to `sink`. Frames arrive in the
    /// configured capture format.
    fn start_capture(&self, sink: mpsc::UnboundedSender<SampleBuffer>) -> Result<(), AudioError>;

    /// Stop delivering captured frames.
    fn stop_capture(&self) -> Result<(), AudioError>;

    /// Schedule one buffer for rendering. The buffer must already be in the
    /// configured playback format.
    fn begin_render(&self, buffer: SampleBuffer) -> Result<oneshot::Receiver<()>, AudioError>;

    /// Discard any scheduled audio and stop rendering.
    fn stop_playback(&self) -> Result<(), AudioError>;

    /// Whether a buffer is currently being rendered.
    fn is_rendering(&self) -> bool;

    /// Elapsed rendered time of the current buffer, if timing is available.
    fn playback_position(&self) -> Option<Duration>;

    /// Release the hardware session.
    fn shutdown(&self) -> Result<(), AudioError>;
}

// ============================================================================
// cpal backend
// ============================================================================

/// Render state shared between the output callback and the engine side.
struct RenderState {
    samples: Vec<f32>,
    pos: usize,
    done: Option<oneshot::Sender<()>>,
    sample_rate: u32,
}

impl RenderState {
    fn empty() -> Self {
        Self { samples: Vec::new(), pos: 0, done: None, sample_rate: 0 }
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.pos = 0;
        // Dropping the sender wakes a waiting drain loop with Err, which it
        // treats as "stopped".
        self.done = None;
    }
}

enum Command {
    Configure {
        capture: AudioFormat,
        playback: AudioFormat,
        reply: std_mpsc::Sender<Result<(), AudioError>>,
    },
    StartCapture {
        sink: mpsc::UnboundedSender<SampleBuffer>,
        reply: std_mpsc::Sender<Result<(), AudioError>>,
    },
    StopCapture {
        reply: std_mpsc::Sender<Result<(), AudioError>>,
    },
    Shutdown,
}

/// Production backend over the default cpal host devices.
pub struct CpalBackend {
    commands: std_mpsc::Sender<Command>,
    render: Arc<Mutex<RenderState>>,
}

impl CpalBackend {
    /// Spawn the audio thread and return a handle to it.
    pub fn new() -> Self {
        let (tx, rx) = std_mpsc::channel();
        let render = Arc::new(Mutex::new(RenderState::empty()));
        let thread_render = Arc::clone(&render);
        std::thread::Builder::new()
            .name("voxlink-audio".to_string())
            .spawn(move || audio_thread(rx, thread_render))
            .ok();
        Self { commands: tx, render }
    }

    fn roundtrip(
        &self,
        build: impl FnOnce(std_mpsc::Sender<Result<(), AudioError>>) -> Command,
    ) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| AudioError::Backend("audio thread is gone".to_string()))?;
        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| AudioError::Backend("audio thread did not respond".to_string()))?
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl AudioBackend for CpalBackend {
    fn configure(&self, capture: AudioFormat, playback: AudioFormat) -> Result<(), AudioError> {
        self.roundtrip(|reply| Command::Configure { capture, playback, reply })
    }

    fn start_capture(&self, sink: mpsc::UnboundedSender<SampleBuffer>) -> Result<(), AudioError> {
        self.roundtrip(|reply| Command::StartCapture { sink, reply })
    }

    fn stop_capture(&self) -> Result<(), AudioError> {
        self.roundtrip(|reply| Command::StopCapture { reply })
    }

    fn begin_render(&self, buffer: SampleBuffer) -> Result<oneshot::Receiver<()>, AudioError> {
        let samples = match buffer {
            SampleBuffer::F32(samples) => samples,
            SampleBuffer::Pcm16(_) => {
                return Err(AudioError::Backend(
                    "render buffer must be f32 in the playback format".to_string(),
                ));
            }
        };
        let (tx, rx) = oneshot::channel();
        let mut state = self.render.lock();
        if state.sample_rate == 0 {
            return Err(AudioError::NotSetUp);
        }
        state.samples = samples;
        state.pos = 0;
        state.done = Some(tx);
        Ok(rx)
    }

    fn stop_playback(&self) -> Result<(), AudioError> {
        self.render.lock().clear();
        Ok(())
    }

    fn is_rendering(&self) -> bool {
        let state = self.render.lock();
        state.done.is_some() && state.pos < state.samples.len()
    }

    fn playback_position(&self) -> Option<Duration> {
        let state = self.render.lock();
        if state.done.is_some() && state.sample_rate > 0 {
            Some(Duration::from_secs_f64(state.pos as f64 / state.sample_rate as f64))
        } else {
            None
        }
    }

    fn shutdown(&self) -> Result<(), AudioError> {
        self.render.lock().clear();
        self.commands
            .send(Command::Shutdown)
            .map_err(|_| AudioError::Backend("audio thread is gone".to_string()))
    }
}

/// The audio thread owns the cpal streams; they are not `Send` and must be
/// built, started, and dropped here.
fn audio_thread(commands: std_mpsc::Receiver<Command>, render: Arc<Mutex<RenderState>>) {
    let mut input_stream: Option<cpal::Stream> = None;
    let mut output_stream: Option<cpal::Stream> = None;
    let mut capture_format: Option<AudioFormat> = None;

    while let Ok(command) = commands.recv() {
        match command {
            Command::Configure { capture, playback, reply } => {
                let result = build_output(&render, playback).map(|stream| {
                    output_stream = Some(stream);
                    capture_format = Some(capture);
                    render.lock().sample_rate = playback.sample_rate;
                });
                if let Err(ref e) = result {
                    error!(error = %e, "failed to configure audio output");
                }
                let _ = reply.send(result);
            }
            Command::StartCapture { sink, reply } => {
                let result = match capture_format {
                    None => Err(AudioError::NotSetUp),
                    Some(format) => build_input(format, sink).map(|stream| {
                        input_stream = Some(stream);
                    }),
                };
                if let Err(ref e) = result {
                    error!(error = %e, "failed to start audio capture");
                }
                let _ = reply.send(result);
            }
            Command::StopCapture { reply } => {
                input_stream = None;
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown => break,
        }
    }

    drop(input_stream);
    drop(output_stream);
    render.lock().clear();
    debug!("audio thread exited");
}

fn build_input(
    format: AudioFormat,
    sink: mpsc::UnboundedSender<SampleBuffer>,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::Setup("no input device available".to_string()))?;
    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = sink.send(SampleBuffer::F32(data.to_vec()));
            },
            |err| warn!(error = %err, "input stream error"),
            None,
        )
        .map_err(|e| AudioError::Setup(e.to_string()))?;
    stream.play().map_err(|e| AudioError::Backend(e.to_string()))?;
    info!(rate = format.sample_rate, "audio capture started");
    Ok(stream)
}

fn build_output(
    render: &Arc<Mutex<RenderState>>,
    format: AudioFormat,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Setup("no output device available".to_string()))?;
    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let shared = Arc::clone(render);
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut state = shared.lock();
                for slot in data.iter_mut() {
                    if state.pos < state.samples.len() {
                        *slot = state.samples[state.pos];
                        state.pos += 1;
                    } else {
                        *slot = 0.0;
                    }
                }
                if state.pos >= state.samples.len() {
                    if let Some(done) = state.done.take() {
                        let _ = done.send(());
                        state.samples.clear();
                        state.pos = 0;
                    }
                }
            },
            |err| warn!(error = %err, "output stream error"),
            None,
        )
        .map_err(|e| AudioError::Setup(e.to_string()))?;
    stream.play().map_err(|e| AudioError::Backend(e.to_string()))?;
    info!(rate = format.sample_rate, "audio playback started");
    Ok(stream)
}
