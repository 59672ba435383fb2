//! Capture/playback engine.
//!
//! Owns the hardware backend, the playback queue, and the capture gate.
//! Inbound chunks render strictly FIFO: one drain task pops an entry,
//! schedules it, waits for render completion, then pops the next. Captured
//! frames flow through a single consumer task that converts and forwards
//! them, so no session logic ever runs on the hardware callback thread.
//!
//! Capture at 16 kHz mono, playback at 24 kHz mono, both fixed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{AudioBackend, AudioError};
use super::convert::{self, AudioFormat, SampleBuffer};

/// Capture (send) sample rate in Hz.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Playback (receive) sample rate in Hz.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Engine lifecycle state, reported over the engine event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    /// Not set up
    Idle,
    /// Capture forwarding enabled
    Started,
    /// Capture forwarding paused; frames are discarded at the tap
    Paused,
    /// Capture forwarding re-enabled
    Resumed,
    /// Engine torn down
    Stopped,
    /// Playback interrupted and queue cleared
    Interrupted,
    /// Rendering the named item (`None` when the queue drained)
    Playing(Option<String>),
    /// Hardware or session failure
    Error(String),
}

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Lifecycle state change
    State(EngineState),
    /// One captured frame, converted to PCM16 at the capture rate
    Captured(Bytes),
}

/// Decides whether a captured frame is forwarded outward.
///
/// `locally_rendering` is true while the engine renders playback audio.
pub trait CapturePolicy: Send + Sync {
    /// Whether to forward the frame.
    fn should_forward(&self, locally_rendering: bool) -> bool;
}

/// Default policy: suppress capture while local playback renders or while
/// the caller has signalled that it is the remote's turn to speak.
#[derive(Debug, Default)]
pub struct HalfDuplexPolicy {
    remote_turn: AtomicBool,
}

impl HalfDuplexPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that the remote is (or is no longer) speaking.
    pub fn set_remote_turn(&self, on: bool) {
        self.remote_turn.store(on, Ordering::Relaxed);
    }
}

impl CapturePolicy for HalfDuplexPolicy {
    fn should_forward(&self, locally_rendering: bool) -> bool {
        !locally_rendering && !self.remote_turn.load(Ordering::Relaxed)
    }
}

struct Playback {
    queue: VecDeque<(Bytes, String)>,
    current_item: Option<String>,
    draining: bool,
}

/// The audio engine.
pub struct AudioEngine {
    backend: Arc<dyn AudioBackend>,
    policy: Arc<dyn CapturePolicy>,
    events: mpsc::UnboundedSender<EngineEvent>,
    set_up: AtomicBool,
    forwarding: Arc<AtomicBool>,
    playback: Arc<Mutex<Playback>>,
    capture_task: Mutex<Option<JoinHandle<()>>>,
}

impl AudioEngine {
    /// Create an engine over the given backend and capture policy. Returns
    /// the engine and the receiver for its event channel.
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        policy: Arc<dyn CapturePolicy>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            backend,
            policy,
            events: tx,
            set_up: AtomicBool::new(false),
            forwarding: Arc::new(AtomicBool::new(false)),
            playback: Arc::new(Mutex::new(Playback {
                queue: VecDeque::new(),
                current_item: None,
                draining: false,
            })),
            capture_task: Mutex::new(None),
        };
        (engine, rx)
    }

    /// Configure the hardware for duplex audio and start the capture
    /// consumer. Idempotent; a second call is a no-op.
    pub fn setup(&self) -> Result<(), AudioError> {
        if self.set_up.swap(true, Ordering::SeqCst) {
            debug!("audio engine already set up");
            return Ok(());
        }

        let capture_format = AudioFormat::f32(CAPTURE_SAMPLE_RATE);
        let playback_format = AudioFormat::f32(PLAYBACK_SAMPLE_RATE);
        if let Err(e) = self.backend.configure(capture_format, playback_format) {
            self.set_up.store(false, Ordering::SeqCst);
            self.emit(EngineState::Error(e.to_string()));
            return Err(e);
        }

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<SampleBuffer>();
        if let Err(e) = self.backend.start_capture(frame_tx) {
            self.set_up.store(false, Ordering::SeqCst);
            self.emit(EngineState::Error(e.to_string()));
            return Err(e);
        }

        let forwarding = Arc::clone(&self.forwarding);
        let policy = Arc::clone(&self.policy);
        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let source = AudioFormat::f32(CAPTURE_SAMPLE_RATE);
            let destination = AudioFormat::pcm16(CAPTURE_SAMPLE_RATE);
            while let Some(frame) = frame_rx.recv().await {
                if !forwarding.load(Ordering::Relaxed) {
                    continue;
                }
                if !policy.should_forward(backend.is_rendering()) {
                    continue;
                }
                match convert::convert(&frame, &source, &destination) {
                    Ok(buffer) => {
                        let bytes = Bytes::from(convert::buffer_to_bytes(&buffer));
                        if events.send(EngineEvent::Captured(bytes)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping unconvertible capture frame"),
                }
            }
            debug!("capture consumer exited");
        });
        *self.capture_task.lock() = Some(task);

        info!(
            capture_rate = CAPTURE_SAMPLE_RATE,
            playback_rate = PLAYBACK_SAMPLE_RATE,
            "audio engine set up"
        );
        Ok(())
    }

    /// Begin forwarding captured frames.
    pub fn start_recording(&self) {
        self.forwarding.store(true, Ordering::Relaxed);
        self.emit(EngineState::Started);
    }

    /// Stop forwarding captured frames. Frames are discarded, not buffered.
    pub fn pause_recording(&self) {
        self.forwarding.store(false, Ordering::Relaxed);
        self.emit(EngineState::Paused);
    }

    /// Resume forwarding captured frames.
    pub fn resume_recording(&self) {
        self.forwarding.store(true, Ordering::Relaxed);
        self.emit(EngineState::Resumed);
    }

    /// Queue one PCM16 chunk (at the playback rate) for rendering, keyed by
    /// the item it belongs to. Starts the drain loop if idle.
    pub fn play_audio(&self, data: Bytes, item_id: String) {
        let spawn = {
            let mut pb = self.playback.lock();
            pb.queue.push_back((data, item_id));
            if pb.draining {
                false
            } else {
                pb.draining = true;
                true
            }
        };
        if spawn {
            self.spawn_drain();
        }
    }

    /// Clear the playback queue and stop rendering immediately.
    pub fn interrupt(&self) {
        {
            let mut pb = self.playback.lock();
            pb.queue.clear();
            pb.current_item = None;
        }
        if let Err(e) = self.backend.stop_playback() {
            warn!(error = %e, "failed to stop playback on interrupt");
        }
        self.emit(EngineState::Interrupted);
    }

    /// Elapsed rendered time of the current item in milliseconds, or `None`
    /// when no timing is available.
    pub fn playback_position_ms(&self) -> Option<u64> {
        self.backend.playback_position().map(|d| d.as_millis() as u64)
    }

    /// The item currently rendering, if any.
    pub fn current_item(&self) -> Option<String> {
        self.playback.lock().current_item.clone()
    }

    /// Tear down capture and playback and release the hardware. Safe to call
    /// repeatedly; a stop on an engine that was never set up is a no-op.
    pub fn stop(&self) -> Result<(), AudioError> {
        if !self.set_up.swap(false, Ordering::SeqCst) {
            debug!("audio engine stop: not set up, nothing to do");
            return Ok(());
        }
        self.forwarding.store(false, Ordering::Relaxed);

        if let Some(task) = self.capture_task.lock().take() {
            task.abort();
        }
        if let Err(e) = self.backend.stop_capture() {
            warn!(error = %e, "failed to stop capture");
        }

        // Clear the queue before touching hardware so the drain loop cannot
        // schedule anything else.
        {
            let mut pb = self.playback.lock();
            pb.queue.clear();
            pb.current_item = None;
        }
        self.backend.stop_playback()?;
        if self.backend.is_rendering() {
            warn!("backend still rendering after stop, forcing reset");
            self.backend.stop_playback()?;
            if self.backend.is_rendering() {
                let e = AudioError::Backend("backend refused to stop rendering".to_string());
                error!(error = %e, "audio engine stop failed");
                self.emit(EngineState::Error(e.to_string()));
                return Err(e);
            }
        }
        self.backend.shutdown()?;

        self.emit(EngineState::Stopped);
        info!("audio engine stopped");
        Ok(())
    }

    fn emit(&self, state: EngineState) {
        let _ = self.events.send(EngineEvent::State(state));
    }

    fn spawn_drain(&self) {
        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        let playback = Arc::clone(&self.playback);
        tokio::spawn(async move {
            loop {
                let (data, item_id) = {
                    let mut pb = playback.lock();
                    match pb.queue.pop_front() {
                        Some(entry) => {
                            pb.current_item = Some(entry.1.clone());
                            entry
                        }
                        None => {
                            pb.current_item = None;
                            pb.draining = false;
                            break;
                        }
                    }
                };
                let _ = events.send(EngineEvent::State(EngineState::Playing(Some(item_id.clone()))));

                let playback_pcm = AudioFormat::pcm16(PLAYBACK_SAMPLE_RATE);
                let playback_f32 = AudioFormat::f32(PLAYBACK_SAMPLE_RATE);
                let buffer = match convert::bytes_to_buffer(&data, &playback_pcm)
                    .and_then(|b| convert::convert(&b, &playback_pcm, &playback_f32))
                {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        warn!(item_id = %item_id, error = %e, "dropping unconvertible playback chunk");
                        continue;
                    }
                };
                match backend.begin_render(buffer) {
                    Ok(done) => {
                        // Err means rendering was stopped early; keep draining,
                        // an interrupt already cleared the queue.
                        let _ = done.await;
                    }
                    Err(e) => {
                        warn!(item_id = %item_id, error = %e, "failed to schedule playback chunk");
                    }
                }
            }
            let _ = events.send(EngineEvent::State(EngineState::Playing(None)));
        });
    }
}
