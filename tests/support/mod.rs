//! Shared test doubles: a scripted WebSocket server, a fake transport, and a
//! fake audio backend.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use voxlink::audio::{AudioBackend, AudioError, AudioFormat, SampleBuffer};
use voxlink::events::{ClientEvent, ServerEvent};
use voxlink::session::{ConnectionFactory, SessionConfig};
use voxlink::transport::{Connection, ConnectionState, EventStream, TransportError};

/// Install the test tracing subscriber once; honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Scripted WebSocket server
// =============================================================================

/// Accept one connection, send the scripted frames, then answer every text
/// frame received with `{"type":"pong"}` until the peer closes.
pub async fn spawn_scripted_socket(frames: Vec<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
    let addr = listener.local_addr().expect("mock server addr");

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let ws_stream = accept_async(stream).await.expect("handshake");
        let (mut write, mut read) = ws_stream.split();

        for frame in frames {
            write.send(Message::Text(frame.into())).await.expect("send scripted frame");
        }

        while let Some(Ok(message)) = read.next().await {
            match message {
                Message::Text(_) => {
                    let _ = write.send(Message::Text(r#"{"type":"pong"}"#.into())).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    format!("ws://{addr}")
}

// =============================================================================
// Fake transport
// =============================================================================

type InboundItem = Result<ServerEvent, TransportError>;

/// In-memory connection: events are injected with [`push_event`], sent
/// events and audio are recorded, state is driven with [`set_state`].
pub struct FakeConnection {
    pub sent: Mutex<Vec<ClientEvent>>,
    pub sent_audio: Mutex<Vec<Bytes>>,
    pub muted: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<InboundItem>>>,
    events_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundItem>>>,
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            sent_audio: Mutex::new(Vec::new()),
            muted: AtomicBool::new(false),
            state_tx,
            state_rx,
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Arc::new(tokio::sync::Mutex::new(events_rx)),
        })
    }

    pub fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    pub fn push_event(&self, item: InboundItem) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(item);
        }
    }

    /// Complete the event stream, as a closing transport would.
    pub fn complete(&self) {
        self.events_tx.lock().take();
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        self.sent.lock().push(event);
        Ok(())
    }

    async fn send_audio(&self, audio: Bytes) -> Result<(), TransportError> {
        if *self.state_rx.borrow() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.sent_audio.lock().push(audio);
        Ok(())
    }

    fn events(&self) -> EventStream {
        let rx = Arc::clone(&self.events_rx);
        Box::pin(async_stream::stream! {
            let mut rx = rx.lock().await;
            while let Some(item) = rx.recv().await {
                yield item;
            }
        })
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    fn unmute(&self) {
        self.muted.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.complete();
        let _ = self.state_tx.send(ConnectionState::Disconnected);
    }
}

/// Hands out one prepared [`FakeConnection`]; optionally reports `Connected`
/// as soon as it is taken.
pub struct FakeFactory {
    pub connection: Arc<FakeConnection>,
    pub auto_connect: bool,
    pub connect_calls: Mutex<Vec<SessionConfig>>,
}

impl FakeFactory {
    pub fn new(connection: Arc<FakeConnection>, auto_connect: bool) -> Arc<Self> {
        Arc::new(Self { connection, auto_connect, connect_calls: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self, config: &SessionConfig) -> Result<Arc<dyn Connection>, TransportError> {
        self.connect_calls.lock().push(config.clone());
        if self.auto_connect {
            self.connection.set_state(ConnectionState::Connected);
        }
        Ok(Arc::clone(&self.connection) as Arc<dyn Connection>)
    }
}

// =============================================================================
// Fake audio backend
// =============================================================================

/// Backend that logs renders instead of reaching hardware. The first sample
/// of each rendered chunk encodes `marker / 128.0`; renders complete after a
/// short sleep so FIFO ordering is observable.
#[derive(Default)]
pub struct FakeBackend {
    rendering: Arc<AtomicBool>,
    rendered: Arc<Mutex<Vec<u8>>>,
    capture_sink: Mutex<Option<mpsc::UnboundedSender<SampleBuffer>>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rendered_markers(&self) -> Vec<u8> {
        self.rendered.lock().clone()
    }

    /// The sink the engine registered for captured frames, once set up.
    pub fn capture_sink(&self) -> Option<mpsc::UnboundedSender<SampleBuffer>> {
        self.capture_sink.lock().clone()
    }
}

impl AudioBackend for FakeBackend {
    fn configure(&self, _: AudioFormat, _: AudioFormat) -> Result<(), AudioError> {
        Ok(())
    }

    fn start_capture(&self, sink: mpsc::UnboundedSender<SampleBuffer>) -> Result<(), AudioError> {
        *self.capture_sink.lock() = Some(sink);
        Ok(())
    }

    fn stop_capture(&self) -> Result<(), AudioError> {
        *self.capture_sink.lock() = None;
        Ok(())
    }

    fn begin_render(&self, buffer: SampleBuffer) -> Result<oneshot::Receiver<()>, AudioError> {
        let marker = match &buffer {
            SampleBuffer::F32(s) => (s.first().copied().unwrap_or(0.0) * 128.0).round() as u8,
            SampleBuffer::Pcm16(s) => (s.first().copied().unwrap_or(0) / 256) as u8,
        };
        self.rendering.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let rendered = Arc::clone(&self.rendered);
        let rendering = Arc::clone(&self.rendering);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            rendered.lock().push(marker);
            rendering.store(false, Ordering::SeqCst);
            let _ = tx.send(());
        });
        Ok(rx)
    }

    fn stop_playback(&self) -> Result<(), AudioError> {
        self.rendering.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_rendering(&self) -> bool {
        self.rendering.load(Ordering::SeqCst)
    }

    fn playback_position(&self) -> Option<Duration> {
        if self.is_rendering() { Some(Duration::from_millis(5)) } else { None }
    }

    fn shutdown(&self) -> Result<(), AudioError> {
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// A PCM16 chunk whose first sample encodes `marker` for the fake backend.
pub fn marker_chunk(marker: i16, frames: usize) -> Vec<u8> {
    let mut samples = vec![0i16; frames];
    samples[0] = marker * 256;
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
