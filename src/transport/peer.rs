//! Peer data-channel transport.
//!
//! A WebRTC peer connection built on sans-IO `str0m`: events ride a data
//! channel, audio rides an Opus media track. Signaling is a single HTTP
//! round trip, POSTing the local SDP offer and applying the returned answer.
//! A driver task owns the `Rtc` instance and pumps `poll_output()` /
//! `handle_input()` against one UDP socket; everything else talks to the
//! driver over channels.
//!
//! Inbound media-track audio is decoded to PCM16 and surfaced as synthetic
//! audio-delta events, so consumers see the same event stream as with the
//! socket transport.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, MutSignals, SampleRate};
use base64::prelude::*;
use bytes::Bytes;
use str0m::change::SdpAnswer;
use str0m::channel::ChannelId;
use str0m::media::{Direction, Frequency, MediaKind, MediaTime, Mid, Pt};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::events::{self, ClientEvent, ServerEvent};

use super::{Connection, ConnectionState, EventStream, TransportError};

/// Label of the data channel carrying control events.
const DATA_CHANNEL_LABEL: &str = "events";

/// Item id attached to synthetic audio deltas decoded from the media track.
const REMOTE_MEDIA_ITEM_ID: &str = "remote-media";

/// Outbound Opus frame duration: 20ms at the capture rate.
const OPUS_FRAME_SAMPLES: usize = (CAPTURE_SAMPLE_RATE as usize) / 50;

/// Maximum size of an encoded Opus frame in bytes.
const MAX_OPUS_FRAME_BYTES: usize = 4000;

/// Maximum decoded samples per channel per Opus frame (120ms at 48 kHz).
const MAX_DECODED_SAMPLES_PER_CHANNEL: usize = 5760;

/// Events queued before the data channel opens; beyond this they are dropped.
const PENDING_EVENT_LIMIT: usize = 50;

type InboundItem = Result<ServerEvent, TransportError>;

// =============================================================================
// Opus codec
// =============================================================================

/// Opus encoder/decoder pair for one direction of the media track.
pub(crate) struct OpusCodec {
    encoder: Encoder,
    decoder: Decoder,
}

impl OpusCodec {
    /// Mono codec at the given rate (must be an Opus-supported rate).
    pub(crate) fn new(sample_rate: u32) -> Result<Self, TransportError> {
        let rate = SampleRate::try_from(sample_rate as i32)
            .map_err(|e| TransportError::Media(format!("invalid Opus rate {sample_rate}: {e}")))?;
        let encoder = Encoder::new(rate, Channels::Mono, Application::Voip)
            .map_err(|e| TransportError::Media(format!("Opus encoder: {e}")))?;
        let decoder = Decoder::new(rate, Channels::Mono)
            .map_err(|e| TransportError::Media(format!("Opus decoder: {e}")))?;
        Ok(Self { encoder, decoder })
    }

    /// Encode one PCM16 frame. The frame length must be a valid Opus frame
    /// size for the configured rate.
    pub(crate) fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, TransportError> {
        let mut output = vec![0u8; MAX_OPUS_FRAME_BYTES];
        let len = self
            .encoder
            .encode(pcm, &mut output)
            .map_err(|e| TransportError::Media(format!("Opus encode: {e}")))?;
        output.truncate(len);
        Ok(output)
    }

    /// Decode one Opus frame to PCM16 at the configured rate.
    pub(crate) fn decode(&mut self, opus: &[u8]) -> Result<Vec<i16>, TransportError> {
        let mut output = vec![0i16; MAX_DECODED_SAMPLES_PER_CHANNEL];
        let packet = audiopus::packet::Packet::try_from(opus)
            .map_err(|e| TransportError::Media(format!("invalid Opus packet: {e}")))?;
        let signals = MutSignals::try_from(output.as_mut_slice())
            .map_err(|e| TransportError::Media(format!("Opus output buffer: {e}")))?;
        let decoded = self
            .decoder
            .decode(Some(packet), signals, false)
            .map_err(|e| TransportError::Media(format!("Opus decode: {e}")))?;
        output.truncate(decoded);
        Ok(output)
    }
}

// =============================================================================
// Pending event queue
// =============================================================================

/// Events written before the data channel opened, flushed in order on open.
#[derive(Default)]
struct PendingQueue {
    items: Vec<Vec<u8>>,
}

impl PendingQueue {
    /// Queue a message. Returns false (and drops it) when the queue is full.
    fn push(&mut self, message: Vec<u8>) -> bool {
        if self.items.len() >= PENDING_EVENT_LIMIT {
            return false;
        }
        self.items.push(message);
        true
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.items)
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

// =============================================================================
// Signaling
// =============================================================================

#[derive(Debug, serde::Deserialize)]
struct SdpExchangeResponse {
    sdp: String,
}

/// POST the local SDP offer to the signaling endpoint and return the answer.
///
/// The answer may come back raw (`application/sdp`) or wrapped in JSON with
/// an `sdp` field; both are accepted.
pub(crate) async fn exchange_sdp(
    client: &reqwest::Client,
    signaling_url: &str,
    credential: &str,
    offer_sdp: &str,
) -> Result<String, TransportError> {
    let response = client
        .post(signaling_url)
        .header("Authorization", format!("Bearer {credential}"))
        .header("Content-Type", "application/sdp")
        .body(offer_sdp.to_string())
        .send()
        .await
        .map_err(|e| TransportError::SignalingFailed(format!("SDP exchange request: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::SignalingFailed(format!(
            "SDP exchange returned {status}: {body}"
        )));
    }

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = response
        .text()
        .await
        .map_err(|e| TransportError::SignalingFailed(format!("SDP answer body: {e}")))?;

    if content_type.contains("application/sdp") {
        Ok(body)
    } else {
        let parsed: SdpExchangeResponse = serde_json::from_str(&body).map_err(|e| {
            TransportError::SignalingFailed(format!("SDP answer is neither SDP nor JSON: {e}"))
        })?;
        Ok(parsed.sdp)
    }
}

// =============================================================================
// Peer connection
// =============================================================================

enum OutboundItem {
    /// Encoded JSON event for the data channel
    Event(Vec<u8>),
    /// PCM16 capture audio at the capture rate, for the media track
    Audio(Bytes),
}

/// WebRTC peer connection with one SendRecv audio track and one data channel.
pub struct PeerConnection {
    outbound: mpsc::UnboundedSender<OutboundItem>,
    events_rx: Arc<Mutex<mpsc::UnboundedReceiver<InboundItem>>>,
    state_rx: watch::Receiver<ConnectionState>,
    muted: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl PeerConnection {
    /// Perform SDP signaling and start the I/O driver.
    ///
    /// Returns once the answer has been applied; readiness is observed on
    /// the state watch when ICE connectivity is established. A signaling
    /// failure tears the peer down and is returned as an error.
    pub async fn connect(signaling_url: &str, credential: &str) -> Result<Self, TransportError> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("UDP bind: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(format!("UDP local addr: {e}")))?;
        let candidate_addr = SocketAddr::new(routable_ip(), local_addr.port());

        let mut rtc = Rtc::new();
        let candidate = Candidate::host(candidate_addr, "udp")
            .map_err(|e| TransportError::ConnectionFailed(format!("host candidate: {e}")))?;
        rtc.add_local_candidate(candidate);

        let mut changes = rtc.sdp_api();
        let mid = changes.add_media(MediaKind::Audio, Direction::SendRecv, None, None);
        let channel_id = changes.add_channel(DATA_CHANNEL_LABEL.to_string());
        let (offer, pending) = changes
            .apply()
            .ok_or_else(|| TransportError::ConnectionFailed("empty SDP offer".to_string()))?;
        debug!(%mid, ?channel_id, "generated local SDP offer");

        let http = reqwest::Client::new();
        let answer_sdp = match exchange_sdp(&http, signaling_url, credential, &offer.to_sdp_string())
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                rtc.disconnect();
                let _ = state_tx.send(ConnectionState::Error(e.to_string()));
                return Err(e);
            }
        };
        let answer = SdpAnswer::from_sdp_string(&answer_sdp).map_err(|e| {
            rtc.disconnect();
            let _ = state_tx.send(ConnectionState::Error(e.to_string()));
            TransportError::SignalingFailed(format!("parse SDP answer: {e}"))
        })?;
        rtc.sdp_api().accept_answer(pending, answer).map_err(|e| {
            let _ = state_tx.send(ConnectionState::Error(e.to_string()));
            TransportError::SignalingFailed(format!("apply SDP answer: {e}"))
        })?;
        info!(%mid, "SDP handshake complete");

        let (pt, clock_rate) = {
            let writer = rtc
                .writer(mid)
                .ok_or_else(|| TransportError::Media("no audio writer after answer".to_string()))?;
            let params = writer.payload_params().next().ok_or_else(|| {
                TransportError::Media("no audio payload type negotiated".to_string())
            })?;
            (params.pt(), params.spec().clock_rate)
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let muted = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        tokio::spawn(drive(
            rtc,
            socket,
            DriverContext {
                mid,
                channel_id,
                pt,
                clock_rate,
                events_tx,
                state_tx,
                cancel: cancel.clone(),
            },
            outbound_rx,
        ));

        Ok(Self {
            outbound: outbound_tx,
            events_rx: Arc::new(Mutex::new(events_rx)),
            state_rx,
            muted,
            cancel,
        })
    }
}

#[async_trait]
impl Connection for PeerConnection {
    async fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        let text = events::encode(&event)?;
        self.outbound
            .send(OutboundItem::Event(text.into_bytes()))
            .map_err(|_| TransportError::Closed)
    }

    async fn send_audio(&self, audio: Bytes) -> Result<(), TransportError> {
        // True no-payload mute: frames never reach the media track.
        if self.muted.load(Ordering::Relaxed) {
            return Ok(());
        }
        if *self.state_rx.borrow() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(OutboundItem::Audio(audio))
            .map_err(|_| TransportError::Closed)
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
        self.muted.store(true, Ordering::Relaxed);
        debug!("media track muted");
    }

    fn unmute(&self) {
        self.muted.store(false, Ordering::Relaxed);
        debug!("media track unmuted");
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

/// Pick an IP other peers can reach for the host candidate. The probe never
/// sends a packet; it only asks the OS for the route's source address.
fn routable_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

// =============================================================================
// Driver
// =============================================================================

struct DriverContext {
    mid: Mid,
    channel_id: ChannelId,
    pt: Pt,
    clock_rate: Frequency,
    events_tx: mpsc::UnboundedSender<InboundItem>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

/// Pump the sans-IO `Rtc` against the UDP socket until it dies.
async fn drive(
    mut rtc: Rtc,
    socket: UdpSocket,
    ctx: DriverContext,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundItem>,
) {
    let mut encoder = match OpusCodec::new(CAPTURE_SAMPLE_RATE) {
        Ok(codec) => codec,
        Err(e) => {
            error!(error = %e, "failed to create Opus encoder");
            let _ = ctx.state_tx.send(ConnectionState::Error(e.to_string()));
            return;
        }
    };
    let mut decoder = match OpusCodec::new(PLAYBACK_SAMPLE_RATE) {
        Ok(codec) => codec,
        Err(e) => {
            error!(error = %e, "failed to create Opus decoder");
            let _ = ctx.state_tx.send(ConnectionState::Error(e.to_string()));
            return;
        }
    };

    let local_addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = ctx.state_tx.send(ConnectionState::Error(e.to_string()));
            return;
        }
    };

    let mut pending = PendingQueue::default();
    let mut dc_open = false;
    let mut pcm_accum: Vec<i16> = Vec::new();
    let mut rtp_offset: u64 = 0;
    let mut buf = vec![0u8; 2000];

    loop {
        // Drain everything the Rtc wants to do before waiting for input.
        let deadline = loop {
            match rtc.poll_output() {
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = socket.send_to(&transmit.contents, transmit.destination).await {
                        warn!(error = %e, "UDP send failed");
                    }
                }
                Ok(Output::Timeout(deadline)) => break deadline,
                Ok(Output::Event(event)) => {
                    handle_rtc_event(&mut rtc, &ctx, &mut decoder, &mut pending, &mut dc_open, event)
                }
                Err(e) => {
                    error!(error = %e, "Rtc failure");
                    let _ = ctx.events_tx.send(Err(TransportError::ConnectionFailed(e.to_string())));
                    rtc.disconnect();
                    break Instant::now();
                }
            }
        };

        if !rtc.is_alive() {
            break;
        }

        let timeout = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!("peer connection cancelled");
                rtc.disconnect();
            }

            item = outbound_rx.recv() => match item {
                Some(OutboundItem::Event(message)) => {
                    write_event(&mut rtc, &ctx, &mut pending, dc_open, message);
                }
                Some(OutboundItem::Audio(audio)) => {
                    write_audio(&mut rtc, &ctx, &mut encoder, &mut pcm_accum, &mut rtp_offset, &audio);
                }
                None => rtc.disconnect(),
            },

            received = socket.recv_from(&mut buf) => match received {
                Ok((n, source)) => {
                    let contents = match buf[..n].try_into() {
                        Ok(contents) => contents,
                        Err(e) => {
                            debug!(error = %e, "dropping unparseable datagram");
                            continue;
                        }
                    };
                    let input = Input::Receive(
                        Instant::now(),
                        Receive {
                            proto: Protocol::Udp,
                            source,
                            destination: local_addr,
                            contents,
                        },
                    );
                    if let Err(e) = rtc.handle_input(input) {
                        warn!(error = %e, "Rtc rejected input");
                    }
                }
                Err(e) => {
                    error!(error = %e, "UDP receive failed");
                    rtc.disconnect();
                }
            },

            _ = tokio::time::sleep(timeout) => {
                if let Err(e) = rtc.handle_input(Input::Timeout(Instant::now())) {
                    warn!(error = %e, "Rtc rejected timeout");
                }
            }
        }
    }

    // Completes the event stream; the final watch value completes state
    // observation.
    drop(ctx.events_tx);
    let _ = ctx.state_tx.send(ConnectionState::Disconnected);
    debug!("peer driver exited");
}

fn handle_rtc_event(
    rtc: &mut Rtc,
    ctx: &DriverContext,
    decoder: &mut OpusCodec,
    pending: &mut PendingQueue,
    dc_open: &mut bool,
    event: Event,
) {
    match event {
        Event::IceConnectionStateChange(state) => {
            debug!(?state, "ICE connection state changed");
            match state {
                IceConnectionState::Connected | IceConnectionState::Completed => {
                    let _ = ctx.state_tx.send(ConnectionState::Connected);
                }
                IceConnectionState::Disconnected => {
                    let _ = ctx.state_tx.send(ConnectionState::Disconnected);
                }
                _ => {}
            }
        }

        Event::Connected => {
            info!("peer connection established");
            let _ = ctx.state_tx.send(ConnectionState::Connected);
        }

        Event::ChannelOpen(id, label) if id == ctx.channel_id => {
            *dc_open = true;
            let queued = pending.drain();
            info!(label = %label, queued = queued.len(), "data channel open");
            if let Some(mut channel) = rtc.channel(ctx.channel_id) {
                for message in queued {
                    if let Err(e) = channel.write(false, &message) {
                        warn!(error = %e, "failed to flush queued event");
                    }
                }
            }
        }

        // Open/close of the channel is diagnostics only; connection state
        // follows ICE.
        Event::ChannelClose(id) if id == ctx.channel_id => {
            *dc_open = false;
            debug!("data channel closed");
        }

        Event::ChannelData(data) if data.id == ctx.channel_id => {
            let item = match std::str::from_utf8(&data.data) {
                Ok(text) => events::decode(text).map_err(TransportError::from),
                Err(e) => Err(TransportError::DataChannel(format!("non-UTF8 message: {e}"))),
            };
            let _ = ctx.events_tx.send(item);
        }

        Event::MediaData(media) if media.mid == ctx.mid => {
            match decoder.decode(&media.data) {
                Ok(samples) => {
                    let mut payload = Vec::with_capacity(samples.len() * 2);
                    for sample in samples {
                        payload.extend_from_slice(&sample.to_le_bytes());
                    }
                    let delta = BASE64_STANDARD.encode(&payload);
                    let _ = ctx.events_tx.send(Ok(ServerEvent::AudioDelta {
                        response_id: REMOTE_MEDIA_ITEM_ID.to_string(),
                        item_id: REMOTE_MEDIA_ITEM_ID.to_string(),
                        delta,
                    }));
                }
                Err(e) => warn!(error = %e, "dropping undecodable media frame"),
            }
        }

        _ => {}
    }
}

fn write_event(
    rtc: &mut Rtc,
    ctx: &DriverContext,
    pending: &mut PendingQueue,
    dc_open: bool,
    message: Vec<u8>,
) {
    if !dc_open {
        if pending.push(message) {
            debug!(queued = pending.len(), "data channel not open, event queued");
        } else {
            warn!(limit = PENDING_EVENT_LIMIT, "pending event queue full, dropping event");
        }
        return;
    }
    match rtc.channel(ctx.channel_id) {
        Some(mut channel) => {
            if let Err(e) = channel.write(false, &message) {
                warn!(error = %e, "data channel write failed");
                let _ = ctx
                    .events_tx
                    .send(Err(TransportError::DataChannel(e.to_string())));
            }
        }
        None => warn!("data channel unavailable for write"),
    }
}

fn write_audio(
    rtc: &mut Rtc,
    ctx: &DriverContext,
    encoder: &mut OpusCodec,
    accum: &mut Vec<i16>,
    rtp_offset: &mut u64,
    audio: &Bytes,
) {
    if audio.len() % 2 != 0 {
        warn!(len = audio.len(), "dropping odd-length PCM16 audio");
        return;
    }
    accum.extend(audio.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])));

    while accum.len() >= OPUS_FRAME_SAMPLES {
        let frame: Vec<i16> = accum.drain(..OPUS_FRAME_SAMPLES).collect();
        let opus = match encoder.encode(&frame) {
            Ok(opus) => opus,
            Err(e) => {
                warn!(error = %e, "dropping unencodable audio frame");
                continue;
            }
        };

        let clock_hz = ctx.clock_rate.get() as u64;
        let ticks = (OPUS_FRAME_SAMPLES as u64) * clock_hz / CAPTURE_SAMPLE_RATE as u64;
        let rtp_time = MediaTime::new(*rtp_offset, ctx.clock_rate);
        *rtp_offset += ticks;

        match rtc.writer(ctx.mid) {
            Some(writer) => {
                if let Err(e) = writer.write(ctx.pt, Instant::now(), rtp_time, opus) {
                    warn!(error = %e, "media track write failed");
                }
            }
            None => warn!("media track writer unavailable"),
        }
    }
}
