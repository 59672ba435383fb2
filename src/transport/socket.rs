//! Message-socket transport.
//!
//! A full-duplex WebSocket carrying one JSON event per text frame. One
//! receive-loop task owns both halves of the socket: inbound frames are
//! decoded and yielded on the event stream (decode failures become `Err`
//! items, they never kill the loop), outbound events arrive over an mpsc
//! channel so writes from concurrent producers are serialized through a
//! single writer.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{self, ClientEvent};

use super::{Connection, ConnectionState, EventStream, TransportError};

type InboundItem = Result<crate::events::ServerEvent, TransportError>;

/// WebSocket connection to the realtime service.
pub struct SocketConnection {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    events_rx: Arc<Mutex<mpsc::UnboundedReceiver<InboundItem>>>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl SocketConnection {
    /// Open the socket and start the receive loop.
    ///
    /// The handshake carries the credential as a bearer token. Returns once
    /// the socket is open; the state watch already reads `Connected`.
    pub async fn connect(endpoint: &str, credential: &str) -> Result<Self, TransportError> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let mut request = endpoint
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {credential}"))
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        info!(endpoint, "opening socket connection");
        let (ws_stream, _response) = connect_async(request).await.map_err(|e| {
            let msg = e.to_string();
            let _ = state_tx.send(ConnectionState::Error(msg.clone()));
            TransportError::ConnectionFailed(msg)
        })?;
        let _ = state_tx.send(ConnectionState::Connected);
        info!(endpoint, "socket connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(receive_loop(
            ws_stream,
            outbound_rx,
            events_tx,
            state_tx,
            cancel.clone(),
        ));

        Ok(Self {
            outbound: outbound_tx,
            events_rx: Arc::new(Mutex::new(events_rx)),
            state_rx,
            cancel,
        })
    }
}

#[async_trait]
impl Connection for SocketConnection {
    async fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        if *self.state_rx.borrow() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.outbound.send(event).map_err(|_| TransportError::Closed)
    }

    async fn send_audio(&self, audio: bytes::Bytes) -> Result<(), TransportError> {
        self.send(ClientEvent::audio_append(&audio)).await
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

    // Audio rides inside append events on this transport; there is no media
    // payload to gate.
    fn mute(&self) {
        debug!("mute is a no-op on the socket transport");
    }

    fn unmute(&self) {
        debug!("unmute is a no-op on the socket transport");
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

async fn receive_loop(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientEvent>,
    events_tx: mpsc::UnboundedSender<InboundItem>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("socket receive loop cancelled");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            outbound = outbound_rx.recv() => match outbound {
                Some(event) => match events::encode(&event) {
                    Ok(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            error!(error = %e, "socket write failed");
                            let _ = events_tx.send(Err(TransportError::WebSocket(e.to_string())));
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound event");
                        let _ = events_tx.send(Err(e.into()));
                    }
                },
                // All senders dropped; connection object is gone.
                None => break,
            },

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let item = events::decode(text.as_str()).map_err(TransportError::from);
                    if events_tx.send(item).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_)))
                | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    info!("socket closed by remote");
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "socket receive failed");
                    let _ = events_tx.send(Err(TransportError::WebSocket(e.to_string())));
                    break;
                }
                None => {
                    info!("socket stream ended");
                    break;
                }
            }
        }
    }

    // Completing both streams: dropping the sender ends the event stream,
    // the final watch value ends state observation.
    drop(events_tx);
    let _ = state_tx.send(ConnectionState::Disconnected);
}
