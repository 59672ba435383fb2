//! Session client lifecycle tests against a fake transport and backend.

mod support;

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use voxlink::audio::{HalfDuplexPolicy, SampleBuffer};
use voxlink::events::{ApiError, ServerEvent};
use voxlink::session::{SessionClient, SessionConfig, SessionError, SessionEvent, VoiceChatState};
use voxlink::transport::{Connection, ConnectionState, TransportKind};

use support::{init_tracing, marker_chunk, FakeBackend, FakeConnection, FakeFactory};

fn client_over(
    connection: Arc<FakeConnection>,
    backend: Arc<FakeBackend>,
    auto_connect: bool,
) -> SessionClient {
    init_tracing();
    SessionClient::with_parts(
        FakeFactory::new(connection, auto_connect),
        backend,
        Arc::new(HalfDuplexPolicy::new()),
    )
}

fn config() -> SessionConfig {
    SessionConfig::new("secret", "model-x", TransportKind::Socket)
}

async fn wait_for_state(client: &SessionClient, want: VoiceChatState) {
    let mut rx = client.state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("state watch closed while waiting for {want}");
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {want}"));
}

fn audio_delta(marker: i16, item_id: &str) -> ServerEvent {
    ServerEvent::AudioDelta {
        response_id: "r1".to_string(),
        item_id: item_id.to_string(),
        delta: BASE64_STANDARD.encode(marker_chunk(marker, 240)),
    }
}

#[tokio::test(start_paused = true)]
async fn happy_path_renders_deltas_in_order_and_returns_to_idle() {
    let connection = FakeConnection::new();
    let backend = FakeBackend::new();
    let client = client_over(Arc::clone(&connection), Arc::clone(&backend), true);
    let mut subscriber = client.events();

    client.start_session(config()).await.unwrap();
    wait_for_state(&client, VoiceChatState::Active).await;

    connection.push_event(Ok(audio_delta(1, "evt1")));
    connection.push_event(Ok(audio_delta(2, "evt1")));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(backend.rendered_markers(), vec![1, 2]);

    // Both deltas were also fanned out to subscribers.
    let mut fanned_out = 0;
    while let Ok(event) = subscriber.try_recv() {
        if matches!(event, SessionEvent::Event(ServerEvent::AudioDelta { .. })) {
            fanned_out += 1;
        }
    }
    assert_eq!(fanned_out, 2);

    client.end_session().await;
    wait_for_state(&client, VoiceChatState::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn pause_resume_alternate_strictly_and_illegal_calls_are_noops() {
    let connection = FakeConnection::new();
    let backend = FakeBackend::new();
    let client = client_over(Arc::clone(&connection), backend, true);

    // Illegal while idle: state unchanged.
    client.pause_chat().await;
    assert_eq!(*client.state().borrow(), VoiceChatState::Idle);

    client.start_session(config()).await.unwrap();
    wait_for_state(&client, VoiceChatState::Active).await;

    client.pause_chat().await;
    assert_eq!(*client.state().borrow(), VoiceChatState::Paused);
    assert!(connection.is_muted());

    // Pausing again skips no legal state.
    client.pause_chat().await;
    assert_eq!(*client.state().borrow(), VoiceChatState::Paused);

    client.resume_chat().await;
    assert_eq!(*client.state().borrow(), VoiceChatState::Active);
    assert!(!connection.is_muted());

    client.resume_chat().await;
    assert_eq!(*client.state().borrow(), VoiceChatState::Active);

    client.pause_chat().await;
    assert_eq!(*client.state().borrow(), VoiceChatState::Paused);

    client.end_session().await;
}

#[tokio::test]
async fn empty_credential_is_rejected_synchronously() {
    let connection = FakeConnection::new();
    let backend = FakeBackend::new();
    let factory = FakeFactory::new(Arc::clone(&connection), true);
    let client = SessionClient::with_parts(
        Arc::clone(&factory) as Arc<dyn voxlink::session::ConnectionFactory>,
        backend,
        Arc::new(HalfDuplexPolicy::new()),
    );

    let err = client
        .start_session(SessionConfig::new("", "model-x", TransportKind::Socket))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidConfiguration(_)));
    assert_eq!(*client.state().borrow(), VoiceChatState::Idle);
    assert!(factory.connect_calls.lock().is_empty());

    let err = client
        .start_session(SessionConfig::new("secret", "  ", TransportKind::Socket))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidConfiguration(_)));
}

#[tokio::test(start_paused = true)]
async fn server_error_event_escalates_to_error_state() {
    let connection = FakeConnection::new();
    let backend = FakeBackend::new();
    let client = client_over(Arc::clone(&connection), backend, true);

    client.start_session(config()).await.unwrap();
    wait_for_state(&client, VoiceChatState::Active).await;

    connection.push_event(Ok(ServerEvent::Error {
        error: ApiError {
            error_type: "server_error".to_string(),
            code: None,
            message: "model overloaded".to_string(),
            param: None,
            event_id: None,
        },
    }));

    wait_for_state(&client, VoiceChatState::Error("model overloaded".to_string())).await;

    // Terminal until the caller restarts.
    client.end_session().await;
    wait_for_state(&client, VoiceChatState::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn captured_audio_flows_out_through_the_connection() {
    let connection = FakeConnection::new();
    let backend = FakeBackend::new();
    let client = client_over(Arc::clone(&connection), Arc::clone(&backend), true);

    client.start_session(config()).await.unwrap();
    wait_for_state(&client, VoiceChatState::Active).await;

    let sink = backend.capture_sink().expect("engine registered a capture sink");
    sink.send(SampleBuffer::F32(vec![0.25; 160])).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let sent = connection.sent_audio.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len(), 320); // 160 frames as PCM16

    client.end_session().await;
}

#[tokio::test(start_paused = true)]
async fn receive_path_failures_are_fanned_out_without_killing_the_session() {
    let connection = FakeConnection::new();
    let backend = FakeBackend::new();
    let client = client_over(Arc::clone(&connection), backend, true);
    let mut subscriber = client.events();

    client.start_session(config()).await.unwrap();
    wait_for_state(&client, VoiceChatState::Active).await;

    connection.push_event(Err(voxlink::transport::TransportError::WebSocket(
        "bad frame".to_string(),
    )));
    connection.push_event(Ok(ServerEvent::Pong));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let first = subscriber.try_recv().unwrap();
    assert!(matches!(first, SessionEvent::Failure(_)));
    let second = subscriber.try_recv().unwrap();
    assert!(matches!(second, SessionEvent::Event(ServerEvent::Pong)));
    assert_eq!(*client.state().borrow(), VoiceChatState::Active);

    client.end_session().await;
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_escalates_a_stuck_handshake() {
    let connection = FakeConnection::new();
    let backend = FakeBackend::new();
    // auto_connect = false: the connection never reports Connected.
    let client = client_over(Arc::clone(&connection), backend, false);

    let mut cfg = config();
    cfg.connect_timeout = Some(Duration::from_millis(100));
    client.start_session(cfg).await.unwrap();
    assert_eq!(*client.state().borrow(), VoiceChatState::Connecting);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(*client.state().borrow(), VoiceChatState::Error(_)));
}

#[tokio::test(start_paused = true)]
async fn end_chat_from_connecting_returns_to_idle_without_closing() {
    let connection = FakeConnection::new();
    let backend = FakeBackend::new();
    let client = client_over(Arc::clone(&connection), backend, false);

    client.start_session(config()).await.unwrap();
    assert_eq!(*client.state().borrow(), VoiceChatState::Connecting);

    client.end_chat().await;
    assert_eq!(*client.state().borrow(), VoiceChatState::Idle);
    // The not-yet-ready connection was not closed.
    assert_eq!(*connection.state().borrow(), ConnectionState::Connecting);

    // end_chat from idle is a no-op.
    client.end_chat().await;
    assert_eq!(*client.state().borrow(), VoiceChatState::Idle);
}

#[tokio::test(start_paused = true)]
async fn speech_started_interrupts_and_truncates_current_item() {
    let connection = FakeConnection::new();
    let backend = FakeBackend::new();
    let client = client_over(Arc::clone(&connection), Arc::clone(&backend), true);

    client.start_session(config()).await.unwrap();
    wait_for_state(&client, VoiceChatState::Active).await;

    connection.push_event(Ok(audio_delta(1, "evt1")));
    tokio::time::sleep(Duration::from_millis(1)).await;
    connection.push_event(Ok(ServerEvent::SpeechStarted {
        audio_start_ms: 0,
        item_id: "user1".to_string(),
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sent = connection.sent.lock().clone();
    let truncated = sent.iter().any(|e| {
        matches!(e, voxlink::events::ClientEvent::ConversationItemTruncate { item_id, .. } if item_id == "evt1")
    });
    assert!(truncated, "expected a truncate for the interrupted item, got {sent:?}");

    client.end_session().await;
}
