//! Socket transport tests against a local scripted WebSocket server.

mod support;

use futures_util::StreamExt;
use voxlink::events::{ClientEvent, ServerEvent};
use voxlink::transport::{Connection, ConnectionState, SocketConnection};

use support::{init_tracing, spawn_scripted_socket};

#[tokio::test]
async fn decode_failure_does_not_kill_the_stream() {
    init_tracing();
    let url = spawn_scripted_socket(vec![
        r#"{"type": "definitely.not.an.event"}"#.to_string(),
        r#"{"type": "pong"}"#.to_string(),
    ])
    .await;

    let connection = SocketConnection::connect(&url, "secret").await.unwrap();
    let mut events = connection.events();

    // One failure, then the valid event on the same stream.
    let first = events.next().await.expect("stream yields the malformed frame");
    assert!(first.is_err(), "expected a decode failure, got {first:?}");
    let second = events.next().await.expect("stream yields the valid frame");
    assert_eq!(second.unwrap(), ServerEvent::Pong);

    // The connection is still open: a round trip works.
    connection.send(ClientEvent::ResponseCreate).await.unwrap();
    let third = events.next().await.expect("stream yields the reply");
    assert_eq!(third.unwrap(), ServerEvent::Pong);

    connection.close().await;
}

#[tokio::test]
async fn close_completes_both_streams() {
    init_tracing();
    let url = spawn_scripted_socket(Vec::new()).await;
    let connection = SocketConnection::connect(&url, "secret").await.unwrap();

    let mut state = connection.state();
    assert_eq!(*state.borrow(), ConnectionState::Connected);

    let mut events = connection.events();
    connection.close().await;

    // The event stream completes, not merely stops yielding.
    assert!(events.next().await.is_none());
    // And the final state is observed as Disconnected.
    while *state.borrow() != ConnectionState::Disconnected {
        state.changed().await.expect("state watch completed before Disconnected");
    }
}

#[tokio::test]
async fn send_after_close_reports_not_connected() {
    init_tracing();
    let url = spawn_scripted_socket(Vec::new()).await;
    let connection = SocketConnection::connect(&url, "secret").await.unwrap();

    connection.close().await;
    let mut state = connection.state();
    while *state.borrow() != ConnectionState::Disconnected {
        if state.changed().await.is_err() {
            break;
        }
    }

    let err = connection.send(ClientEvent::ResponseCreate).await.unwrap_err();
    assert!(matches!(err, voxlink::transport::TransportError::NotConnected));
}
