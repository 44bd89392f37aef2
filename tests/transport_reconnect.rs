//! WebSocket transport lifecycle tests against the mock tutor server.

mod mock_tutor;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use mock_tutor::{MockTutor, wait_until};
use tutor_live::core::transport::{
    ControlCommand, Handshake, ReconnectionConfig, Speaker, TextFrame, Transport, TransportConfig,
    TransportEvent, WebSocketTransport, WireFrame,
};
use tutor_live::errors::TutorError;

fn transport(endpoint: String, max_attempts: u32) -> WebSocketTransport {
    WebSocketTransport::new(TransportConfig {
        reconnection: ReconnectionConfig {
            enabled: true,
            max_attempts,
            base_delay_ms: 10,
        },
        ..TransportConfig::new(endpoint)
    })
}

fn record_status(transport: &WebSocketTransport) -> Arc<Mutex<Vec<TransportEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    // Kept registered for the whole test
    let _subscription = transport.on_status(Arc::new(move |event: TransportEvent| {
        sink.lock().push(event);
    }));
    events
}

fn record_frames(transport: &WebSocketTransport) -> Arc<Mutex<Vec<WireFrame>>> {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    let _subscription = transport.on_frame(Arc::new(move |frame: WireFrame| {
        sink.lock().push(frame);
    }));
    frames
}

#[tokio::test]
async fn test_backoff_then_terminal_failure() {
    let mock = MockTutor::start().await;
    let transport = transport(mock.url(), 3);
    let events = record_status(&transport);

    transport.connect(Handshake::new("hi")).await.unwrap();
    assert!(transport.is_connected());

    // Every retry is refused once the server is gone
    mock.shutdown();
    wait_until(|| {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, TransportEvent::Failed { .. }))
            .then_some(())
    })
    .await;

    let events = events.lock().clone();
    assert!(matches!(
        events[0],
        TransportEvent::Opened {
            reconnected: false,
            ..
        }
    ));
    let retries: Vec<(u32, u64)> = events
        .iter()
        .filter_map(|e| match e {
            TransportEvent::Reconnecting { attempt, delay_ms } => Some((*attempt, *delay_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(1, 10), (2, 20), (3, 30)]);

    match events.last() {
        Some(TransportEvent::Failed { error, attempts }) => {
            assert_eq!(*attempts, 3);
            assert!(matches!(error, TutorError::ConnectionFailed(_)));
        }
        other => panic!("expected a terminal failure, got {other:?}"),
    }
    assert!(!transport.is_connected());
    assert_eq!(
        transport.send(TextFrame::user("anyone?", false).into()),
        Err(TutorError::NotConnected)
    );
}

#[tokio::test]
async fn test_reconnect_resends_setup() {
    let mock = MockTutor::start().await;
    let transport = transport(mock.url(), 3);
    let events = record_status(&transport);

    transport.connect(Handshake::new("Be kind")).await.unwrap();
    mock.wait_for_message(|m| m["type"] == "setup").await;

    mock.drop_connection();
    wait_until(|| {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, TransportEvent::Opened { reconnected: true, .. }))
            .then_some(())
    })
    .await;

    assert_eq!(mock.connections().len(), 2);
    wait_until(|| (mock.received_of_type("setup").len() == 2).then_some(())).await;
    let setups = mock.received_of_type("setup");
    assert_eq!(setups[1]["instructions"], "Be kind");

    let connection = transport.connection().unwrap();
    assert_eq!(connection.id, 2);

    transport
        .send(TextFrame::user("back again", false).into())
        .unwrap();
    mock.wait_for_message(|m| m["content"] == "back again").await;
}

#[tokio::test]
async fn test_backoff_restarts_after_each_reconnect() {
    let mock = MockTutor::start().await;
    let transport = transport(mock.url(), 3);
    let events = record_status(&transport);

    transport.connect(Handshake::new("hi")).await.unwrap();
    mock.wait_for_connections(1).await;

    for round in 2..=3 {
        mock.drop_connection();
        mock.wait_for_connections(round).await;
        wait_until(|| {
            let reopened = events
                .lock()
                .iter()
                .filter(|e| matches!(e, TransportEvent::Opened { reconnected: true, .. }))
                .count();
            (reopened == round - 1).then_some(())
        })
        .await;
    }

    let retries: Vec<u32> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            TransportEvent::Reconnecting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 1]);
    assert_eq!(transport.connection().unwrap().attempt, 0);
}

#[tokio::test]
async fn test_opened_precedes_first_frame() {
    let mock = MockTutor::start_with_greeting(json!({
        "type": "text",
        "content": "Bienvenido",
        "speaker": "tutor"
    }))
    .await;
    let transport = transport(mock.url(), 3);

    let log = Arc::new(Mutex::new(Vec::new()));
    let status_log = log.clone();
    let _status = transport.on_status(Arc::new(move |event: TransportEvent| {
        if matches!(event, TransportEvent::Opened { .. }) {
            status_log.lock().push("opened");
        }
    }));
    let frame_log = log.clone();
    let _frames = transport.on_frame(Arc::new(move |_frame: WireFrame| {
        frame_log.lock().push("frame");
    }));

    transport.connect(Handshake::new("hi")).await.unwrap();
    wait_until(|| (log.lock().len() == 2).then_some(())).await;
    assert_eq!(*log.lock(), vec!["opened", "frame"]);
}

#[tokio::test]
async fn test_intentional_disconnect_does_not_retry() {
    let mock = MockTutor::start().await;
    let transport = transport(mock.url(), 3);
    let events = record_status(&transport);

    transport.connect(Handshake::new("hi")).await.unwrap();
    mock.wait_for_connections(1).await;

    transport.disconnect();
    assert!(!transport.is_connected());
    wait_until(|| (mock.open_connections() == 0).then_some(())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(mock.connections().len(), 1);
    // disconnect() drops every listener after reporting Closed
    let events = events.lock().clone();
    assert_eq!(events.last(), Some(&TransportEvent::Closed));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, TransportEvent::Reconnecting { .. }))
    );
}

#[tokio::test]
async fn test_connect_refused() {
    let mock = MockTutor::start().await;
    let url = mock.url();
    mock.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let transport = transport(url, 3);
    let result = transport.connect(Handshake::new("hi")).await;

    assert!(matches!(result, Err(TutorError::ConnectionFailed(_))));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_inbound_frames() {
    let mock = MockTutor::start().await;
    let transport = transport(mock.url(), 3);
    let frames = record_frames(&transport);

    transport.connect(Handshake::new("hi")).await.unwrap();
    mock.wait_for_connections(1).await;

    mock.say("Hola");
    mock.send_raw(Message::Text("{broken".into()));
    mock.send_raw(Message::Binary(vec![0u8, 1, 2, 3].into()));
    mock.send(json!({ "type": "control", "command": "interrupted" }));
    mock.send(json!({ "name": "award_badge", "args": { "badge_id": "first-words" } }));

    wait_until(|| (frames.lock().len() == 4).then_some(())).await;
    let frames = frames.lock().clone();

    match &frames[0] {
        WireFrame::Text(text) => {
            assert_eq!(text.content, "Hola");
            assert_eq!(text.speaker, Speaker::Tutor);
        }
        other => panic!("expected text, got {other:?}"),
    }
    match &frames[1] {
        WireFrame::Audio(audio) => {
            assert_eq!(audio.payload.as_ref(), &[0u8, 1, 2, 3]);
            assert_eq!(audio.mime, "audio/pcm;rate=24000");
        }
        other => panic!("expected audio, got {other:?}"),
    }
    assert_eq!(frames[2], WireFrame::Control(ControlCommand::Interrupted));
    match &frames[3] {
        WireFrame::FunctionCall(call) => {
            assert_eq!(call.name, "award_badge");
            assert!(call.call_id.is_none());
        }
        other => panic!("expected function call, got {other:?}"),
    }
    assert!(transport.is_connected());
}
