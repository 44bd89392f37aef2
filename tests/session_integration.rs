//! End-to-end session tests
//!
//! Drive a full `TutorSession` over a real websocket transport against the
//! mock tutor server.

mod mock_tutor;

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use serde_json::{Value, json};
use tokio::time::timeout;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mock_tutor::{MockTutor, wait_until};
use tutor_live::core::audio::{AudioConfig, ScriptedInput, encode_pcm16};
use tutor_live::core::transport::{
    HandshakeMode, INSTRUCTIONS_QUERY_PARAM, ReconnectionConfig, Speaker, TransportConfig,
    WebSocketTransport,
};
use tutor_live::session::{
    EndReason, HandshakeBuilder, HttpPersistence, MemoryPersistence, PersistRequest, PhaseKind,
    SessionSettings, SessionState, SessionTask, TutorSession, TutorSessionBuilder,
};

const WAIT: Duration = Duration::from_secs(5);

fn transport_config(mock: &MockTutor) -> TransportConfig {
    TransportConfig {
        reconnection: ReconnectionConfig {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 10,
        },
        ..TransportConfig::new(mock.url())
    }
}

fn builder(config: TransportConfig) -> TutorSessionBuilder {
    TutorSession::builder(Arc::new(WebSocketTransport::new(config)))
}

async fn wait_state(
    session: &TutorSession,
    predicate: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    timeout(WAIT, session.wait_for(predicate))
        .await
        .expect("state not reached within 5s")
        .unwrap()
}

fn is_opening_turn(message: &Value) -> bool {
    message["type"] == "text" && message["speaker"] == "user" && message["content"] == "Hello"
}

#[tokio::test]
async fn test_end_to_end_summary() {
    let mock = MockTutor::start().await;
    let store = MemoryPersistence::new();
    let session = builder(transport_config(&mock))
        .persistence(Arc::new(store.clone()))
        .build();

    let handshake = HandshakeBuilder::new("You are a barista in Madrid.").build();
    session.start(handshake).await.unwrap();

    // Handshake first, then the hidden opening turn
    let setup = mock.wait_for_message(|m| m["type"] == "setup").await;
    assert!(
        setup["instructions"]
            .as_str()
            .unwrap()
            .starts_with("You are a barista in Madrid.")
    );
    mock.wait_for_message(is_opening_turn).await;
    assert_eq!(mock.received()[0]["type"], "setup");

    mock.say("Hello! How are you?");
    mock.call(
        "call-1",
        "show_session_summary",
        json!({
            "did_well": ["greeting"],
            "work_on": ["past tense"],
            "stars": 4,
            "summary_text": "Good job!"
        }),
    );

    let state = wait_state(&session, SessionState::is_ended).await;
    assert_eq!(state.phase, PhaseKind::Ended);
    assert_eq!(state.end_reason, Some(EndReason::SummaryReceived));
    assert_eq!(state.summary.as_ref().map(|s| s.stars), Some(4));
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].text, "Hello! How are you?");
    assert_eq!(state.messages[0].speaker, Speaker::Tutor);
    assert!(!state.can_reconnect);

    // The summary call was answered before the socket closed
    let result = mock
        .wait_for_message(|m| m["type"] == "function_result")
        .await;
    assert_eq!(result["id"], "call-1");
    assert_eq!(result["result"], "ok");

    // Closed for good: no reconnect attempt
    wait_until(|| (mock.open_connections() == 0).then_some(())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.connections().len(), 1);
    assert!(session.state().reconnect_attempt.is_none());

    wait_until(|| {
        store
            .writes()
            .iter()
            .any(|w| matches!(w, PersistRequest::Summary(_)))
            .then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_dropped_chunk_is_not_replayed_after_reconnect() {
    let mock = MockTutor::start().await;
    let (input, feeder) = ScriptedInput::new();
    let settings = SessionSettings {
        audio: AudioConfig {
            input_sample_rate: 1000,
            chunk_duration_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut config = transport_config(&mock);
    config.input_sample_rate = 1000;
    let session = builder(config)
        .settings(settings)
        .input(Box::new(input))
        .build();

    session.start(HandshakeBuilder::new("Chat").build()).await.unwrap();
    wait_state(&session, |s| s.phase == PhaseKind::ConnectedIdle).await;
    session.start_listening().await.unwrap();

    mock.drop_connection();
    wait_state(&session, |s| s.reconnect_attempt.is_some()).await;

    // Produced while offline: discarded without an error
    feeder.push(vec![1; 10]);

    mock.wait_for_connections(2).await;
    wait_state(&session, |s| {
        s.reconnect_attempt.is_none() && s.phase == PhaseKind::ConnectedIdle
    })
    .await;

    session.start_listening().await.unwrap();
    assert!(feeder.push(vec![2; 10]));

    let expected = BASE64_STANDARD.encode(encode_pcm16(&[2; 10]));
    let stale = BASE64_STANDARD.encode(encode_pcm16(&[1; 10]));
    mock.wait_for_message(|m| m["type"] == "audio").await;
    let audio = mock.received_of_type("audio");
    assert!(audio.iter().all(|m| m["data"] != stale.as_str()));
    assert_eq!(audio[0]["data"], expected.as_str());
    assert_eq!(audio[0]["mime"], "audio/pcm;rate=1000");

    // The setup frame is re-sent on the new connection, the opening turn is not
    assert_eq!(mock.received_of_type("setup").len(), 2);
    assert_eq!(
        mock.received().iter().filter(|m| is_opening_turn(m)).count(),
        1
    );
}

#[tokio::test]
async fn test_task_completion_over_the_wire() {
    let mock = MockTutor::start().await;
    let tasks = vec![
        SessionTask::new("task-1", "Greet the waiter"),
        SessionTask::new("task-2", "Order a coffee"),
    ];
    let session = builder(transport_config(&mock))
        .tasks(tasks.clone())
        .build();

    let handshake = HandshakeBuilder::new("Cafe").with_tasks(tasks).build();
    session.start(handshake).await.unwrap();
    let setup = mock.wait_for_message(|m| m["type"] == "setup").await;
    let tools: Vec<&str> = setup["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(tools.contains(&"mark_task_complete"));

    mock.call("c1", "mark_task_complete", json!({ "task_id": "1" }));
    let state = wait_state(&session, |s| !s.completed_tasks.is_empty()).await;
    assert!(state.tasks[0].completed);
    assert!(!state.tasks[1].completed);

    mock.call("c2", "mark_task_complete", json!({}));
    let rejected = mock
        .wait_for_message(|m| m["type"] == "function_result" && m["id"] == "c2")
        .await;
    assert_eq!(rejected["result"], "error");
    assert!(
        rejected["error"]
            .as_str()
            .unwrap()
            .contains("missing required field 'task_id'")
    );

    let state = session.state();
    assert!(!state.tasks[1].completed);
    assert!(!state.is_ended());
    assert_eq!(mock.open_connections(), 1);
}

#[tokio::test]
async fn test_loosely_typed_calls_are_answered() {
    let mock = MockTutor::start().await;
    let tasks = vec![SessionTask::new("task-1", "Greet the waiter")];
    let session = builder(transport_config(&mock))
        .tasks(tasks.clone())
        .build();
    session
        .start(HandshakeBuilder::new("Cafe").with_tasks(tasks).build())
        .await
        .unwrap();
    mock.wait_for_message(is_opening_turn).await;

    // Numeric call id
    mock.send(json!({
        "type": "function_call",
        "id": 7,
        "name": "mark_task_complete",
        "args": { "task_id": "1" }
    }));
    let accepted = mock
        .wait_for_message(|m| m["type"] == "function_result" && m["id"] == "7")
        .await;
    assert_eq!(accepted["result"], "ok");
    let state = wait_state(&session, |s| !s.completed_tasks.is_empty()).await;
    assert!(state.tasks[0].completed);

    // Arguments that are not an object
    mock.send(json!({ "id": "c9", "name": "award_badge", "args": 42 }));
    let rejected = mock
        .wait_for_message(|m| m["type"] == "function_result" && m["id"] == "c9")
        .await;
    assert_eq!(rejected["result"], "error");
    assert!(
        rejected["error"]
            .as_str()
            .unwrap()
            .contains("arguments must be an object, got a number")
    );
    assert!(session.state().badges.is_empty());
    assert_eq!(mock.open_connections(), 1);
}

#[tokio::test]
async fn test_malformed_frames_keep_the_connection() {
    let mock = MockTutor::start().await;
    let session = builder(transport_config(&mock)).build();
    session.start(HandshakeBuilder::new("Chat").build()).await.unwrap();
    mock.wait_for_message(is_opening_turn).await;

    mock.send_raw(tokio_tungstenite::tungstenite::Message::Text(
        "definitely not json".into(),
    ));
    mock.send(json!({ "type": "hologram" }));
    mock.say("Still here.");
    mock.send(json!({ "type": "control", "command": "turn_complete" }));

    let state = wait_state(&session, |s| !s.messages.is_empty()).await;
    assert_eq!(state.messages[0].text, "Still here.");
    assert!(state.connection_error.is_none());
    assert_eq!(mock.connections().len(), 1);
}

#[tokio::test]
async fn test_query_handshake_with_api_key() {
    let mock = MockTutor::start().await;
    let config = TransportConfig {
        api_key: Some("secret-key".to_string()),
        handshake_mode: HandshakeMode::Query,
        ..transport_config(&mock)
    };
    let session = builder(config).build();

    session
        .start(HandshakeBuilder::new("Query lesson").build())
        .await
        .unwrap();
    mock.wait_for_message(is_opening_turn).await;

    let connection = &mock.connections()[0];
    assert_eq!(connection.authorization.as_deref(), Some("Bearer secret-key"));
    assert!(
        connection
            .query
            .as_deref()
            .unwrap()
            .contains(&format!("{INSTRUCTIONS_QUERY_PARAM}=Query"))
    );
    assert!(mock.received_of_type("setup").is_empty());
}

#[tokio::test]
async fn test_struggles_reach_the_persistence_service() {
    let mock = MockTutor::start().await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/struggles"))
        .and(body_partial_json(json!({
            "data": { "error_type": "grammar", "severity": 6 }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = HttpPersistence::new(&server.uri()).unwrap();
    let session = builder(transport_config(&mock))
        .persistence(Arc::new(store))
        .build();
    session.start(HandshakeBuilder::new("Chat").build()).await.unwrap();
    mock.wait_for_message(is_opening_turn).await;

    mock.call(
        "s1",
        "mark_for_review",
        json!({
            "error_type": "grammar",
            "severity": 6,
            "user_sentence": "Yo tener hambre",
            "correction": "Yo tengo hambre"
        }),
    );

    let result = mock
        .wait_for_message(|m| m["type"] == "function_result" && m["id"] == "s1")
        .await;
    assert_eq!(result["result"], "ok");
    assert_eq!(session.state().struggles.len(), 1);

    for _ in 0..100 {
        let seen = server.received_requests().await.unwrap_or_default();
        if !seen.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server.verify().await;
}

#[tokio::test]
async fn test_retries_exhausted_offers_reconnect() {
    let mock = MockTutor::start().await;
    let session = builder(transport_config(&mock)).build();
    session.start(HandshakeBuilder::new("Chat").build()).await.unwrap();
    wait_state(&session, |s| s.phase == PhaseKind::ConnectedIdle).await;

    mock.shutdown();

    let state = wait_state(&session, |s| s.can_reconnect).await;
    assert_eq!(state.phase, PhaseKind::Disconnected);
    assert!(
        state
            .connection_error
            .as_deref()
            .unwrap()
            .contains("after 3 reconnection attempts")
    );
    assert!(!state.is_ended());
}
