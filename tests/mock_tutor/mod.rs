//! WebSocket Mock Tutor Server
//!
//! Accepts tutor connections on a random local port, records every message the
//! client sends, and lets a test push frames, drop the connection or stop
//! accepting new ones.

// Not every test binary uses every helper
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// What the server saw when a client connected.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRecord {
    pub query: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Default)]
struct MockState {
    received: Mutex<Vec<Value>>,
    connections: Mutex<Vec<ConnectionRecord>>,
    current: Mutex<Option<Connection>>,
    open_count: AtomicUsize,
    greeting: Option<Value>,
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

/// Running mock tutor.
pub struct MockTutor {
    address: String,
    state: Arc<MockState>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl MockTutor {
    /// Bind to a random port and start accepting connections.
    pub async fn start() -> Self {
        Self::launch(MockState::default()).await
    }

    /// Like [`MockTutor::start`], but push `greeting` the moment each
    /// connection is accepted.
    pub async fn start_with_greeting(greeting: Value) -> Self {
        Self::launch(MockState {
            greeting: Some(greeting),
            ..MockState::default()
        })
        .await
    }

    async fn launch(state: MockState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}/live", listener.local_addr().unwrap());
        let state = Arc::new(state);

        let accept_state = state.clone();
        let acceptor = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (outbound, inbound) = mpsc::unbounded_channel();
                let task = tokio::spawn(handle_connection(stream, accept_state.clone(), inbound));
                let previous = accept_state
                    .current
                    .lock()
                    .replace(Connection { outbound, task });
                if let Some(previous) = previous {
                    previous.task.abort();
                }
            }
        });

        Self {
            address,
            state,
            acceptor: Mutex::new(Some(acceptor)),
        }
    }

    /// Endpoint URL for the client.
    pub fn url(&self) -> String {
        self.address.clone()
    }

    /// Send a JSON frame on the current connection.
    pub fn send(&self, frame: Value) {
        self.send_raw(Message::Text(frame.to_string().into()));
    }

    /// Send any websocket message on the current connection.
    pub fn send_raw(&self, message: Message) {
        if let Some(connection) = self.state.current.lock().as_ref() {
            let _ = connection.outbound.send(message);
        }
    }

    /// Send a tutor text frame.
    pub fn say(&self, content: &str) {
        self.send(json!({ "type": "text", "content": content, "speaker": "tutor" }));
    }

    /// Send a function call on the sub-channel format.
    pub fn call(&self, id: &str, name: &str, args: Value) {
        self.send(json!({ "id": id, "name": name, "args": args }));
    }

    /// Kill the current connection without a close frame.
    pub fn drop_connection(&self) {
        if let Some(connection) = self.state.current.lock().take() {
            connection.task.abort();
        }
    }

    /// Stop accepting connections and kill the current one.
    pub fn shutdown(&self) {
        if let Some(acceptor) = self.acceptor.lock().take() {
            acceptor.abort();
        }
        self.drop_connection();
    }

    /// Every message received so far, parsed as JSON.
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    /// Received messages with the given `type` tag.
    pub fn received_of_type(&self, kind: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|message| message["type"] == kind)
            .collect()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.state.connections.lock().clone()
    }

    /// Number of connections currently being served.
    pub fn open_connections(&self) -> usize {
        self.state.open_count.load(Ordering::SeqCst)
    }

    /// Poll until a received message satisfies `predicate`.
    pub async fn wait_for_message(&self, predicate: impl Fn(&Value) -> bool) -> Value {
        wait_until(|| self.received().into_iter().find(|message| predicate(message))).await
    }

    /// Poll until at least `count` connections were accepted.
    pub async fn wait_for_connections(&self, count: usize) {
        wait_until(|| (self.connections().len() >= count).then_some(())).await;
    }
}

impl Drop for MockTutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Poll `check` every few milliseconds for up to five seconds.
pub async fn wait_until<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<MockState>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let mut record = ConnectionRecord::default();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        record.query = request.uri().query().map(str::to_string);
        record.authorization = request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };
    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            eprintln!("Mock tutor handshake failed: {}", e);
            return;
        }
    };
    state.connections.lock().push(record);
    let _open = OpenGuard::new(state.clone());
    let (mut write, mut read) = ws_stream.split();
    if let Some(greeting) = &state.greeting {
        if write
            .send(Message::Text(greeting.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if write.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                        state.received.lock().push(value);
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    eprintln!("Mock tutor WebSocket error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Counts a connection as open until the task ends or is aborted.
struct OpenGuard(Arc<MockState>);

impl OpenGuard {
    fn new(state: Arc<MockState>) -> Self {
        state.open_count.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.open_count.fetch_sub(1, Ordering::SeqCst);
    }
}
