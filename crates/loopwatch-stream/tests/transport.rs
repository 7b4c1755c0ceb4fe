use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Router,
};
use futures_util::stream::{self, StreamExt};
use loopwatch_core::{EventKind, OutboundMessage};
use loopwatch_stream::{
    spawn_transport, Backoff, ConnectionStatus, ExhaustionPolicy, StreamConfig, StreamEvent,
    TransportMode,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone, Copy, PartialEq, Eq)]
enum SocketBehavior {
    /// Sends junk, a foreign frame, then one real frame and records what the client sends.
    Deliver,
    /// Refuses the upgrade, so every attempt fails before opening.
    Reject,
    /// Pushes a long burst of valid frames without waiting for the client.
    Flood,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StreamBehavior {
    Deliver,
    Unavailable,
}

struct Backend {
    socket: SocketBehavior,
    push_stream: StreamBehavior,
    socket_hits: AtomicU32,
    stream_hits: AtomicU32,
    received: Mutex<Vec<String>>,
}

impl Backend {
    fn new(socket: SocketBehavior, push_stream: StreamBehavior) -> Arc<Self> {
        Arc::new(Self {
            socket,
            push_stream,
            socket_hits: AtomicU32::new(0),
            stream_hits: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
        })
    }

    fn hits(&self) -> (u32, u32) {
        (
            self.socket_hits.load(Ordering::SeqCst),
            self.stream_hits.load(Ordering::SeqCst),
        )
    }
}

fn frame(session_id: &str, kind: &str, data: serde_json::Value) -> String {
    json!({
        "session_id": session_id,
        "type": kind,
        "data": data,
        "timestamp": "2026-03-01T10:00:00.000000",
    })
    .to_string()
}

async fn serve(backend: Arc<Backend>) -> SocketAddr {
    let app = Router::new()
        .route("/ws/:session_id", get(socket_handler))
        .route("/ws/:session_id/stream", get(stream_handler))
        .with_state(backend);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

async fn socket_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(backend): State<Arc<Backend>>,
) -> Response {
    backend.socket_hits.fetch_add(1, Ordering::SeqCst);
    if backend.socket == SocketBehavior::Reject {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ws.on_upgrade(move |socket| run_socket(socket, session_id, backend))
}

const FLOOD_FRAMES: u32 = 1000;

async fn run_socket(mut socket: WebSocket, session_id: String, backend: Arc<Backend>) {
    if backend.socket == SocketBehavior::Flood {
        for index in 0..FLOOD_FRAMES {
            let text = frame(&session_id, "thought", json!({"thought": format!("burst {index}")}));
            if socket.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        while let Some(Ok(_)) = socket.recv().await {}
        return;
    }
    let frames = [
        "{not json".to_string(),
        frame("someone-else", "thought", json!({"thought": "leak"})),
        frame(&session_id, "iteration_start", json!({"iteration": 1, "mode": "normal"})),
    ];
    for text in frames {
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) if text.contains("\"close_me\"") => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: 1011,
                        reason: "agent crashed".into(),
                    })))
                    .await;
                return;
            }
            Message::Text(text) => backend.received.lock().expect("lock").push(text),
            _ => {}
        }
    }
}

async fn stream_handler(
    Path(session_id): Path<String>,
    State(backend): State<Arc<Backend>>,
) -> Response {
    backend.stream_hits.fetch_add(1, Ordering::SeqCst);
    if backend.push_stream == StreamBehavior::Unavailable {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let events = vec![
        Ok::<_, Infallible>(
            Event::default()
                .event("connected")
                .data(json!({"session_id": session_id}).to_string()),
        ),
        Ok(Event::default().data(frame(&session_id, "thought", json!({"thought": "via sse"})))),
    ];
    Sse::new(stream::iter(events).chain(stream::pending())).into_response()
}

fn config(addr: SocketAddr, attempts: u32, policy: ExhaustionPolicy) -> StreamConfig {
    StreamConfig {
        reconnect_attempts: attempts,
        backoff: Backoff::Linear {
            base: Duration::from_millis(20),
        },
        exhaustion_policy: policy,
        ..StreamConfig::new(format!("http://{addr}"))
    }
}

async fn next_update(events: &mut mpsc::Receiver<StreamEvent>) -> loopwatch_core::CanonicalUpdate {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(StreamEvent::Update(update)) => return update,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("update before timeout")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition before timeout");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socket_delivers_only_well_formed_frames_for_active_session() {
    let backend = Backend::new(SocketBehavior::Deliver, StreamBehavior::Deliver);
    let addr = serve(backend.clone()).await;
    let (handle, mut events) = spawn_transport(config(addr, 5, ExhaustionPolicy::Cycle));

    handle.activate("s-1", None).await.expect("activate");
    match events.recv().await {
        Some(StreamEvent::SessionChanged { session_id }) => {
            assert_eq!(session_id.as_deref(), Some("s-1"))
        }
        other => panic!("expected session change first, got {other:?}"),
    }

    let update = next_update(&mut events).await;
    assert_eq!(update.session_id, "s-1");
    assert_eq!(update.kind, EventKind::IterationStart);
    assert_eq!(update.iteration, Some(1));

    let state = handle.state();
    assert_eq!(state.status, ConnectionStatus::Connected);
    assert_eq!(state.mode, TransportMode::PrimarySocket);

    handle.send(OutboundMessage::ping()).await.expect("send");
    wait_until(|| !backend.received.lock().expect("lock").is_empty()).await;
    let sent: serde_json::Value =
        serde_json::from_str(&backend.received.lock().expect("lock")[0]).expect("json");
    assert_eq!(sent["type"], "ping");

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn falls_back_to_push_stream_after_socket_budget() {
    let backend = Backend::new(SocketBehavior::Reject, StreamBehavior::Deliver);
    let addr = serve(backend.clone()).await;
    let (handle, mut events) = spawn_transport(config(addr, 5, ExhaustionPolicy::Cycle));

    handle.activate("s-2", None).await.expect("activate");
    let update = next_update(&mut events).await;

    assert_eq!(update.kind, EventKind::Thought);
    assert_eq!(update.data_str(&["thought"]), Some("via sse"));
    assert_eq!(backend.hits(), (6, 1));
    let state = handle.state();
    assert_eq!(state.mode, TransportMode::PushStream);
    assert_eq!(state.status, ConnectionStatus::Connected);

    // receive-only: dropped without touching the socket endpoint
    handle.send(OutboundMessage::ping()).await.expect("send");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.hits(), (6, 1));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn give_up_policy_ends_in_error_state() {
    let backend = Backend::new(SocketBehavior::Reject, StreamBehavior::Unavailable);
    let addr = serve(backend.clone()).await;
    let (handle, _events) = spawn_transport(config(addr, 1, ExhaustionPolicy::GiveUp));

    handle.activate("s-3", None).await.expect("activate");
    let state = handle.watch_state();
    wait_until(|| backend.hits() == (2, 2) && state.borrow().status == ConnectionStatus::Error)
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.hits(), (2, 2));
    let snapshot = handle.state();
    assert_eq!(snapshot.status, ConnectionStatus::Error);
    assert!(snapshot
        .last_error
        .as_deref()
        .is_some_and(|err| err.contains("503")));

    handle.connect().await.expect("connect");
    wait_until(|| backend.hits().0 >= 3).await;

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cycle_policy_returns_to_socket_until_disconnect() {
    let backend = Backend::new(SocketBehavior::Reject, StreamBehavior::Unavailable);
    let addr = serve(backend.clone()).await;
    let (handle, _events) = spawn_transport(config(addr, 1, ExhaustionPolicy::Cycle));

    handle.activate("s-4", None).await.expect("activate");
    wait_until(|| backend.hits().0 >= 3 && backend.hits().1 >= 2).await;

    handle.disconnect().await.expect("disconnect");
    let state = handle.watch_state();
    wait_until(|| state.borrow().status == ConnectionStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = backend.hits();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.hits(), settled);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abnormal_close_reconnects_on_primary_socket() {
    let backend = Backend::new(SocketBehavior::Deliver, StreamBehavior::Deliver);
    let addr = serve(backend.clone()).await;
    let (handle, mut events) = spawn_transport(config(addr, 5, ExhaustionPolicy::Cycle));

    handle.activate("s-5", None).await.expect("activate");
    next_update(&mut events).await;
    handle
        .send(OutboundMessage::new("close_me", serde_json::Value::Null))
        .await
        .expect("send");

    let replayed = next_update(&mut events).await;
    assert_eq!(replayed.kind, EventKind::IterationStart);
    assert_eq!(backend.hits(), (2, 0));
    assert_eq!(handle.state().mode, TransportMode::PrimarySocket);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_consumer_does_not_block_teardown() {
    let backend = Backend::new(SocketBehavior::Flood, StreamBehavior::Deliver);
    let addr = serve(backend.clone()).await;
    let (handle, mut events) = spawn_transport(StreamConfig {
        event_buffer: 8,
        ..config(addr, 5, ExhaustionPolicy::Cycle)
    });

    handle.activate("s-6", None).await.expect("activate");
    next_update(&mut events).await;
    // stop reading; the queue fills and the task waits for space
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(3), async move {
        handle.disconnect().await.expect("disconnect");
        handle.shutdown().await;
    })
    .await
    .expect("teardown with a full event queue");
    assert_eq!(backend.hits(), (1, 0));
    drop(events);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deactivate_cancels_pending_retry() {
    let backend = Backend::new(SocketBehavior::Reject, StreamBehavior::Unavailable);
    let addr = serve(backend.clone()).await;
    let (handle, mut events) = spawn_transport(config(addr, 5, ExhaustionPolicy::Cycle));

    handle.activate("s-7", None).await.expect("activate");
    wait_until(|| backend.hits().0 >= 2).await;

    handle.deactivate().await.expect("deactivate");
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(StreamEvent::SessionChanged { session_id: None }) => break,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("session cleared before timeout");

    let state = handle.watch_state();
    wait_until(|| state.borrow().status == ConnectionStatus::Disconnected).await;
    assert!(handle.state().session_id.is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = backend.hits();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.hits(), settled);

    // nothing to reconnect to until a new session is activated
    handle.connect().await.expect("connect");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.hits(), settled);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_session_url_wins_over_api_base() {
    let backend = Backend::new(SocketBehavior::Deliver, StreamBehavior::Deliver);
    let addr = serve(backend.clone()).await;
    let (handle, mut events) = spawn_transport(StreamConfig {
        api_base: "http://127.0.0.1:1".to_string(),
        ..config(addr, 5, ExhaustionPolicy::Cycle)
    });

    handle
        .activate("s-8", Some(format!("http://{addr}/ws/s-8")))
        .await
        .expect("activate");
    let update = next_update(&mut events).await;

    assert_eq!(update.session_id, "s-8");
    assert_eq!(update.kind, EventKind::IterationStart);
    assert_eq!(backend.hits(), (1, 0));
    let state = handle.state();
    assert_eq!(state.mode, TransportMode::PrimarySocket);
    assert_eq!(state.status, ConnectionStatus::Connected);

    handle.shutdown().await;
}
