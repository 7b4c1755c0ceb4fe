use chrono::Utc;
use futures_util::{future::BoxFuture, FutureExt};
use loopwatch_core::{frame::decode_json_frame, frame::encode_json_frame, normalize, CanonicalUpdate, OutboundMessage};
use serde::Serialize;
use std::collections::VecDeque;
use std::pin::Pin;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Sleep,
};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::connection::{self, Connection, Inbound};
use crate::endpoint;
use crate::policy::{ConnectionStatus, NextAttempt, TransportMode, TransportSelector};
use crate::TransportError;

const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum StreamCommand {
    /// Switch to `session_id`, discarding any previous session's transport.
    Activate {
        session_id: String,
        explicit_url: Option<String>,
    },
    /// Clear the session; tears everything down.
    Deactivate,
    /// Fresh attempt on the primary socket with full budgets.
    Connect,
    /// Close and stop retrying until the next `Connect` or `Activate`.
    Disconnect,
    Send(OutboundMessage),
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Status(ConnectionState),
    /// Emitted before the first update of a newly activated session.
    SessionChanged { session_id: Option<String> },
    Update(CanonicalUpdate),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub mode: TransportMode,
    pub session_id: Option<String>,
    pub socket_attempts: u32,
    pub push_stream_attempts: u32,
    pub last_error: Option<String>,
}

/// Caller side of the transport task.
pub struct StreamHandle {
    commands: mpsc::Sender<StreamCommand>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub async fn activate(
        &self,
        session_id: impl Into<String>,
        explicit_url: Option<String>,
    ) -> Result<(), TransportError> {
        self.command(StreamCommand::Activate {
            session_id: session_id.into(),
            explicit_url,
        })
        .await
    }

    pub async fn deactivate(&self) -> Result<(), TransportError> {
        self.command(StreamCommand::Deactivate).await
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        self.command(StreamCommand::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.command(StreamCommand::Disconnect).await
    }

    /// Fire-and-forget; dropped with a warning unless the primary socket is open.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.command(StreamCommand::Send(message)).await
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Closes the command queue and waits for the task to release its transport.
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(err) = self.task.await {
            warn!("transport_task_join_error: {err}");
        }
    }

    async fn command(&self, command: StreamCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Starts the transport task. Updates arrive in order on the returned receiver,
/// which is the single consumer queue for the session.
pub fn spawn_transport(config: StreamConfig) -> (StreamHandle, mpsc::Receiver<StreamEvent>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
    let (state_tx, state_rx) = watch::channel(ConnectionState::default());
    let manager = TransportManager::new(config, command_rx, event_tx, state_tx);
    let task = tokio::spawn(manager.run());
    (
        StreamHandle {
            commands: command_tx,
            state: state_rx,
            task,
        },
        event_rx,
    )
}

struct SessionTarget {
    session_id: String,
    explicit_url: Option<String>,
}

enum Link {
    Idle,
    Connecting(BoxFuture<'static, Result<Connection, TransportError>>),
    Open(Connection),
    Waiting(Pin<Box<Sleep>>),
}

enum LinkOutcome {
    Opened(Connection),
    ConnectFailed(TransportError),
    Inbound(Inbound),
    RetryDue,
}

impl Link {
    async fn progress(&mut self) -> LinkOutcome {
        match self {
            Link::Idle => std::future::pending().await,
            Link::Connecting(attempt) => match attempt.as_mut().await {
                Ok(connection) => LinkOutcome::Opened(connection),
                Err(err) => LinkOutcome::ConnectFailed(err),
            },
            Link::Open(connection) => LinkOutcome::Inbound(connection.next_inbound().await),
            Link::Waiting(timer) => {
                timer.as_mut().await;
                LinkOutcome::RetryDue
            }
        }
    }
}

struct TransportManager {
    config: StreamConfig,
    client: reqwest::Client,
    selector: TransportSelector,
    session: Option<SessionTarget>,
    reconnect_permitted: bool,
    link: Link,
    status: ConnectionStatus,
    last_error: Option<String>,
    commands: mpsc::Receiver<StreamCommand>,
    /// Commands that arrived while an event was waiting for queue space.
    deferred: VecDeque<StreamCommand>,
    /// Set while a teardown-type command is pending; events are then only
    /// delivered if the queue has room.
    halted: bool,
    closing: bool,
    events: mpsc::Sender<StreamEvent>,
    state: watch::Sender<ConnectionState>,
}

impl TransportManager {
    fn new(
        config: StreamConfig,
        commands: mpsc::Receiver<StreamCommand>,
        events: mpsc::Sender<StreamEvent>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        let selector = TransportSelector::new(&config);
        Self {
            config,
            client: reqwest::Client::new(),
            selector,
            session: None,
            reconnect_permitted: true,
            link: Link::Idle,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            commands,
            deferred: VecDeque::new(),
            halted: false,
            closing: false,
            events,
            state,
        }
    }

    async fn run(mut self) {
        loop {
            if let Some(command) = self.deferred.pop_front() {
                self.handle_command(command).await;
                continue;
            }
            if self.closing {
                break;
            }
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                outcome = self.link.progress() => self.handle_outcome(outcome).await,
            }
        }
        self.teardown().await;
        debug!("transport_task_stopped");
    }

    async fn handle_command(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::Activate {
                session_id,
                explicit_url,
            } => {
                self.halted = false;
                self.teardown().await;
                let changed = self
                    .session
                    .as_ref()
                    .map(|current| current.session_id != session_id)
                    .unwrap_or(true);
                info!("session_activated: {session_id}");
                self.session = Some(SessionTarget {
                    session_id: session_id.clone(),
                    explicit_url,
                });
                self.selector.reset();
                self.reconnect_permitted = true;
                self.last_error = None;
                if changed {
                    self.emit(StreamEvent::SessionChanged {
                        session_id: Some(session_id),
                    })
                    .await;
                }
                self.start_attempt().await;
            }
            StreamCommand::Deactivate => {
                self.teardown().await;
                if let Some(previous) = self.session.take() {
                    info!("session_deactivated: {}", previous.session_id);
                    self.emit(StreamEvent::SessionChanged { session_id: None }).await;
                }
                self.selector.reset();
                self.set_status(ConnectionStatus::Disconnected).await;
            }
            StreamCommand::Connect => {
                if self.session.is_none() {
                    warn!("connect_ignored: no active session");
                    return;
                }
                self.halted = false;
                self.teardown().await;
                self.selector.reset();
                self.reconnect_permitted = true;
                self.start_attempt().await;
            }
            StreamCommand::Disconnect => {
                self.selector.exhaust();
                self.reconnect_permitted = false;
                self.teardown().await;
                self.set_status(ConnectionStatus::Disconnected).await;
            }
            StreamCommand::Send(message) => self.send_outbound(message).await,
        }
    }

    async fn handle_outcome(&mut self, outcome: LinkOutcome) {
        match outcome {
            LinkOutcome::Opened(connection) => {
                info!("transport_connected: mode={}", connection.mode());
                self.selector.on_open();
                self.last_error = None;
                self.link = Link::Open(connection);
                self.set_status(ConnectionStatus::Connected).await;
            }
            LinkOutcome::ConnectFailed(err) => {
                warn!("transport_connect_error: mode={} {err}", self.selector.mode());
                self.link = Link::Idle;
                self.fail(err.to_string()).await;
            }
            LinkOutcome::Inbound(Inbound::Frame(text)) => self.handle_frame(&text).await,
            LinkOutcome::Inbound(Inbound::Closed { abnormal, reason }) => {
                self.link = Link::Idle;
                if abnormal {
                    warn!("transport_closed_abnormally: mode={} {reason}", self.selector.mode());
                    self.fail(reason).await;
                } else {
                    info!("transport_closed: mode={} {reason}", self.selector.mode());
                    self.set_status(ConnectionStatus::Disconnected).await;
                }
            }
            LinkOutcome::Inbound(Inbound::Failed(reason)) => {
                warn!("transport_error: mode={} {reason}", self.selector.mode());
                self.link = Link::Idle;
                self.fail(reason).await;
            }
            LinkOutcome::RetryDue => {
                self.link = Link::Idle;
                self.start_attempt().await;
            }
        }
    }

    async fn handle_frame(&mut self, text: &str) {
        let value = match decode_json_frame(text, self.config.max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!("frame_decode_error: {err}");
                return;
            }
        };
        let Some(update) = normalize(&value, Utc::now()) else {
            debug!("frame_dropped: missing session_id or type");
            return;
        };
        if let Some(target) = self.session.as_ref() {
            if update.session_id != target.session_id {
                debug!(
                    "frame_dropped: session {} is not active ({})",
                    update.session_id, target.session_id
                );
                return;
            }
        }
        self.emit(StreamEvent::Update(update)).await;
    }

    async fn send_outbound(&mut self, message: OutboundMessage) {
        let connection = match &mut self.link {
            Link::Open(connection) if connection.mode() == TransportMode::PrimarySocket => {
                connection
            }
            _ => {
                warn!("send_rejected: primary socket is not open (type={})", message.kind);
                return;
            }
        };
        let text = match encode_json_frame(&message, self.config.max_frame_bytes) {
            Ok(text) => text,
            Err(err) => {
                warn!("send_rejected: {err}");
                return;
            }
        };
        if let Err(err) = connection.send_text(text).await {
            warn!("send_failed: {err}");
        }
    }

    async fn start_attempt(&mut self) {
        let Some(target) = self.session.as_ref() else {
            return;
        };
        let mode = self.selector.mode();
        let base = self.config.endpoint_base().to_string();
        let explicit = target.explicit_url.as_deref();
        let attempt: BoxFuture<'static, Result<Connection, TransportError>> = match mode {
            TransportMode::PrimarySocket => {
                match endpoint::socket_url(&base, &target.session_id, explicit) {
                    Ok(url) => {
                        debug!("socket_connecting: {url}");
                        connection::open_socket(url).boxed()
                    }
                    Err(err) => futures_util::future::ready(Err(err)).boxed(),
                }
            }
            TransportMode::PushStream => {
                match endpoint::stream_url(&base, &target.session_id, explicit) {
                    Ok(url) => {
                        debug!("push_stream_connecting: {url}");
                        connection::open_push_stream(
                            self.client.clone(),
                            url,
                            self.config.max_frame_bytes,
                        )
                        .boxed()
                    }
                    Err(err) => futures_util::future::ready(Err(err)).boxed(),
                }
            }
        };
        self.link = Link::Connecting(attempt);
        self.set_status(ConnectionStatus::Connecting).await;
    }

    async fn fail(&mut self, reason: String) {
        self.last_error = Some(reason);
        self.set_status(ConnectionStatus::Error).await;
        if !self.reconnect_permitted || self.session.is_none() {
            return;
        }
        match self.selector.on_failure() {
            NextAttempt::Retry {
                mode,
                attempt,
                delay,
            } => {
                info!(
                    "reconnect_scheduled: mode={mode} attempt={attempt} delay_ms={}",
                    delay.as_millis()
                );
                self.link = Link::Waiting(Box::pin(tokio::time::sleep(delay)));
                self.publish_state();
            }
            NextAttempt::SwitchMode { to } => {
                info!("transport_fallback: retry budget spent, switching to {to}");
                self.start_attempt().await;
            }
            NextAttempt::GiveUp => {
                warn!("transport_exhausted: both retry budgets spent, giving up");
            }
        }
    }

    async fn teardown(&mut self) {
        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Open(connection) => {
                debug!("transport_teardown: closing {}", connection.mode());
                connection.close().await;
            }
            Link::Connecting(_) => debug!("transport_teardown: attempt cancelled"),
            Link::Waiting(_) => debug!("transport_teardown: retry timer cancelled"),
            Link::Idle => {}
        }
    }

    async fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        let snapshot = self.publish_state();
        self.emit(StreamEvent::Status(snapshot)).await;
    }

    fn publish_state(&self) -> ConnectionState {
        let snapshot = ConnectionState {
            status: self.status,
            mode: self.selector.mode(),
            session_id: self.session.as_ref().map(|target| target.session_id.clone()),
            socket_attempts: self.selector.budget(TransportMode::PrimarySocket).attempts(),
            push_stream_attempts: self.selector.budget(TransportMode::PushStream).attempts(),
            last_error: self.last_error.clone(),
        };
        self.state.send_replace(snapshot.clone());
        snapshot
    }

    /// Waits for queue space, but never past a command that tears the link
    /// down: a stalled consumer must not block `disconnect` or shutdown.
    async fn emit(&mut self, event: StreamEvent) {
        if self.halted || self.closing {
            if self.events.try_send(event).is_err() {
                debug!("event_dropped: consumer is not keeping up during teardown");
            }
            return;
        }
        loop {
            tokio::select! {
                permit = self.events.reserve() => {
                    match permit {
                        Ok(permit) => permit.send(event),
                        Err(_) => debug!("event_receiver_closed"),
                    }
                    return;
                }
                command = self.commands.recv() => match command {
                    Some(StreamCommand::Send(message)) => {
                        self.deferred.push_back(StreamCommand::Send(message));
                    }
                    Some(command) => {
                        debug!("event_dropped: superseded by a pending command");
                        self.deferred.push_back(command);
                        self.halted = true;
                        return;
                    }
                    None => {
                        debug!("event_dropped: command queue closed");
                        self.closing = true;
                        return;
                    }
                },
            }
        }
    }
}
