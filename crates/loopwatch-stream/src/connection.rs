use futures_util::{stream::BoxStream, SinkExt, StreamExt};
use loopwatch_core::{SseEvent, SseFrameDecoder};
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::frame::coding::CloseCode, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::policy::TransportMode;
use crate::TransportError;

type SocketStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What one read from the active transport produced.
#[derive(Debug)]
pub(crate) enum Inbound {
    Frame(String),
    Closed { abnormal: bool, reason: String },
    Failed(String),
}

pub(crate) enum Connection {
    Socket(Box<SocketStream>),
    PushStream(PushStream),
}

pub(crate) struct PushStream {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseFrameDecoder,
    ready: VecDeque<SseEvent>,
    ended: bool,
}

pub(crate) async fn open_socket(url: Url) -> Result<Connection, TransportError> {
    let (ws, _) = connect_async(url.as_str())
        .await
        .map_err(|err| TransportError::SocketConnect(err.to_string()))?;
    Ok(Connection::Socket(Box::new(ws)))
}

pub(crate) async fn open_push_stream(
    client: reqwest::Client,
    url: Url,
    max_frame_bytes: usize,
) -> Result<Connection, TransportError> {
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|err| TransportError::PushStreamRequest(err.to_string()))?;
    if !response.status().is_success() {
        return Err(TransportError::PushStreamStatus(response.status().as_u16()));
    }
    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
        .boxed();
    Ok(Connection::PushStream(PushStream {
        body,
        decoder: SseFrameDecoder::new(max_frame_bytes),
        ready: VecDeque::new(),
        ended: false,
    }))
}

impl Connection {
    pub(crate) fn mode(&self) -> TransportMode {
        match self {
            Connection::Socket(_) => TransportMode::PrimarySocket,
            Connection::PushStream(_) => TransportMode::PushStream,
        }
    }

    /// Waits for the next text frame. Cancel-safe: nothing is consumed from
    /// the transport unless this returns.
    pub(crate) async fn next_inbound(&mut self) -> Inbound {
        match self {
            Connection::Socket(ws) => next_socket_frame(ws).await,
            Connection::PushStream(stream) => stream.next_event().await,
        }
    }

    pub(crate) async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        match self {
            Connection::Socket(ws) => ws
                .send(Message::Text(text))
                .await
                .map_err(|err| TransportError::Send(err.to_string())),
            Connection::PushStream(_) => Err(TransportError::Send(
                "push stream is receive-only".to_string(),
            )),
        }
    }

    pub(crate) async fn close(self) {
        if let Connection::Socket(mut ws) = self {
            if let Err(err) = (*ws).close(None).await {
                debug!("socket_close_error: {err}");
            }
        }
    }
}

async fn next_socket_frame(ws: &mut SocketStream) -> Inbound {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Inbound::Frame(text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => return Inbound::Frame(text),
                Err(err) => warn!("socket_binary_frame_invalid_utf8: {err}"),
            },
            Some(Ok(Message::Close(frame))) => {
                let (abnormal, reason) = match frame {
                    Some(frame) => (
                        frame.code != CloseCode::Normal,
                        format!("closed with code {}: {}", u16::from(frame.code), frame.reason),
                    ),
                    None => (true, "closed without status".to_string()),
                };
                return Inbound::Closed { abnormal, reason };
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Inbound::Failed(err.to_string()),
            None => {
                return Inbound::Closed {
                    abnormal: true,
                    reason: "socket ended".to_string(),
                }
            }
        }
    }
}

impl PushStream {
    async fn next_event(&mut self) -> Inbound {
        loop {
            if let Some(event) = self.ready.pop_front() {
                if event.name() == "connected" {
                    debug!("push_stream_connected: {}", event.data);
                    continue;
                }
                return Inbound::Frame(event.data);
            }
            if self.ended {
                return Inbound::Closed {
                    abnormal: true,
                    reason: "push stream ended".to_string(),
                };
            }
            match self.body.next().await {
                Some(Ok(chunk)) => {
                    let report = self.decoder.push_chunk(&chunk);
                    for err in report.errors {
                        warn!("push_stream_decode_error: {err}");
                    }
                    self.ready.extend(report.frames);
                }
                Some(Err(err)) => return Inbound::Failed(err.to_string()),
                None => {
                    self.ended = true;
                    let report = self.decoder.finish();
                    for err in report.errors {
                        warn!("push_stream_decode_error: {err}");
                    }
                    self.ready.extend(report.frames);
                }
            }
        }
    }
}
