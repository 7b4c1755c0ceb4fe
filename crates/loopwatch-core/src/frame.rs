use serde_json::Value;
use thiserror::Error;

use crate::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    fn push_frame(&mut self, frame: T) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

/// Parses one text frame into JSON, enforcing the size cap.
pub fn decode_json_frame(text: &str, max_frame_bytes: usize) -> Result<Value, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn encode_json_frame<T: serde::Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Name the server gave the event; unnamed events are `message`.
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental decoder for a `text/event-stream` body.
///
/// Chunks may split lines or events anywhere; a blank line dispatches the
/// accumulated event. Comment lines (`: heartbeat`) are dropped.
pub struct SseFrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    current: SseEvent,
    has_data: bool,
}

impl SseFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            current: SseEvent::default(),
            has_data: false,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<SseEvent> {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.consume_line(&line, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.push_error(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Flushes a trailing event the server never terminated with a blank line.
    pub fn finish(&mut self) -> DecodeReport<SseEvent> {
        let mut report = DecodeReport::default();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.consume_line(&line, &mut report);
        }
        self.dispatch(&mut report);
        report
    }

    fn consume_line(&mut self, line: &[u8], report: &mut DecodeReport<SseEvent>) {
        if line.is_empty() {
            self.dispatch(report);
            return;
        }
        if line[0] == b':' {
            return;
        }
        let text = String::from_utf8_lossy(line);
        let (field, value) = match text.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (text.as_ref(), ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
                if self.current.data.len() > self.max_frame_bytes {
                    report.push_error(FrameError::OversizedFrame {
                        size: self.current.data.len(),
                        max: self.max_frame_bytes,
                    });
                    self.current = SseEvent::default();
                    self.has_data = false;
                }
            }
            "event" => self.current.event = Some(value.to_string()),
            "id" => self.current.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, report: &mut DecodeReport<SseEvent>) {
        if !self.has_data {
            self.current = SseEvent::default();
            return;
        }
        report.push_frame(std::mem::take(&mut self.current));
        self.has_data = false;
    }
}

impl Default for SseFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
