//! Server-sent events framing and the shared stream pump.

use codeloom_core::error::ProviderError;
use codeloom_core::provider::ProviderEvent;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// One `event:`/`data:` block terminated by a blank line.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Reassembles frames from arbitrarily split byte chunks.
#[derive(Default)]
pub(crate) struct SseBuffer {
    bytes: Vec<u8>,
    pending: SseFrame,
}

impl SseBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.bytes.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.bytes.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.bytes.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame when the body ends without a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.bytes.is_empty() {
            let raw = std::mem::take(&mut self.bytes);
            let line = String::from_utf8_lossy(&raw).trim_end().to_string();
            if let Some(frame) = self.line(&line) {
                return Some(frame);
            }
        }
        self.take_pending()
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.take_pending();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.pending.event = Some(value.to_string()),
            "data" => {
                if !self.pending.data.is_empty() {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
            }
            _ => {}
        }
        None
    }

    fn take_pending(&mut self) -> Option<SseFrame> {
        if self.pending.data.is_empty() && self.pending.event.is_none() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }
}

/// Vendor-specific translation of frames into provider events.
pub(crate) trait StreamDecoder: Send + 'static {
    fn frame(&mut self, frame: &SseFrame) -> Vec<ProviderEvent>;

    /// Called once when the body ends; must yield a terminal event if none
    /// was produced yet.
    fn end(&mut self) -> Vec<ProviderEvent>;
}

/// Drive `response` through `decoder` into `tx` until a terminal event,
/// the end of the body, an idle timeout, or cancellation.
pub(crate) async fn pump<D: StreamDecoder>(
    response: reqwest::Response,
    mut decoder: D,
    idle_timeout: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<ProviderEvent>,
) {
    let mut body = response.bytes_stream();
    let mut buffer = SseBuffer::default();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Provider stream cancelled");
                return;
            }
            next = tokio::time::timeout(idle_timeout, body.next()) => next,
        };

        let done = !matches!(next, Ok(Some(Ok(_))));
        let events = match next {
            Err(_) => vec![ProviderEvent::error(ProviderError::Timeout(format!(
                "no stream data for {}s",
                idle_timeout.as_secs()
            )))],
            Ok(Some(Err(e))) => vec![ProviderEvent::error(ProviderError::StreamInterrupted(
                e.to_string(),
            ))],
            Ok(None) => {
                let mut events: Vec<ProviderEvent> = buffer
                    .finish()
                    .map(|frame| decoder.frame(&frame))
                    .unwrap_or_default();
                if !events.iter().any(ProviderEvent::is_terminal) {
                    events.extend(decoder.end());
                }
                events
            }
            Ok(Some(Ok(chunk))) => {
                let mut events = Vec::new();
                for frame in buffer.push(&chunk) {
                    trace!(event = ?frame.event, "SSE frame");
                    events.extend(decoder.frame(&frame));
                }
                if events.is_empty() {
                    continue;
                }
                events
            }
        };

        for event in events {
            let terminal = event.is_terminal();
            if tx.send(event).await.is_err() || terminal {
                return;
            }
        }
        if done {
            return;
        }
    }
}
