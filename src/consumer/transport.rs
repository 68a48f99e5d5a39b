//! Event transports: in-process subscription and SSE over HTTP.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use super::connection::{EventStream, EventTransport};
use crate::distributor::EventDistributor;
use crate::events::{EventEnvelope, StreamMessage};
use crate::store::ConversationStore;

/// SSE event name carrying one JSON envelope.
pub const PROGRESS_EVENT_NAME: &str = "progress";
/// Reserved SSE event name signalling stream closure.
pub const CLOSE_EVENT_NAME: &str = "close";

/// Subscribes directly to an in-process distributor. Resuming needs the
/// store the distributor persists into; without one, reconnects are live-only.
pub struct DistributorTransport {
    distributor: Arc<EventDistributor>,
    store: Option<Arc<dyn ConversationStore>>,
}

impl DistributorTransport {
    pub fn new(distributor: Arc<EventDistributor>) -> Self {
        Self {
            distributor,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }
}

#[async_trait]
impl EventTransport for DistributorTransport {
    async fn open(&self, project_id: &str, after_sequence: Option<u64>) -> Result<EventStream> {
        match (after_sequence, &self.store) {
            (Some(after), Some(store)) => {
                let resumed = self
                    .distributor
                    .resume(store.as_ref(), project_id, after)
                    .await
                    .context("Failed to resume event stream")?;
                Ok(resumed.map(Ok).boxed())
            }
            _ => Ok(self.distributor.subscribe_stream(project_id).map(Ok).boxed()),
        }
    }
}

/// Connects to `GET {base_url}/api/projects/{id}/stream`.
pub struct SseTransport {
    http: reqwest::Client,
    base_url: String,
}

impl SseTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn stream_url(&self, project_id: &str, after_sequence: Option<u64>) -> String {
        match after_sequence {
            Some(after) => format!("{}/api/projects/{}/stream?after={}", self.base_url, project_id, after),
            None => format!("{}/api/projects/{}/stream", self.base_url, project_id),
        }
    }
}

#[async_trait]
impl EventTransport for SseTransport {
    async fn open(&self, project_id: &str, after_sequence: Option<u64>) -> Result<EventStream> {
        let resp = self
            .http
            .get(self.stream_url(project_id, after_sequence))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .context("Failed to connect to event stream")?
            .error_for_status()
            .context("Event stream endpoint returned error status")?;

        let bytes = resp.bytes_stream().boxed();
        let stream = futures::stream::unfold(
            (bytes, SseDecoder::new(), VecDeque::new(), false),
            |(mut bytes, mut decoder, mut pending, mut done)| async move {
                loop {
                    if let Some(item) = pending.pop_front() {
                        return Some((item, (bytes, decoder, pending, done)));
                    }
                    if done {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            for frame in decoder.feed(&chunk) {
                                if let Some(item) = frame.into_message() {
                                    pending.push_back(item);
                                }
                            }
                        }
                        Some(Err(e)) => {
                            pending.push_back(Err(anyhow::Error::new(e).context("Event stream read failed")));
                            done = true;
                        }
                        None => done = true,
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// `None` for frames that carry nothing for the consumer.
    fn into_message(self) -> Option<Result<StreamMessage>> {
        match self.event.as_deref() {
            Some(CLOSE_EVENT_NAME) => Some(Ok(StreamMessage::Closed)),
            Some(PROGRESS_EVENT_NAME) | None => {
                if self.data.is_empty() {
                    return None;
                }
                Some(
                    serde_json::from_str::<EventEnvelope>(&self.data)
                        .map(StreamMessage::Event)
                        .context("Failed to decode progress frame"),
                )
            }
            Some(other) => {
                debug!(event = other, "ignoring unknown SSE event");
                None
            }
        }
    }
}

/// Incremental `text/event-stream` parser. Bytes may arrive split anywhere,
/// including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    current: SseFrame,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            let frame = std::mem::take(&mut self.current);
            return (frame.event.is_some() || !frame.data.is_empty()).then_some(frame);
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.current.event = Some(value.to_string()),
            "data" => {
                if !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
            }
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProgressEvent;

    #[test]
    fn test_decoder_handles_split_chunks_and_keepalive() {
        let mut decoder = SseDecoder::new();
        let mut frames = decoder.feed(b": keep-alive\n\nevent: prog");
        assert!(frames.is_empty());
        frames.extend(decoder.feed(b"ress\ndata: {\"a\":1}\r\n\r\nevent: close\ndata: \n\n"));
        assert_eq!(
            frames,
            vec![
                SseFrame { event: Some("progress".into()), data: "{\"a\":1}".into() },
                SseFrame { event: Some("close".into()), data: String::new() },
            ]
        );
    }

    #[test]
    fn test_decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn test_decoder_split_utf8() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: é\n\n".as_bytes();
        let (a, b) = bytes.split_at(7);
        assert!(decoder.feed(a).is_empty());
        assert_eq!(decoder.feed(b)[0].data, "é");
    }

    #[test]
    fn test_frame_to_message() {
        let frame = SseFrame {
            event: Some("progress".into()),
            data: r#"{"projectId":"P1","sequence":1,"emittedAt":"2024-01-01T00:00:00Z","type":"complete","message":"Done"}"#.into(),
        };
        match frame.into_message() {
            Some(Ok(StreamMessage::Event(env))) => {
                assert_eq!(env.event, ProgressEvent::Complete { message: "Done".into() })
            }
            other => panic!("unexpected {:?}", other.map(|r| r.is_ok())),
        }

        let close = SseFrame { event: Some("close".into()), data: String::new() };
        assert!(matches!(close.into_message(), Some(Ok(StreamMessage::Closed))));

        let junk = SseFrame { event: Some("progress".into()), data: "{nope".into() };
        assert!(matches!(junk.into_message(), Some(Err(_))));
    }

    #[tokio::test]
    async fn test_distributor_transport_delivers_published_events() {
        let dist = Arc::new(EventDistributor::default());
        let transport = DistributorTransport::new(dist.clone());
        let mut stream = transport.open("P1", None).await.unwrap();

        dist.publish("P1", ProgressEvent::StepStart { message: "go".into() }, None);
        match stream.next().await {
            Some(Ok(StreamMessage::Event(env))) => assert_eq!(env.sequence, 1),
            _ => panic!("expected event"),
        }
        drop(stream);
        assert_eq!(dist.subscriber_count("P1"), 0);
    }

    #[tokio::test]
    async fn test_distributor_transport_catches_up_from_store() -> Result<()> {
        use crate::distributor::EventPersister;
        use crate::store::SqliteStore;

        let store = Arc::new(SqliteStore::in_memory()?);
        let dist = Arc::new(
            EventDistributor::default().with_persister(EventPersister::spawn(store.clone())),
        );
        let transport = DistributorTransport::new(dist.clone()).with_store(store);

        let first = dist.publish("P1", ProgressEvent::StepStart { message: "go".into() }, None);
        dist.publish("P1", ProgressEvent::Complete { message: "Done".into() }, None);

        let mut stream = transport.open("P1", Some(first.sequence)).await?;
        match stream.next().await {
            Some(Ok(StreamMessage::Event(env))) => {
                assert_eq!(env.event, ProgressEvent::Complete { message: "Done".into() })
            }
            _ => panic!("expected caught-up event"),
        }
        Ok(())
    }

    #[test]
    fn test_stream_url_carries_resume_point() {
        let transport = SseTransport::new("http://127.0.0.1:3000/");
        assert_eq!(
            transport.stream_url("P1", None),
            "http://127.0.0.1:3000/api/projects/P1/stream"
        );
        assert_eq!(
            transport.stream_url("P1", Some(12)),
            "http://127.0.0.1:3000/api/projects/P1/stream?after=12"
        );
    }
}
