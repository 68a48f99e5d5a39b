//! Reconnecting stream consumer.
//!
//! Drives one viewer's connection to a project's event stream, folding every
//! event into a [`GenerationState`]. Connection handling is an explicit state
//! machine over [`ConnectionPhase`]; the transport and the reconnect sleeper
//! are injected so the whole loop runs deterministically in tests.
//!
//! Every reconnect asks the transport to resume after the last applied
//! sequence, so events emitted while disconnected are caught up on.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::active::{ActiveGenerationGuard, ActiveGenerations};
use super::state::GenerationState;
use crate::events::{EventEnvelope, StreamMessage};

pub type EventStream = BoxStream<'static, Result<StreamMessage>>;

/// Opens a push connection to a project's event stream.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// With `after_sequence` set, the stream first yields the missed durable
    /// events stamped after it, then continues live.
    async fn open(&self, project_id: &str, after_sequence: Option<u64>) -> Result<EventStream>;
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub reconnect_delay: Duration,
    /// Consecutive connection losses (without an event in between) before
    /// giving up.
    pub max_consecutive_failures: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_consecutive_failures: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connected,
    Reconnecting,
    /// The run reached `complete` or `error`.
    Terminal,
    /// The server sent the close frame.
    Closed,
    /// Gave up after repeated connection losses.
    Disconnected,
}

impl ConnectionPhase {
    /// `run` has returned and will not reconnect.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Terminal | Self::Closed | Self::Disconnected)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSnapshot {
    pub phase: ConnectionPhase,
    pub state: GenerationState,
}

enum StreamEnd {
    Terminal,
    Closed,
    Lost { saw_event: bool },
}

pub struct StreamConsumer {
    project_id: String,
    transport: Arc<dyn EventTransport>,
    sleeper: Arc<dyn Sleeper>,
    active: ActiveGenerations,
    config: ConsumerConfig,
    state: GenerationState,
    last_sequence: Option<u64>,
    phase: ConnectionPhase,
    guard: Option<ActiveGenerationGuard>,
    updates: watch::Sender<ConsumerSnapshot>,
}

impl StreamConsumer {
    pub fn new(
        project_id: impl Into<String>,
        transport: Arc<dyn EventTransport>,
        active: ActiveGenerations,
    ) -> Self {
        let (updates, _) = watch::channel(ConsumerSnapshot::default());
        Self {
            project_id: project_id.into(),
            transport,
            sleeper: Arc::new(TokioSleeper),
            active,
            config: ConsumerConfig::default(),
            state: GenerationState::new(),
            last_sequence: None,
            phase: ConnectionPhase::Idle,
            guard: None,
            updates,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed from a replayed state, e.g. after a full page reload.
    pub fn with_state(mut self, state: GenerationState) -> Self {
        self.last_sequence = state.events.iter().map(|e| e.sequence).max();
        self.state = state;
        self
    }

    /// Sequence of the last event folded into the state.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn into_state(self) -> GenerationState {
        self.state
    }

    pub fn watch(&self) -> watch::Receiver<ConsumerSnapshot> {
        self.updates.subscribe()
    }

    /// Consume until the run ends, the server closes the stream, or the
    /// connection is lost too many times in a row.
    pub async fn run(&mut self) -> ConnectionPhase {
        if self.state.status.is_terminal() {
            self.finish(ConnectionPhase::Terminal);
            return self.phase;
        }
        self.track_activity();

        let mut failures = 0u32;
        loop {
            match self.transport.open(&self.project_id, self.last_sequence).await {
                Ok(stream) => {
                    self.set_phase(ConnectionPhase::Connected);
                    match self.drain(stream).await {
                        StreamEnd::Terminal => {
                            self.finish(ConnectionPhase::Terminal);
                            return self.phase;
                        }
                        StreamEnd::Closed => {
                            self.finish(ConnectionPhase::Closed);
                            return self.phase;
                        }
                        StreamEnd::Lost { saw_event } => {
                            if saw_event {
                                failures = 0;
                            }
                            warn!(project_id = %self.project_id, "event stream lost");
                        }
                    }
                }
                Err(e) => {
                    warn!(project_id = %self.project_id, error = %e, "failed to open event stream");
                }
            }

            failures += 1;
            if failures >= self.config.max_consecutive_failures {
                warn!(
                    project_id = %self.project_id,
                    failures,
                    "giving up on event stream"
                );
                self.finish(ConnectionPhase::Disconnected);
                return self.phase;
            }

            self.set_phase(ConnectionPhase::Reconnecting);
            debug!(
                project_id = %self.project_id,
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "reconnecting"
            );
            self.sleeper.sleep(self.config.reconnect_delay).await;
        }
    }

    async fn drain(&mut self, mut stream: EventStream) -> StreamEnd {
        let mut saw_event = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(StreamMessage::Event(envelope)) => {
                    saw_event = true;
                    self.apply(envelope);
                    if self.state.status.is_terminal() {
                        return StreamEnd::Terminal;
                    }
                }
                Ok(StreamMessage::Closed) => return StreamEnd::Closed,
                Err(e) => {
                    debug!(project_id = %self.project_id, error = %e, "stream error");
                    return StreamEnd::Lost { saw_event };
                }
            }
        }
        StreamEnd::Lost { saw_event }
    }

    fn apply(&mut self, envelope: EventEnvelope) {
        if self.last_sequence.is_some_and(|last| envelope.sequence <= last) {
            debug!(
                project_id = %self.project_id,
                sequence = envelope.sequence,
                "skipping already applied event"
            );
            return;
        }
        self.last_sequence = Some(envelope.sequence);
        self.state.apply(envelope);
        self.track_activity();
        self.publish_snapshot();
    }

    /// Hold the active-generation guard exactly while the run is active.
    fn track_activity(&mut self) {
        if self.state.status.is_active() {
            if self.guard.is_none() {
                self.guard = Some(self.active.acquire());
            }
        } else {
            self.guard = None;
        }
    }

    fn set_phase(&mut self, phase: ConnectionPhase) {
        if self.phase != phase {
            debug!(project_id = %self.project_id, from = ?self.phase, to = ?phase, "connection phase");
            self.phase = phase;
            self.publish_snapshot();
        }
    }

    fn finish(&mut self, phase: ConnectionPhase) {
        self.guard = None;
        info!(project_id = %self.project_id, phase = ?phase, status = ?self.state.status, "stream consumer finished");
        self.set_phase(phase);
    }

    fn publish_snapshot(&self) {
        self.updates.send_replace(ConsumerSnapshot {
            phase: self.phase,
            state: self.state.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::state::GenerationStatus;
    use crate::events::ProgressEvent;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

    fn env(event: ProgressEvent) -> Result<StreamMessage> {
        env_at(NEXT_SEQUENCE.fetch_add(1, Ordering::SeqCst), event)
    }

    fn env_at(sequence: u64, event: ProgressEvent) -> Result<StreamMessage> {
        Ok(StreamMessage::Event(EventEnvelope {
            project_id: "P1".into(),
            sequence,
            emitted_at: Utc::now(),
            version_id: None,
            event,
        }))
    }

    /// Each `open` pops the next scripted connection; `None` means the open
    /// itself fails.
    struct ScriptedTransport {
        connections: Mutex<VecDeque<Option<Vec<Result<StreamMessage>>>>>,
        opens: Mutex<u32>,
        resumed_from: Mutex<Vec<Option<u64>>>,
    }

    impl ScriptedTransport {
        fn new(connections: Vec<Option<Vec<Result<StreamMessage>>>>) -> Arc<Self> {
            Arc::new(Self {
                connections: Mutex::new(connections.into()),
                opens: Mutex::new(0),
                resumed_from: Mutex::new(Vec::new()),
            })
        }

        fn opens(&self) -> u32 {
            *self.opens.lock().unwrap()
        }
    }

    #[async_trait]
    impl EventTransport for ScriptedTransport {
        async fn open(&self, _project_id: &str, after_sequence: Option<u64>) -> Result<EventStream> {
            *self.opens.lock().unwrap() += 1;
            self.resumed_from.lock().unwrap().push(after_sequence);
            match self.connections.lock().unwrap().pop_front() {
                Some(Some(items)) => Ok(futures::stream::iter(items).boxed()),
                _ => anyhow::bail!("connection refused"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        sleeps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    fn consumer(
        transport: Arc<ScriptedTransport>,
        active: &ActiveGenerations,
        sleeper: Arc<RecordingSleeper>,
    ) -> StreamConsumer {
        StreamConsumer::new("P1", transport, active.clone()).with_sleeper(sleeper)
    }

    #[tokio::test]
    async fn test_runs_to_terminal_on_single_connection() {
        let transport = ScriptedTransport::new(vec![Some(vec![
            env(ProgressEvent::ProjectCreated { message: String::new() }),
            env(ProgressEvent::Complete { message: String::new() }),
        ])]);
        let active = ActiveGenerations::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut c = consumer(transport.clone(), &active, sleeper.clone());

        assert_eq!(c.run().await, ConnectionPhase::Terminal);
        assert_eq!(c.state().status, GenerationStatus::Complete);
        assert_eq!(active.count(), 0);
        assert_eq!(active.idle_transitions(), 1);
        assert!(sleeper.sleeps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconnects_once_after_loss_and_releases_counter_once() {
        let transport = ScriptedTransport::new(vec![
            Some(vec![env(ProgressEvent::StepStart { message: "Generating".into() })]),
            Some(vec![env(ProgressEvent::Complete { message: "Done".into() })]),
        ]);
        let active = ActiveGenerations::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut c = consumer(transport.clone(), &active, sleeper.clone());

        assert_eq!(c.run().await, ConnectionPhase::Terminal);
        assert_eq!(transport.opens(), 2);
        assert_eq!(*sleeper.sleeps.lock().unwrap(), vec![Duration::from_secs(5)]);
        assert_eq!(active.count(), 0);
        assert_eq!(active.idle_transitions(), 1);
    }

    #[tokio::test]
    async fn test_second_consecutive_failure_disconnects() {
        let transport = ScriptedTransport::new(vec![
            Some(vec![env(ProgressEvent::StepStart { message: "Generating".into() })]),
            None,
            Some(vec![env(ProgressEvent::Complete { message: String::new() })]),
        ]);
        let active = ActiveGenerations::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut c = consumer(transport.clone(), &active, sleeper);

        assert_eq!(c.run().await, ConnectionPhase::Disconnected);
        assert_eq!(transport.opens(), 2);
        assert_eq!(c.state().status, GenerationStatus::Generating);
        assert_eq!(active.count(), 0);
        assert_eq!(active.idle_transitions(), 1);
    }

    #[tokio::test]
    async fn test_event_after_reconnect_resets_failure_count() {
        let transport = ScriptedTransport::new(vec![
            Some(vec![env(ProgressEvent::StepStart { message: "a".into() })]),
            Some(vec![env(ProgressEvent::StepStart { message: "b".into() })]),
            Some(vec![env(ProgressEvent::Complete { message: String::new() })]),
        ]);
        let active = ActiveGenerations::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut c = consumer(transport.clone(), &active, sleeper);

        assert_eq!(c.run().await, ConnectionPhase::Terminal);
        assert_eq!(transport.opens(), 3);
        assert_eq!(active.idle_transitions(), 1);
    }

    #[tokio::test]
    async fn test_close_frame_ends_without_reconnect() {
        let transport = ScriptedTransport::new(vec![Some(vec![
            env(ProgressEvent::StepStart { message: "Generating".into() }),
            Ok(StreamMessage::Closed),
        ])]);
        let active = ActiveGenerations::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut c = consumer(transport.clone(), &active, sleeper);

        assert_eq!(c.run().await, ConnectionPhase::Closed);
        assert_eq!(transport.opens(), 1);
        assert_eq!(active.count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_seed_never_connects() {
        let transport = ScriptedTransport::new(vec![]);
        let active = ActiveGenerations::new();
        let seeded = GenerationState {
            status: GenerationStatus::Complete,
            ..GenerationState::default()
        };
        let mut c = consumer(transport.clone(), &active, Arc::new(RecordingSleeper::default()))
            .with_state(seeded);

        assert_eq!(c.run().await, ConnectionPhase::Terminal);
        assert_eq!(transport.opens(), 0);
        assert_eq!(active.idle_transitions(), 0);
    }

    #[tokio::test]
    async fn test_dropping_consumer_mid_run_releases_counter() {
        let transport = ScriptedTransport::new(vec![Some(vec![env(ProgressEvent::StepStart {
            message: "Generating".into(),
        })])]);
        let active = ActiveGenerations::new();
        let mut c = consumer(transport, &active, Arc::new(RecordingSleeper::default()));

        let stream = c.transport.open("P1", None).await.unwrap();
        let _ = c.drain(stream).await;
        assert_eq!(active.count(), 1);
        drop(c);
        assert_eq!(active.count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_resumes_after_last_applied_sequence() {
        let transport = ScriptedTransport::new(vec![
            Some(vec![
                env_at(1, ProgressEvent::StepStart { message: "Generating".into() }),
                env_at(2, ProgressEvent::FileGenerating { filename: "a.ts".into() }),
            ]),
            Some(vec![
                env_at(2, ProgressEvent::FileGenerating { filename: "a.ts".into() }),
                env_at(3, ProgressEvent::FileComplete { filename: "a.ts".into(), content: "x".into() }),
                env_at(4, ProgressEvent::Complete { message: "Done".into() }),
            ]),
        ]);
        let active = ActiveGenerations::new();
        let mut c = consumer(transport.clone(), &active, Arc::new(RecordingSleeper::default()));

        assert_eq!(c.run().await, ConnectionPhase::Terminal);
        assert_eq!(*transport.resumed_from.lock().unwrap(), vec![None, Some(2)]);
        assert_eq!(c.state().events.len(), 4);
        assert_eq!(c.last_sequence(), Some(4));
        assert_eq!(active.count(), 0);
        assert_eq!(active.idle_transitions(), 1);
    }

    #[tokio::test]
    async fn test_seeded_state_resumes_from_its_last_event() {
        let transport = ScriptedTransport::new(vec![Some(vec![
            env_at(7, ProgressEvent::StepStart { message: "Generating".into() }),
            env_at(8, ProgressEvent::Complete { message: String::new() }),
        ])]);
        let seeded = GenerationState::new()
            .reduce(EventEnvelope {
                project_id: "P1".into(),
                sequence: 7,
                emitted_at: Utc::now(),
                version_id: None,
                event: ProgressEvent::StepStart { message: "Generating".into() },
            });
        let active = ActiveGenerations::new();
        let mut c = consumer(transport.clone(), &active, Arc::new(RecordingSleeper::default()))
            .with_state(seeded);

        assert_eq!(c.run().await, ConnectionPhase::Terminal);
        assert_eq!(*transport.resumed_from.lock().unwrap(), vec![Some(7)]);
        assert_eq!(c.state().events.len(), 2);
    }

    #[tokio::test]
    async fn test_watch_publishes_final_snapshot() {
        let transport = ScriptedTransport::new(vec![Some(vec![
            env(ProgressEvent::FileGenerating { filename: "a.ts".into() }),
            env(ProgressEvent::Error { message: "boom".into() }),
        ])]);
        let active = ActiveGenerations::new();
        let mut c = consumer(transport, &active, Arc::new(RecordingSleeper::default()));
        let rx = c.watch();

        c.run().await;
        let snap = rx.borrow().clone();
        assert_eq!(snap.phase, ConnectionPhase::Terminal);
        assert_eq!(snap.state.status, GenerationStatus::Error);
        assert_eq!(snap.state.error.as_deref(), Some("boom"));
    }
}
