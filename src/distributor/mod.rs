//! Per-project fan-out of progress events.
//!
//! Each project id maps to the list of live subscriber channels. Writers for
//! different projects only contend on their dashmap shard. Sends are
//! `try_send` on bounded channels, so a slow viewer can never stall the
//! producer or its siblings.

pub mod persist;

use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{SharedClock, SystemClock};
use crate::events::{EventEnvelope, ProgressEvent, StreamMessage};
use crate::store::ConversationStore;

pub use persist::{EventPersister, PersistFailure};

/// How long `close` waits to deliver the close marker to a full channel.
const CLOSE_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub subscriber_buffer: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            idle_timeout: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Identifies one subscription for `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub project_id: String,
    pub id: Uuid,
}

struct Subscriber {
    id: Uuid,
    sink: mpsc::Sender<StreamMessage>,
    last_activity: DateTime<Utc>,
}

pub struct EventDistributor {
    projects: DashMap<String, Vec<Subscriber>>,
    sequence: AtomicU64,
    last_emitted_micros: AtomicI64,
    persister: Option<EventPersister>,
    clock: SharedClock,
    config: DistributorConfig,
}

impl EventDistributor {
    pub fn new(config: DistributorConfig) -> Self {
        Self {
            projects: DashMap::new(),
            sequence: AtomicU64::new(0),
            last_emitted_micros: AtomicI64::new(i64::MIN),
            persister: None,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_persister(mut self, persister: EventPersister) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Wait for queued durable writes. No-op without a persister.
    pub async fn flush(&self) {
        if let Some(p) = &self.persister {
            p.flush().await;
        }
    }

    pub fn subscribe(&self, project_id: &str) -> (SubscriptionHandle, mpsc::Receiver<StreamMessage>) {
        let (sink, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let id = Uuid::new_v4();
        self.projects
            .entry(project_id.to_string())
            .or_default()
            .push(Subscriber {
                id,
                sink,
                last_activity: self.clock.now(),
            });
        debug!(project_id, subscriber = %id, "subscribed");
        (
            SubscriptionHandle {
                project_id: project_id.to_string(),
                id,
            },
            rx,
        )
    }

    /// Subscribe as a `Stream` that unsubscribes itself when dropped.
    pub fn subscribe_stream(self: &Arc<Self>, project_id: &str) -> SubscriptionStream {
        let (handle, rx) = self.subscribe(project_id);
        SubscriptionStream {
            distributor: Arc::downgrade(self),
            handle,
            rx,
        }
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = match self.projects.get_mut(&handle.project_id) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != handle.id);
                subs.len() < before
            }
            None => false,
        };
        self.projects
            .remove_if(&handle.project_id, |_, subs| subs.is_empty());
        if removed {
            debug!(project_id = %handle.project_id, subscriber = %handle.id, "unsubscribed");
        }
        removed
    }

    /// Stamp, persist (allow-listed types only) and fan out one event.
    ///
    /// The project's entry stays locked from stamping through delivery, so
    /// every subscriber of a project sees its events in sequence order and
    /// the persister receives them in the same order.
    pub fn publish(
        &self,
        project_id: &str,
        event: ProgressEvent,
        version_id: Option<String>,
    ) -> EventEnvelope {
        let mut subs = self.projects.entry(project_id.to_string()).or_default();

        let envelope = EventEnvelope {
            project_id: project_id.to_string(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            emitted_at: self.next_emission_time(),
            version_id,
            event,
        };

        let event_type = envelope.event.event_type();
        if event_type.is_persisted()
            && let Some(persister) = &self.persister
        {
            persister.enqueue(envelope.clone());
        }

        let mut delivered = 0usize;
        let now = self.clock.now();
        subs.retain_mut(|sub| {
            match sub.sink.try_send(StreamMessage::Event(envelope.clone())) {
                Ok(()) => {
                    sub.last_activity = now;
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        project_id,
                        subscriber = %sub.id,
                        event_type = %event_type,
                        "subscriber buffer full, dropping event"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(project_id, subscriber = %sub.id, "subscriber gone, removing");
                    false
                }
            }
        });
        drop(subs);
        self.projects.remove_if(project_id, |_, subs| subs.is_empty());

        debug!(
            project_id,
            event_type = %event_type,
            sequence = envelope.sequence,
            delivered,
            "published event"
        );
        envelope
    }

    /// Subscribe and catch up on durable events stamped after
    /// `after_sequence`. The live subscription is taken before the store is
    /// read, so nothing published in between is lost; live events already
    /// covered by the catch-up are filtered out.
    ///
    /// Only persisted event types can be caught up on. Transient events
    /// (`code:chunk`, `file:generating`) missed while disconnected are gone.
    pub async fn resume(
        self: &Arc<Self>,
        store: &dyn ConversationStore,
        project_id: &str,
        after_sequence: u64,
    ) -> Result<BoxStream<'static, StreamMessage>> {
        let live = self.subscribe_stream(project_id);
        self.flush().await;

        let mut missed: Vec<EventEnvelope> = store
            .list_durable_events(project_id, None)
            .await?
            .iter()
            .filter_map(|row| row.envelope())
            .filter(|envelope| envelope.sequence > after_sequence)
            .collect();
        missed.sort_by_key(|envelope| envelope.sequence);

        let cutoff = missed
            .last()
            .map(|envelope| envelope.sequence)
            .unwrap_or(after_sequence);
        debug!(project_id, after_sequence, missed = missed.len(), "resuming stream");

        let live = live.filter(move |message| {
            let keep = match message {
                StreamMessage::Event(envelope) => envelope.sequence > cutoff,
                StreamMessage::Closed => true,
            };
            futures::future::ready(keep)
        });
        Ok(stream::iter(missed.into_iter().map(StreamMessage::Event))
            .chain(live)
            .boxed())
    }

    /// Send the close marker to every subscriber of a project and evict them.
    pub fn close(&self, project_id: &str) {
        let Some((_, subs)) = self.projects.remove(project_id) else {
            return;
        };
        let count = subs.len();
        for sub in subs {
            match sub.sink.try_send(StreamMessage::Closed) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            let _ = tokio::time::timeout(
                                CLOSE_DELIVERY_TIMEOUT,
                                sub.sink.send(StreamMessage::Closed),
                            )
                            .await;
                        });
                    }
                }
            }
        }
        info!(project_id, subscribers = count, "closed project stream");
    }

    /// Evict subscriptions idle longer than the configured timeout.
    /// Returns the number of subscriptions removed.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let timeout = TimeDelta::from_std(self.config.idle_timeout).unwrap_or(TimeDelta::MAX);
        let mut evicted = 0usize;
        self.projects.retain(|project_id, subs| {
            subs.retain(|sub| {
                let idle = now.signed_duration_since(sub.last_activity) > timeout;
                if idle {
                    debug!(project_id = %project_id, subscriber = %sub.id, "evicting idle subscriber");
                    evicted += 1;
                }
                !idle
            });
            !subs.is_empty()
        });
        if evicted > 0 {
            info!(evicted, "swept idle subscriptions");
        }
        evicted
    }

    /// Periodic sweep. The task holds a weak reference and ends once the
    /// distributor is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(distributor) = weak.upgrade() else {
                    break;
                };
                distributor.sweep_idle();
            }
            debug!("idle sweeper stopped");
        })
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.projects.get(project_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn project_count(&self) -> usize {
        self.projects.len()
    }

    /// Strictly increasing across the process even if the clock stalls or
    /// steps backwards.
    fn next_emission_time(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let now_micros = now.timestamp_micros();
        let prev = self
            .last_emitted_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_micros.max(last.saturating_add(1)))
            })
            .unwrap_or(now_micros);
        let stamped = now_micros.max(prev.saturating_add(1));
        DateTime::from_timestamp_micros(stamped).unwrap_or(now)
    }
}

pub struct SubscriptionStream {
    distributor: Weak<EventDistributor>,
    handle: SubscriptionHandle,
    rx: mpsc::Receiver<StreamMessage>,
}

impl SubscriptionStream {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

impl Stream for SubscriptionStream {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        if let Some(distributor) = self.distributor.upgrade() {
            distributor.unsubscribe(&self.handle);
        }
    }
}

impl Default for EventDistributor {
    fn default() -> Self {
        Self::new(DistributorConfig::default())
    }
}
