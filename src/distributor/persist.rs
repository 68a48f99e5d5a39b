//! Background persistence of the durable event subset.
//!
//! `EventPersister::enqueue` never blocks the publisher. Writes are applied
//! in order by a single task; failures are logged and broadcast, never
//! propagated to `publish`.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::events::EventEnvelope;
use crate::models::{InsertOutcome, NewDurableEvent};
use crate::store::ConversationStore;

const FAILURE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct PersistFailure {
    pub project_id: String,
    pub event_type: String,
    pub message: String,
    pub error: String,
}

enum PersistCommand {
    Write(Box<EventEnvelope>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct EventPersister {
    tx: mpsc::UnboundedSender<PersistCommand>,
    failures: broadcast::Sender<PersistFailure>,
}

impl EventPersister {
    /// Spawn the persistence task. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn ConversationStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        tokio::spawn(run_persist_loop(store, rx, failures.clone()));
        Self { tx, failures }
    }

    pub fn enqueue(&self, envelope: EventEnvelope) {
        if self.tx.send(PersistCommand::Write(Box::new(envelope))).is_err() {
            warn!("persistence task has stopped; dropping durable event");
        }
    }

    /// Wait until every write queued before this call has completed.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn failures(&self) -> broadcast::Receiver<PersistFailure> {
        self.failures.subscribe()
    }
}

fn to_durable(envelope: &EventEnvelope) -> Result<NewDurableEvent, serde_json::Error> {
    let event_type = envelope.event.event_type();
    Ok(NewDurableEvent {
        project_id: envelope.project_id.clone(),
        event_type: event_type.as_str().to_string(),
        message: envelope.event.durable_message(),
        metadata: Some(serde_json::to_value(envelope)?),
        version_id: envelope.version_id.clone(),
        dedupe: event_type.dedupes_on_persist(),
    })
}

async fn run_persist_loop(
    store: Arc<dyn ConversationStore>,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
    failures: broadcast::Sender<PersistFailure>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            PersistCommand::Flush(done) => {
                let _ = done.send(());
            }
            PersistCommand::Write(envelope) => {
                let result = match to_durable(&envelope) {
                    Ok(row) => store.insert_durable_event(row).await,
                    Err(e) => Err(anyhow::Error::new(e).context("Failed to serialize envelope")),
                };
                match result {
                    Ok(InsertOutcome::Inserted) => {
                        debug!(
                            project_id = %envelope.project_id,
                            event_type = %envelope.event.event_type(),
                            sequence = envelope.sequence,
                            "persisted event"
                        );
                    }
                    Ok(InsertOutcome::Duplicate) => {
                        debug!(
                            project_id = %envelope.project_id,
                            event_type = %envelope.event.event_type(),
                            "duplicate durable event skipped"
                        );
                    }
                    Err(e) => {
                        warn!(
                            project_id = %envelope.project_id,
                            event_type = %envelope.event.event_type(),
                            error = %e,
                            "failed to persist event"
                        );
                        let _ = failures.send(PersistFailure {
                            project_id: envelope.project_id.clone(),
                            event_type: envelope.event.event_type().as_str().to_string(),
                            message: envelope.event.durable_message(),
                            error: format!("{:#}", e),
                        });
                    }
                }
            }
        }
    }
    debug!("persistence task exiting");
}
