//! Client-side generation state and its pure reducer.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{EventEnvelope, ProgressEvent};
use crate::models::DurableEvent;

/// Step names matching this put the run in `validating`.
static VALIDATION_STEP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:validat\w*|verif\w*|lint\w*|type[- ]?check\w*|run(?:ning)? (?:the )?tests?)\b",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    #[default]
    Idle,
    Initializing,
    Generating,
    Validating,
    Complete,
    Error,
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// A run has started and not yet finished.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initializing | Self::Generating | Self::Validating)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileState {
    pub content: String,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationState {
    pub status: GenerationStatus,
    pub current_step: Option<String>,
    pub current_file: Option<String>,
    pub files: BTreeMap<String, FileState>,
    pub events: Vec<EventEnvelope>,
    pub error: Option<String>,
}

fn is_validation_step(name: &str) -> bool {
    VALIDATION_STEP_REGEX.is_match(name)
}

impl GenerationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the state. Every event is appended to the log;
    /// once terminal, nothing else changes.
    pub fn reduce(mut self, envelope: EventEnvelope) -> Self {
        let event = envelope.event.clone();
        self.events.push(envelope);

        if self.status.is_terminal() {
            debug!(event_type = %event.event_type(), "event after terminal status, logged only");
            return self;
        }

        match event {
            ProgressEvent::ProjectCreated { .. } => {
                self.status = GenerationStatus::Initializing;
            }
            ProgressEvent::StepStart { message } => {
                self.status = if is_validation_step(&message) {
                    GenerationStatus::Validating
                } else {
                    GenerationStatus::Generating
                };
                self.current_step = Some(message);
            }
            ProgressEvent::FileGenerating { filename } => {
                self.status = GenerationStatus::Generating;
                self.files.entry(filename.clone()).or_default();
                self.current_file = Some(filename);
            }
            ProgressEvent::CodeChunk { filename, chunk } => {
                if let Some(file) = self.files.get_mut(&filename) {
                    file.content.push_str(&chunk);
                } else {
                    debug!(filename = %filename, "chunk for unknown file ignored");
                }
            }
            ProgressEvent::FileComplete { filename, content } => {
                let file = self.files.entry(filename).or_default();
                file.content = content;
                file.is_complete = true;
            }
            ProgressEvent::ValidationStart { .. } => {
                self.status = GenerationStatus::Validating;
            }
            ProgressEvent::Complete { .. } => {
                self.status = GenerationStatus::Complete;
                self.current_file = None;
                self.current_step = None;
            }
            ProgressEvent::Error { message } => {
                self.status = GenerationStatus::Error;
                self.error = Some(message);
                self.current_file = None;
                self.current_step = None;
            }
            ProgressEvent::StepComplete { .. } | ProgressEvent::ValidationComplete { .. } => {}
        }
        self
    }

    pub fn apply(&mut self, envelope: EventEnvelope) {
        *self = std::mem::take(self).reduce(envelope);
    }

    /// Rebuild state from durable rows, in row order. Rows whose metadata
    /// isn't a stored envelope are skipped.
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a DurableEvent>) -> Self {
        events
            .into_iter()
            .filter_map(|row| {
                let envelope = row.envelope();
                if envelope.is_none() {
                    debug!(row = row.id, "skipping durable row without envelope");
                }
                envelope
            })
            .fold(Self::new(), Self::reduce)
    }
}
