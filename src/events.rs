use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Progress events ──────────────────────────────────────────────────

/// Typed progress emitted by the execution worker for one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    #[serde(rename = "project:created")]
    ProjectCreated {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "step:start")]
    StepStart { message: String },
    #[serde(rename = "step:complete")]
    StepComplete { message: String },
    #[serde(rename = "file:generating")]
    FileGenerating { filename: String },
    #[serde(rename = "code:chunk")]
    CodeChunk { filename: String, chunk: String },
    #[serde(rename = "file:complete")]
    FileComplete { filename: String, content: String },
    #[serde(rename = "validation:start")]
    ValidationStart {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "validation:complete")]
    ValidationComplete {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passed: Option<bool>,
    },
    #[serde(rename = "complete")]
    Complete {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ProgressEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ProjectCreated { .. } => EventType::ProjectCreated,
            Self::StepStart { .. } => EventType::StepStart,
            Self::StepComplete { .. } => EventType::StepComplete,
            Self::FileGenerating { .. } => EventType::FileGenerating,
            Self::CodeChunk { .. } => EventType::CodeChunk,
            Self::FileComplete { .. } => EventType::FileComplete,
            Self::ValidationStart { .. } => EventType::ValidationStart,
            Self::ValidationComplete { .. } => EventType::ValidationComplete,
            Self::Complete { .. } => EventType::Complete,
            Self::Error { .. } => EventType::Error,
        }
    }

    /// The `message` column of the durable row. Together with the project and
    /// event type it forms the dedup key.
    pub fn durable_message(&self) -> String {
        match self {
            Self::ProjectCreated { message } if message.is_empty() => "Project created".to_string(),
            Self::ProjectCreated { message }
            | Self::StepStart { message }
            | Self::StepComplete { message }
            | Self::ValidationStart { message }
            | Self::ValidationComplete { message, .. }
            | Self::Complete { message }
            | Self::Error { message } => message.clone(),
            Self::FileGenerating { filename }
            | Self::CodeChunk { filename, .. }
            | Self::FileComplete { filename, .. } => filename.clone(),
        }
    }

    /// Whether this event writes or streams file content.
    pub fn mutates_files(&self) -> bool {
        matches!(
            self,
            Self::FileGenerating { .. } | Self::CodeChunk { .. } | Self::FileComplete { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type().is_terminal()
    }
}

// ── Event type tags ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ProjectCreated,
    StepStart,
    StepComplete,
    FileGenerating,
    CodeChunk,
    FileComplete,
    ValidationStart,
    ValidationComplete,
    Complete,
    Error,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        Self::ProjectCreated,
        Self::StepStart,
        Self::StepComplete,
        Self::FileGenerating,
        Self::CodeChunk,
        Self::FileComplete,
        Self::ValidationStart,
        Self::ValidationComplete,
        Self::Complete,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "project:created",
            Self::StepStart => "step:start",
            Self::StepComplete => "step:complete",
            Self::FileGenerating => "file:generating",
            Self::CodeChunk => "code:chunk",
            Self::FileComplete => "file:complete",
            Self::ValidationStart => "validation:start",
            Self::ValidationComplete => "validation:complete",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// Durable allow-list. High-frequency streaming events stay live-only.
    pub fn is_persisted(&self) -> bool {
        match self {
            Self::ProjectCreated
            | Self::StepStart
            | Self::StepComplete
            | Self::FileComplete
            | Self::ValidationStart
            | Self::ValidationComplete
            | Self::Complete
            | Self::Error => true,
            Self::FileGenerating | Self::CodeChunk => false,
        }
    }

    /// Types the worker may emit more than once for the same logical step.
    pub fn dedupes_on_persist(&self) -> bool {
        matches!(self, Self::StepComplete | Self::FileComplete)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid event type: {}", s))
    }
}

// ── Envelope ─────────────────────────────────────────────────────────

/// A progress event as stamped by the distributor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub project_id: String,
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

/// What a subscriber's channel carries: events, then possibly the reserved
/// terminal marker sent by `close`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Event(EventEnvelope),
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(event: ProgressEvent) -> EventEnvelope {
        EventEnvelope {
            project_id: "P1".to_string(),
            sequence: 7,
            emitted_at: Utc::now(),
            version_id: Some("v1".to_string()),
            event,
        }
    }

    #[test]
    fn test_event_type_tags_match_serialized_type() {
        let samples = vec![
            ProgressEvent::ProjectCreated { message: String::new() },
            ProgressEvent::StepStart { message: "s".into() },
            ProgressEvent::StepComplete { message: "s".into() },
            ProgressEvent::FileGenerating { filename: "a.ts".into() },
            ProgressEvent::CodeChunk { filename: "a.ts".into(), chunk: "x".into() },
            ProgressEvent::FileComplete { filename: "a.ts".into(), content: "x".into() },
            ProgressEvent::ValidationStart { message: String::new() },
            ProgressEvent::ValidationComplete { message: String::new(), passed: Some(true) },
            ProgressEvent::Complete { message: "Done".into() },
            ProgressEvent::Error { message: "boom".into() },
        ];
        assert_eq!(samples.len(), EventType::ALL.len());
        for event in samples {
            let json: serde_json::Value = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type().as_str());
        }
    }

    #[test]
    fn test_event_type_from_str_covers_all() {
        for t in EventType::ALL {
            assert_eq!(EventType::from_str(t.as_str()).unwrap(), t);
        }
        assert!(EventType::from_str("file:deleted").is_err());
    }

    #[test]
    fn test_persisted_allow_list() {
        let live_only: Vec<_> = EventType::ALL
            .into_iter()
            .filter(|t| !t.is_persisted())
            .collect();
        assert_eq!(live_only, vec![EventType::FileGenerating, EventType::CodeChunk]);
        assert!(EventType::StepComplete.dedupes_on_persist());
        assert!(EventType::FileComplete.dedupes_on_persist());
        assert!(!EventType::StepStart.dedupes_on_persist());
    }

    #[test]
    fn test_envelope_serializes_flat() {
        let env = envelope(ProgressEvent::CodeChunk {
            filename: "a.ts".into(),
            chunk: "export ".into(),
        });
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "code:chunk");
        assert_eq!(json["projectId"], "P1");
        assert_eq!(json["versionId"], "v1");
        assert_eq!(json["filename"], "a.ts");
        assert_eq!(json["chunk"], "export ");
        assert!(json["emittedAt"].is_string());
    }

    #[test]
    fn test_envelope_deserializes_from_wire() {
        let wire = r#"{"projectId":"P1","sequence":3,"emittedAt":"2024-01-01T00:00:00Z","type":"file:complete","filename":"a.ts","content":"export const x=1;"}"#;
        let env: EventEnvelope = serde_json::from_str(wire).unwrap();
        assert_eq!(env.sequence, 3);
        assert_eq!(env.version_id, None);
        assert_eq!(
            env.event,
            ProgressEvent::FileComplete {
                filename: "a.ts".into(),
                content: "export const x=1;".into()
            }
        );
    }

    #[test]
    fn test_project_created_accepts_missing_message() {
        let event: ProgressEvent = serde_json::from_str(r#"{"type":"project:created"}"#).unwrap();
        assert_eq!(event.durable_message(), "Project created");
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let result: Result<ProgressEvent, _> =
            serde_json::from_str(r#"{"type":"file:deleted","filename":"a.ts"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_durable_message_uses_filename_for_files() {
        let event = ProgressEvent::FileComplete {
            filename: "src/a.ts".into(),
            content: "long content".into(),
        };
        assert_eq!(event.durable_message(), "src/a.ts");
        assert!(event.mutates_files());
        assert!(!event.is_terminal());
        assert!(ProgressEvent::Error { message: "x".into() }.is_terminal());
    }
}
