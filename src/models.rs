use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::events::EventEnvelope;

/// Path → content map of a code snapshot. Ordered so that iteration (and
/// everything derived from it) is deterministic.
pub type FileMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Character size counted against the context budget.
    pub fn size(&self) -> usize {
        self.role.as_str().chars().count() + self.content.chars().count()
    }
}

/// Character size of one file entry counted against the context budget.
pub fn file_size(path: &str, content: &str) -> usize {
    path.chars().count() + content.chars().count()
}

/// Outcome of a durable event insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// A durable event row about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDurableEvent {
    pub project_id: String,
    pub event_type: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub version_id: Option<String>,
    /// Skip the insert when a row with the same (project, type, message,
    /// version) exists.
    pub dedupe: bool,
}

/// A persisted progress event as read back for replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DurableEvent {
    pub id: i64,
    pub project_id: String,
    pub event_type: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub version_id: Option<String>,
    pub created_at: String,
}

impl DurableEvent {
    /// The envelope stored as metadata, if the row carries one.
    pub fn envelope(&self) -> Option<EventEnvelope> {
        let meta = self.metadata.clone()?;
        serde_json::from_value(meta).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::from_str(role.as_str()).unwrap(), role);
        }
        assert!(Role::from_str("robot").is_err());
    }

    #[test]
    fn test_message_size_counts_role_and_chars() {
        let msg = ChatMessage::user("héllo");
        assert_eq!(msg.size(), "user".len() + 5);
    }

    #[test]
    fn test_file_size() {
        assert_eq!(file_size("a.ts", "abc"), 7);
    }
}
