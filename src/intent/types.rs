use serde::{Deserialize, Serialize};

use crate::errors::ClassificationError;

/// The five mutually exclusive kinds of change a prompt can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IterationMode {
    Create,
    Modify,
    CreateAndLink,
    FixError,
    Question,
}

impl IterationMode {
    pub const ALL: [IterationMode; 5] = [
        Self::Create,
        Self::Modify,
        Self::CreateAndLink,
        Self::FixError,
        Self::Question,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Modify => "MODIFY",
            Self::CreateAndLink => "CREATE_AND_LINK",
            Self::FixError => "FIX_ERROR",
            Self::Question => "QUESTION",
        }
    }

    /// `QUESTION` answers without ever touching files.
    pub fn mutates_files(&self) -> bool {
        !matches!(self, Self::Question)
    }

    /// How many recent messages the assembler fetches for this mode.
    pub fn default_message_limit(&self) -> usize {
        match self {
            Self::Question => 30,
            Self::Modify | Self::CreateAndLink => 20,
            Self::FixError => 15,
            Self::Create => 10,
        }
    }
}

impl std::fmt::Display for IterationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entities {
    #[serde(default)]
    pub to_create: Vec<String>,
    #[serde(default)]
    pub to_modify: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl Entities {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_modify.is_empty() && self.link.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Model,
    Rules,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub mode: IterationMode,
    pub confidence: f64,
    pub task_list: Vec<String>,
    pub entities: Entities,
    pub warnings: Vec<String>,
    pub source: ClassificationSource,
}

/// Wire shape the model is asked to return. Everything optional except the
/// mode is defaulted and checked afterwards.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClassification {
    mode: String,
    confidence: Option<f64>,
    #[serde(default, alias = "tasks")]
    task_list: Vec<String>,
    #[serde(default)]
    entities: Entities,
    #[serde(default)]
    warnings: Vec<String>,
}

/// Slice out the outermost `{...}` span so code fences and surrounding prose
/// from the model don't break parsing.
fn extract_json_object(raw: &str) -> &str {
    match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if end > start => &raw[start..=end],
        _ => raw,
    }
}

impl ClassificationResult {
    /// Parse and validate untrusted model output.
    pub fn from_model_output(raw: &str) -> Result<Self, ClassificationError> {
        let cleaned = extract_json_object(raw);
        let parsed: RawClassification =
            serde_json::from_str(cleaned).map_err(ClassificationError::MalformedJson)?;

        let mode = IterationMode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(parsed.mode.trim()))
            .ok_or_else(|| ClassificationError::InvalidField {
                field: "mode",
                message: format!("unknown mode '{}'", parsed.mode),
            })?;

        let confidence = parsed.confidence.unwrap_or(0.5);
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(ClassificationError::InvalidField {
                field: "confidence",
                message: format!("{} is outside [0, 1]", confidence),
            });
        }

        if parsed.task_list.iter().any(|t| t.trim().is_empty()) {
            return Err(ClassificationError::InvalidField {
                field: "taskList",
                message: "task entries must be non-empty".to_string(),
            });
        }

        let mut result = ClassificationResult {
            mode,
            confidence,
            task_list: parsed.task_list,
            entities: parsed.entities,
            warnings: parsed.warnings,
            source: ClassificationSource::Model,
        };
        result.enforce_question_invariant();
        Ok(result)
    }

    /// Strip any entities from a `QUESTION` result.
    pub fn enforce_question_invariant(&mut self) {
        if self.mode == IterationMode::Question && !self.entities.is_empty() {
            self.entities = Entities::default();
            self.warnings
                .push("Question mode cannot target files; entities were dropped".to_string());
        }
    }
}
