//! Intent classification: model first, keyword rules when the model path
//! fails for any reason.

pub mod llm;
pub mod rules;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::ClassificationError;
use crate::models::ChatMessage;

pub use llm::{AnthropicClient, ClaudeCliClient, ModelClient, ModelRequest};
pub use rules::RuleClassifier;
pub use types::{ClassificationResult, ClassificationSource, Entities, IterationMode};

pub const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(20);

/// Files listed in the model's context block before "and N more".
const CONTEXT_FILE_LIST_LIMIT: usize = 50;
/// Per-message excerpt length in the context block.
const CONTEXT_MESSAGE_EXCERPT_CHARS: usize = 300;

const CLASSIFIER_SYSTEM_PROMPT: &str = r#"You classify change requests against an existing generated codebase.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "mode": "CREATE" | "MODIFY" | "CREATE_AND_LINK" | "FIX_ERROR" | "QUESTION",
  "confidence": 0.0-1.0,
  "taskList": ["Ordered, concrete steps"],
  "entities": {
    "toCreate": ["new/file/paths.ts"],
    "toModify": ["existing/file/paths.ts"],
    "link": "optional external service or component to connect"
  },
  "warnings": []
}

Rules:
- CREATE adds new functionality or files.
- MODIFY changes existing files without fixing a reported failure.
- CREATE_AND_LINK builds something new and wires it to an existing part or external service.
- FIX_ERROR addresses an error, crash, or broken behavior.
- QUESTION asks about the code and must not change any file; leave entities empty.
- Only list files in toModify that appear in the existing file list.
"#;

/// Lightweight context available before the full bundle is assembled.
#[derive(Debug, Clone, Default)]
pub struct ClassifierContext {
    pub history: Vec<ChatMessage>,
    pub existing_files: Vec<String>,
}

impl ClassifierContext {
    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("### Existing Files\n");
        if self.existing_files.is_empty() {
            out.push_str("(none)\n");
        }
        for path in self.existing_files.iter().take(CONTEXT_FILE_LIST_LIMIT) {
            out.push_str("- ");
            out.push_str(path);
            out.push('\n');
        }
        if self.existing_files.len() > CONTEXT_FILE_LIST_LIMIT {
            out.push_str(&format!(
                "... and {} more\n",
                self.existing_files.len() - CONTEXT_FILE_LIST_LIMIT
            ));
        }
        out.push_str("\n### Recent Conversation\n");
        if self.history.is_empty() {
            out.push_str("(none)\n");
        }
        for msg in &self.history {
            let excerpt: String = msg
                .content
                .chars()
                .take(CONTEXT_MESSAGE_EXCERPT_CHARS)
                .collect();
            out.push_str(&format!("{}: {}\n", msg.role.as_str(), excerpt));
        }
        out
    }
}

pub struct IntentClassifier {
    model: Option<Arc<dyn ModelClient>>,
    rules: RuleClassifier,
    timeout: Duration,
}

impl IntentClassifier {
    pub fn new(model: Option<Arc<dyn ModelClient>>, timeout: Duration) -> Self {
        Self {
            model,
            rules: RuleClassifier::new(),
            timeout,
        }
    }

    /// Rules only; no model is consulted.
    pub fn rules_only() -> Self {
        Self::new(None, DEFAULT_CLASSIFY_TIMEOUT)
    }

    /// Classify a prompt. Never fails: model failures fall back to rules.
    pub async fn classify(&self, prompt: &str, ctx: &ClassifierContext) -> ClassificationResult {
        if prompt.trim().is_empty() {
            return self.rules.classify(prompt, ctx);
        }

        match self.classify_with_model(prompt, ctx).await {
            Ok(result) => {
                debug!(mode = %result.mode, confidence = result.confidence, "model classification");
                result
            }
            Err(ClassificationError::ModelUnavailable) => self.rules.classify(prompt, ctx),
            Err(e) => {
                warn!(error = %e, "model classification failed, using rule fallback");
                self.rules.classify(prompt, ctx)
            }
        }
    }

    async fn classify_with_model(
        &self,
        prompt: &str,
        ctx: &ClassifierContext,
    ) -> Result<ClassificationResult, ClassificationError> {
        let model = self
            .model
            .as_ref()
            .ok_or(ClassificationError::ModelUnavailable)?;

        let request = ModelRequest {
            system_prompt: CLASSIFIER_SYSTEM_PROMPT.to_string(),
            context_block: ctx.render(),
            user_prompt: prompt.to_string(),
        };

        let raw = tokio::time::timeout(self.timeout, model.complete(&request))
            .await
            .map_err(|_| ClassificationError::Timeout {
                seconds: self.timeout.as_secs(),
            })?
            .map_err(ClassificationError::ModelCall)?;

        ClassificationResult::from_model_output(&raw).inspect_err(|_| {
            debug!(
                backend = model.name(),
                raw = %raw.chars().take(500).collect::<String>(),
                "rejected model output"
            );
        })
    }
}
