//! Prompt submission: classify, assemble context, trigger.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::context::ContextAssembler;
use crate::errors::ServiceError;
use crate::intent::{ClassificationResult, ClassifierContext, IntentClassifier};
use crate::models::ChatMessage;
use crate::store::ConversationStore;
use crate::trigger::{ExecutionRequest, ExecutionTrigger, RunPolicies};

/// Messages shown to the classifier before the full window is known.
const CLASSIFIER_HISTORY_LIMIT: usize = 6;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedIteration {
    pub version_id: String,
    pub classification: ClassificationResult,
    pub context_truncated: bool,
    pub context_summary: String,
}

pub struct IterationService {
    store: Arc<dyn ConversationStore>,
    classifier: IntentClassifier,
    assembler: ContextAssembler,
    trigger: ExecutionTrigger,
}

impl IterationService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        classifier: IntentClassifier,
        assembler: ContextAssembler,
        trigger: ExecutionTrigger,
    ) -> Self {
        Self {
            store,
            classifier,
            assembler,
            trigger,
        }
    }

    /// Record the prompt and start a generation run for it. Returns once the
    /// run is dispatched; progress arrives on the project's event stream.
    pub async fn submit(
        &self,
        project_id: &str,
        prompt: &str,
    ) -> Result<SubmittedIteration, ServiceError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ServiceError::EmptyPrompt);
        }

        let history = self
            .store
            .fetch_messages(project_id, CLASSIFIER_HISTORY_LIMIT)
            .await
            .map_err(ServiceError::Store)?;
        let snapshot = self
            .store
            .fetch_latest_snapshot(project_id)
            .await
            .map_err(ServiceError::Store)?;
        self.store
            .append_message(project_id, ChatMessage::user(prompt))
            .await
            .map_err(ServiceError::Store)?;

        let ctx = ClassifierContext {
            history,
            existing_files: snapshot.into_keys().collect(),
        };
        let classification = self.classifier.classify(prompt, &ctx).await;

        let bundle = self.assembler.build_for(project_id, &classification).await?;
        let version_id = Uuid::new_v4().to_string();

        let submitted = SubmittedIteration {
            version_id: version_id.clone(),
            classification: classification.clone(),
            context_truncated: bundle.truncated,
            context_summary: bundle.summary.clone(),
        };

        let request =
            ExecutionRequest::new(project_id, version_id, prompt, classification, bundle)?;
        info!(
            project_id,
            version_id = %submitted.version_id,
            mode = %submitted.classification.mode,
            confidence = submitted.classification.confidence,
            truncated = submitted.context_truncated,
            "iteration submitted"
        );
        self.trigger.trigger(request);

        Ok(submitted)
    }

    /// File-mutation permissions of the runs still in flight.
    pub fn runs(&self) -> &RunPolicies {
        self.trigger.policies()
    }
}
