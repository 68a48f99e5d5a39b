//! Bounded context assembly from conversation history and the latest
//! accepted code snapshot.

pub mod budget;
pub mod files;
pub mod history;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::intent::ClassificationResult;
use crate::models::{ChatMessage, FileMap, file_size};
use crate::store::ConversationStore;

pub use budget::{ContextBudget, ContextLimit, MAX_CONTEXT_CHARS, parse_context_limit};

/// Omitted paths listed in the summary before "and N more".
const SUMMARY_OMITTED_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBundle {
    pub history: Vec<ChatMessage>,
    pub files: FileMap,
    pub truncated: bool,
    pub summary: String,
}

impl ContextBundle {
    pub fn size(&self) -> usize {
        let history: usize = self.history.iter().map(ChatMessage::size).sum();
        let files: usize = self.files.iter().map(|(p, c)| file_size(p, c)).sum();
        history + files
    }
}

pub struct ContextAssembler {
    store: Arc<dyn ConversationStore>,
    budget: ContextBudget,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn ConversationStore>, budget: ContextBudget) -> Self {
        Self { store, budget }
    }

    pub fn budget(&self) -> ContextBudget {
        self.budget
    }

    /// Build a bundle with the message window chosen by the classification.
    pub async fn build_for(
        &self,
        project_id: &str,
        classification: &ClassificationResult,
    ) -> Result<ContextBundle> {
        self.build(project_id, classification.mode.default_message_limit())
            .await
    }

    pub async fn build(&self, project_id: &str, message_limit: usize) -> Result<ContextBundle> {
        let messages = self
            .store
            .fetch_messages(project_id, message_limit)
            .await
            .context("Failed to fetch conversation history")?;
        let snapshot = self
            .store
            .fetch_latest_snapshot(project_id)
            .await
            .context("Failed to fetch latest code snapshot")?;

        let bundle = assemble(messages, snapshot, self.budget);
        if bundle.truncated {
            info!(project_id, summary = %bundle.summary, "context truncated");
        } else {
            debug!(project_id, size = bundle.size(), "context assembled");
        }
        Ok(bundle)
    }
}

/// Pure allocation step, separated from store access.
pub fn assemble(messages: Vec<ChatMessage>, snapshot: FileMap, budget: ContextBudget) -> ContextBundle {
    let history_total: usize = messages.iter().map(ChatMessage::size).sum();
    let files_total: usize = snapshot.iter().map(|(p, c)| file_size(p, c)).sum();

    if history_total + files_total <= budget.max_chars {
        let summary = format!(
            "Full context: {} messages, {} files ({} of {} chars)",
            messages.len(),
            snapshot.len(),
            history_total + files_total,
            budget.max_chars
        );
        return ContextBundle {
            history: messages,
            files: snapshot,
            truncated: false,
            summary,
        };
    }

    // History gets its fixed share, or more when files need less than theirs.
    let history_budget = budget
        .history_chars()
        .max(budget.max_chars.saturating_sub(files_total));
    let hist = history::select_history(&messages, history_budget);
    let file_sel = files::select_files(&snapshot, budget.files_chars(hist.used_chars));

    let summary = summarize(
        &hist,
        messages.len(),
        &file_sel,
        snapshot.len(),
        budget.max_chars,
    );

    ContextBundle {
        history: hist.messages,
        files: file_sel.files,
        truncated: true,
        summary,
    }
}

fn summarize(
    hist: &history::HistorySelection,
    available_messages: usize,
    file_sel: &files::FileSelection,
    available_files: usize,
    max_chars: usize,
) -> String {
    let mut strategies = Vec::new();
    if hist.truncated {
        strategies.push("history");
    }
    if file_sel.truncated {
        strategies.push("files");
    }

    let mut summary = format!(
        "Context truncated to {} chars ({} trimmed): kept {} of {} messages, {} of {} files",
        max_chars,
        strategies.join(" and "),
        hist.messages.len(),
        available_messages,
        file_sel.files.len(),
        available_files,
    );

    if !file_sel.omitted.is_empty() {
        let listed: Vec<&str> = file_sel
            .omitted
            .iter()
            .take(SUMMARY_OMITTED_LIMIT)
            .map(String::as_str)
            .collect();
        summary.push_str(&format!(". Omitted: {}", listed.join(", ")));
        if file_sel.omitted.len() > SUMMARY_OMITTED_LIMIT {
            summary.push_str(&format!(
                " and {} more",
                file_sel.omitted.len() - SUMMARY_OMITTED_LIMIT
            ));
        }
    }
    summary
}
