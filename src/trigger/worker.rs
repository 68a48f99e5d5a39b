use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use super::{EventSink, ExecutionRequest, ExecutionWorker};
use crate::errors::TriggerError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DispatchBody<'a> {
    #[serde(flatten)]
    request: &'a ExecutionRequest,
    /// Where the remote worker POSTs its progress events.
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_url: Option<String>,
}

/// Dispatches the request to a remote generation service. The service reports
/// progress back through `POST /api/projects/{id}/events`, so a successful
/// dispatch does not end the run.
pub struct HttpWorker {
    http: reqwest::Client,
    endpoint: String,
    callback_base: Option<String>,
}

impl HttpWorker {
    pub fn new(endpoint: impl Into<String>, callback_base: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            callback_base: callback_base.map(|b| b.trim_end_matches('/').to_string()),
        }
    }

    fn callback_url(&self, project_id: &str) -> Option<String> {
        self.callback_base
            .as_ref()
            .map(|base| format!("{}/api/projects/{}/events", base, project_id))
    }
}

#[async_trait]
impl ExecutionWorker for HttpWorker {
    async fn execute(&self, request: ExecutionRequest, _events: EventSink) -> Result<()> {
        let body = DispatchBody {
            callback_url: self.callback_url(request.project_id()),
            request: &request,
        };
        self.http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("Failed to dispatch execution request")?
            .error_for_status()
            .context("Execution worker rejected the request")?;
        info!(
            project_id = %request.project_id(),
            version_id = %request.version_id(),
            endpoint = %self.endpoint,
            "execution request dispatched"
        );
        Ok(())
    }

    fn completes_inline(&self) -> bool {
        false
    }
}

/// Used when no worker endpoint is configured: every run ends in `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredWorker;

#[async_trait]
impl ExecutionWorker for UnconfiguredWorker {
    async fn execute(&self, _request: ExecutionRequest, _events: EventSink) -> Result<()> {
        Err(TriggerError::WorkerUnavailable.into())
    }
}
