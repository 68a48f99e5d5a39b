//! Language-model backends for intent classification.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One classification call: system instructions, a rendered context block,
/// and the user's prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub context_block: String,
    pub user_prompt: String,
}

impl ModelRequest {
    /// Context block and prompt joined into the single user turn.
    pub fn render_user_turn(&self) -> String {
        format!(
            "## Project Context\n{}\n\n## Request\n{}\n\nRespond with JSON only.",
            self.context_block, self.user_prompt
        )
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Returns the raw text of the model's reply.
    async fn complete(&self, request: &ModelRequest) -> Result<String>;

    fn name(&self) -> &'static str;
}

/// Shells out to the `claude` CLI in print mode.
pub struct ClaudeCliClient {
    command: String,
}

impl ClaudeCliClient {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ModelClient for ClaudeCliClient {
    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        let prompt = request.render_user_turn();
        let output = Command::new(&self.command)
            .args([
                "--print",
                "--output-format",
                "text",
                "-p",
                &prompt,
                "--system",
                &request.system_prompt,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run claude CLI for classification")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Claude classifier failed: {}", stderr);
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn name(&self) -> &'static str {
        "claude-cli"
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<MessagesTurn<'a>>,
}

#[derive(Serialize)]
struct MessagesTurn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Calls the Messages HTTP API directly.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: ANTHROPIC_MESSAGES_URL.to_string(),
            max_tokens: 1024,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        let user_turn = request.render_user_turn();
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: &request.system_prompt,
            messages: vec![MessagesTurn {
                role: "user",
                content: &user_turn,
            }],
        };

        let resp: MessagesResponse = self
            .http
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("Failed to send classification request")?
            .error_for_status()
            .context("Messages API returned error status")?
            .json()
            .await
            .context("Failed to parse Messages API response")?;

        let text: String = resp
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            anyhow::bail!("Messages API returned no text content");
        }
        Ok(text)
    }

    fn name(&self) -> &'static str {
        "anthropic-http"
    }
}
