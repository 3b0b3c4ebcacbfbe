//! Candidate summaries through the Anthropic Messages API

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::executor::{ensure_success, http_client, TaskExecutor, TaskOutput};
use crate::config::AnthropicConfig;
use crate::error::EnrichError;
use crate::models::{AiUsage, Candidate, Task, TaskType};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// USD per million input tokens
pub const INPUT_PRICE_PER_MTOK: f64 = 3.0;
/// USD per million output tokens
pub const OUTPUT_PRICE_PER_MTOK: f64 = 15.0;

/// Estimated cost of one call in USD
pub fn estimate_cost(input_tokens: u64, output_tokens: u64) -> f64 {
    (input_tokens as f64 * INPUT_PRICE_PER_MTOK + output_tokens as f64 * OUTPUT_PRICE_PER_MTOK)
        / 1_000_000.0
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Summarizer backed by the Anthropic Messages API
pub struct AnthropicSummarizer {
    client: Client,
    config: AnthropicConfig,
    api_key: String,
}

impl AnthropicSummarizer {
    /// Fails with [`EnrichError::MissingApiKey`] when no key is configured
    pub fn new(config: &AnthropicConfig, timeout: Duration) -> Result<Self, EnrichError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(EnrichError::MissingApiKey("anthropic"))?;

        Ok(Self {
            client: http_client(timeout, concat!("linksite/", env!("CARGO_PKG_VERSION")))?,
            config: config.clone(),
            api_key,
        })
    }

    fn prompt(candidate: &Candidate) -> String {
        format!(
            "Generate a 2-3 sentence summary for this link.\n\n\
             Title: {}\n\
             URL: {}\n\n\
             Write a concise, informative summary that captures the key points. \
             Focus on what makes this interesting or notable.\n\
             Just output the summary, no preamble.",
            candidate.title, candidate.url
        )
    }
}

#[async_trait]
impl TaskExecutor for AnthropicSummarizer {
    fn task_type(&self) -> TaskType {
        TaskType::Summarize
    }

    async fn execute(
        &self,
        task: &Task,
        candidate: &Candidate,
    ) -> Result<TaskOutput, EnrichError> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            messages: vec![Message {
                role: "user",
                content: Self::prompt(candidate),
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;
        let body: MessagesResponse = ensure_success(response).await?.json().await?;

        let text: String = body
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        let usage = AiUsage {
            model: self.config.model.clone(),
            input_tokens: body.usage.input_tokens,
            output_tokens: body.usage.output_tokens,
            cost_usd: estimate_cost(body.usage.input_tokens, body.usage.output_tokens),
            candidate_id: Some(task.candidate_id),
            created_at: Utc::now(),
        };

        tracing::debug!(
            candidate_id = candidate.id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost_usd = usage.cost_usd,
            "Summary generated"
        );

        Ok(TaskOutput::Summary {
            text: text.trim().to_string(),
            usage: Some(usage),
        })
    }
}
