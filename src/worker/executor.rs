//! Task executors: one external call per task

use async_trait::async_trait;
use reqwest::{Client, Response};
use std::time::Duration;

use crate::error::EnrichError;
use crate::models::{AiUsage, Candidate, Discussion, Task, TaskType};

/// Error bodies kept in failure messages
const MAX_ERROR_BODY: usize = 200;

/// Summaries this short are treated as a failed call
pub const MIN_SUMMARY_CHARS: usize = 20;

/// What an executor produced
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Summary {
        text: String,
        usage: Option<AiUsage>,
    },
    Discussions {
        platform: String,
        items: Vec<Discussion>,
    },
}

impl TaskOutput {
    /// Metered usage to record, even when the output itself is rejected
    pub fn usage(&self) -> Option<&AiUsage> {
        match self {
            Self::Summary { usage, .. } => usage.as_ref(),
            Self::Discussions { .. } => None,
        }
    }

    pub fn validate(&self) -> Result<(), EnrichError> {
        match self {
            Self::Summary { text, .. } if text.trim().chars().count() <= MIN_SUMMARY_CHARS => Err(
                EnrichError::InvalidResponse(format!("summary too short: {:?}", text.trim())),
            ),
            _ => Ok(()),
        }
    }
}

/// A handler for one task type
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// External API this executor calls; gated before every execution
    fn api_name(&self) -> &'static str {
        self.task_type().api_name()
    }

    async fn execute(&self, task: &Task, candidate: &Candidate)
        -> Result<TaskOutput, EnrichError>;
}

/// HTTP client with a hard per-request timeout
pub(crate) fn http_client(timeout: Duration, user_agent: &str) -> Result<Client, EnrichError> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()?)
}

/// Turn non-2xx responses into [`EnrichError::Status`]
pub(crate) async fn ensure_success(response: Response) -> Result<Response, EnrichError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(EnrichError::Status {
        code: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY).collect(),
    })
}
