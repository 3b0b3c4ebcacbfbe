//! Reverse lookups: where else is this link being discussed?

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::executor::{ensure_success, http_client, TaskExecutor, TaskOutput};
use crate::config::{HackerNewsConfig, RedditConfig};
use crate::error::EnrichError;
use crate::models::{Candidate, Discussion, Task, TaskType};

pub const HN_PLATFORM: &str = "hackernews";
pub const REDDIT_PLATFORM: &str = "reddit";

const HN_ITEM_URL: &str = "https://news.ycombinator.com/item?id=";
const REDDIT_SITE: &str = "https://www.reddit.com";

// ============================================================================
// Hacker News (Algolia search)
// ============================================================================

#[derive(Debug, Deserialize)]
struct HnSearchResponse {
    #[serde(default)]
    hits: Vec<HnHit>,
}

#[derive(Debug, Deserialize)]
struct HnHit {
    #[serde(rename = "objectID")]
    object_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    points: Option<i64>,
    #[serde(default)]
    num_comments: Option<i64>,
}

impl From<HnHit> for Discussion {
    fn from(hit: HnHit) -> Self {
        Discussion {
            platform: HN_PLATFORM.to_string(),
            url: format!("{HN_ITEM_URL}{}", hit.object_id),
            title: hit.title.unwrap_or_default(),
            score: hit.points.unwrap_or(0),
            num_comments: hit.num_comments.unwrap_or(0),
        }
    }
}

/// Finds Hacker News stories that link to a candidate
pub struct HackerNewsLookup {
    client: Client,
    base_url: String,
}

impl HackerNewsLookup {
    pub fn new(config: &HackerNewsConfig, timeout: Duration) -> Result<Self, EnrichError> {
        Ok(Self {
            client: http_client(timeout, &config.user_agent)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TaskExecutor for HackerNewsLookup {
    fn task_type(&self) -> TaskType {
        TaskType::HnDiscussions
    }

    async fn execute(
        &self,
        _task: &Task,
        candidate: &Candidate,
    ) -> Result<TaskOutput, EnrichError> {
        let response = self
            .client
            .get(format!("{}/api/v1/search", self.base_url))
            .query(&[
                ("query", candidate.url.as_str()),
                ("restrictSearchableAttributes", "url"),
            ])
            .send()
            .await?;
        let body: HnSearchResponse = ensure_success(response).await?.json().await?;

        Ok(TaskOutput::Discussions {
            platform: HN_PLATFORM.to_string(),
            items: body.hits.into_iter().map(Discussion::from).collect(),
        })
    }
}

// ============================================================================
// Reddit (/api/info.json)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RedditListing {
    data: RedditListingData,
}

#[derive(Debug, Deserialize)]
struct RedditListingData {
    #[serde(default)]
    children: Vec<RedditChild>,
}

#[derive(Debug, Deserialize)]
struct RedditChild {
    data: RedditPost,
}

#[derive(Debug, Deserialize)]
struct RedditPost {
    permalink: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    num_comments: i64,
}

impl From<RedditPost> for Discussion {
    fn from(post: RedditPost) -> Self {
        Discussion {
            platform: REDDIT_PLATFORM.to_string(),
            url: format!("{REDDIT_SITE}{}", post.permalink),
            title: post.title,
            score: post.score,
            num_comments: post.num_comments,
        }
    }
}

/// Finds Reddit submissions of a candidate's URL
pub struct RedditLookup {
    client: Client,
    base_url: String,
}

impl RedditLookup {
    pub fn new(config: &RedditConfig, timeout: Duration) -> Result<Self, EnrichError> {
        Ok(Self {
            client: http_client(timeout, &config.user_agent)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TaskExecutor for RedditLookup {
    fn task_type(&self) -> TaskType {
        TaskType::RedditDiscussions
    }

    async fn execute(
        &self,
        _task: &Task,
        candidate: &Candidate,
    ) -> Result<TaskOutput, EnrichError> {
        let response = self
            .client
            .get(format!("{}/api/info.json", self.base_url))
            .query(&[("url", candidate.url.as_str())])
            .send()
            .await?;
        let listing: RedditListing = ensure_success(response).await?.json().await?;

        Ok(TaskOutput::Discussions {
            platform: REDDIT_PLATFORM.to_string(),
            items: listing
                .data
                .children
                .into_iter()
                .map(|child| Discussion::from(child.data))
                .collect(),
        })
    }
}
