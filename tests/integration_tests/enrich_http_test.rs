//! HTTP executor tests against mock servers
//!
//! Covers request shape, response parsing and error mapping for:
//! 1. Anthropic summaries
//! 2. Hacker News (Algolia) lookups
//! 3. Reddit lookups
//! 4. Worker-level failure handling over real HTTP

use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use linksite::config::{AnthropicConfig, HackerNewsConfig, RedditConfig};
use linksite::error::EnrichError;
use linksite::models::{Candidate, NewTask, PriorityClass, Task, TaskStatus, TaskType};
use linksite::worker::{
    AnthropicSummarizer, HackerNewsLookup, RedditLookup, TaskExecutor, TaskOutput, WorkerAction,
};

use super::fixtures::{add_candidate, sqlite_store, t0, worker};

const LINK: &str = "https://blog.example/post";

fn candidate() -> Candidate {
    Candidate {
        id: 7,
        title: "Writing a scheduler".into(),
        url: LINK.into(),
        summary: None,
        direct_score: 0.0,
        times_shown: 0,
        last_shown_at: None,
        feed_id: None,
        content_vector: None,
        created_at: Utc::now(),
    }
}

fn task(task_type: TaskType) -> Task {
    Task {
        id: 1,
        candidate_id: 7,
        task_type,
        priority_class: PriorityClass::UserSubmitted,
        status: TaskStatus::InProgress,
        attempts: 1,
        last_error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn anthropic(server: &MockServer) -> AnthropicSummarizer {
    let config = AnthropicConfig {
        base_url: server.uri(),
        api_key: Some("test-key".into()),
        ..AnthropicConfig::default()
    };
    AnthropicSummarizer::new(&config, Duration::from_secs(5)).unwrap()
}

fn hn_config(server: &MockServer) -> HackerNewsConfig {
    HackerNewsConfig {
        base_url: server.uri(),
        ..HackerNewsConfig::default()
    }
}

// ============================================================================
// Anthropic
// ============================================================================

#[tokio::test]
async fn test_anthropic_summary_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                {"type": "text", "text": "  A walkthrough of building a cooperative "},
                {"type": "text", "text": "task scheduler from first principles.  "}
            ],
            "usage": {"input_tokens": 1000, "output_tokens": 200}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let output = anthropic(&server)
        .execute(&task(TaskType::Summarize), &candidate())
        .await
        .unwrap();

    match &output {
        TaskOutput::Summary { text, usage } => {
            assert_eq!(
                text,
                "A walkthrough of building a cooperative task scheduler from first principles."
            );
            let usage = usage.as_ref().unwrap();
            assert_eq!(usage.input_tokens, 1000);
            assert_eq!(usage.output_tokens, 200);
            assert!((usage.cost_usd - 0.006).abs() < 1e-9);
            assert_eq!(usage.candidate_id, Some(7));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(output.validate().is_ok());
}

#[tokio::test]
async fn test_anthropic_error_status_is_mapped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate_limit_error"))
        .mount(&server)
        .await;

    let err = anthropic(&server)
        .execute(&task(TaskType::Summarize), &candidate())
        .await
        .unwrap_err();
    match err {
        EnrichError::Status { code, body } => {
            assert_eq!(code, 429);
            assert_eq!(body, "rate_limit_error");
        }
        other => panic!("unexpected {other:?}"),
    }
}

// ============================================================================
// Discussion lookups
// ============================================================================

#[tokio::test]
async fn test_hn_lookup_searches_by_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/search"))
        .and(query_param("query", LINK))
        .and(query_param("restrictSearchableAttributes", "url"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": [
                {
                    "objectID": "4242",
                    "title": "Writing a scheduler",
                    "points": 311,
                    "num_comments": 97
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let lookup = HackerNewsLookup::new(&hn_config(&server), Duration::from_secs(5)).unwrap();
    let output = lookup
        .execute(&task(TaskType::HnDiscussions), &candidate())
        .await
        .unwrap();

    match output {
        TaskOutput::Discussions { platform, items } => {
            assert_eq!(platform, "hackernews");
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].url, "https://news.ycombinator.com/item?id=4242");
            assert_eq!(items[0].score, 311);
            assert_eq!(items[0].num_comments, 97);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_reddit_lookup_reads_listing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/info.json"))
        .and(query_param("url", LINK))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kind": "Listing",
            "data": {"children": [
                {"kind": "t3", "data": {
                    "permalink": "/r/programming/comments/xyz/writing_a_scheduler/",
                    "title": "Writing a scheduler",
                    "score": 88,
                    "num_comments": 23
                }},
                {"kind": "t3", "data": {
                    "permalink": "/r/rust/comments/abc/writing_a_scheduler/",
                    "title": "Writing a scheduler"
                }}
            ]}
        })))
        .mount(&server)
        .await;

    let config = RedditConfig {
        base_url: server.uri(),
        ..RedditConfig::default()
    };
    let lookup = RedditLookup::new(&config, Duration::from_secs(5)).unwrap();
    let output = lookup
        .execute(&task(TaskType::RedditDiscussions), &candidate())
        .await
        .unwrap();

    match output {
        TaskOutput::Discussions { platform, items } => {
            assert_eq!(platform, "reddit");
            assert_eq!(items.len(), 2);
            assert_eq!(
                items[0].url,
                "https://www.reddit.com/r/programming/comments/xyz/writing_a_scheduler/"
            );
            assert_eq!(items[1].score, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"hits": []}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let lookup = HackerNewsLookup::new(&hn_config(&server), Duration::from_millis(200)).unwrap();
    let err = lookup
        .execute(&task(TaskType::HnDiscussions), &candidate())
        .await
        .unwrap_err();
    assert!(matches!(err, EnrichError::Http(_) | EnrichError::Timeout(_)));
}

// ============================================================================
// Worker over HTTP
// ============================================================================

#[tokio::test]
async fn test_worker_saves_discussions_from_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": [
                {"objectID": "1", "title": "a", "points": 3, "num_comments": 1},
                {"objectID": "2", "title": "b", "points": 9, "num_comments": 4}
            ]
        })))
        .mount(&server)
        .await;

    let (store, _dir) = sqlite_store();
    let candidate_id = add_candidate(&store, "story");
    let task_id = store
        .enqueue(
            &NewTask::new(candidate_id, TaskType::HnDiscussions, PriorityClass::ReverseLookup)
                .at(t0()),
        )
        .unwrap()
        .unwrap();

    let lookup = HackerNewsLookup::new(&hn_config(&server), Duration::from_secs(5)).unwrap();
    let worker = worker(store.clone()).with_executor(std::sync::Arc::new(lookup));

    let action = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(action, WorkerAction::Completed { .. }));
    assert_eq!(store.get_task(task_id).unwrap().unwrap().status, TaskStatus::Done);
    assert_eq!(store.discussions_for(candidate_id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_worker_backs_off_after_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(1)
        .mount(&server)
        .await;

    let (store, _dir) = sqlite_store();
    let candidate_id = add_candidate(&store, "story");
    store
        .enqueue(
            &NewTask::new(candidate_id, TaskType::HnDiscussions, PriorityClass::Backlog).at(t0()),
        )
        .unwrap();

    let lookup = HackerNewsLookup::new(&hn_config(&server), Duration::from_secs(5)).unwrap();
    let worker = worker(store.clone()).with_executor(std::sync::Arc::new(lookup));

    let action = worker.tick_at(t0()).await.result.unwrap();
    match action {
        WorkerAction::Requeued { error, .. } => assert!(error.contains("503")),
        other => panic!("unexpected {other:?}"),
    }

    // The second tick stays away from the failing API
    let action = worker.tick_at(t0()).await.result.unwrap();
    assert!(matches!(action, WorkerAction::Deferred(_)));

    let status = linksite::ratelimit::BackoffStore::new(store.clone())
        .status_at("hn", t0())
        .unwrap();
    assert!(status.is_backing_off);
    assert_eq!(status.consecutive_failures, 1);
    assert_eq!(
        status.last_error.as_deref(),
        Some("API returned status 503: maintenance")
    );
}
