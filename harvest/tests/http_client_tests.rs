mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use common::{conversation_item, day, full_body, init_test_logger};
use harvest::client::{ConversationSource, HttpConversationClient, SearchQuery};
use harvest::config::{ApiConfig, Config};
use harvest::error::HarvestError;
use harvest::models::provider::{groups_to_canonical, to_canonical};
use harvest::pipeline::Chunker;
use harvest::resilience::CircuitBreakerRegistry;

fn api_config(base_url: String, max_retries: u32) -> ApiConfig {
    ApiConfig {
        base_url,
        access_token: Some("test-token".to_string()),
        timeout_secs: 5,
        max_retries,
    }
}

fn client(server: &MockServer, max_retries: u32) -> HttpConversationClient {
    match HttpConversationClient::new(api_config(server.uri(), max_retries)) {
        Ok(client) => client,
        Err(error) => panic!("Expected client creation to succeed, got: {error}"),
    }
}

fn query() -> SearchQuery {
    SearchQuery::new(day(0), day(6), 2)
}

#[test]
fn test_base_url_trailing_slash_is_trimmed() {
    let client = HttpConversationClient::new(api_config("https://api.example.com/".to_string(), 0));

    match client {
        Ok(value) => assert_eq!(value.base_url(), "https://api.example.com"),
        Err(error) => panic!("Expected client creation to succeed, got: {error}"),
    }
}

#[tokio::test]
async fn test_search_sends_range_filter_and_follows_cursor() {
    init_test_logger();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/conversations/search"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(|request: &Request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
            match body["pagination"]["starting_after"].as_str() {
                None => ResponseTemplate::new(200).set_body_json(json!({
                    "type": "conversation.list",
                    "conversations": [conversation_item("c1", day(1), None)],
                    "pages": { "type": "pages", "next": { "page": 2, "starting_after": "cursor-2" } }
                })),
                Some("cursor-2") => ResponseTemplate::new(200).set_body_json(json!({
                    "type": "conversation.list",
                    "conversations": [conversation_item("c2", day(2), None)],
                    "pages": { "type": "pages", "next": null }
                })),
                Some(_) => ResponseTemplate::new(400),
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    let client = client(&server, 0);

    let first = client.search_page(&query(), None).await.unwrap();
    assert_eq!(first.items.len(), 1);
    assert_eq!(first.next_cursor.as_deref(), Some("cursor-2"));

    let second = client.search_page(&query(), Some("cursor-2")).await.unwrap();
    assert_eq!(second.items[0]["id"], "c2");
    assert_eq!(second.next_cursor, None);

    let requests = server.received_requests().await.unwrap_or_default();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let filters = &body["query"]["value"];
    assert_eq!(body["query"]["operator"], "AND");
    assert_eq!(filters[0]["operator"], ">");
    assert_eq!(filters[0]["value"], day(0).timestamp() - 1);
    assert_eq!(filters[1]["operator"], "<");
    assert_eq!(filters[1]["value"], day(6).timestamp() + 1);
    assert_eq!(body["pagination"]["per_page"], 2);
}

#[tokio::test]
async fn test_next_page_url_yields_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/conversations/search"))
        .and(body_partial_json(json!({ "pagination": { "per_page": 2 } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "conversations": [],
            "pages": { "next": "https://api.example.com/conversations/search?per_page=2&starting_after=abc%3D%3D" }
        })))
        .mount(&server)
        .await;

    let page = client(&server, 0).search_page(&query(), None).await.unwrap();

    assert_eq!(page.next_cursor.as_deref(), Some("abc=="));
}

#[tokio::test]
async fn test_rate_limit_is_retried_after_header() {
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_for_mock = Arc::clone(&attempts);

    Mock::given(method("GET"))
        .and(path("/admins/a1"))
        .respond_with(move |_request: &Request| {
            if attempts_for_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(429).insert_header("retry-after", "0")
            } else {
                ResponseTemplate::new(200).set_body_json(json!({
                    "type": "admin",
                    "id": "a1",
                    "name": "Alex",
                    "email": "alex@example.com",
                    "away_mode_enabled": false
                }))
            }
        })
        .mount(&server)
        .await;

    let admin = client(&server, 2).get_owner("a1").await.unwrap();

    assert_eq!(admin.name.as_deref(), Some("Alex"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rate_limit_exhaustion_surfaces_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/admins/a1"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .expect(2)
        .mount(&server)
        .await;

    let result = client(&server, 1).get_owner("a1").await;

    match result {
        Err(error @ HarvestError::RateLimit { retry_after: Some(0) }) => {
            assert!(error.is_transient());
        }
        other => panic!("Expected rate limit error, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_for_mock = Arc::clone(&attempts);

    Mock::given(method("GET"))
        .and(path("/admins/a1/teams"))
        .respond_with(move |_request: &Request| {
            if attempts_for_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(503).set_body_string("upstream temporary failure")
            } else {
                ResponseTemplate::new(200).set_body_json(json!({
                    "type": "team.list",
                    "teams": [{ "type": "team", "id": "t1", "name": "Billing" }]
                }))
            }
        })
        .mount(&server)
        .await;

    let teams = client(&server, 2).get_owner_groups("a1").await.unwrap();
    let groups = groups_to_canonical(teams);

    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name.as_deref(), Some("Billing"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_not_found_is_client_error_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/conversations/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server, 3).get_conversation("missing").await;

    match result {
        Err(HarvestError::Client { status, body }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "not found");
        }
        other => panic!("Expected client error, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_unauthorized_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/conversations/search"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server, 3).search_page(&query(), None).await;

    match result {
        Err(HarvestError::Auth(message)) => assert!(message.contains("invalid token")),
        other => panic!("Expected auth error, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_conversation_body_accepts_bare_and_wrapped_parts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/conversations/wrapped"))
        .and(query_param("display_as", "plaintext"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(full_body("wrapped", day(1), Some("a1"), 2)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/conversations/bare"))
        .and(query_param("display_as", "plaintext"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 42,
            "created_at": "2024-01-02T03:04:05Z",
            "conversation_parts": [{ "id": "p1" }, { "id": "p2" }, { "id": "p3" }]
        })))
        .mount(&server)
        .await;

    let client = client(&server, 0);

    let wrapped = to_canonical(client.get_conversation("wrapped").await.unwrap()).unwrap();
    assert_eq!(wrapped.conversation_parts.len(), 2);
    assert_eq!(wrapped.owner_id.as_deref(), Some("a1"));

    let bare = to_canonical(client.get_conversation("bare").await.unwrap()).unwrap();
    assert_eq!(bare.id, "42");
    assert_eq!(bare.conversation_parts.total_count, 3);
    assert_eq!(
        bare.created_at,
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    );
}

#[tokio::test]
async fn test_end_to_end_fetch_against_mock_api() {
    init_test_logger();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/conversations/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "conversations": [
                conversation_item("c1", day(1), Some("a1")),
                conversation_item("c2", day(2), None),
                conversation_item("c1", day(1), Some("a1"))
            ],
            "pages": { "next": null }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/conversations/c1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(full_body("c1", day(1), Some("a1"), 4)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/conversations/c2"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admins/a1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "a1", "name": "Alex" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admins/a1/teams"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "teams": [{ "id": 3, "name": "Tier 1" }]
        })))
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.api = api_config(server.uri(), 1);
    config.fetch.request_delay_ms = 0;
    config.fetch.chunk_delay_ms = 0;

    let source: Arc<dyn ConversationSource> = Arc::new(client(&server, 1));
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
    let chunker = Chunker::from_config(source, &config, Some(Arc::clone(&breakers)));

    let report = chunker.fetch(day(0), day(3), None).await.unwrap();

    let ids: Vec<&str> = report.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2"]);
    assert_eq!(report.enrichment.enriched_body, 1);
    assert_eq!(report.enrichment.failed_body, 1);
    assert_eq!(report.enrichment.skipped_no_owner, 1);

    let c1 = &report.records[0];
    assert!(c1.enrichment.is_complete());
    assert_eq!(c1.conversation_parts.len(), 4);
    let owner = c1.owner.as_ref().unwrap();
    assert_eq!(owner.name.as_deref(), Some("Alex"));
    assert_eq!(owner.groups[0].id, "3");

    let serialized = serde_json::to_value(&report.records).unwrap();
    assert_eq!(serialized[0]["conversation_parts"]["type"], "conversation_part.list");
}
