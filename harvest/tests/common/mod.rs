// Common test utilities for integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use harvest::client::{ConversationSource, SearchPage, SearchQuery};
use harvest::error::{HarvestError, Result};
use harvest::models::provider::{ProviderAdmin, ProviderConversation, ProviderTeams};

static INIT: Once = Once::new();

/// Initialize tracing subscriber once for tests
pub fn init_test_logger() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::days(n)
}

/// Minimal search item as the API returns it.
pub fn conversation_item(id: &str, created_at: DateTime<Utc>, owner: Option<&str>) -> Value {
    json!({
        "type": "conversation",
        "id": id,
        "created_at": created_at.timestamp(),
        "updated_at": created_at.timestamp(),
        "state": "open",
        "admin_assignee_id": owner,
        "conversation_parts": {
            "type": "conversation_part.list",
            "conversation_parts": [],
            "total_count": 0
        }
    })
}

pub fn full_body(id: &str, created_at: DateTime<Utc>, owner: Option<&str>, parts: usize) -> Value {
    let parts: Vec<Value> = (0..parts)
        .map(|i| {
            json!({
                "type": "conversation_part",
                "id": format!("{id}-p{i}"),
                "body": format!("message {i}")
            })
        })
        .collect();
    json!({
        "type": "conversation",
        "id": id,
        "created_at": created_at.timestamp(),
        "admin_assignee_id": owner,
        "conversation_parts": {
            "type": "conversation_part.list",
            "conversation_parts": parts,
            "total_count": parts.len()
        }
    })
}

/// Scripted response to one `search_page` call.
#[derive(Debug, Clone)]
pub enum ScriptedPage {
    Page { items: Vec<Value>, next: Option<String> },
    ServerError,
    ClientError,
}

impl ScriptedPage {
    pub fn page(items: Vec<Value>, next: Option<&str>) -> Self {
        ScriptedPage::Page {
            items,
            next: next.map(str::to_string),
        }
    }

    fn into_result(self) -> Result<SearchPage> {
        match self {
            ScriptedPage::Page { items, next } => Ok(SearchPage {
                items,
                next_cursor: next,
            }),
            ScriptedPage::ServerError => Err(HarvestError::Server {
                status: 503,
                body: "scripted outage".to_string(),
            }),
            ScriptedPage::ClientError => Err(HarvestError::Client {
                status: 400,
                body: "scripted bad request".to_string(),
            }),
        }
    }
}

/// In-memory `ConversationSource`. Search responses are served in script
/// order; an exhausted script yields an empty final page.
#[derive(Default)]
pub struct FakeSource {
    search_script: Mutex<VecDeque<ScriptedPage>>,
    bodies: HashMap<String, Value>,
    owners: HashMap<String, Value>,
    teams: HashMap<String, Value>,
    failing_bodies: HashSet<String>,
    failing_owners: HashSet<String>,
    latency: Duration,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub queries: Mutex<Vec<(SearchQuery, Option<String>)>>,
    pub search_calls: AtomicUsize,
    pub body_calls: AtomicUsize,
    pub owner_calls: AtomicUsize,
    pub team_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages(self, pages: Vec<ScriptedPage>) -> Self {
        *self.search_script.lock().unwrap() = pages.into();
        self
    }

    pub fn with_body(mut self, id: &str, body: Value) -> Self {
        self.bodies.insert(id.to_string(), body);
        self
    }

    pub fn with_owner(mut self, id: &str, name: &str) -> Self {
        self.owners.insert(
            id.to_string(),
            json!({
                "type": "admin",
                "id": id,
                "name": name,
                "email": format!("{name}@example.com")
            }),
        );
        self
    }

    pub fn with_teams(mut self, owner_id: &str, teams: Value) -> Self {
        self.teams.insert(owner_id.to_string(), teams);
        self
    }

    pub fn failing_body(mut self, id: &str) -> Self {
        self.failing_bodies.insert(id.to_string());
        self
    }

    pub fn failing_owner(mut self, id: &str) -> Self {
        self.failing_owners.insert(id.to_string());
        self
    }

    /// Every sub-fetch sleeps this long, so concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    async fn simulate_call(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn not_found(what: &str, id: &str) -> HarvestError {
    HarvestError::Client {
        status: 404,
        body: format!("{what} {id} not found"),
    }
}

#[async_trait]
impl ConversationSource for FakeSource {
    async fn search_page(&self, query: &SearchQuery, cursor: Option<&str>) -> Result<SearchPage> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.queries
            .lock()
            .unwrap()
            .push((query.clone(), cursor.map(str::to_string)));

        let next = self.search_script.lock().unwrap().pop_front();
        next.unwrap_or(ScriptedPage::Page {
            items: Vec::new(),
            next: None,
        })
        .into_result()
    }

    async fn get_conversation(&self, id: &str) -> Result<ProviderConversation> {
        self.body_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await;
        if self.failing_bodies.contains(id) {
            return Err(HarvestError::Server {
                status: 500,
                body: "body unavailable".to_string(),
            });
        }
        let body = self.bodies.get(id).cloned().ok_or_else(|| not_found("conversation", id))?;
        ProviderConversation::from_value(body)
    }

    async fn get_owner(&self, owner_id: &str) -> Result<ProviderAdmin> {
        self.owner_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await;
        if self.failing_owners.contains(owner_id) {
            return Err(HarvestError::Server {
                status: 502,
                body: "admin lookup failed".to_string(),
            });
        }
        let owner = self
            .owners
            .get(owner_id)
            .cloned()
            .ok_or_else(|| not_found("admin", owner_id))?;
        Ok(serde_json::from_value(owner)?)
    }

    async fn get_owner_groups(&self, owner_id: &str) -> Result<ProviderTeams> {
        self.team_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await;
        let teams = self
            .teams
            .get(owner_id)
            .cloned()
            .unwrap_or_else(|| json!({ "teams": [] }));
        Ok(serde_json::from_value(teams)?)
    }
}
