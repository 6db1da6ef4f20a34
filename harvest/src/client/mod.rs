mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::Result;
use crate::models::provider::{ProviderAdmin, ProviderConversation, ProviderTeams};

pub use http::HttpConversationClient;

/// Creation-time range query issued against the search endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub page_size: u32,
}

impl SearchQuery {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, page_size: u32) -> Self {
        Self {
            start,
            end,
            page_size,
        }
    }

    /// Request body for one page.
    ///
    /// The API only offers strict `>` / `<` on `created_at`, so the bounds are
    /// widened by one second to make the range inclusive at second
    /// resolution. Records that still fall outside are dropped downstream.
    pub fn to_request_body(&self, cursor: Option<&str>) -> Value {
        let mut pagination = json!({ "per_page": self.page_size });
        if let Some(cursor) = cursor {
            pagination["starting_after"] = json!(cursor);
        }

        json!({
            "query": {
                "operator": "AND",
                "value": [
                    {
                        "field": "created_at",
                        "operator": ">",
                        "value": self.start.timestamp() - 1
                    },
                    {
                        "field": "created_at",
                        "operator": "<",
                        "value": self.end.timestamp() + 1
                    }
                ]
            },
            "pagination": pagination
        })
    }
}

/// One page of search results. Items stay untyped until the pipeline maps
/// them, so one malformed item cannot sink the whole page.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
}

/// The remote endpoints the pipeline consumes.
#[async_trait]
pub trait ConversationSource: Send + Sync {
    async fn search_page(&self, query: &SearchQuery, cursor: Option<&str>) -> Result<SearchPage>;

    async fn get_conversation(&self, id: &str) -> Result<ProviderConversation>;

    async fn get_owner(&self, owner_id: &str) -> Result<ProviderAdmin>;

    async fn get_owner_groups(&self, owner_id: &str) -> Result<ProviderTeams>;
}
