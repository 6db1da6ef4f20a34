use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Client, RequestBuilder, Response, StatusCode,
};
use serde::de::DeserializeOwned;

use crate::client::{ConversationSource, SearchPage, SearchQuery};
use crate::config::ApiConfig;
use crate::error::{HarvestError, Result};
use crate::models::provider::{
    ProviderAdmin, ProviderConversation, ProviderSearchResponse, ProviderTeams,
};

/// Longest `Retry-After` we are willing to sit through inside one request.
const MAX_RETRY_AFTER_SECS: u64 = 60;

/// Delay before retry `attempt` (one-based) when the server gave no
/// `Retry-After`: 100ms doubling per attempt, saturating.
fn retry_backoff(attempt: u32) -> Duration {
    let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(100_u64.saturating_mul(factor))
}

#[derive(Clone)]
pub struct HttpConversationClient {
    client: Client,
    config: ApiConfig,
    headers: HeaderMap,
}

impl HttpConversationClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| HarvestError::Config(format!("Failed to create HTTP client: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(ref token) = config.access_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                    HarvestError::Config(format!("Invalid access token header: {e}"))
                })?,
            );
        }

        Ok(Self {
            client,
            config,
            headers,
        })
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }

    /// Send a request, retrying rate limits and server errors up to
    /// `max_retries` times. 429s wait for `Retry-After` when the server
    /// provides one.
    async fn send<T, B>(&self, build: B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Fn() -> RequestBuilder,
    {
        let mut last_error = None;
        let mut retry_after: Option<u64> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = match retry_after.take() {
                    Some(secs) => Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS)),
                    None => retry_backoff(attempt),
                };
                tokio::time::sleep(delay).await;
            }

            let response = build().headers(self.headers.clone()).send().await;

            match response {
                Ok(resp) => match Self::check_status(resp).await {
                    Ok(resp) => return Ok(resp.json::<T>().await?),
                    Err(HarvestError::RateLimit { retry_after: after }) => {
                        tracing::debug!(attempt, retry_after = ?after, "Rate limited by API");
                        retry_after = after;
                        last_error = Some(HarvestError::RateLimit { retry_after: after });
                    }
                    Err(err) if matches!(err, HarvestError::Server { .. }) => {
                        tracing::debug!(attempt, error = %err, "API server error");
                        last_error = Some(err);
                    }
                    Err(err) => return Err(err),
                },
                Err(e) if e.is_timeout() || e.is_connect() => {
                    tracing::debug!(attempt, error = %e, "API request failed");
                    last_error = Some(HarvestError::Http(e));
                }
                Err(e) => return Err(HarvestError::Http(e)),
            }
        }

        Err(last_error.unwrap_or_else(|| HarvestError::Fetch("Unknown request error".to_string())))
    }

    async fn check_status(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok());
            return Err(HarvestError::RateLimit { retry_after });
        }

        let body = resp.text().await.unwrap_or_default();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(HarvestError::Auth(body));
        }

        if status.is_server_error() {
            return Err(HarvestError::Server {
                status: status.as_u16(),
                body,
            });
        }

        Err(HarvestError::Client {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ConversationSource for HttpConversationClient {
    async fn search_page(&self, query: &SearchQuery, cursor: Option<&str>) -> Result<SearchPage> {
        let url = self.url("conversations/search");
        let body = query.to_request_body(cursor);

        let response: ProviderSearchResponse =
            self.send(|| self.client.post(&url).json(&body)).await?;

        let next_cursor = response
            .pages
            .and_then(|pages| pages.next)
            .and_then(|next| next.cursor());

        Ok(SearchPage {
            items: response.conversations,
            next_cursor,
        })
    }

    async fn get_conversation(&self, id: &str) -> Result<ProviderConversation> {
        let url = self.url(&format!("conversations/{id}"));
        self.send(|| {
            self.client
                .get(&url)
                .query(&[("display_as", "plaintext")])
        })
        .await
    }

    async fn get_owner(&self, owner_id: &str) -> Result<ProviderAdmin> {
        let url = self.url(&format!("admins/{owner_id}"));
        self.send(|| self.client.get(&url)).await
    }

    async fn get_owner_groups(&self, owner_id: &str) -> Result<ProviderTeams> {
        let url = self.url(&format!("admins/{owner_id}/teams"));
        self.send(|| self.client.get(&url)).await
    }
}
