use std::collections::HashSet;
use std::sync::Arc;

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::{pin_mut, Stream, TryStreamExt};

use crate::client::{ConversationSource, SearchPage, SearchQuery};
use crate::error::{HarvestError, Result};
use crate::models::provider::{to_canonical, ProviderConversation};
use crate::models::ConversationRecord;
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};

pub const SEARCH_BREAKER: &str = "search";

/// IDs already emitted by one top-level fetch.
#[derive(Debug, Clone, Default)]
pub struct DedupSet {
    seen: HashSet<String>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Returns `false` if the id was already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.seen.insert(id.into())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Keep the first occurrence of each id, preserving order.
    pub fn dedup(records: Vec<ConversationRecord>) -> Vec<ConversationRecord> {
        let mut set = Self::new();
        records
            .into_iter()
            .filter(|r| set.insert(r.id.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exhausted,
    MaxRecords,
    EmergencyCeiling,
}

#[derive(Debug)]
struct SearchBatch {
    records: Vec<ConversationRecord>,
    pages: usize,
    items_read: usize,
    duplicates: usize,
    unmappable: usize,
    stop: StopReason,
}

/// Iterate search pages by cursor. Ends when the API stops handing out a
/// cursor, or hands back the one it was just given.
fn page_stream<'a>(
    source: &'a dyn ConversationSource,
    query: &'a SearchQuery,
) -> impl Stream<Item = Result<SearchPage>> + Send + 'a {
    try_stream! {
        let mut cursor: Option<String> = None;
        loop {
            let page = source.search_page(query, cursor.as_deref()).await?;
            let next = page.next_cursor.clone();
            yield page;

            match next {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    tracing::warn!(
                        cursor = %next,
                        "Search API repeated its cursor, stopping pagination"
                    );
                    break;
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
    }
}

/// Runs a creation-time range search to completion, mapping and
/// deduplicating items as pages arrive.
pub struct PagedSearchClient {
    source: Arc<dyn ConversationSource>,
    page_size: u32,
    emergency_ceiling: usize,
    retry: RetryPolicy,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl PagedSearchClient {
    pub fn new(
        source: Arc<dyn ConversationSource>,
        page_size: u32,
        emergency_ceiling: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            page_size,
            emergency_ceiling,
            retry,
            breakers: None,
        }
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Fetch every conversation created in `[start, end]`, skipping ids in
    /// `dedup`. New ids are added to `dedup` only once the whole search has
    /// succeeded, so a retried attempt starts from the same state.
    pub async fn search(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_records: Option<usize>,
        dedup: &mut DedupSet,
    ) -> Result<Vec<ConversationRecord>> {
        let query = SearchQuery::new(start, end, self.page_size);
        let query = &query;
        let seen: &DedupSet = dedup;

        let batch = self
            .retry
            .run_transient("conversation search", || async move {
                match &self.breakers {
                    Some(registry) => {
                        registry
                            .get(SEARCH_BREAKER)
                            .call_filtered(
                                || self.search_once(query, max_records, seen),
                                HarvestError::is_transient,
                            )
                            .await
                    }
                    None => self.search_once(query, max_records, seen).await,
                }
            })
            .await?;

        for record in &batch.records {
            dedup.insert(record.id.clone());
        }

        tracing::info!(
            window_start = %start,
            window_end = %end,
            pages = batch.pages,
            items_read = batch.items_read,
            records = batch.records.len(),
            duplicates = batch.duplicates,
            unmappable = batch.unmappable,
            stop = ?batch.stop,
            "Search complete"
        );

        Ok(batch.records)
    }

    async fn search_once(
        &self,
        query: &SearchQuery,
        max_records: Option<usize>,
        seen: &DedupSet,
    ) -> Result<SearchBatch> {
        let mut batch = SearchBatch {
            records: Vec::new(),
            pages: 0,
            items_read: 0,
            duplicates: 0,
            unmappable: 0,
            stop: StopReason::Exhausted,
        };
        let mut emitted: HashSet<String> = HashSet::new();

        if max_records == Some(0) {
            batch.stop = StopReason::MaxRecords;
            return Ok(batch);
        }

        let pages = page_stream(self.source.as_ref(), query);
        pin_mut!(pages);

        'pages: while let Some(page) = pages.try_next().await? {
            batch.pages += 1;
            tracing::debug!(
                page = batch.pages,
                items = page.items.len(),
                has_next = page.next_cursor.is_some(),
                "Received search page"
            );

            for item in page.items {
                if batch.items_read >= self.emergency_ceiling {
                    tracing::error!(
                        ceiling = self.emergency_ceiling,
                        pages = batch.pages,
                        "Emergency record ceiling reached, aborting pagination"
                    );
                    batch.stop = StopReason::EmergencyCeiling;
                    break 'pages;
                }
                batch.items_read += 1;

                let record = match ProviderConversation::from_value(item).and_then(to_canonical) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping unmappable search item");
                        batch.unmappable += 1;
                        continue;
                    }
                };

                if seen.contains(&record.id) || !emitted.insert(record.id.clone()) {
                    batch.duplicates += 1;
                    continue;
                }
                batch.records.push(record);

                if max_records.is_some_and(|max| batch.records.len() >= max) {
                    batch.stop = StopReason::MaxRecords;
                    break 'pages;
                }
            }
        }

        Ok(batch)
    }
}
