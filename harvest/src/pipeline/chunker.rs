use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::client::ConversationSource;
use crate::config::Config;
use crate::error::{HarvestError, Result};
use crate::models::ConversationRecord;
use crate::pipeline::dates::filter_to_window;
use crate::pipeline::enrichment::{EnrichmentCoordinator, EnrichmentMetrics};
use crate::pipeline::search::{DedupSet, PagedSearchClient};
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};

/// Inclusive `[start, end]` slice of the requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ChunkWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Split `[start, end]` into consecutive windows of at most `max_span`.
///
/// Each window ends one second before the next begins, and the last is
/// clamped to `end`, so the windows neither overlap nor leave gaps at the
/// API's one-second resolution.
pub fn plan_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_span: chrono::Duration,
) -> VecDeque<ChunkWindow> {
    let mut windows = VecDeque::new();
    if end < start {
        return windows;
    }
    if max_span <= chrono::Duration::zero() {
        windows.push_back(ChunkWindow { start, end });
        return windows;
    }

    let one_second = chrono::Duration::seconds(1);
    let mut window_start = start;
    while window_start <= end {
        let next_start = window_start + max_span;
        let window_end = (next_start - one_second).min(end);
        windows.push_back(ChunkWindow {
            start: window_start,
            end: window_end,
        });
        window_start = next_start;
    }
    windows
}

/// Result of one top-level fetch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub records: Vec<ConversationRecord>,
    pub enrichment: EnrichmentMetrics,
    pub windows_planned: usize,
    pub windows_fetched: usize,
    pub windows_failed: usize,
    /// A later window failed and the records cover only a prefix of the range.
    pub partial: bool,
    pub dropped_out_of_window: usize,
}

struct WindowOutcome {
    records: Vec<ConversationRecord>,
    metrics: EnrichmentMetrics,
    dropped: usize,
}

/// Drives a fetch over an arbitrary date range: one pass for short ranges,
/// sequential fixed-span windows for long ones.
pub struct Chunker {
    search: PagedSearchClient,
    enrichment: EnrichmentCoordinator,
    chunk_threshold: chrono::Duration,
    max_span: chrono::Duration,
    chunk_delay: Duration,
}

impl Chunker {
    pub fn new(
        search: PagedSearchClient,
        enrichment: EnrichmentCoordinator,
        chunk_threshold: chrono::Duration,
        max_span: chrono::Duration,
        chunk_delay: Duration,
    ) -> Self {
        Self {
            search,
            enrichment,
            chunk_threshold,
            max_span,
            chunk_delay,
        }
    }

    /// Wire a complete pipeline from configuration.
    pub fn from_config(
        source: Arc<dyn ConversationSource>,
        config: &Config,
        breakers: Option<Arc<CircuitBreakerRegistry>>,
    ) -> Self {
        let mut search = PagedSearchClient::new(
            Arc::clone(&source),
            config.fetch.page_size,
            config.fetch.emergency_record_ceiling,
            RetryPolicy::from_config(&config.retry),
        );
        let mut enrichment = EnrichmentCoordinator::new(
            source,
            config.fetch.max_concurrency,
            config.fetch.request_delay(),
        )
        .with_progress(config.fetch.progress_every, config.fetch.progress_interval());

        if let Some(registry) = breakers {
            search = search.with_breakers(Arc::clone(&registry));
            enrichment = enrichment.with_breakers(registry);
        }

        Self::new(
            search,
            enrichment,
            config.fetch.chunk_threshold(),
            config.fetch.max_chunk_span(),
            config.fetch.chunk_delay(),
        )
    }

    pub fn plan(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> VecDeque<ChunkWindow> {
        if end - start < self.chunk_threshold {
            VecDeque::from([ChunkWindow { start, end }])
        } else {
            plan_windows(start, end, self.max_span)
        }
    }

    /// Fetch, enrich and normalize every conversation created in
    /// `[start, end]`, stopping once `max_records` have been collected.
    pub async fn fetch(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_records: Option<usize>,
    ) -> Result<FetchReport> {
        if end < start {
            return Err(HarvestError::Validation(format!(
                "Fetch range end {end} is before start {start}"
            )));
        }

        let mut windows = self.plan(start, end);
        let mut report = FetchReport {
            windows_planned: windows.len(),
            ..Default::default()
        };
        if max_records == Some(0) {
            return Ok(report);
        }

        tracing::info!(
            start = %start,
            end = %end,
            windows = windows.len(),
            max_records = ?max_records,
            "Starting conversation fetch"
        );

        let mut dedup = DedupSet::new();
        let mut index = 0usize;

        while let Some(window) = windows.pop_front() {
            if index > 0 && !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            index += 1;

            let remaining = max_records.map(|max| max.saturating_sub(report.records.len()));
            match self.fetch_window(window, start, end, remaining, &mut dedup).await {
                Ok(outcome) => {
                    report.windows_fetched += 1;
                    report.enrichment.merge(&outcome.metrics);
                    report.dropped_out_of_window += outcome.dropped;
                    report.records.extend(outcome.records);

                    tracing::info!(
                        window = index,
                        of = report.windows_planned,
                        window_start = %window.start,
                        window_end = %window.end,
                        accumulated = report.records.len(),
                        "Window complete"
                    );
                }
                Err(e) => {
                    report.windows_failed += 1;
                    if report.records.is_empty() {
                        tracing::error!(
                            window = index,
                            window_start = %window.start,
                            window_end = %window.end,
                            error = %e,
                            "Window failed with nothing accumulated"
                        );
                        return Err(HarvestError::Fetch(format!(
                            "Window {} to {} failed: {e}",
                            window.start, window.end
                        )));
                    }
                    tracing::warn!(
                        window = index,
                        window_start = %window.start,
                        window_end = %window.end,
                        accumulated = report.records.len(),
                        skipped_windows = windows.len(),
                        error = %e,
                        "Window failed, returning partial results"
                    );
                    report.partial = true;
                    break;
                }
            }

            if let Some(max) = max_records {
                if report.records.len() >= max {
                    report.records.truncate(max);
                    if !windows.is_empty() {
                        tracing::info!(
                            max_records = max,
                            skipped_windows = windows.len(),
                            "Record cap reached, stopping early"
                        );
                    }
                    break;
                }
            }
        }

        tracing::info!(
            records = report.records.len(),
            windows_fetched = report.windows_fetched,
            windows_failed = report.windows_failed,
            partial = report.partial,
            failed_body = report.enrichment.failed_body,
            failed_owner = report.enrichment.failed_owner,
            failed_groups = report.enrichment.failed_groups,
            "Conversation fetch complete"
        );

        Ok(report)
    }

    async fn fetch_window(
        &self,
        window: ChunkWindow,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_records: Option<usize>,
        dedup: &mut DedupSet,
    ) -> Result<WindowOutcome> {
        let records = self
            .search
            .search(window.start, window.end, max_records, dedup)
            .await?;

        let stray = records
            .iter()
            .filter(|r| !window.contains(r.created_at))
            .count();
        if stray > 0 {
            tracing::warn!(
                window_start = %window.start,
                window_end = %window.end,
                stray,
                "Search returned conversations outside the window"
            );
        }

        let (records, metrics) = self.enrichment.enrich(records).await;
        let filtered = filter_to_window(records, start, end);

        Ok(WindowOutcome {
            records: filtered.kept,
            metrics,
            dropped: filtered.dropped,
        })
    }
}
