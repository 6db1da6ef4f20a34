use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::client::ConversationSource;
use crate::error::{HarvestError, Result};
use crate::models::provider::{apply_full_body, groups_to_canonical, owner_to_canonical};
use crate::models::{ConversationRecord, OwnerProfile};
use crate::resilience::CircuitBreakerRegistry;

pub const CONVERSATIONS_BREAKER: &str = "conversations";
pub const ADMINS_BREAKER: &str = "admins";
pub const TEAMS_BREAKER: &str = "teams";

/// Per-run enrichment counters. Every field is a count of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentMetrics {
    pub processed: usize,
    pub enriched_body: usize,
    pub enriched_owner: usize,
    pub enriched_groups: usize,
    pub failed_body: usize,
    pub failed_owner: usize,
    pub failed_groups: usize,
    pub skipped_no_owner: usize,
}

impl EnrichmentMetrics {
    pub fn merge(&mut self, other: &EnrichmentMetrics) {
        self.processed += other.processed;
        self.enriched_body += other.enriched_body;
        self.enriched_owner += other.enriched_owner;
        self.enriched_groups += other.enriched_groups;
        self.failed_body += other.failed_body;
        self.failed_owner += other.failed_owner;
        self.failed_groups += other.failed_groups;
        self.skipped_no_owner += other.skipped_no_owner;
    }

    pub fn failures(&self) -> usize {
        self.failed_body + self.failed_owner + self.failed_groups
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubFetchOutcome {
    Pending,
    Succeeded,
    Failed(String),
    Skipped,
}

/// The sub-fetches one record needs and how each went.
#[derive(Debug, Clone)]
pub struct EnrichmentTask {
    pub conversation_id: String,
    pub needs_body: bool,
    pub needs_owner: bool,
    pub needs_groups: bool,
    pub body: SubFetchOutcome,
    pub owner: SubFetchOutcome,
    pub groups: SubFetchOutcome,
}

impl EnrichmentTask {
    pub fn for_record(record: &ConversationRecord) -> Self {
        let needs = |done: bool| {
            if done {
                SubFetchOutcome::Skipped
            } else {
                SubFetchOutcome::Pending
            }
        };
        Self {
            conversation_id: record.id.clone(),
            needs_body: !record.enrichment.body,
            needs_owner: !record.enrichment.owner,
            needs_groups: !record.enrichment.groups,
            body: needs(record.enrichment.body),
            owner: needs(record.enrichment.owner),
            groups: needs(record.enrichment.groups),
        }
    }

    pub fn metrics(&self, no_owner: bool) -> EnrichmentMetrics {
        let succeeded = |o: &SubFetchOutcome| usize::from(*o == SubFetchOutcome::Succeeded);
        let failed = |o: &SubFetchOutcome| usize::from(matches!(o, SubFetchOutcome::Failed(_)));
        EnrichmentMetrics {
            processed: 1,
            enriched_body: succeeded(&self.body),
            enriched_owner: succeeded(&self.owner),
            enriched_groups: succeeded(&self.groups),
            failed_body: failed(&self.body),
            failed_owner: failed(&self.owner),
            failed_groups: failed(&self.groups),
            skipped_no_owner: usize::from(no_owner),
        }
    }
}

/// Periodic completion log for one fan-out: every `every` records or every
/// `interval`, whichever comes first.
struct ProgressTracker {
    total: usize,
    every: usize,
    interval: Duration,
    completed: AtomicUsize,
    started: Instant,
    last_logged: Mutex<Instant>,
}

impl ProgressTracker {
    fn new(total: usize, every: usize, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            total,
            every,
            interval,
            completed: AtomicUsize::new(0),
            started: now,
            last_logged: Mutex::new(now),
        }
    }

    fn record_completion(&self) {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let by_count = self.every > 0 && done % self.every == 0;

        let mut last = self
            .last_logged
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let by_time = last.elapsed() >= self.interval;
        if !(by_count || by_time || done == self.total) {
            return;
        }
        *last = Instant::now();
        drop(last);

        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            done as f64 / elapsed
        } else {
            0.0
        };
        let remaining = self.total.saturating_sub(done);
        let eta_secs = if rate > 0.0 {
            (remaining as f64 / rate).round() as u64
        } else {
            0
        };
        let percent = if self.total > 0 {
            done as f64 * 100.0 / self.total as f64
        } else {
            100.0
        };

        tracing::info!(
            completed = done,
            total = self.total,
            percent = (percent * 10.0).round() / 10.0,
            per_sec = (rate * 100.0).round() / 100.0,
            eta_secs,
            "Enrichment progress"
        );
    }
}

/// Fans out per-record sub-fetches (full body, owner, owner's teams) under a
/// concurrency bound and merges the results back into each record.
///
/// Sub-fetch failures are counted, never raised: every input record comes
/// back out, enriched as far as the remote API allowed.
pub struct EnrichmentCoordinator {
    source: Arc<dyn ConversationSource>,
    concurrency: usize,
    request_delay: Duration,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    progress_every: usize,
    progress_interval: Duration,
}

impl EnrichmentCoordinator {
    pub fn new(
        source: Arc<dyn ConversationSource>,
        concurrency: usize,
        request_delay: Duration,
    ) -> Self {
        Self {
            source,
            concurrency: concurrency.max(1),
            request_delay,
            breakers: None,
            progress_every: 50,
            progress_interval: Duration::from_secs(10),
        }
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_progress(mut self, every: usize, interval: Duration) -> Self {
        self.progress_every = every;
        self.progress_interval = interval;
        self
    }

    pub async fn enrich(
        &self,
        records: Vec<ConversationRecord>,
    ) -> (Vec<ConversationRecord>, EnrichmentMetrics) {
        if records.is_empty() {
            return (records, EnrichmentMetrics::default());
        }

        let total = records.len();
        let semaphore = Semaphore::new(self.concurrency);
        let progress = ProgressTracker::new(total, self.progress_every, self.progress_interval);

        tracing::info!(
            records = total,
            concurrency = self.concurrency,
            "Starting enrichment"
        );

        let tasks = records
            .into_iter()
            .map(|record| self.enrich_one(record, &semaphore, &progress));
        let results = join_all(tasks).await;

        let mut metrics = EnrichmentMetrics::default();
        let mut enriched = Vec::with_capacity(results.len());
        for (record, record_metrics) in results {
            metrics.merge(&record_metrics);
            enriched.push(record);
        }

        tracing::info!(
            processed = metrics.processed,
            failed_body = metrics.failed_body,
            failed_owner = metrics.failed_owner,
            failed_groups = metrics.failed_groups,
            skipped_no_owner = metrics.skipped_no_owner,
            elapsed_ms = progress.started.elapsed().as_millis() as u64,
            "Enrichment complete"
        );

        (enriched, metrics)
    }

    async fn enrich_one(
        &self,
        mut record: ConversationRecord,
        semaphore: &Semaphore,
        progress: &ProgressTracker,
    ) -> (ConversationRecord, EnrichmentMetrics) {
        // Only errors once closed, which never happens here.
        let _permit = semaphore.acquire().await.ok();
        let mut task = EnrichmentTask::for_record(&record);

        if task.needs_body {
            let fetched = self
                .guarded(CONVERSATIONS_BREAKER, || self.source.get_conversation(&record.id))
                .await;
            match fetched {
                Ok(full) => {
                    apply_full_body(&mut record, full);
                    record.enrichment.body = true;
                    task.body = SubFetchOutcome::Succeeded;
                    self.pace().await;
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %record.id,
                        error = %e,
                        "Failed to fetch conversation body"
                    );
                    task.body = SubFetchOutcome::Failed(e.to_string());
                }
            }
        }

        let Some(owner_id) = record.owner_id.clone() else {
            tracing::debug!(
                conversation_id = %record.id,
                "No owner assigned, skipping owner enrichment"
            );
            if task.needs_owner {
                task.owner = SubFetchOutcome::Skipped;
            }
            if task.needs_groups {
                task.groups = SubFetchOutcome::Skipped;
            }
            let metrics = task.metrics(task.needs_owner || task.needs_groups);
            progress.record_completion();
            return (record, metrics);
        };

        if task.needs_owner {
            let fetched = self
                .guarded(ADMINS_BREAKER, || self.source.get_owner(&owner_id))
                .await
                .and_then(owner_to_canonical);
            match fetched {
                Ok(profile) => {
                    let groups = record.owner.take().map(|o| o.groups).unwrap_or_default();
                    record.owner = Some(OwnerProfile { groups, ..profile });
                    record.enrichment.owner = true;
                    task.owner = SubFetchOutcome::Succeeded;
                    self.pace().await;
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %record.id,
                        owner_id = %owner_id,
                        error = %e,
                        "Failed to fetch owner profile"
                    );
                    task.owner = SubFetchOutcome::Failed(e.to_string());
                }
            }
        }

        if task.needs_groups {
            let fetched = self
                .guarded(TEAMS_BREAKER, || self.source.get_owner_groups(&owner_id))
                .await;
            match fetched {
                Ok(teams) => {
                    let groups = groups_to_canonical(teams);
                    let owner = record.owner.get_or_insert_with(|| OwnerProfile {
                        id: owner_id.clone(),
                        name: None,
                        email: None,
                        job_title: None,
                        away_mode_enabled: None,
                        groups: Vec::new(),
                    });
                    owner.groups = groups;
                    record.enrichment.groups = true;
                    task.groups = SubFetchOutcome::Succeeded;
                    self.pace().await;
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %record.id,
                        owner_id = %owner_id,
                        error = %e,
                        "Failed to fetch owner groups"
                    );
                    task.groups = SubFetchOutcome::Failed(e.to_string());
                }
            }
        }

        let metrics = task.metrics(false);
        progress.record_completion();
        (record, metrics)
    }

    async fn guarded<T, F, Fut>(&self, breaker: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match &self.breakers {
            Some(registry) => {
                registry
                    .get(breaker)
                    .call_filtered(operation, HarvestError::is_transient)
                    .await
            }
            None => operation().await,
        }
    }

    async fn pace(&self) {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
    }
}
