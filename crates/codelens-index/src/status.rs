//! Per-repository embedding status with monotonic progress and TTL eviction.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EmbeddingState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Snapshot of one repository's embedding run.
///
/// `processed_chunks` counts every chunk the run has dealt with, including
/// failed and skipped ones, so progress reaches 100 when the run finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingStatus {
    pub repository_id: String,
    pub state: EmbeddingState,
    pub progress: u8,
    pub total_chunks: usize,
    pub processed_chunks: usize,
    pub failed_chunks: usize,
    /// Chunks whose vector already existed before this run.
    pub skipped_chunks: usize,
    pub batches_total: usize,
    pub batches_succeeded: usize,
    pub batches_failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub estimated_seconds_remaining: Option<u64>,
    pub error: Option<String>,
}

impl EmbeddingStatus {
    #[must_use]
    pub fn pending(repository_id: impl Into<String>) -> Self {
        Self {
            repository_id: repository_id.into(),
            state: EmbeddingState::Pending,
            progress: 0,
            total_chunks: 0,
            processed_chunks: 0,
            failed_chunks: 0,
            skipped_chunks: 0,
            batches_total: 0,
            batches_succeeded: 0,
            batches_failed: 0,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
            estimated_seconds_remaining: None,
            error: None,
        }
    }

    /// Fresh `processing` status for a new run.
    #[must_use]
    pub fn started(repository_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            state: EmbeddingState::Processing,
            started_at: Some(now),
            updated_at: now,
            ..Self::pending(repository_id)
        }
    }

    /// Set the chunk plan of the run. Skipped chunks count as processed.
    pub fn plan(&mut self, total_chunks: usize, skipped_chunks: usize, batches_total: usize) {
        self.total_chunks = total_chunks;
        self.skipped_chunks = skipped_chunks;
        self.processed_chunks = skipped_chunks;
        self.batches_total = batches_total;
        self.progress = progress_percent(self.processed_chunks, self.total_chunks);
    }

    /// Account for one finished batch of `chunks` chunks.
    pub fn record_batch(&mut self, chunks: usize, succeeded: bool, now: DateTime<Utc>) {
        self.processed_chunks = (self.processed_chunks + chunks).min(self.total_chunks);
        if succeeded {
            self.batches_succeeded += 1;
        } else {
            self.failed_chunks += chunks;
            self.batches_failed += 1;
        }
        self.progress = progress_percent(self.processed_chunks, self.total_chunks);
        self.updated_at = now;
        self.estimated_seconds_remaining = self
            .avg_ms_per_chunk(now)
            .map(|avg| ms_to_secs(avg * count_f64(self.remaining_chunks())));
    }

    /// Close the run: `failed` when the failure ratio exceeds `failure_tolerance`.
    pub fn finish(&mut self, failure_tolerance: f64, now: DateTime<Utc>) {
        self.progress = if self.total_chunks == 0 {
            100
        } else {
            progress_percent(self.processed_chunks, self.total_chunks)
        };
        self.state = if self.failure_ratio() > failure_tolerance {
            EmbeddingState::Failed
        } else {
            EmbeddingState::Completed
        };
        if self.state == EmbeddingState::Failed && self.error.is_none() {
            self.error = Some(format!(
                "{} of {} chunks failed to embed",
                self.failed_chunks, self.total_chunks
            ));
        }
        self.completed_at = Some(now);
        self.updated_at = now;
        self.estimated_seconds_remaining = Some(0);
    }

    /// Abort the run with an error that prevented it from continuing.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.state = EmbeddingState::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        self.updated_at = now;
        self.estimated_seconds_remaining = None;
    }

    #[must_use]
    pub fn remaining_chunks(&self) -> usize {
        self.total_chunks.saturating_sub(self.processed_chunks)
    }

    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        if self.total_chunks == 0 {
            0.0
        } else {
            count_f64(self.failed_chunks) / count_f64(self.total_chunks)
        }
    }

    /// Mean wall time per chunk attempted in this run.
    #[must_use]
    pub fn avg_ms_per_chunk(&self, now: DateTime<Utc>) -> Option<f64> {
        let attempted = self.processed_chunks.saturating_sub(self.skipped_chunks);
        if attempted == 0 {
            return None;
        }
        let elapsed = self.elapsed_ms(now)?;
        Some(count_f64_u64(elapsed) / count_f64(attempted))
    }

    #[must_use]
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or(now);
        u64::try_from((end - started).num_milliseconds()).ok()
    }
}

/// Status plus derived throughput figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub status: EmbeddingStatus,
    pub batches_total: usize,
    pub batches_succeeded: usize,
    pub batches_failed: usize,
    pub avg_ms_per_chunk: Option<f64>,
    pub elapsed_ms: Option<u64>,
}

impl ProcessingStats {
    #[must_use]
    pub fn from_status(status: EmbeddingStatus, now: DateTime<Utc>) -> Self {
        Self {
            batches_total: status.batches_total,
            batches_succeeded: status.batches_succeeded,
            batches_failed: status.batches_failed,
            avg_ms_per_chunk: status.avg_ms_per_chunk(now),
            elapsed_ms: status.elapsed_ms(now),
            status,
        }
    }
}

/// `round(processed / total × 100)`, 0 for an empty plan.
#[must_use]
pub fn progress_percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (processed.min(total) * 100 + total / 2) / total;
    u8::try_from(pct).unwrap_or(100)
}

#[allow(clippy::cast_precision_loss)]
fn count_f64(n: usize) -> f64 {
    n as f64
}

#[allow(clippy::cast_precision_loss)]
fn count_f64_u64(n: u64) -> f64 {
    n as f64
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn ms_to_secs(ms: f64) -> u64 {
    (ms / 1000.0).ceil().max(0.0) as u64
}

/// Concurrency-safe keyed status store.
///
/// The embedding pipeline is the only writer. Progress of a run never moves
/// backwards; only a transition to `pending` starts over.
#[derive(Debug)]
pub struct StatusTracker {
    entries: RwLock<HashMap<String, EmbeddingStatus>>,
    ttl: Duration,
}

impl StatusTracker {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    #[must_use]
    pub fn get(&self, repository_id: &str) -> Option<EmbeddingStatus> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(repository_id)
            .cloned()
    }

    /// Mark a repository `pending` unless a run is already in progress.
    /// Returns the resulting status.
    pub fn mark_pending(&self, repository_id: &str) -> EmbeddingStatus {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(repository_id.to_owned())
            .or_insert_with(|| EmbeddingStatus::pending(repository_id));
        if entry.state != EmbeddingState::Processing {
            *entry = EmbeddingStatus::pending(repository_id);
        }
        entry.clone()
    }

    /// Atomically start a run. Returns `Err(current)` if one is already
    /// processing.
    ///
    /// # Errors
    ///
    /// Returns the current status when the repository is already processing.
    pub fn begin(
        &self,
        repository_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EmbeddingStatus, EmbeddingStatus> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = entries.get(repository_id)
            && current.state == EmbeddingState::Processing
        {
            return Err(current.clone());
        }
        let status = EmbeddingStatus::started(repository_id, now);
        entries.insert(repository_id.to_owned(), status.clone());
        Ok(status)
    }

    /// Apply `f` to an existing entry under the write lock. Progress is
    /// clamped so it never decreases.
    pub fn update(
        &self,
        repository_id: &str,
        f: impl FnOnce(&mut EmbeddingStatus),
    ) -> Option<EmbeddingStatus> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(repository_id)?;
        let before = entry.progress;
        f(entry);
        if entry.state != EmbeddingState::Pending && entry.progress < before {
            entry.progress = before;
        }
        Some(entry.clone())
    }

    /// Undo a [`StatusTracker::mark_pending`] whose job was never accepted.
    /// Leaves the entry alone if a run has picked it up meanwhile.
    pub fn restore(&self, repository_id: &str, previous: Option<EmbeddingStatus>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries
            .get(repository_id)
            .is_some_and(|s| s.state != EmbeddingState::Pending)
        {
            return;
        }
        match previous {
            Some(status) => {
                entries.insert(repository_id.to_owned(), status);
            }
            None => {
                entries.remove(repository_id);
            }
        }
    }

    pub fn remove(&self, repository_id: &str) -> Option<EmbeddingStatus> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(repository_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop terminal entries that finished more than `ttl` before `now`.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, status| {
            !(status.state.is_terminal()
                && status
                    .completed_at
                    .is_some_and(|done| now.signed_duration_since(done) > ttl))
        });
        before - entries.len()
    }

    /// Run [`StatusTracker::evict_expired`] every `interval` until `cancel` fires.
    pub fn spawn_eviction(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("status eviction stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = tracker.evict_expired(Utc::now());
                        if evicted > 0 {
                            tracing::debug!(evicted, "evicted expired embedding statuses");
                        }
                    }
                }
            }
        })
    }
}
