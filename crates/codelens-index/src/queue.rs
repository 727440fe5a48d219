//! Bounded multi-producer multi-consumer priority queue of embedding jobs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// A request to embed one repository. Higher priority runs first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub repository_id: String,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
}

impl EmbeddingJob {
    #[must_use]
    pub fn new(repository_id: impl Into<String>, priority: i32) -> Self {
        Self {
            repository_id: repository_id.into(),
            priority,
            enqueued_at: Utc::now(),
        }
    }
}

/// Why a job was not accepted. The job is handed back.
#[derive(Debug)]
pub enum PushError {
    Full(EmbeddingJob),
    Closed(EmbeddingJob),
}

impl PushError {
    #[must_use]
    pub fn into_job(self) -> EmbeddingJob {
        match self {
            Self::Full(job) | Self::Closed(job) => job,
        }
    }
}

struct Entry {
    job: EmbeddingJob,
    seq: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

/// Jobs are ordered by priority, FIFO among equal priorities. `try_push`
/// never blocks; `pop` waits until a job arrives or the queue is closed.
pub struct JobQueue {
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
}

impl JobQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Errors
    ///
    /// Returns [`PushError::Full`] at capacity and [`PushError::Closed`]
    /// after [`JobQueue::close`].
    pub fn try_push(&self, job: EmbeddingJob) -> Result<(), PushError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PushError::Closed(job));
            }
            if state.heap.len() >= self.capacity {
                return Err(PushError::Full(job));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry { job, seq });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the highest-priority job. Returns `None` once the queue is
    /// closed and drained.
    pub async fn pop(&self) -> Option<EmbeddingJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(entry) = state.heap.pop() {
                    return Some(entry.job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting jobs and wake every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn higher_priority_first_then_fifo() {
        let q = JobQueue::new(10);
        q.try_push(EmbeddingJob::new("low", 0)).unwrap();
        q.try_push(EmbeddingJob::new("a", 5)).unwrap();
        q.try_push(EmbeddingJob::new("b", 5)).unwrap();
        q.try_push(EmbeddingJob::new("c", 5)).unwrap();
        q.try_push(EmbeddingJob::new("urgent", 9)).unwrap();

        let mut order = Vec::new();
        while !q.is_empty() {
            order.push(q.pop().await.unwrap().repository_id);
        }
        assert_eq!(order, vec!["urgent", "a", "b", "c", "low"]);
    }

    #[test]
    fn full_queue_hands_job_back() {
        let q = JobQueue::new(1);
        q.try_push(EmbeddingJob::new("a", 0)).unwrap();
        let err = q.try_push(EmbeddingJob::new("b", 0)).unwrap_err();
        assert!(matches!(err, PushError::Full(_)));
        assert_eq!(err.into_job().repository_id, "b");
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q = Arc::new(JobQueue::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.try_push(EmbeddingJob::new("late", 1)).unwrap();
        let job = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.unwrap().repository_id, "late");
    }

    #[tokio::test]
    async fn close_wakes_all_consumers() {
        let q = Arc::new(JobQueue::new(4));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                tokio::spawn(async move { q.pop().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        for c in consumers {
            let popped = tokio::time::timeout(Duration::from_secs(1), c)
                .await
                .unwrap()
                .unwrap();
            assert!(popped.is_none());
        }
        assert!(matches!(
            q.try_push(EmbeddingJob::new("x", 0)),
            Err(PushError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn close_still_drains_pending_jobs() {
        let q = JobQueue::new(4);
        q.try_push(EmbeddingJob::new("a", 0)).unwrap();
        q.close();
        assert_eq!(q.pop().await.unwrap().repository_id, "a");
        assert!(q.pop().await.is_none());
    }
}
