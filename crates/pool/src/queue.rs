//! The pending-job queue.
//!
//! [`QueueAdapter`] is the seam for alternative storage (a durable
//! adapter defines its own format); [`InMemoryQueue`] is the adapter the
//! pool ships. A job is observed by the queue in exactly one of three
//! states: waiting (subject to peek), reserved (invisible to peek,
//! consumed by at most one runner), or gone. Transitions are atomic at
//! the queue boundary.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use fanout_core::types::JobId;

/// Errors from a queue adapter.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The reservation was already consumed or never issued.
    #[error("Unknown reservation: {0}")]
    UnknownReservation(String),

    /// Adapter-specific failure (storage, serialization, ...).
    #[error("Queue adapter failure: {0}")]
    Adapter(String),
}

/// A queued reference to a job. The job payload itself stays on the pool's
/// job record; adapters treat this as opaque.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub priority: i32,
}

/// Transient right to commit or return exactly one job payload.
///
/// Consumed by exactly one of [`QueueAdapter::commit`],
/// [`QueueAdapter::retry`], or [`QueueAdapter::discard`].
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: String,
    pub job_id: JobId,
}

/// Storage seam for pending jobs.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Add a job to the waiting set.
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError>;

    /// Snapshot the first `limit` waiting jobs in dispatch order
    /// (priority descending, FIFO within a priority).
    async fn peek(&self, limit: usize) -> Result<Vec<QueuedJob>, QueueError>;

    /// Atomically move a waiting job to the reserved set. Returns `None`
    /// when the job is not waiting (already reserved, or removed).
    async fn reserve(&self, job_id: &str) -> Result<Option<Reservation>, QueueError>;

    /// Consume a reservation: the job is done with the queue.
    async fn commit(&self, reservation: &Reservation) -> Result<(), QueueError>;

    /// Consume a reservation by returning the job to the waiting set (at
    /// the back of its priority class).
    async fn retry(&self, reservation: &Reservation) -> Result<(), QueueError>;

    /// Consume a reservation and drop the job.
    async fn discard(&self, reservation: &Reservation) -> Result<(), QueueError>;

    /// Remove a waiting job (cancellation). Returns whether it was
    /// waiting.
    async fn remove(&self, job_id: &str) -> Result<bool, QueueError>;

    /// Number of waiting jobs.
    async fn pending_count(&self) -> Result<usize, QueueError>;
}

// ---------------------------------------------------------------------------
// In-memory adapter
// ---------------------------------------------------------------------------

struct Entry {
    job: QueuedJob,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    waiting: Vec<Entry>,
    reserved: HashMap<String, Entry>,
    next_seq: u64,
}

/// Process-local queue. The mutex serializes reserve/retry/commit/discard
/// so the waiting / reserved states stay mutually exclusive.
#[derive(Default)]
pub struct InMemoryQueue {
    inner: Mutex<Inner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueAdapter for InMemoryQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.waiting.push(Entry { job, seq });
        Ok(())
    }

    async fn peek(&self, limit: usize) -> Result<Vec<QueuedJob>, QueueError> {
        let inner = self.inner.lock().unwrap();
        let mut order: Vec<&Entry> = inner.waiting.iter().collect();
        order.sort_by(|a, b| {
            b.job
                .priority
                .cmp(&a.job.priority)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        Ok(order
            .into_iter()
            .take(limit)
            .map(|entry| entry.job.clone())
            .collect())
    }

    async fn reserve(&self, job_id: &str) -> Result<Option<Reservation>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.waiting.iter().position(|e| e.job.job_id == job_id) else {
            return Ok(None);
        };
        let entry = inner.waiting.swap_remove(index);
        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: entry.job.job_id.clone(),
        };
        inner.reserved.insert(reservation.id.clone(), entry);
        Ok(Some(reservation))
    }

    async fn commit(&self, reservation: &Reservation) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .reserved
            .remove(&reservation.id)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownReservation(reservation.id.clone()))
    }

    async fn retry(&self, reservation: &Reservation) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .reserved
            .remove(&reservation.id)
            .ok_or_else(|| QueueError::UnknownReservation(reservation.id.clone()))?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.waiting.push(Entry {
            job: entry.job,
            seq,
        });
        Ok(())
    }

    async fn discard(&self, reservation: &Reservation) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .reserved
            .remove(&reservation.id)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownReservation(reservation.id.clone()))
    }

    async fn remove(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.waiting.iter().position(|e| e.job.job_id == job_id) else {
            return Ok(false);
        };
        inner.waiting.swap_remove(index);
        Ok(true)
    }

    async fn pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.inner.lock().unwrap().waiting.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, priority: i32) -> QueuedJob {
        QueuedJob {
            job_id: id.to_string(),
            priority,
        }
    }

    #[tokio::test]
    async fn peek_orders_by_priority_then_fifo() {
        let queue = InMemoryQueue::new();
        queue.enqueue(job("a", 0)).await.unwrap();
        queue.enqueue(job("b", 5)).await.unwrap();
        queue.enqueue(job("c", 0)).await.unwrap();
        queue.enqueue(job("d", 5)).await.unwrap();

        let peeked = queue.peek(10).await.unwrap();
        let ids: Vec<&str> = peeked.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn peek_respects_limit() {
        let queue = InMemoryQueue::new();
        for i in 0..5 {
            queue.enqueue(job(&format!("j{i}"), 0)).await.unwrap();
        }
        assert_eq!(queue.peek(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reserved_jobs_are_invisible_to_peek() {
        let queue = InMemoryQueue::new();
        queue.enqueue(job("a", 0)).await.unwrap();

        let reservation = queue.reserve("a").await.unwrap().unwrap();
        assert!(queue.peek(10).await.unwrap().is_empty());
        assert_eq!(queue.pending_count().await.unwrap(), 0);

        // A second reserve for the same id finds nothing.
        assert!(queue.reserve("a").await.unwrap().is_none());

        queue.commit(&reservation).await.unwrap();
    }

    #[tokio::test]
    async fn reservation_is_consumed_exactly_once() {
        let queue = InMemoryQueue::new();
        queue.enqueue(job("a", 0)).await.unwrap();
        let reservation = queue.reserve("a").await.unwrap().unwrap();

        queue.commit(&reservation).await.unwrap();
        assert!(queue.commit(&reservation).await.is_err());
        assert!(queue.retry(&reservation).await.is_err());
        assert!(queue.discard(&reservation).await.is_err());
    }

    #[tokio::test]
    async fn retry_requeues_at_back_of_priority_class() {
        let queue = InMemoryQueue::new();
        queue.enqueue(job("a", 0)).await.unwrap();
        queue.enqueue(job("b", 0)).await.unwrap();

        let reservation = queue.reserve("a").await.unwrap().unwrap();
        queue.retry(&reservation).await.unwrap();

        let ids: Vec<String> = queue
            .peek(10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn remove_only_affects_waiting_jobs() {
        let queue = InMemoryQueue::new();
        queue.enqueue(job("a", 0)).await.unwrap();
        queue.enqueue(job("b", 0)).await.unwrap();

        assert!(queue.remove("a").await.unwrap());
        assert!(!queue.remove("a").await.unwrap());

        let _reservation = queue.reserve("b").await.unwrap().unwrap();
        assert!(!queue.remove("b").await.unwrap());
    }
}
