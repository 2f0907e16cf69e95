//! Ingestion queue and worker pool.
//!
//! In-memory FIFO with a hard capacity; overflow surfaces a retryable 503 to
//! the event source, which persists and redelivers.  A bounded pool of
//! workers drains the queue.  Concurrent uploads of the same `doc_id`
//! collapse onto the single in-flight job.  Cancellation is cooperative: a
//! `DELETE /jobs/{id}` fires the job's token, which the processor observes at
//! stage boundaries.  A watchdog cancels jobs that outlive
//! `timeout_s_per_page × pages`.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};
use crate::parser::DocumentSource;
use crate::processor::{JobContext, Processor};
use crate::state::{ServerEvent, now_iso};

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub doc_id: String,
    pub source_key: String,
    pub filename: String,
    pub status: String,
    pub stage: String,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

#[derive(Debug)]
pub enum EnqueueOutcome {
    Enqueued { job_id: String, doc_id: String },
    /// The document already has a queued or running job; callers observe that
    /// job's event stream instead of spawning a second one.
    Duplicate { job_id: String, doc_id: String },
}

struct QueuedJob {
    job_id: String,
    doc_id: String,
    source: DocumentSource,
    cancel: CancellationToken,
}

pub struct JobQueue {
    pending: Mutex<VecDeque<QueuedJob>>,
    capacity: usize,
    records: DashMap<String, JobRecord>,
    in_flight: DashMap<String, String>,
    tokens: DashMap<String, CancellationToken>,
    notify: Notify,
    active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            capacity,
            records: DashMap::new(),
            in_flight: DashMap::new(),
            tokens: DashMap::new(),
            notify: Notify::new(),
            active: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    /// Admit a job, collapsing duplicates of an in-flight `doc_id`.
    pub fn enqueue(&self, source: DocumentSource) -> AppResult<EnqueueOutcome> {
        let doc_id = source.doc_id();

        if let Some(existing) = self.in_flight.get(&doc_id) {
            return Ok(EnqueueOutcome::Duplicate {
                job_id: existing.value().clone(),
                doc_id,
            });
        }

        let mut pending = self.pending.lock();
        if pending.len() >= self.capacity {
            return Err(AppError::QueueFull);
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let now = now_iso();

        self.records.insert(
            job_id.clone(),
            JobRecord {
                job_id: job_id.clone(),
                doc_id: doc_id.clone(),
                source_key: source.key.clone(),
                filename: source.filename.clone(),
                status: "queued".to_string(),
                stage: "queued".to_string(),
                progress: 0.0,
                error: None,
                created_at: now.clone(),
                started_at: None,
                updated_at: now,
            },
        );
        self.in_flight.insert(doc_id.clone(), job_id.clone());
        self.tokens.insert(job_id.clone(), cancel.clone());

        pending.push_back(QueuedJob {
            job_id: job_id.clone(),
            doc_id: doc_id.clone(),
            source,
            cancel,
        });
        drop(pending);

        self.notify.notify_one();
        Ok(EnqueueOutcome::Enqueued { job_id, doc_id })
    }

    /// Cancel a job.  Queued jobs are removed outright; running jobs get
    /// their token fired and exit at the next stage boundary.
    pub fn cancel(&self, job_id: &str) -> AppResult<()> {
        let Some(token) = self.tokens.get(job_id).map(|t| t.value().clone()) else {
            return Err(AppError::NotFound(format!("job {}", job_id)));
        };
        token.cancel();

        let was_queued = {
            let mut pending = self.pending.lock();
            let before = pending.len();
            pending.retain(|j| j.job_id != job_id);
            pending.len() < before
        };

        if was_queued {
            self.finish(job_id, "cancelled", None);
            info!(job_id, "queued job cancelled");
        } else {
            info!(job_id, "cancellation requested for running job");
        }
        Ok(())
    }

    pub fn record(&self, job_id: &str) -> Option<JobRecord> {
        self.records.get(job_id).map(|r| r.value().clone())
    }

    pub fn in_flight_job(&self, doc_id: &str) -> Option<JobRecord> {
        self.in_flight
            .get(doc_id)
            .and_then(|id| self.record(id.value()))
    }

    /// Queued or running job for a filename.  Registration happens before
    /// the upload exists, so it can only match on the name.
    pub fn in_flight_by_filename(&self, filename: &str) -> Option<JobRecord> {
        self.records
            .iter()
            .find(|r| {
                r.value().filename == filename
                    && matches!(r.value().status.as_str(), "queued" | "running")
            })
            .map(|r| r.value().clone())
    }

    pub fn stats(&self) -> QueueStats {
        let queued = self.pending.lock().len();
        let active = self.active.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let cancelled = self.cancelled.load(Ordering::Relaxed);
        QueueStats {
            queued,
            active,
            completed,
            failed,
            cancelled,
            total: queued + active + completed + failed + cancelled,
        }
    }

    pub fn recent_records(&self, limit: usize) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records.truncate(limit);
        records
    }

    fn pop(&self) -> Option<QueuedJob> {
        let mut pending = self.pending.lock();
        while let Some(job) = pending.pop_front() {
            if job.cancel.is_cancelled() {
                continue;
            }
            return Some(job);
        }
        None
    }

    fn update_record(&self, job_id: &str, f: impl FnOnce(&mut JobRecord)) {
        if let Some(mut record) = self.records.get_mut(job_id) {
            f(record.value_mut());
            record.value_mut().updated_at = now_iso();
        }
    }

    /// Terminal bookkeeping shared by every outcome.
    fn finish(&self, job_id: &str, status: &str, error: Option<String>) {
        match status {
            "completed" => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            "failed" => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            "cancelled" => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        let mut doc_id = None;
        self.update_record(job_id, |r| {
            r.status = status.to_string();
            if status != "completed" {
                r.error = error;
            }
            doc_id = Some(r.doc_id.clone());
        });
        if let Some(doc_id) = doc_id {
            self.in_flight.remove(&doc_id);
        }
        self.tokens.remove(job_id);
    }
}

/// Start the bounded worker pool.
pub fn spawn_workers(
    queue: Arc<JobQueue>,
    processor: Arc<Processor>,
    events: broadcast::Sender<ServerEvent>,
    max_parallel: usize,
    timeout_s_per_page: u64,
) {
    for worker_id in 0..max_parallel.max(1) {
        let queue = queue.clone();
        let processor = processor.clone();
        let events = events.clone();
        tokio::spawn(async move {
            info!(worker_id, "ingestion worker started");
            loop {
                match queue.pop() {
                    Some(job) => {
                        run_job(&queue, &processor, &events, job, timeout_s_per_page).await;
                    }
                    None => queue.notify.notified().await,
                }
            }
        });
    }
}

async fn run_job(
    queue: &Arc<JobQueue>,
    processor: &Arc<Processor>,
    events: &broadcast::Sender<ServerEvent>,
    job: QueuedJob,
    timeout_s_per_page: u64,
) {
    queue.active.fetch_add(1, Ordering::Relaxed);
    queue.update_record(&job.job_id, |r| {
        r.status = "running".to_string();
        r.started_at = Some(now_iso());
    });

    let (pages_tx, pages_rx) = watch::channel(1usize);
    let (stage_tx, mut stage_rx) = watch::channel(("queued".to_string(), 0.0f32));

    // Mirror staged progress into the job record for /status consumers.
    let mirror_queue = queue.clone();
    let mirror_job_id = job.job_id.clone();
    let mirror = tokio::spawn(async move {
        while stage_rx.changed().await.is_ok() {
            let (stage, progress) = stage_rx.borrow().clone();
            mirror_queue.update_record(&mirror_job_id, |r| {
                r.stage = stage;
                r.progress = progress;
            });
        }
    });

    let ctx = JobContext {
        job_id: job.job_id.clone(),
        doc_id: job.doc_id.clone(),
        source: job.source,
        cancel: job.cancel.clone(),
        pages_tx,
        stage_tx,
    };

    let started = Instant::now();
    let watchdog = async {
        loop {
            let pages = *pages_rx.borrow();
            let limit = Duration::from_secs(timeout_s_per_page.saturating_mul(pages as u64));
            let elapsed = started.elapsed();
            if elapsed >= limit {
                break;
            }
            let remaining = limit - elapsed;
            tokio::time::sleep(remaining.min(Duration::from_secs(5))).await;
        }
    };

    let outcome = tokio::select! {
        result = processor.process(&ctx) => Some(result),
        _ = watchdog => None,
    };

    match outcome {
        Some(Ok(result)) => {
            queue.finish(&job.job_id, "completed", None);
            info!(job_id = %job.job_id, doc_id = %job.doc_id, chunks = result.chunks, "job completed");
        }
        Some(Err(AppError::Cancelled)) => {
            queue.finish(&job.job_id, "cancelled", Some("cancelled".to_string()));
            info!(job_id = %job.job_id, doc_id = %job.doc_id, "job cancelled");
        }
        Some(Err(e)) => {
            queue.finish(&job.job_id, "failed", Some(e.to_string()));
            error!(job_id = %job.job_id, doc_id = %job.doc_id, error = %e, "job failed");
            let _ = events.send(ServerEvent::Log {
                level: "error".to_string(),
                message: format!("job {} failed: {}", job.job_id, e),
                timestamp: now_iso(),
            });
        }
        None => {
            // Watchdog fired: cancel cooperatively and record the timeout.
            job.cancel.cancel();
            queue.finish(&job.job_id, "failed", Some("job timed out".to_string()));
            warn!(job_id = %job.job_id, doc_id = %job.doc_id, "job timed out");
        }
    }

    mirror.abort();
    queue.active.fetch_sub(1, Ordering::Relaxed);

    let stats = queue.stats();
    let _ = events.send(ServerEvent::Stats {
        active: stats.active,
        completed: stats.completed,
        failed: stats.failed,
        total: stats.total,
        timestamp: now_iso(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str) -> DocumentSource {
        DocumentSource {
            bucket: "uploads".to_string(),
            key: name.to_string(),
            filename: name.to_string(),
            size: 1024,
            content_tag: Some(format!("\"etag-{}\"", name)),
        }
    }

    #[test]
    fn enqueue_assigns_ids_and_records() {
        let queue = JobQueue::new(8);
        let outcome = queue.enqueue(source("a.pdf")).unwrap();
        let EnqueueOutcome::Enqueued { job_id, doc_id } = outcome else {
            panic!("expected fresh enqueue");
        };
        assert_eq!(doc_id, source("a.pdf").doc_id());
        let record = queue.record(&job_id).unwrap();
        assert_eq!(record.status, "queued");
        assert_eq!(record.filename, "a.pdf");
        assert_eq!(queue.stats().queued, 1);
    }

    #[test]
    fn same_name_different_content_is_not_collapsed() {
        let queue = JobQueue::new(8);
        let mut first = source("a.pdf");
        first.content_tag = Some("\"etag-one\"".to_string());
        let mut second = source("a.pdf");
        second.content_tag = Some("\"etag-two\"".to_string());

        assert!(matches!(
            queue.enqueue(first).unwrap(),
            EnqueueOutcome::Enqueued { .. }
        ));
        assert!(matches!(
            queue.enqueue(second).unwrap(),
            EnqueueOutcome::Enqueued { .. }
        ));
        assert_eq!(queue.stats().queued, 2);
    }

    #[test]
    fn in_flight_lookup_by_filename() {
        let queue = JobQueue::new(8);
        let EnqueueOutcome::Enqueued { job_id, .. } = queue.enqueue(source("a.pdf")).unwrap()
        else {
            panic!("expected fresh enqueue");
        };
        assert_eq!(
            queue.in_flight_by_filename("a.pdf").unwrap().job_id,
            job_id
        );
        assert!(queue.in_flight_by_filename("b.pdf").is_none());

        queue.cancel(&job_id).unwrap();
        assert!(queue.in_flight_by_filename("a.pdf").is_none());
    }

    #[test]
    fn duplicate_in_flight_collapses() {
        let queue = JobQueue::new(8);
        let EnqueueOutcome::Enqueued { job_id, .. } = queue.enqueue(source("a.pdf")).unwrap()
        else {
            panic!("expected fresh enqueue");
        };
        let EnqueueOutcome::Duplicate { job_id: dup_id, .. } =
            queue.enqueue(source("a.pdf")).unwrap()
        else {
            panic!("expected duplicate");
        };
        assert_eq!(job_id, dup_id);
        assert_eq!(queue.stats().queued, 1);
    }

    #[test]
    fn capacity_overflow_is_retryable() {
        let queue = JobQueue::new(2);
        queue.enqueue(source("a.pdf")).unwrap();
        queue.enqueue(source("b.pdf")).unwrap();
        let err = queue.enqueue(source("c.pdf")).unwrap_err();
        assert!(matches!(err, AppError::QueueFull));
    }

    #[test]
    fn fifo_order_preserved() {
        let queue = JobQueue::new(8);
        queue.enqueue(source("a.pdf")).unwrap();
        queue.enqueue(source("b.pdf")).unwrap();
        queue.enqueue(source("c.pdf")).unwrap();
        assert_eq!(queue.pop().unwrap().source.filename, "a.pdf");
        assert_eq!(queue.pop().unwrap().source.filename, "b.pdf");
        assert_eq!(queue.pop().unwrap().source.filename, "c.pdf");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn cancel_queued_job_removes_it() {
        let queue = JobQueue::new(8);
        let EnqueueOutcome::Enqueued { job_id, doc_id } = queue.enqueue(source("a.pdf")).unwrap()
        else {
            panic!("expected fresh enqueue");
        };
        queue.cancel(&job_id).unwrap();
        assert!(queue.pop().is_none());
        assert_eq!(queue.record(&job_id).unwrap().status, "cancelled");
        assert_eq!(queue.stats().cancelled, 1);
        // The doc can be re-enqueued afterwards.
        assert!(queue.in_flight_job(&doc_id).is_none());
        assert!(matches!(
            queue.enqueue(source("a.pdf")).unwrap(),
            EnqueueOutcome::Enqueued { .. }
        ));
    }

    #[test]
    fn cancel_unknown_job_is_not_found() {
        let queue = JobQueue::new(8);
        assert!(matches!(
            queue.cancel("nope"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn finish_updates_counters_and_in_flight() {
        let queue = JobQueue::new(8);
        let EnqueueOutcome::Enqueued { job_id, doc_id } = queue.enqueue(source("a.pdf")).unwrap()
        else {
            panic!("expected fresh enqueue");
        };
        queue.pop().unwrap();
        queue.finish(&job_id, "completed", None);
        assert_eq!(queue.stats().completed, 1);
        assert!(queue.in_flight_job(&doc_id).is_none());
        assert_eq!(queue.record(&job_id).unwrap().status, "completed");
    }
}
