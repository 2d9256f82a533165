//! Outbox Worker
//!
//! Drains the embedding outbox: claims pending jobs FIFO, embeds their
//! content, hydrates event metadata, and upserts vector records. The
//! worker is the only writer to the vector store; everything else that
//! wants a vector indexed goes through the outbox.
//!
//! Each batch is an at-least-once unit. Jobs whose event has been pruned
//! are completed (skipped); any failure sends the remaining jobs through
//! `fail_jobs`, which requeues them until `max_retries` and then parks
//! them as terminally `failed`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::WorkerConfig;
use crate::embeddings::Embedder;
use crate::events::OutboxJob;
use crate::search::{VectorRecord, VectorStore, record_id};
use crate::storage::EventStore;

/// Version folded into derived vector record ids; bump when the embedding
/// model changes so stale records are replaced rather than mixed
pub const EMBEDDING_VERSION: u32 = 1;

/// Preview length stored on vector records
const PREVIEW_LENGTH: usize = 200;

/// What one batch accomplished
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub claimed: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// The background embedding worker
pub struct OutboxWorker {
    store: Arc<EventStore>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<Mutex<VectorStore>>,
    config: WorkerConfig,
    running: AtomicBool,
    wake: Notify,
}

impl OutboxWorker {
    /// Create a worker. Jobs stranded in `processing` by a previous crash
    /// are reset to `pending` here, before any claiming starts.
    pub fn new(
        store: Arc<EventStore>,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<Mutex<VectorStore>>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        if let Err(e) = store.reconcile_processing() {
            tracing::warn!("Outbox reconciliation failed: {}", e);
        }
        Arc::new(Self {
            store,
            embedder,
            vectors,
            config,
            running: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    /// Whether the background loop is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the background loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!("Outbox worker started");
            while worker.running.load(Ordering::SeqCst) {
                let stats = worker.process_batch();
                if stats.claimed == 0 {
                    let sleep = tokio::time::sleep(Duration::from_millis(
                        worker.config.poll_interval_ms,
                    ));
                    tokio::select! {
                        _ = sleep => {}
                        _ = worker.wake.notified() => {}
                    }
                }
            }
            tracing::debug!("Outbox worker stopped");
        });
    }

    /// Request the loop to stop; cancels any in-progress sleep
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Claim and process one batch
    pub fn process_batch(&self) -> BatchStats {
        let jobs = match self.store.claim_pending(self.config.batch_size) {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!("Outbox claim failed: {}", e);
                return BatchStats::default();
            }
        };
        if jobs.is_empty() {
            return BatchStats::default();
        }

        let mut stats = BatchStats {
            claimed: jobs.len(),
            ..Default::default()
        };

        let contents: Vec<&str> = jobs.iter().map(|j| j.content.as_str()).collect();
        let vectors = match self.embedder.embed_batch(&contents) {
            Ok(vectors) => vectors,
            Err(e) => {
                tracing::warn!("Embedding batch of {} failed: {}", jobs.len(), e);
                self.fail_all(&jobs, &e.to_string());
                stats.failed = jobs.len();
                return stats;
            }
        };

        // Hydrate each job with its event; a missing event means the row
        // was pruned after enqueue, so the job is done
        let mut records = Vec::with_capacity(jobs.len());
        let mut record_jobs = Vec::with_capacity(jobs.len());
        let mut skipped_ids = Vec::new();
        for (job, vector) in jobs.iter().zip(vectors) {
            match self.store.get_event(&job.event_id) {
                Ok(Some(event)) => {
                    records.push(VectorRecord {
                        id: record_id("event", &event.id, EMBEDDING_VERSION),
                        event_id: event.id,
                        session_id: event.session_id,
                        event_type: event.event_type,
                        content_preview: preview(&job.content),
                        vector,
                        timestamp: event.timestamp,
                        metadata: event.metadata,
                    });
                    record_jobs.push(job.id);
                }
                Ok(None) => {
                    tracing::debug!("Outbox job {} has no event; skipping", job.id);
                    skipped_ids.push(job.id);
                }
                Err(e) => {
                    tracing::warn!("Hydrating event {} failed: {}", job.event_id, e);
                    if let Err(e) = self.store.fail_jobs(&[job.id], &e.to_string()) {
                        tracing::warn!("fail_jobs failed: {}", e);
                    }
                    stats.failed += 1;
                }
            }
        }

        if !records.is_empty() {
            let upsert = {
                let mut vectors = match self.vectors.lock() {
                    Ok(guard) => guard,
                    Err(_) => {
                        self.fail_all(&jobs, "Vector store lock poisoned");
                        stats.failed += record_jobs.len();
                        return stats;
                    }
                };
                vectors.upsert_batch(records)
            };
            match upsert {
                Ok(()) => {
                    if let Err(e) = self.store.complete_jobs(&record_jobs) {
                        tracing::warn!("complete_jobs failed: {}", e);
                    } else {
                        stats.completed = record_jobs.len();
                    }
                }
                Err(e) => {
                    tracing::warn!("Vector upsert failed: {}", e);
                    if let Err(e2) = self.store.fail_jobs(&record_jobs, &e.to_string()) {
                        tracing::warn!("fail_jobs failed: {}", e2);
                    }
                    stats.failed += record_jobs.len();
                }
            }
        }

        if !skipped_ids.is_empty() {
            if let Err(e) = self.store.complete_jobs(&skipped_ids) {
                tracing::warn!("complete_jobs (skipped) failed: {}", e);
            } else {
                stats.skipped = skipped_ids.len();
            }
        }

        stats
    }

    /// Drain the outbox synchronously. Stops when the queue is empty or a
    /// batch makes no forward progress (embedder down), so a dead embedder
    /// cannot spin this into a hot loop.
    pub fn process_all(&self) -> BatchStats {
        let mut total = BatchStats::default();
        loop {
            let stats = self.process_batch();
            total.claimed += stats.claimed;
            total.completed += stats.completed;
            total.skipped += stats.skipped;
            total.failed += stats.failed;
            if stats.claimed == 0 {
                break;
            }
            if stats.completed == 0 && stats.skipped == 0 {
                break;
            }
        }
        total
    }

    fn fail_all(&self, jobs: &[OutboxJob], reason: &str) {
        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
        if let Err(e) = self.store.fail_jobs(&ids, reason) {
            tracing::warn!("fail_jobs failed: {}", e);
        }
    }
}

fn preview(content: &str) -> String {
    if content.len() <= PREVIEW_LENGTH {
        return content.to_string();
    }
    let mut end = PREVIEW_LENGTH;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    content[..end].to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingError, HashingEmbedder};
    use crate::events::{AppendInput, EventType};
    use tempfile::TempDir;

    const DIMS: usize = 64;

    struct OfflineEmbedder;

    impl Embedder for OfflineEmbedder {
        fn dimensions(&self) -> usize {
            DIMS
        }
        fn embed(&self, _text: &str) -> crate::embeddings::Result<Vec<f32>> {
            Err(EmbeddingError::Unavailable("model offline".to_string()))
        }
    }

    fn setup(embedder: Arc<dyn Embedder>) -> (Arc<OutboxWorker>, Arc<EventStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EventStore::open(&dir.path().join("events.db"), 3).unwrap());
        let vectors = Arc::new(Mutex::new(
            VectorStore::open(&dir.path().join("vectors"), DIMS).unwrap(),
        ));
        let worker = OutboxWorker::new(
            Arc::clone(&store),
            embedder,
            vectors,
            WorkerConfig::default(),
        );
        (worker, store, dir)
    }

    fn append_and_enqueue(store: &EventStore, content: &str) -> String {
        let result = store
            .append(AppendInput::new(EventType::UserPrompt, "s1", content))
            .unwrap();
        store.enqueue_for_embedding(&result.event_id, content).unwrap();
        result.event_id
    }

    #[test]
    fn test_drain_indexes_events() {
        let (worker, store, _dir) = setup(Arc::new(HashingEmbedder::new(DIMS)));
        let a = append_and_enqueue(&store, "rate limiting in express");
        let b = append_and_enqueue(&store, "passport authentication");

        let stats = worker.process_all();
        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.completed, 2);

        let vectors = worker.vectors.lock().unwrap();
        assert!(vectors.exists(&a));
        assert!(vectors.exists(&b));
        assert_eq!(vectors.count(), 2);

        let (pending, processing, failed) = store.outbox_counts().unwrap();
        assert_eq!((pending, processing, failed), (0, 0, 0));
    }

    #[test]
    fn test_reprocessing_is_idempotent() {
        let (worker, store, _dir) = setup(Arc::new(HashingEmbedder::new(DIMS)));
        let a = append_and_enqueue(&store, "some content");
        worker.process_all();

        // Re-enqueue the same event: the derived record id replaces in place
        store.enqueue_for_embedding(&a, "some content").unwrap();
        worker.process_all();

        let vectors = worker.vectors.lock().unwrap();
        assert_eq!(vectors.count(), 1);
    }

    #[test]
    fn test_orphan_job_is_skipped() {
        let (worker, store, _dir) = setup(Arc::new(HashingEmbedder::new(DIMS)));
        store.enqueue_for_embedding("no-such-event", "ghost").unwrap();

        let stats = worker.process_all();
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.completed, 0);

        let (pending, _, failed) = store.outbox_counts().unwrap();
        assert_eq!((pending, failed), (0, 0));
    }

    #[test]
    fn test_offline_embedder_retries_then_fails() {
        let (worker, store, _dir) = setup(Arc::new(OfflineEmbedder));
        append_and_enqueue(&store, "doomed");

        // Each drain requeues once then stops on zero progress; after
        // max_retries + 1 drains the job is terminally failed
        for _ in 0..4 {
            worker.process_all();
        }

        let (pending, processing, failed) = store.outbox_counts().unwrap();
        assert_eq!((pending, processing, failed), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (worker, store, _dir) = setup(Arc::new(HashingEmbedder::new(DIMS)));
        let a = append_and_enqueue(&store, "background content");

        assert!(!worker.is_running());
        worker.start();
        assert!(worker.is_running());

        // The loop picks the job up without an explicit drain
        for _ in 0..50 {
            if worker.vectors.lock().unwrap().exists(&a) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(worker.vectors.lock().unwrap().exists(&a));

        worker.stop();
        assert!(!worker.is_running());
    }
}
