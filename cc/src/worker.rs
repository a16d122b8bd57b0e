//! Background worker pool for card generation

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::card::{CardRequest, ContextCard};
use crate::embed::Embedder;
use crate::store::CardStore;
use crate::summarize::{estimate_tokens, extract_keywords, summarize};
use crate::{DEFAULT_BATCH_SIZE, DEFAULT_WORKERS};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Requests processed per batch
    pub batch_size: usize,
    /// Number of concurrent workers
    pub workers: usize,
    /// When false, queued requests are dropped silently
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            enabled: true,
        }
    }
}

/// Clone-able handle for queueing card requests.
///
/// Queueing never blocks the caller; requests ride an unbounded channel and
/// are consumed by the pool at its own pace.
#[derive(Clone)]
pub struct CardQueue {
    tx: mpsc::UnboundedSender<CardRequest>,
    enabled: bool,
}

impl CardQueue {
    pub fn queue(&self, request: CardRequest) {
        if !self.enabled {
            return;
        }
        debug!(session_id = %request.session_id, hash = %request.content_hash, "CardQueue::queue");
        // Send fails only after shutdown; dropping the request then is correct
        let _ = self.tx.send(request);
    }
}

/// Pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    pub cards_generated: usize,
    pub cards_failed: usize,
}

/// The background card-generation pool
pub struct CardWorkerPool {
    queue: CardQueue,
    handles: Vec<JoinHandle<()>>,
    generated: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl CardWorkerPool {
    /// Start the pool. Workers run until every [`CardQueue`] handle is
    /// dropped and the queue drains.
    pub fn start(config: WorkerConfig, store: Arc<CardStore>, embedder: Arc<dyn Embedder>) -> Self {
        debug!(workers = config.workers, batch_size = config.batch_size, "CardWorkerPool::start");
        let (tx, rx) = mpsc::unbounded_channel::<CardRequest>();
        let rx = Arc::new(Mutex::new(rx));
        let generated = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        if config.enabled {
            for worker_id in 0..config.workers.max(1) {
                let rx = rx.clone();
                let store = store.clone();
                let embedder = embedder.clone();
                let generated = generated.clone();
                let failed = failed.clone();
                let batch_size = config.batch_size.max(1);

                handles.push(tokio::spawn(async move {
                    debug!(worker_id, "card worker started");
                    loop {
                        let batch = {
                            let mut rx = rx.lock().await;
                            let first = match rx.recv().await {
                                Some(req) => req,
                                None => break,
                            };
                            let mut batch = vec![first];
                            while batch.len() < batch_size {
                                match rx.try_recv() {
                                    Ok(req) => batch.push(req),
                                    Err(_) => break,
                                }
                            }
                            batch
                        };

                        let count = batch.len();
                        match process_batch(batch, &store, embedder.as_ref()).await {
                            Ok(()) => {
                                generated.fetch_add(count, Ordering::Relaxed);
                            }
                            Err(e) => {
                                failed.fetch_add(count, Ordering::Relaxed);
                                warn!(worker_id, error = %e, "card batch failed");
                            }
                        }
                    }
                    debug!(worker_id, "card worker stopped");
                }));
            }
        }

        Self {
            queue: CardQueue {
                tx,
                enabled: config.enabled,
            },
            handles,
            generated,
            failed,
        }
    }

    /// Queue a single request
    pub fn queue(&self, request: CardRequest) {
        self.queue.queue(request);
    }

    /// A clone-able queue handle for producers
    pub fn handle(&self) -> CardQueue {
        self.queue.clone()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            cards_generated: self.generated.load(Ordering::Relaxed),
            cards_failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Drop the pool's sender and wait for workers to drain and exit.
    ///
    /// Other [`CardQueue`] handles keep the channel open; drop them first.
    pub async fn shutdown(self) {
        debug!("CardWorkerPool::shutdown");
        drop(self.queue);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn process_batch(
    batch: Vec<CardRequest>,
    store: &CardStore,
    embedder: &dyn Embedder,
) -> eyre::Result<()> {
    debug!(count = batch.len(), "process_batch: called");

    let summaries: Vec<String> = batch
        .iter()
        .map(|req| summarize(&req.content, &req.role))
        .collect();

    // Embed only the non-empty summaries, one provider call per batch
    let to_embed: Vec<(usize, String)> = summaries
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_empty())
        .map(|(i, s)| (i, s.clone()))
        .collect();

    let mut embeddings: Vec<Option<Vec<f32>>> = vec![None; batch.len()];
    if !to_embed.is_empty() {
        let texts: Vec<String> = to_embed.iter().map(|(_, s)| s.clone()).collect();
        let vectors = embedder.embed(&texts).await?;
        for ((idx, _), vector) in to_embed.into_iter().zip(vectors) {
            embeddings[idx] = Some(vector);
        }
    }

    let cards: Vec<ContextCard> = batch
        .into_iter()
        .zip(summaries)
        .zip(embeddings)
        .map(|((req, summary), embedding)| ContextCard {
            keywords: extract_keywords(&summary),
            estimated_tokens: estimate_tokens(&req.content),
            session_id: req.session_id,
            content_hash: req.content_hash,
            role: req.role,
            summary,
            embedding,
            phase_name: req.phase_name,
            cascade_id: req.cascade_id,
            turn_number: req.turn_number,
            is_callout: req.is_callout,
            callout_name: req.callout_name,
            created_at: req.timestamp,
        })
        .collect();

    store.insert_cards(&cards)?;
    Ok(())
}
