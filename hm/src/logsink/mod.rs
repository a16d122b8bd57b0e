//! Log Sink - single entry point for unified log records
//!
//! `log(record)` is non-blocking for producers: records ride a channel to a
//! background writer which persists them and fans them out:
//!
//! ```text
//! LogSink::log(record)
//!     │  (channel; producers back off above the high-water mark)
//!     ▼
//! sink worker
//!     ├── LogStore::append            (storage failure -> stderr only)
//!     ├── EventBus                    (sounding_attempt / sounding_error / evaluator)
//!     ├── CardQueue                   (eligible records only)
//!     └── cost queue                  (request_id present, cost unknown, paid provider)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cardstore::{CardQueue, CardRequest, card_eligible};
use logstore::{LogRecord, LogStore, NodeType};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SinkConfig;
use crate::cost::CostTask;
use crate::events::{Event, EventBus, preview};
use crate::llm::provider::is_free_provider;

/// How long a producer will back off waiting for the queue to drain
const BACKPRESSURE_PATIENCE: Duration = Duration::from_secs(2);

/// Clone-able producer handle.
///
/// `log` appends to the sink queue and returns. Only when the queue depth
/// exceeds the configured high-water mark does the producer briefly back off;
/// this is one of the runtime's declared suspension points.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogRecord>,
    depth: Arc<AtomicUsize>,
    high_water: usize,
}

impl LogSink {
    pub fn log(&self, record: LogRecord) {
        if self.depth.load(Ordering::Relaxed) >= self.high_water {
            debug!("LogSink::log: above high-water mark, backing off");
            let start = std::time::Instant::now();
            while self.depth.load(Ordering::Relaxed) >= self.high_water
                && start.elapsed() < BACKPRESSURE_PATIENCE
            {
                std::thread::sleep(Duration::from_micros(500));
            }
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        // Send fails only after shutdown; the record is dropped then
        if self.tx.send(record).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Current queue depth (records accepted but not yet written)
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Spawn the sink worker. Returns the producer handle and the worker task;
/// the worker exits when every handle is dropped and the queue drains.
pub fn spawn_sink(
    config: &SinkConfig,
    store: Arc<LogStore>,
    bus: Arc<EventBus>,
    cards: Option<CardQueue>,
    cost_tx: Option<mpsc::UnboundedSender<CostTask>>,
) -> (LogSink, JoinHandle<()>) {
    debug!(high_water = config.high_water, "spawn_sink: starting sink worker");
    let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
    let depth = Arc::new(AtomicUsize::new(0));

    let sink = LogSink {
        tx,
        depth: depth.clone(),
        high_water: config.high_water,
    };

    let handle = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            depth.fetch_sub(1, Ordering::Relaxed);

            // Storage failures never surface to producers
            if let Err(e) = store.append(&record) {
                eprintln!("[logsink] failed to persist record {}: {}", record.trace_id, e);
            }

            if let Some(event) = record_event(&record) {
                bus.publish(event);
            }

            if let Some(cards) = &cards {
                enqueue_card(cards, &record);
            }

            if let Some(cost_tx) = &cost_tx {
                enqueue_cost(cost_tx, &record);
            }
        }
        debug!("sink worker: channel closed, exiting");
    });

    (sink, handle)
}

/// Map a record onto the real-time event stream. Only sounding and evaluator
/// records flow through here; lifecycle events are published directly by the
/// runner.
fn record_event(record: &LogRecord) -> Option<Event> {
    match record.node_type {
        NodeType::SoundingAttempt => Some(Event::SoundingAttempt {
            session_id: record.session_id.clone(),
            phase_name: record.phase_name.clone(),
            sounding_index: record.sounding_index?,
            is_winner: record.is_winner,
            reforge_step: record.reforge_step,
            content_preview: match &record.content {
                Some(c) if !c.is_null() => Some(preview(&record.content_text(), 500)),
                _ => None,
            },
            model: record.model.clone(),
        }),
        NodeType::SoundingError => Some(Event::SoundingError {
            session_id: record.session_id.clone(),
            phase_name: record.phase_name.clone(),
            sounding_index: record.sounding_index.unwrap_or(-1),
            error: preview(&record.content_text(), 500),
        }),
        NodeType::Evaluator => Some(Event::Evaluator {
            session_id: record.session_id.clone(),
            phase_name: record.phase_name.clone(),
            reforge_step: record.reforge_step,
            content_preview: Some(preview(&record.content_text(), 1000)),
            model: record.model.clone(),
        }),
        _ => None,
    }
}

fn enqueue_card(cards: &CardQueue, record: &LogRecord) {
    let role = record.role.as_deref();
    if !card_eligible(record.node_type.as_str(), role) {
        return;
    }
    let content = match &record.content {
        Some(c) if !c.is_null() => c.clone(),
        _ => return,
    };

    let mut request = CardRequest::new(
        record.session_id.clone(),
        content_hash(role.unwrap_or(""), &content),
        role.unwrap_or("").to_string(),
        content,
    );
    request.phase_name = record.phase_name.clone();
    request.cascade_id = record.cascade_id.clone();
    request.turn_number = record.turn_number;
    request.is_callout = record.is_callout.unwrap_or(false);
    request.callout_name = record.callout_name.clone();
    request.timestamp = record.timestamp;
    cards.queue(request);
}

fn enqueue_cost(cost_tx: &mpsc::UnboundedSender<CostTask>, record: &LogRecord) {
    let request_id = match &record.request_id {
        Some(id) if record.cost.is_none() => id.clone(),
        _ => return,
    };
    if record.provider.as_deref().map(is_free_provider).unwrap_or(false) {
        return;
    }
    let _ = cost_tx.send(CostTask::new(request_id));
}

/// Stable content hash joining log records with context cards
pub fn content_hash(role: &str, content: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(role.as_bytes());
    hasher.update(b"\x00");
    hasher.update(content.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink_with_store() -> (LogSink, JoinHandle<()>, Arc<LogStore>, Arc<EventBus>) {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(100));
        let (sink, handle) = spawn_sink(&SinkConfig::default(), store.clone(), bus.clone(), None, None);
        (sink, handle, store, bus)
    }

    #[tokio::test]
    async fn test_log_persists_to_store() {
        let (sink, handle, store, _bus) = sink_with_store();
        sink.log(LogRecord {
            content: Some(json!("hello")),
            ..LogRecord::new("s1", NodeType::Turn)
        });
        drop(sink);
        handle.await.unwrap();

        let records = store.session_records("s1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_text(), "hello");
    }

    #[tokio::test]
    async fn test_sounding_records_reach_event_bus() {
        let (sink, handle, _store, bus) = sink_with_store();
        let mut rx = bus.subscribe();

        sink.log(LogRecord {
            sounding_index: Some(1),
            is_winner: Some(false),
            content: Some(json!("attempt output")),
            ..LogRecord::new("s1", NodeType::SoundingAttempt)
        });
        drop(sink);
        handle.await.unwrap();

        let event = rx.recv().await.unwrap();
        match event {
            Event::SoundingAttempt { sounding_index, is_winner, .. } => {
                assert_eq!(sounding_index, 1);
                assert_eq!(is_winner, Some(false));
            }
            other => panic!("Expected SoundingAttempt, got {:?}", other.event_type()),
        }
    }

    #[tokio::test]
    async fn test_plain_records_do_not_emit_events() {
        let (sink, handle, _store, bus) = sink_with_store();
        let mut rx = bus.subscribe();

        sink.log(LogRecord::new("s1", NodeType::Turn));
        drop(sink);
        handle.await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_eligible_records_queue_cards() {
        let card_store = Arc::new(cardstore::CardStore::open_in_memory().unwrap());
        let pool = cardstore::CardWorkerPool::start(
            cardstore::WorkerConfig::default(),
            card_store.clone(),
            Arc::new(cardstore::HashEmbedder::default()),
        );
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(100));
        let (sink, handle) = spawn_sink(&SinkConfig::default(), store, bus, Some(pool.handle()), None);

        // Eligible: agent message with content
        sink.log(LogRecord {
            role: Some("assistant".into()),
            content: Some(json!("substantive reply")),
            ..LogRecord::new("s1", NodeType::Agent)
        });
        // Not eligible: structural phase entry
        sink.log(LogRecord {
            role: Some("assistant".into()),
            content: Some(json!("phase start")),
            ..LogRecord::new("s1", NodeType::Phase)
        });
        drop(sink);
        handle.await.unwrap();
        pool.shutdown().await;

        let cards = card_store.cards_for_session("s1").unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].summary, "substantive reply");
    }

    #[tokio::test]
    async fn test_cost_queue_receives_unpriced_requests() {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(100));
        let (cost_tx, mut cost_rx) = mpsc::unbounded_channel();
        let (sink, handle) = spawn_sink(&SinkConfig::default(), store, bus, None, Some(cost_tx));

        // Needs enrichment: request_id, no cost, paid provider
        sink.log(LogRecord {
            request_id: Some("req-1".into()),
            provider: Some("openrouter".into()),
            ..LogRecord::new("s1", NodeType::Agent)
        });
        // Free provider: skipped
        sink.log(LogRecord {
            request_id: Some("req-2".into()),
            provider: Some("ollama".into()),
            ..LogRecord::new("s1", NodeType::Agent)
        });
        // Already priced: skipped
        sink.log(LogRecord {
            request_id: Some("req-3".into()),
            provider: Some("openrouter".into()),
            cost: Some(0.01),
            ..LogRecord::new("s1", NodeType::Agent)
        });
        drop(sink);
        handle.await.unwrap();

        let task = cost_rx.recv().await.unwrap();
        assert_eq!(task.request_id, "req-1");
        assert!(cost_rx.try_recv().is_err());
    }

    #[test]
    fn test_content_hash_stable_and_distinct() {
        let a = content_hash("user", &json!("hello"));
        let b = content_hash("user", &json!("hello"));
        let c = content_hash("assistant", &json!("hello"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
