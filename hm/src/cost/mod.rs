//! Cost Enricher - reconciles provider usage data into logged requests
//!
//! Providers report generation cost a few seconds after the completion
//! returns, so the model client logs `cost = None` and this worker fills it
//! in later by `request_id`. Readers of the log store must tolerate both the
//! pre- and post-enrichment shape of a record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use logstore::{CostUpdate, LogStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CostConfig;

/// A request awaiting usage reconciliation
#[derive(Debug, Clone)]
pub struct CostTask {
    pub request_id: String,
}

impl CostTask {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }
}

/// Fetches server-side usage data for a request id.
///
/// Returns `Ok(None)` when the provider has no data yet (poll again later).
#[async_trait]
pub trait UsageFetcher: Send + Sync {
    async fn fetch_usage(&self, request_id: &str) -> eyre::Result<Option<CostUpdate>>;
}

/// Usage fetcher for OpenRouter-style `/generation?id=` endpoints
pub struct GenerationEndpointFetcher {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GenerationEndpointFetcher {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl UsageFetcher for GenerationEndpointFetcher {
    async fn fetch_usage(&self, request_id: &str) -> eyre::Result<Option<CostUpdate>> {
        let url = format!("{}/generation?id={}", self.base_url.trim_end_matches('/'), request_id);
        debug!(%url, "GenerationEndpointFetcher::fetch_usage");

        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            // Generation not indexed yet
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(eyre::eyre!("usage endpoint returned {}", response.status()));
        }

        let body: serde_json::Value = response.json().await?;
        let data = &body["data"];
        if data.is_null() {
            return Ok(None);
        }

        Ok(Some(CostUpdate {
            cost: data["total_cost"].as_f64(),
            tokens_in: data["tokens_prompt"].as_i64(),
            tokens_out: data["tokens_completion"].as_i64(),
            tokens_reasoning: data["native_tokens_reasoning"].as_i64(),
            // Server-side generation time beats client-measured latency
            duration_ms: data["generation_time"].as_i64(),
        }))
    }
}

/// Spawn the enrichment worker.
///
/// Each task gets its own retry loop: an initial delay (providers need a few
/// seconds to index usage), then exponential backoff up to the configured
/// attempt cap.
pub fn spawn_cost_enricher(
    config: &CostConfig,
    store: Arc<LogStore>,
    fetcher: Arc<dyn UsageFetcher>,
    mut rx: mpsc::UnboundedReceiver<CostTask>,
) -> JoinHandle<()> {
    let initial_delay = Duration::from_millis(config.initial_delay_ms);
    let max_attempts = config.max_attempts.max(1);
    debug!(?initial_delay, max_attempts, "spawn_cost_enricher: starting");

    tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            let store = store.clone();
            let fetcher = fetcher.clone();
            tokio::spawn(async move {
                enrich_one(task, store, fetcher, initial_delay, max_attempts).await;
            });
        }
        debug!("cost enricher: channel closed, exiting");
    })
}

async fn enrich_one(
    task: CostTask,
    store: Arc<LogStore>,
    fetcher: Arc<dyn UsageFetcher>,
    initial_delay: Duration,
    max_attempts: u32,
) {
    for attempt in 0..max_attempts {
        // Exponential backoff with jitter so bursts of requests don't poll
        // the usage endpoint in lockstep
        let jitter = Duration::from_millis(rand::random::<u64>() % 250);
        let delay = initial_delay * 2u32.pow(attempt.min(6)) + jitter;
        tokio::time::sleep(delay).await;

        match fetcher.fetch_usage(&task.request_id).await {
            Ok(Some(update)) => {
                debug!(request_id = %task.request_id, cost = ?update.cost, "enrich_one: reconciling");
                if let Err(e) = store.reconcile_by_request_id(&task.request_id, &update) {
                    warn!(request_id = %task.request_id, error = %e, "enrich_one: reconcile failed");
                }
                return;
            }
            Ok(None) => {
                debug!(request_id = %task.request_id, attempt, "enrich_one: no usage data yet");
            }
            Err(e) => {
                debug!(request_id = %task.request_id, attempt, error = %e, "enrich_one: fetch failed");
            }
        }
    }
    warn!(request_id = %task.request_id, max_attempts, "enrich_one: giving up");
}

#[cfg(test)]
mod tests {
    use super::*;
    use logstore::{LogRecord, NodeType};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fetcher that reports no data for the first N calls
    struct SlowFetcher {
        calls: AtomicU32,
        ready_after: u32,
    }

    #[async_trait]
    impl UsageFetcher for SlowFetcher {
        async fn fetch_usage(&self, _request_id: &str) -> eyre::Result<Option<CostUpdate>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.ready_after {
                return Ok(None);
            }
            Ok(Some(CostUpdate {
                cost: Some(0.05),
                tokens_out: Some(123),
                ..Default::default()
            }))
        }
    }

    #[tokio::test]
    async fn test_enrichment_backfills_cost() {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        store
            .append(&LogRecord {
                request_id: Some("req-9".into()),
                ..LogRecord::new("s", NodeType::Agent)
            })
            .unwrap();

        let config = CostConfig {
            enabled: true,
            initial_delay_ms: 1,
            max_attempts: 5,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let fetcher = Arc::new(SlowFetcher {
            calls: AtomicU32::new(0),
            ready_after: 2,
        });
        let handle = spawn_cost_enricher(&config, store.clone(), fetcher, rx);

        tx.send(CostTask::new("req-9")).unwrap();
        drop(tx);
        handle.await.unwrap();
        // Wait for the per-task worker to finish its retries
        tokio::time::sleep(Duration::from_millis(100)).await;

        let records = store.session_records("s").unwrap();
        assert_eq!(records[0].cost, Some(0.05));
        assert_eq!(records[0].tokens_out, Some(123));
    }

    #[tokio::test]
    async fn test_enrichment_gives_up_after_max_attempts() {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        store
            .append(&LogRecord {
                request_id: Some("req-never".into()),
                ..LogRecord::new("s", NodeType::Agent)
            })
            .unwrap();

        let config = CostConfig {
            enabled: true,
            initial_delay_ms: 1,
            max_attempts: 2,
        };
        let fetcher = Arc::new(SlowFetcher {
            calls: AtomicU32::new(0),
            ready_after: 100,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_cost_enricher(&config, store.clone(), fetcher.clone(), rx);

        tx.send(CostTask::new("req-never")).unwrap();
        drop(tx);
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Cost stays unset; attempts bounded
        let records = store.session_records("s").unwrap();
        assert_eq!(records[0].cost, None);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
