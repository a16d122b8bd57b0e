//! Runtime assembly - wires the engines, stores and background workers
//!
//! One `Runtime` owns the event bus, the log sink and its worker, the
//! card-generation pool, the cost enricher and the cascade runner. The two
//! process-wide registries (sessions, tools) are initialised here and torn
//! down in `shutdown`.

use std::sync::Arc;

use cardstore::{CardStore, CardWorkerPool, WorkerConfig};
use logstore::LogStore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::cost::{GenerationEndpointFetcher, spawn_cost_enricher};
use crate::echo::{init_sessions, shutdown_sessions};
use crate::events::{EventBus, create_event_bus};
use crate::llm::{ModelClient, ModelEmbedder, create_client};
use crate::logsink::{LogSink, spawn_sink};
use crate::runner::CascadeRunner;
use crate::tools::{ToolDispatcher, init_tools, shutdown_tools};

pub struct Runtime {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub sink: LogSink,
    pub store: Arc<LogStore>,
    pub runner: CascadeRunner,
    card_pool: Option<CardWorkerPool>,
    sink_task: JoinHandle<()>,
    cost_task: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Full production assembly: real model client, file-backed stores.
    pub fn initialize(config: Config) -> eyre::Result<Self> {
        let client = create_client(&config)?;
        let store = Arc::new(LogStore::open(&config.storage.log_db)?);
        let card_store = if config.cards.enabled {
            Some(Arc::new(CardStore::open(&config.storage.card_db)?))
        } else {
            None
        };
        Self::assemble(config, client, store, card_store)
    }

    /// Assembly with explicit parts - used by tests and embedders that
    /// bring their own client or stores.
    pub fn assemble(
        config: Config,
        client: Arc<dyn ModelClient>,
        store: Arc<LogStore>,
        card_store: Option<Arc<CardStore>>,
    ) -> eyre::Result<Self> {
        debug!("Runtime::assemble");
        init_sessions();
        let registry = init_tools(&config.tools);

        let config = Arc::new(config);
        let bus = create_event_bus();

        let card_pool = card_store.map(|card_store| {
            let embedder = Arc::new(ModelEmbedder::new(
                client.clone(),
                Some(config.provider.embed_model.clone()),
            ));
            CardWorkerPool::start(
                WorkerConfig {
                    batch_size: config.cards.batch_size,
                    workers: config.cards.workers,
                    enabled: config.cards.enabled,
                },
                card_store,
                embedder,
            )
        });

        let (cost_tx, cost_task) = if config.cost.enabled {
            match config.provider.api_key() {
                Ok(api_key) => {
                    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                    let fetcher = Arc::new(GenerationEndpointFetcher::new(
                        config.provider.base_url.clone(),
                        api_key,
                    ));
                    let task = spawn_cost_enricher(&config.cost, store.clone(), fetcher, rx);
                    (Some(tx), Some(task))
                }
                Err(e) => {
                    warn!(error = %e, "cost enrichment disabled: no API key");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let (sink, sink_task) = spawn_sink(
            &config.sink,
            store.clone(),
            bus.clone(),
            card_pool.as_ref().map(|pool| pool.handle()),
            cost_tx,
        );

        let dispatcher = Arc::new(ToolDispatcher::new(registry));
        let runner = CascadeRunner::new(
            config.clone(),
            client,
            dispatcher,
            bus.clone(),
            Some(sink.clone()),
        );

        Ok(Self {
            config,
            bus,
            sink,
            store,
            runner,
            card_pool,
            sink_task,
            cost_task,
        })
    }

    /// Tear down background workers and the global registries. Drains the
    /// sink queue first so every logged record is persisted.
    ///
    /// The runner and its dispatcher reference each other (cascade-as-tool
    /// dispatch loops back into the runner), so the sink channel never
    /// closes on its own; the worker is drained and then stopped.
    pub async fn shutdown(self) {
        debug!("Runtime::shutdown");
        let Runtime {
            config: _,
            bus: _,
            sink,
            store: _,
            runner,
            card_pool,
            sink_task,
            cost_task,
        } = self;

        shutdown_sessions();
        drop(runner);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while sink.depth() > 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        drop(sink);
        sink_task.abort();
        let _ = sink_task.await;

        if let Some(pool) = card_pool {
            pool.shutdown().await;
        }
        if let Some(task) = cost_task {
            let _ = task.await;
        }
        shutdown_tools();
    }
}
