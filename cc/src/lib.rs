//! CardStore - context-card generation for intelligent context selection
//!
//! A context card is a compressed view of one message: a short summary,
//! extracted keywords, a token estimate and an embedding vector. Cards are
//! generated asynchronously by background workers so the producing runtime
//! never blocks, and are stored keyed by `(session_id, content_hash)` so they
//! can be joined back to the unified log for original-content retrieval.
//!
//! # Architecture
//!
//! ```text
//! CardQueue (clone-able sender)
//!     │ queue(CardRequest)
//!     ▼
//! CardWorkerPool (N tokio workers, batched)
//!     ├── summarize (heuristics only - no model on the fast path)
//!     ├── keywords  (regex, stopword-filtered, capped)
//!     └── embed     (Embedder trait, batched)
//!     ▼
//! CardStore (SQLite, context_cards table)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use cardstore::{CardRequest, CardStore, CardWorkerPool, HashEmbedder, WorkerConfig};
//! use std::sync::Arc;
//!
//! let store = Arc::new(CardStore::open(".cards.db")?);
//! let pool = CardWorkerPool::start(WorkerConfig::default(), store.clone(), Arc::new(HashEmbedder::default()));
//! pool.queue(CardRequest::new("sess-1", "hash-1", "assistant", serde_json::json!("hello world")));
//! ```

pub mod cli;
mod card;
mod embed;
mod store;
mod summarize;
mod worker;

pub use card::{CardRequest, ContextCard, card_eligible};
pub use embed::{Embedder, HashEmbedder, cosine_similarity};
pub use store::{CardStore, CardStoreError};
pub use summarize::{estimate_tokens, extract_keywords, summarize};
pub use worker::{CardQueue, CardWorkerPool, WorkerConfig};

/// Default number of requests processed per batch
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default number of background workers
pub const DEFAULT_WORKERS: usize = 2;
