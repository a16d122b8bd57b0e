//! LogStore - unified structured log store
//!
//! Every observable event in a cascade run (phases, turns, tool calls,
//! sounding attempts, ward results, model requests) becomes one
//! [`LogRecord`]. Records are append-only with one exception: a record
//! carrying a provider `request_id` may later be reconciled in place when
//! usage data (cost, server-side token counts) becomes available.
//!
//! # Architecture
//!
//! ```text
//! LogStore (SQLite)
//! └── unified_logs          # one row per record, JSON payload columns
//!     ├── append(record)
//!     ├── reconcile_by_request_id(id, update)
//!     └── query_where(sql)  # SQL-style WHERE filtering
//! ```
//!
//! Readers must tolerate both the pre- and post-reconcile shape of any
//! record that carries a `request_id`.

pub mod cli;
mod record;
mod store;

pub use record::{CostUpdate, LogRecord, NodeType};
pub use store::{LogStore, StoreError};
