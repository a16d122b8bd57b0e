//! Event system for real-time observability
//!
//! Components publish typed events to a broadcast bus; consumers (SSE
//! broadcasters, the narrator, test harnesses) subscribe independently.

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, create_event_bus, preview};
pub use types::{Event, EventEnvelope};
