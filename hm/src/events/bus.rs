//! Event Bus - central pub/sub for cascade activity
//!
//! The EventBus uses tokio broadcast channels to deliver events to all
//! subscribers with minimal latency. The runtime emits events; consumers
//! (SSE broadcasters, the narrator, log followers) subscribe. Each
//! subscriber holds its own bounded queue; a subscriber that falls behind
//! loses the oldest events rather than stalling producers.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::Event;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Central event bus for cascade activity streaming
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given per-subscriber capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Publish an event to all subscribers.
    ///
    /// Fire-and-forget: with no subscribers the event is dropped; a full
    /// subscriber queue sheds its oldest events.
    pub fn publish(&self, event: Event) {
        debug!(
            event_type = event.event_type(),
            session_id = event.session_id(),
            "EventBus::publish"
        );
        // Ignore send errors (no subscribers is OK)
        let _ = self.tx.send(event);
    }

    /// Subscribe to receive events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Create an emitter handle bound to a session
    pub fn emitter_for(&self, session_id: impl Into<String>) -> EventEmitter {
        let session_id = session_id.into();
        debug!(%session_id, "EventBus::emitter_for: creating emitter");
        EventEmitter {
            tx: self.tx.clone(),
            session_id,
        }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Handle for components to publish events without owning the bus.
///
/// Cheap to clone; carries a pre-set session id for the convenience methods.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<Event>,
    session_id: String,
}

impl EventEmitter {
    /// The session this emitter is bound to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Publish a raw event
    pub fn publish(&self, event: Event) {
        debug!(event_type = event.event_type(), "EventEmitter::publish");
        let _ = self.tx.send(event);
    }

    // === Convenience methods ===

    pub fn cascade_start(&self, cascade_id: &str, depth: u32, parent_session_id: Option<&str>) {
        self.publish(Event::CascadeStart {
            session_id: self.session_id.clone(),
            cascade_id: cascade_id.to_string(),
            depth,
            parent_session_id: parent_session_id.map(|s| s.to_string()),
        });
    }

    pub fn cascade_complete(&self, cascade_id: &str, status: &str) {
        self.publish(Event::CascadeComplete {
            session_id: self.session_id.clone(),
            cascade_id: cascade_id.to_string(),
            status: status.to_string(),
        });
    }

    pub fn cascade_error(&self, cascade_id: &str, error: &str, error_type: &str) {
        self.publish(Event::CascadeError {
            session_id: self.session_id.clone(),
            cascade_id: cascade_id.to_string(),
            error: error.to_string(),
            error_type: error_type.to_string(),
        });
    }

    pub fn phase_start(&self, phase_name: &str) {
        self.publish(Event::PhaseStart {
            session_id: self.session_id.clone(),
            phase_name: phase_name.to_string(),
        });
    }

    pub fn phase_complete(&self, phase_name: &str, output_preview: &str) {
        self.publish(Event::PhaseComplete {
            session_id: self.session_id.clone(),
            phase_name: phase_name.to_string(),
            output_preview: preview(output_preview, 200),
        });
    }

    pub fn turn_start(&self, phase_name: &str, turn: u32) {
        self.publish(Event::TurnStart {
            session_id: self.session_id.clone(),
            phase_name: phase_name.to_string(),
            turn,
        });
    }

    pub fn turn_complete(&self, phase_name: &str, turn: u32, has_tool_calls: bool) {
        self.publish(Event::TurnComplete {
            session_id: self.session_id.clone(),
            phase_name: phase_name.to_string(),
            turn,
            has_tool_calls,
        });
    }

    pub fn tool_call(&self, phase_name: &str, tool_name: &str, args_preview: &str) {
        self.publish(Event::ToolCall {
            session_id: self.session_id.clone(),
            phase_name: phase_name.to_string(),
            tool_name: tool_name.to_string(),
            args_preview: preview(args_preview, 200),
        });
    }

    pub fn tool_complete(&self, phase_name: &str, tool_name: &str, success: bool, result: &str, duration_ms: u64) {
        self.publish(Event::ToolComplete {
            session_id: self.session_id.clone(),
            phase_name: phase_name.to_string(),
            tool_name: tool_name.to_string(),
            success,
            result_preview: preview(result, 200),
            duration_ms,
        });
    }
}

/// Truncate a string for event payloads
pub fn preview(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
