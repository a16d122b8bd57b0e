//! Event types for cascade activity streaming
//!
//! These events represent all observable activity during a cascade run:
//! - Cascade lifecycle (start, complete, error)
//! - Phase and turn progression
//! - Tool execution
//! - Sounding attempts and evaluator decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Core event enum - the vocabulary of cascade activity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // === Cascade lifecycle ===
    CascadeStart {
        session_id: String,
        cascade_id: String,
        depth: u32,
        parent_session_id: Option<String>,
    },
    CascadeComplete {
        session_id: String,
        cascade_id: String,
        status: String,
    },
    CascadeError {
        session_id: String,
        cascade_id: String,
        error: String,
        error_type: String,
    },

    // === Phase progression ===
    PhaseStart {
        session_id: String,
        phase_name: String,
    },
    PhaseComplete {
        session_id: String,
        phase_name: String,
        output_preview: String,
    },
    TurnStart {
        session_id: String,
        phase_name: String,
        turn: u32,
    },
    TurnComplete {
        session_id: String,
        phase_name: String,
        turn: u32,
        has_tool_calls: bool,
    },

    // === Tool execution ===
    ToolCall {
        session_id: String,
        phase_name: String,
        tool_name: String,
        args_preview: String,
    },
    ToolComplete {
        session_id: String,
        phase_name: String,
        tool_name: String,
        success: bool,
        result_preview: String,
        duration_ms: u64,
    },

    // === Soundings ===
    SoundingAttempt {
        session_id: String,
        phase_name: Option<String>,
        sounding_index: i64,
        is_winner: Option<bool>,
        reforge_step: Option<i64>,
        content_preview: Option<String>,
        model: Option<String>,
    },
    SoundingError {
        session_id: String,
        phase_name: Option<String>,
        sounding_index: i64,
        error: String,
    },
    Evaluator {
        session_id: String,
        phase_name: Option<String>,
        reforge_step: Option<i64>,
        content_preview: Option<String>,
        model: Option<String>,
    },

    // === Stream control ===
    Heartbeat {
        session_id: String,
    },
    Connected {
        session_id: String,
    },
}

impl Event {
    /// The session this event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            Event::CascadeStart { session_id, .. }
            | Event::CascadeComplete { session_id, .. }
            | Event::CascadeError { session_id, .. }
            | Event::PhaseStart { session_id, .. }
            | Event::PhaseComplete { session_id, .. }
            | Event::TurnStart { session_id, .. }
            | Event::TurnComplete { session_id, .. }
            | Event::ToolCall { session_id, .. }
            | Event::ToolComplete { session_id, .. }
            | Event::SoundingAttempt { session_id, .. }
            | Event::SoundingError { session_id, .. }
            | Event::Evaluator { session_id, .. }
            | Event::Heartbeat { session_id }
            | Event::Connected { session_id } => session_id,
        }
    }

    /// Wire name of the event type, matching the serde tag
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::CascadeStart { .. } => "cascade_start",
            Event::CascadeComplete { .. } => "cascade_complete",
            Event::CascadeError { .. } => "cascade_error",
            Event::PhaseStart { .. } => "phase_start",
            Event::PhaseComplete { .. } => "phase_complete",
            Event::TurnStart { .. } => "turn_start",
            Event::TurnComplete { .. } => "turn_complete",
            Event::ToolCall { .. } => "tool_call",
            Event::ToolComplete { .. } => "tool_complete",
            Event::SoundingAttempt { .. } => "sounding_attempt",
            Event::SoundingError { .. } => "sounding_error",
            Event::Evaluator { .. } => "evaluator",
            Event::Heartbeat { .. } => "heartbeat",
            Event::Connected { .. } => "connected",
        }
    }
}

/// An event stamped with its emission time, as delivered to external
/// consumers (SSE, log files)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_matches_serde_tag() {
        let event = Event::PhaseStart {
            session_id: "s".to_string(),
            phase_name: "p".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
    }

    #[test]
    fn test_session_id_accessor() {
        let event = Event::SoundingAttempt {
            session_id: "sess-9".to_string(),
            phase_name: None,
            sounding_index: 2,
            is_winner: Some(true),
            reforge_step: None,
            content_preview: None,
            model: None,
        };
        assert_eq!(event.session_id(), "sess-9");
        assert_eq!(event.event_type(), "sounding_attempt");
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = EventEnvelope::new(Event::Heartbeat {
            session_id: "s".to_string(),
        });
        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event.event_type(), "heartbeat");
    }
}
