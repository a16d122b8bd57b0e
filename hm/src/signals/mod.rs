//! Named signals - cross-cascade coordination
//!
//! A cascade can park on a named signal (`await_signal`) until another
//! cascade, a webhook, or an operator fires it (`fire_signal`) with an
//! optional payload. Waits carry their own timeout, written as a number
//! plus unit: `30s`, `5m`, `1h`, `1d`.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::debug;

struct Waiter {
    signal_name: String,
    session_id: Option<String>,
    description: Option<String>,
    waiting_since: DateTime<Utc>,
    tx: oneshot::Sender<Value>,
}

/// A waiting signal as reported by [`list_waiting`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingSignal {
    pub signal_name: String,
    pub session_id: Option<String>,
    pub description: Option<String>,
    pub waiting_since: DateTime<Utc>,
}

static WAITERS: OnceLock<Mutex<HashMap<String, Waiter>>> = OnceLock::new();

fn waiters() -> &'static Mutex<HashMap<String, Waiter>> {
    WAITERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Parse a timeout string: `30s`, `5m`, `1h`, `1d`
pub fn parse_timeout(spec: &str) -> Result<Duration, String> {
    let spec = spec.trim();
    let Some(unit_char) = spec.chars().last() else {
        return Err("empty timeout".to_string());
    };
    let (number, unit) = spec.split_at(spec.len() - unit_char.len_utf8());
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid timeout number in '{spec}'"))?;
    let seconds = match unit {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        "d" => number * 86_400,
        other => return Err(format!("unknown timeout unit '{other}' (use s/m/h/d)")),
    };
    Ok(Duration::from_secs(seconds))
}

/// Block until the named signal fires or the timeout expires.
///
/// Returns the fired payload, or `None` on timeout.
pub async fn await_signal(
    signal_name: &str,
    timeout: Duration,
    session_id: Option<String>,
    description: Option<String>,
) -> Option<Value> {
    debug!(%signal_name, ?timeout, "await_signal: registering waiter");
    let waiter_id = uuid::Uuid::now_v7().to_string();
    let (tx, rx) = oneshot::channel();

    waiters().lock().unwrap_or_else(|e| e.into_inner()).insert(
        waiter_id.clone(),
        Waiter {
            signal_name: signal_name.to_string(),
            session_id,
            description,
            waiting_since: Utc::now(),
            tx,
        },
    );

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(payload)) => Some(payload),
        // Fired-then-dropped or timed out: clean up our registration
        _ => {
            waiters()
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&waiter_id);
            None
        }
    }
}

/// Wake every waiter on `signal_name` (optionally restricted to one
/// session). Returns the number of waiters woken.
pub fn fire_signal(signal_name: &str, payload: Option<Value>, session_id: Option<&str>) -> usize {
    let payload = payload.unwrap_or_else(|| json!({}));
    let mut map = waiters().lock().unwrap_or_else(|e| e.into_inner());

    let matching: Vec<String> = map
        .iter()
        .filter(|(_, w)| {
            w.signal_name == signal_name
                && session_id
                    .map(|sid| w.session_id.as_deref() == Some(sid))
                    .unwrap_or(true)
        })
        .map(|(id, _)| id.clone())
        .collect();

    debug!(%signal_name, count = matching.len(), "fire_signal");
    let mut fired = 0;
    for id in matching {
        if let Some(waiter) = map.remove(&id) {
            if waiter.tx.send(payload.clone()).is_ok() {
                fired += 1;
            }
        }
    }
    fired
}

/// Signals currently being waited on
pub fn list_waiting(signal_name: Option<&str>) -> Vec<WaitingSignal> {
    waiters()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .values()
        .filter(|w| signal_name.map(|n| w.signal_name == n).unwrap_or(true))
        .map(|w| WaitingSignal {
            signal_name: w.signal_name.clone(),
            session_id: w.session_id.clone(),
            description: w.description.clone(),
            waiting_since: w.waiting_since,
        })
        .collect()
}
