//! Decoding of backend payloads into raw status updates.
//!
//! Both channels carry the same shape of data: a status token plus optional
//! stage, progress and error details. Push messages wrap it in an event
//! envelope (`{"event": "progress_update", "data": {...}, "sequence": 7}`),
//! poll responses are the bare snapshot.

use crate::domain::{Anomaly, TimestampUtc};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// A status report from either channel, not yet interpreted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawUpdate {
    pub status: Option<String>,
    pub current_stage: Option<String>,
    pub progress: Option<f64>,
    pub error: Option<String>,
    /// Ordering marker carried by push envelopes.
    pub marker: Option<PushMarker>,
    pub received_at: Option<TimestampUtc>,
}

impl RawUpdate {
    /// Convenience constructor for a bare status token.
    pub fn status(token: &str) -> Self {
        Self {
            status: Some(token.to_string()),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_marker(mut self, marker: PushMarker) -> Self {
        self.marker = Some(marker);
        self
    }
}

/// Ordering information attached to a push message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMarker {
    Sequence(u64),
    Timestamp(TimestampUtc),
}

impl PushMarker {
    /// Markers of different kinds are not comparable and never count as newer.
    pub fn is_newer_than(&self, other: &PushMarker) -> bool {
        match (self, other) {
            (PushMarker::Sequence(a), PushMarker::Sequence(b)) => a > b,
            (PushMarker::Timestamp(a), PushMarker::Timestamp(b)) => a > b,
            _ => false,
        }
    }
}

/// A decoded push message.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Update(RawUpdate),
    /// Connection chatter that carries no status.
    Keepalive,
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    #[serde(alias = "type")]
    event: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default, alias = "seq")]
    sequence: Option<u64>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

const KEEPALIVE_EVENTS: &[&str] = &["ping", "pong", "heartbeat", "connected", "subscribed"];

/// Decodes one push message.
pub fn parse_push_message(text: &str, received_at: TimestampUtc) -> Result<PushEvent, Anomaly> {
    let envelope: PushEnvelope =
        serde_json::from_str(text).map_err(|e| Anomaly::Malformed(e.to_string()))?;
    let event = envelope.event.to_ascii_lowercase();

    if KEEPALIVE_EVENTS.contains(&event.as_str()) {
        return Ok(PushEvent::Keepalive);
    }

    let data = envelope.data.unwrap_or(Value::Null);
    let mut update = fields_from(&data);
    update.received_at = Some(received_at);
    update.marker = envelope
        .sequence
        .map(PushMarker::Sequence)
        .or_else(|| {
            envelope
                .timestamp
                .as_deref()
                .or_else(|| data.get("timestamp").and_then(Value::as_str))
                .and_then(parse_timestamp)
                .map(PushMarker::Timestamp)
        });

    match event.as_str() {
        "generation_complete" => {
            if update.status.is_none() {
                update.status = Some("completed".to_string());
            }
        }
        "error" => {
            if update.error.is_none() {
                update.error = Some(
                    envelope
                        .message
                        .unwrap_or_else(|| "backend reported an error".to_string()),
                );
            }
        }
        _ => {}
    }

    if update.status.is_none()
        && update.current_stage.is_none()
        && update.progress.is_none()
        && update.error.is_none()
    {
        return Err(Anomaly::Malformed(format!(
            "'{}' event carries no status information",
            event
        )));
    }

    Ok(PushEvent::Update(update))
}

/// Decodes one poll response.
pub fn parse_poll_snapshot(value: &Value, received_at: TimestampUtc) -> Result<RawUpdate, Anomaly> {
    let body = match value.get("data") {
        Some(inner) if value.get("status").is_none() && inner.is_object() => inner,
        _ => value,
    };
    if !body.is_object() {
        return Err(Anomaly::Malformed("status snapshot is not an object".to_string()));
    }

    let mut update = fields_from(body);
    if update.status.is_none() {
        return Err(Anomaly::Malformed("status snapshot has no status".to_string()));
    }
    update.received_at = Some(received_at);
    Ok(update)
}

fn fields_from(data: &Value) -> RawUpdate {
    RawUpdate {
        status: string_field(data, "status"),
        current_stage: string_field(data, "current_stage"),
        progress: data.get("progress").and_then(number_value),
        error: error_field(data),
        marker: None,
        received_at: None,
    }
}

fn string_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn number_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

/// Takes the most recent error from `error`, `error_message`, or the last
/// entry of an `errors` array (strings or `{message}` objects).
fn error_field(data: &Value) -> Option<String> {
    if let Some(error) = string_field(data, "error").or_else(|| string_field(data, "error_message"))
    {
        return Some(error);
    }
    let last = data.get("errors")?.as_array()?.last()?;
    match last {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => string_field(last, "message").or_else(|| string_field(last, "error")),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<TimestampUtc> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
