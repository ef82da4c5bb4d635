use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stream::{Fields, StreamEntry, StreamId};
use crate::utils::parse_timestamp;
use crate::{PulseError, Result};

/// Keys every ingested event must carry, in their canonical form.
pub const REQUIRED_FIELDS: [&str; 3] = ["site", "event_name", "captured_at"];

const ALIASES: [(&str, &str); 5] = [
    ("site_name", "site"),
    ("name", "event_name"),
    ("event", "event_name"),
    ("timestamp", "captured_at"),
    ("app_name", "app"),
];

const CORE_FIELDS: [&str; 5] = ["site", "event_name", "app", "app_version", "captured_at"];

/// Body of an ingest request: `{"events": [...]}`, a bare array or one event.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestPayload {
    Batch { events: Vec<Value> },
    List(Vec<Value>),
    Single(Map<String, Value>),
}

impl IngestPayload {
    pub fn into_events(self) -> Vec<Value> {
        match self {
            IngestPayload::Batch { events } => events,
            IngestPayload::List(events) => events,
            IngestPayload::Single(event) => vec![Value::Object(event)],
        }
    }
}

/// A validated event, with aliases folded onto canonical keys.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestEvent {
    fields: Map<String, Value>,
}

impl IngestEvent {
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(raw) = value else {
            return Err(PulseError::Validation(
                "Event failed validation. Expected a JSON object".to_string(),
            ));
        };

        let mut fields = Map::new();
        let mut aliased = Vec::new();
        for (key, value) in raw {
            match ALIASES.iter().find(|(alias, _)| *alias == key) {
                Some((_, canonical)) => aliased.push((canonical.to_string(), value)),
                None => {
                    fields.insert(key, value);
                }
            }
        }
        // An explicit canonical key wins over its alias.
        for (canonical, value) in aliased {
            if !fields.get(&canonical).map(is_present).unwrap_or(false) {
                fields.insert(canonical, value);
            }
        }

        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|key| !fields.get(*key).map(is_present).unwrap_or(false))
            .collect();
        if !missing.is_empty() {
            return Err(PulseError::Validation(format!(
                "Event failed validation. Missing/empty: {:?}",
                missing
            )));
        }

        let captured_at = field_text(&fields, "captured_at").unwrap_or_default();
        if parse_timestamp(&captured_at).is_none() {
            return Err(PulseError::Validation(format!(
                "Event failed validation. Invalid captured_at: '{}'",
                captured_at
            )));
        }

        Ok(Self { fields })
    }

    pub fn site(&self) -> String {
        field_text(&self.fields, "site").unwrap_or_default()
    }

    pub fn event_name(&self) -> String {
        field_text(&self.fields, "event_name").unwrap_or_default()
    }

    /// Flattens into stream fields: nulls dropped, non-strings as JSON text.
    pub fn to_stream_fields(&self, received_at: &str) -> Fields {
        let mut out = Fields::new();
        for (key, value) in &self.fields {
            if let Some(text) = value_text(value) {
                out.insert(key.clone(), text);
            }
        }
        out.insert("received_at".to_string(), received_at.to_string());
        out
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn field_text(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields.get(key).and_then(value_text)
}

/// One row of the `events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: StreamId,
    pub site_name: String,
    pub event_name: String,
    pub app_name: Option<String>,
    pub app_version: Option<String>,
    pub captured_at_ms: i64,
    pub additional_data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreparedEvent {
    Ready(StoredEvent),
    Skipped(String),
}

impl StoredEvent {
    /// Maps a stream entry onto a row. Entries that can never be stored are skipped.
    pub fn prepare(entry: &StreamEntry) -> PreparedEvent {
        let get = |key: &str| entry.fields.get(key).filter(|v| !v.trim().is_empty()).cloned();

        let (Some(site_name), Some(event_name)) = (get("site"), get("event_name")) else {
            return PreparedEvent::Skipped("missing site or event_name".to_string());
        };

        let captured_at = get("captured_at").unwrap_or_default();
        let Some(captured) = parse_timestamp(&captured_at) else {
            return PreparedEvent::Skipped(format!("invalid captured_at '{}'", captured_at));
        };

        let mut additional_data = Map::new();
        for (key, raw) in &entry.fields {
            if CORE_FIELDS.contains(&key.as_str()) {
                continue;
            }
            // Nested values were flattened to JSON text on ingest.
            let value = match raw.chars().next() {
                Some('{') | Some('[') => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                _ => Value::String(raw.clone()),
            };
            additional_data.insert(key.clone(), value);
        }

        let app_version = get("app_version").or_else(|| {
            additional_data
                .get("properties")
                .and_then(|p| p.get("app_version"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        PreparedEvent::Ready(StoredEvent {
            id: entry.id,
            site_name,
            event_name,
            app_name: get("app"),
            app_version,
            captured_at_ms: captured.timestamp_millis(),
            additional_data,
        })
    }
}
