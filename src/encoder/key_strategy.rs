use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// How the partition key of a record is derived from the inbound body.
///
/// Grouping strategies (`Field`, `Composite`) give causally related events
/// the same key so they stay ordered on one shard. When the grouping fields
/// are absent the record falls back to a generated key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyStrategy {
    #[default]
    Generated,
    Field {
        path: String,
    },
    Composite {
        fields: Vec<String>,
    },
}

impl KeyStrategy {
    /// Grouping value for `body`, or `None` when a generated key is needed.
    pub fn extract_key(&self, body: &Value) -> Option<String> {
        let key = match self {
            KeyStrategy::Generated => return None,
            KeyStrategy::Field { path } => extract_field_value(body, path),
            KeyStrategy::Composite { fields } => extract_composite_key(body, fields),
        };

        match key {
            Some(k) if !k.is_empty() => Some(k),
            _ => {
                debug!(strategy = ?self, "Grouping key unavailable, using generated key");
                None
            }
        }
    }
}

/// Produces keys that never collide within a process and are unlikely to
/// collide across processes: a random per-instance salt plus a counter.
#[derive(Debug)]
pub struct KeyGenerator {
    salt: u32,
    counter: AtomicU64,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::with_salt(rand::random())
    }

    pub fn with_salt(salt: u32) -> Self {
        Self {
            salt,
            counter: AtomicU64::new(0),
        }
    }

    pub fn generate(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:08x}-{:016x}", self.salt, n)
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_field_value(record: &Value, field_path: &str) -> Option<String> {
    let mut current = record;

    for part in field_path.split('.') {
        match current.get(part) {
            Some(value) => current = value,
            None => {
                debug!("Field '{}' not found in body", part);
                return None;
            }
        }
    }

    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        _ => Some(current.to_string()),
    }
}

fn extract_composite_key(record: &Value, fields: &[String]) -> Option<String> {
    let mut key_parts = Vec::with_capacity(fields.len());

    for field in fields {
        match extract_field_value(record, field) {
            Some(value) => key_parts.push(value),
            None => {
                debug!("Missing field '{}' for composite key", field);
                return None;
            }
        }
    }

    if key_parts.is_empty() {
        None
    } else {
        Some(key_parts.join(":"))
    }
}
