//! Per-connection subscription registry (§4.8): tracks which connections
//! are watching which paths/globs, and dispatches the raw subscribe/
//! unsubscribe wire messages.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::SharedClock;
use crate::config::SubscriptionConfig;
use crate::path::{self, Pattern};

pub type ConnectionId = u64;

#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    pub pattern: Pattern,
    pub is_glob: bool,
    pub subscribed_at_ms: i64,
    pub group: Option<String>,
}

/// Error codes for malformed or rejected subscribe/unsubscribe messages
/// (§4.8 "handleMessage").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    InvalidJson,
    MissingType,
    UnknownType,
    MissingPath,
    InvalidPath,
    LimitReached,
}

impl MessageError {
    pub fn code(self) -> &'static str {
        match self {
            MessageError::InvalidJson => "invalid_json",
            MessageError::MissingType => "missing_type",
            MessageError::UnknownType => "unknown_type",
            MessageError::MissingPath => "missing_path",
            MessageError::InvalidPath => "invalid_path",
            MessageError::LimitReached => "limit_reached",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Subscribe { path: String, group: Option<String> },
    Unsubscribe { path: String },
    UnsubscribeGroup { group: String },
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    by_connection: DashMap<ConnectionId, DashMap<String, SubscriptionEntry>>,
    config: SubscriptionConfigHolder,
}

#[derive(Default)]
struct SubscriptionConfigHolder(SubscriptionConfig);

impl SubscriptionRegistry {
    pub fn new(config: SubscriptionConfig) -> Self {
        Self { by_connection: DashMap::new(), config: SubscriptionConfigHolder(config) }
    }

    pub fn subscribe(
        &self,
        conn: ConnectionId,
        raw_path: &str,
        group: Option<String>,
        clock: &SharedClock,
    ) -> Result<(), MessageError> {
        let normalized = if path::is_pattern(raw_path) {
            raw_path.to_string()
        } else {
            path::normalize(raw_path).map_err(|_| MessageError::InvalidPath)?
        };
        let pattern = Pattern::compile(&normalized).map_err(|_| MessageError::InvalidPath)?;

        let entries = self.by_connection.entry(conn).or_default();
        if !entries.contains_key(&normalized) && entries.len() >= self.config.0.max_subscriptions_per_connection {
            return Err(MessageError::LimitReached);
        }
        entries.insert(
            normalized,
            SubscriptionEntry {
                pattern,
                is_glob: path::is_pattern(raw_path),
                subscribed_at_ms: clock.now_ms(),
                group,
            },
        );
        Ok(())
    }

    pub fn unsubscribe(&self, conn: ConnectionId, raw_path: &str) {
        if let Some(entries) = self.by_connection.get(&conn) {
            entries.remove(raw_path);
        }
    }

    pub fn unsubscribe_group(&self, conn: ConnectionId, group: &str) {
        if let Some(entries) = self.by_connection.get(&conn) {
            entries.retain(|_, entry| entry.group.as_deref() != Some(group));
        }
    }

    pub fn get_subscriptions_by_group(&self, conn: ConnectionId, group: &str) -> Vec<String> {
        self.by_connection
            .get(&conn)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.value().group.as_deref() == Some(group))
                    .map(|e| e.key().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, conn: ConnectionId, raw_path: &str) -> bool {
        self.by_connection.get(&conn).map(|entries| entries.contains_key(raw_path)).unwrap_or(false)
    }

    pub fn get_subscriptions(&self, conn: ConnectionId) -> Vec<String> {
        self.by_connection.get(&conn).map(|entries| entries.iter().map(|e| e.key().clone()).collect()).unwrap_or_default()
    }

    pub fn get_subscription_count(&self, conn: ConnectionId) -> usize {
        self.by_connection.get(&conn).map(|entries| entries.len()).unwrap_or(0)
    }

    /// All connections with at least one pattern matching `path` (§4.8).
    pub fn get_subscribers_for_path(&self, path: &str) -> Vec<ConnectionId> {
        self.by_connection
            .iter()
            .filter(|entry| entry.value().iter().any(|e| e.value().pattern.matches(path)))
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn get_matching_patterns(&self, conn: ConnectionId, path: &str) -> Vec<String> {
        self.by_connection
            .get(&conn)
            .map(|entries| entries.iter().filter(|e| e.value().pattern.matches(path)).map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    pub fn remove_connection(&self, conn: ConnectionId) {
        self.by_connection.remove(&conn);
    }

    pub fn get_connection_count(&self) -> usize {
        self.by_connection.len()
    }

    pub fn has_pattern(&self, conn: ConnectionId, raw_path: &str) -> bool {
        self.is_subscribed(conn, raw_path)
    }

    /// Parses and dispatches a raw JSON subscribe/unsubscribe message,
    /// returning the JSON acknowledgement to send back (§4.8).
    pub fn handle_message(&self, conn: ConnectionId, raw: &str, clock: &SharedClock) -> Result<Value, MessageError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| MessageError::InvalidJson)?;
        let Some(type_field) = value.get("type").and_then(Value::as_str) else {
            return Err(MessageError::MissingType);
        };

        match type_field {
            "subscribe" => {
                let path = path_field(&value)?;
                let group = value.get("group").and_then(Value::as_str).map(str::to_string);
                self.subscribe(conn, path, group, clock)?;
                Ok(serde_json::json!({"type": "subscribed", "path": path}))
            }
            "unsubscribe" => {
                let path = path_field(&value)?;
                self.unsubscribe(conn, path);
                Ok(serde_json::json!({"type": "unsubscribed", "path": path}))
            }
            "unsubscribe_group" => {
                let group = value.get("group").and_then(Value::as_str).ok_or(MessageError::MissingPath)?;
                self.unsubscribe_group(conn, group);
                Ok(serde_json::json!({"type": "unsubscribed_group", "group": group}))
            }
            _ => Err(MessageError::UnknownType),
        }
    }
}

/// Distinguishes an absent `path` field (`missing_path`) from one present
/// but not a string (`invalid_path`) — the wire protocol's two separate
/// error codes (§4.8, §6).
fn path_field(value: &Value) -> Result<&str, MessageError> {
    match value.get("path") {
        None => Err(MessageError::MissingPath),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(MessageError::InvalidPath),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::Arc;

    fn clock() -> SharedClock {
        Arc::new(VirtualClock::new(0))
    }

    #[test]
    fn subscribe_then_matches_subscriber() {
        let registry = SubscriptionRegistry::new(SubscriptionConfig::default());
        registry.subscribe(1, "/a/*", None, &clock()).unwrap();
        assert_eq!(registry.get_subscribers_for_path("/a/b"), vec![1]);
        assert!(registry.get_subscribers_for_path("/a/b/c").is_empty());
    }

    #[test]
    fn limit_reached_rejects_new_subscription() {
        let registry = SubscriptionRegistry::new(SubscriptionConfig { max_subscriptions_per_connection: 1 });
        registry.subscribe(1, "/a", None, &clock()).unwrap();
        assert_eq!(registry.subscribe(1, "/b", None, &clock()), Err(MessageError::LimitReached));
    }

    #[test]
    fn unsubscribe_group_removes_only_that_group() {
        let registry = SubscriptionRegistry::new(SubscriptionConfig::default());
        registry.subscribe(1, "/a", Some("g1".into()), &clock()).unwrap();
        registry.subscribe(1, "/b", Some("g2".into()), &clock()).unwrap();
        registry.unsubscribe_group(1, "g1");
        assert_eq!(registry.get_subscriptions(1), vec!["/b".to_string()]);
    }

    #[test]
    fn handle_message_rejects_invalid_json() {
        let registry = SubscriptionRegistry::new(SubscriptionConfig::default());
        assert_eq!(registry.handle_message(1, "not json", &clock()), Err(MessageError::InvalidJson));
    }

    #[test]
    fn handle_message_subscribes_on_valid_payload() {
        let registry = SubscriptionRegistry::new(SubscriptionConfig::default());
        let ack = registry.handle_message(1, r#"{"type":"subscribe","path":"/a"}"#, &clock()).unwrap();
        assert_eq!(ack["type"], "subscribed");
        assert!(registry.is_subscribed(1, "/a"));
    }

    #[test]
    fn handle_message_reports_missing_path_when_field_absent() {
        let registry = SubscriptionRegistry::new(SubscriptionConfig::default());
        let err = registry.handle_message(1, r#"{"type":"subscribe"}"#, &clock()).unwrap_err();
        assert_eq!(err, MessageError::MissingPath);
        assert_eq!(err.code(), "missing_path");
    }

    #[test]
    fn handle_message_reports_invalid_path_when_field_not_a_string() {
        let registry = SubscriptionRegistry::new(SubscriptionConfig::default());
        let err = registry.handle_message(1, r#"{"type":"subscribe","path":42}"#, &clock()).unwrap_err();
        assert_eq!(err, MessageError::InvalidPath);
        assert_eq!(err.code(), "invalid_path");
    }
}
