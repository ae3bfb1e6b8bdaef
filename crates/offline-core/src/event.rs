//! Telemetry event model shared by every storage backend.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority class of an event.
///
/// Governs whether an event is eligible for offline caching and the order in
/// which persisted events are evicted (Normal before Critical).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PersistenceLevel {
    #[default]
    Normal,
    Critical,
}

impl PersistenceLevel {
    /// Numeric code used in persisted records and indexes.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Normal => 1,
            Self::Critical => 2,
        }
    }

    /// Parse a numeric code, treating unknown values as Normal.
    pub fn from_i64(value: i64) -> Self {
        if value >= 2 {
            Self::Critical
        } else {
            Self::Normal
        }
    }
}

impl fmt::Display for PersistenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl Serialize for PersistenceLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

impl<'de> Deserialize<'de> for PersistenceLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        Ok(Self::from_i64(value))
    }
}

/// Serialized body of an event, as produced by the upstream pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Byte length of the payload, used as its serialized-size estimate.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Borrow the payload as bytes regardless of variant.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

/// A telemetry record travelling through the offline channel.
///
/// `id` is empty until a storage provider assigns one; providers use
/// time-ordered ids (see [`crate::EventId`]) so records can be sorted
/// chronologically without extra bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "iKey", default)]
    pub ikey: String,
    #[serde(default)]
    pub persistence: PersistenceLevel,
    #[serde(rename = "serializedData", default)]
    pub data: Payload,
    #[serde(default)]
    pub critical_cnt: u32,
    #[serde(default)]
    pub attempt_cnt: u32,
    #[serde(rename = "isSync", default)]
    pub sync: bool,
}

impl TelemetryEvent {
    /// Create an event with no id yet.
    pub fn new(ikey: impl Into<String>, persistence: PersistenceLevel, data: impl Into<Payload>) -> Self {
        let critical_cnt = u32::from(persistence == PersistenceLevel::Critical);
        Self {
            id: String::new(),
            ikey: ikey.into(),
            persistence,
            data: data.into(),
            critical_cnt,
            attempt_cnt: 0,
            sync: false,
        }
    }

    /// Builder-style id override.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    pub fn is_critical(&self) -> bool {
        self.persistence == PersistenceLevel::Critical
    }

    /// Serialized-length estimate used by the in-memory buffer.
    pub fn size_estimate(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_level_ordering() {
        assert!(PersistenceLevel::Normal < PersistenceLevel::Critical);
        assert_eq!(PersistenceLevel::from_i64(2), PersistenceLevel::Critical);
        assert_eq!(PersistenceLevel::from_i64(0), PersistenceLevel::Normal);
    }

    #[test]
    fn test_event_json_shape() {
        let event = TelemetryEvent::new("ikey-1", PersistenceLevel::Critical, "payload").with_id("1.abc");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["id"], "1.abc");
        assert_eq!(json["iKey"], "ikey-1");
        assert_eq!(json["persistence"], 2);
        assert_eq!(json["serializedData"], "payload");
        assert_eq!(json["criticalCnt"], 1);
        assert_eq!(json["attemptCnt"], 0);
    }

    #[test]
    fn test_binary_payload_survives_json() {
        let event = TelemetryEvent::new("ikey-1", PersistenceLevel::Normal, vec![1u8, 2, 3]);
        let json = serde_json::to_string(&event).unwrap();
        let parsed: TelemetryEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, event);
        assert!(parsed.data.is_binary());
    }

    #[test]
    fn test_size_estimate_uses_payload_bytes() {
        let event = TelemetryEvent::new("k", PersistenceLevel::Normal, "héllo");
        assert_eq!(event.size_estimate(), "héllo".len());
    }
}
