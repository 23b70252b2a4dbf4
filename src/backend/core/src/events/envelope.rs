//! The domain event envelope.
//!
//! Every occurrence in the system is recorded as a `DomainEvent` in one
//! chronological stream. There are no per-entity streams; membership in a
//! consistency boundary is expressed through the open `tags` map and
//! resolved at query time (the dynamic consistency boundary pattern).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Event Identity
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique, time-sortable identifier for events.
///
/// UUIDv7 embeds a millisecond timestamp in its high bits, so the byte
/// order of ids is the chronological order of the stream. Both backends
/// rely on this for `ORDER BY id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }

    /// The millisecond timestamp embedded in the id.
    pub fn timestamp_millis(&self) -> u64 {
        let bytes = self.0.as_bytes();
        let mut millis: u64 = 0;
        for b in &bytes[..6] {
            millis = (millis << 8) | *b as u64;
        }
        millis
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id source shared by all writers in the process.
///
/// `Uuid::now_v7` alone is time-ordered only down to the millisecond; two
/// ids minted in the same millisecond may compare either way. The
/// generator closes that gap by bumping any id that does not exceed the
/// last one issued, so ids are strictly increasing per process.
#[derive(Debug, Default)]
pub struct EventIdGenerator {
    last: Mutex<Option<Uuid>>,
}

impl EventIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> EventId {
        let mut last = self.last.lock();
        let mut candidate = Uuid::now_v7();
        if let Some(prev) = *last {
            if candidate <= prev {
                candidate = increment_uuid(prev);
            }
        }
        *last = Some(candidate);
        EventId(candidate)
    }
}

fn increment_uuid(uuid: Uuid) -> Uuid {
    let mut bytes = *uuid.as_bytes();
    for byte in bytes.iter_mut().rev() {
        let (next, overflow) = byte.overflowing_add(1);
        *byte = next;
        if !overflow {
            break;
        }
    }
    Uuid::from_bytes(bytes)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Actor
// ═══════════════════════════════════════════════════════════════════════════════

/// Who caused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActorKind {
    User,
    System,
    AiProvider,
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::System => write!(f, "system"),
            Self::AiProvider => write!(f, "ai-provider"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::User,
            id: id.into(),
            metadata: None,
        }
    }

    pub fn system(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::System,
            id: id.into(),
            metadata: None,
        }
    }

    pub fn ai_provider(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::AiProvider,
            id: id.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tags
// ═══════════════════════════════════════════════════════════════════════════════

/// Well-known tag keys. Tags are an open map; these are merely the keys
/// the query surface exposes first-class filters for.
pub mod tag {
    pub const CORRELATION_ID: &str = "correlationId";
    pub const ISSUE_ID: &str = "issueId";
    pub const PR_ID: &str = "prId";
}

/// Tag map. BTreeMap keeps serialization order stable, which keeps
/// replay output byte-identical across runs.
pub type Tags = BTreeMap<String, String>;

// ═══════════════════════════════════════════════════════════════════════════════
// Domain Event
// ═══════════════════════════════════════════════════════════════════════════════

/// A single immutable fact in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: EventId,

    /// Namespaced type, e.g. `ISSUE.SELECTED` or `WORKFLOW.STEP.COMPLETED`.
    pub event_type: String,

    pub timestamp: DateTime<Utc>,

    pub schema_version: u32,

    pub actor: Actor,

    #[serde(default)]
    pub tags: Tags,

    pub payload: Value,

    /// Free-form context, exempt from schema validation but not from
    /// masking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl DomainEvent {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.tag(tag::CORRELATION_ID)
    }

    /// Blob references carried by the payload, if any. Producers record a
    /// reference as a `blobId` field (top-level or nested one level under
    /// well-known keys like `diff` or `content`).
    pub fn blob_refs(&self) -> Vec<String> {
        let mut refs = Vec::new();
        collect_blob_refs(&self.payload, &mut refs);
        refs
    }
}

fn collect_blob_refs(value: &Value, refs: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                if key == "blobId" {
                    if let Some(id) = val.as_str() {
                        refs.push(id.to_string());
                    }
                } else {
                    collect_blob_refs(val, refs);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_blob_refs(item, refs);
            }
        }
        _ => {}
    }
}

/// What a producer submits; the store assigns the id, stamps the time,
/// validates, and masks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub event_type: String,

    /// Defaults to the latest registered version for the type when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,

    pub actor: Actor,

    #[serde(default)]
    pub tags: Tags,

    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, actor: Actor, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version: None,
            actor,
            tags: Tags::new(),
            payload,
            metadata: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation(self, correlation_id: impl Into<String>) -> Self {
        self.with_tag(tag::CORRELATION_ID, correlation_id)
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = Some(version);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generator_is_strictly_increasing() {
        let generator = EventIdGenerator::new();
        let mut prev = generator.next();
        for _ in 0..1000 {
            let next = generator.next();
            assert!(next > prev, "ids must be strictly increasing");
            prev = next;
        }
    }

    #[test]
    fn test_event_id_embeds_timestamp() {
        let before = Utc::now().timestamp_millis() as u64;
        let id = EventId::new();
        let after = Utc::now().timestamp_millis() as u64;
        assert!(id.timestamp_millis() >= before);
        assert!(id.timestamp_millis() <= after);
    }

    #[test]
    fn test_increment_uuid_carries() {
        let uuid = Uuid::from_bytes([
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff,
        ]);
        let bumped = increment_uuid(uuid);
        assert_eq!(
            bumped.as_bytes(),
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0]
        );
    }

    #[test]
    fn test_blob_refs_collected_recursively() {
        let event = DomainEvent {
            id: EventId::new(),
            event_type: "PR.DIFF.CAPTURED".into(),
            timestamp: Utc::now(),
            schema_version: 1,
            actor: Actor::system("capture"),
            tags: Tags::new(),
            payload: json!({
                "blobId": "aaa",
                "nested": {"blobId": "bbb"},
                "list": [{"blobId": "ccc"}]
            }),
            metadata: None,
        };
        let mut refs = event.blob_refs();
        refs.sort();
        assert_eq!(refs, vec!["aaa", "bbb", "ccc"]);
    }

    #[test]
    fn test_envelope_serialization_shape() {
        let event = DomainEvent {
            id: EventId::new(),
            event_type: "ISSUE.SELECTED".into(),
            timestamp: Utc::now(),
            schema_version: 1,
            actor: Actor::user("alice"),
            tags: [("issueId".to_string(), "42".to_string())].into(),
            payload: json!({"issueId": "42"}),
            metadata: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "ISSUE.SELECTED");
        assert_eq!(json["schemaVersion"], 1);
        assert_eq!(json["actor"]["kind"], "user");
        assert_eq!(json["tags"]["issueId"], "42");
    }

    #[test]
    fn test_tags_serialize_in_stable_order() {
        let mut tags = Tags::new();
        tags.insert("zzz".into(), "1".into());
        tags.insert("aaa".into(), "2".into());
        let serialized = serde_json::to_string(&tags).unwrap();
        assert!(serialized.find("aaa").unwrap() < serialized.find("zzz").unwrap());
    }
}
