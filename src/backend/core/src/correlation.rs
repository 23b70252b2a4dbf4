//! Correlation identifiers.
//!
//! A correlation id ties every event in one logical workflow run together
//! so the whole run can be queried or replayed as a unit. The format is
//! `c-<base36 millis>-<entity>-<random>`: the timestamp prefix makes ids
//! sort chronologically as plain strings, the embedded entity id keeps
//! them human-readable in logs, and the random suffix disambiguates
//! concurrent runs over the same entity.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ChronicleError, ErrorCode, Result};

const PREFIX: &str = "c";
const SUFFIX_LEN: usize = 6;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A workflow-scoped correlation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new id for the originating entity.
    ///
    /// The entity id is normalized to lowercase alphanumerics and dashes
    /// so the result stays a single hyphen-delimited token stream.
    pub fn generate(entity_id: &str) -> Self {
        Self::generate_at(entity_id, Utc::now())
    }

    /// Generate an id with an explicit timestamp. Used by tests and
    /// backfills; `generate` is the normal entry point.
    pub fn generate_at(entity_id: &str, at: DateTime<Utc>) -> Self {
        let millis = at.timestamp_millis().max(0) as u64;
        let entity = normalize_entity(entity_id);
        let suffix = random_suffix();
        Self(format!(
            "{}-{}-{}-{}",
            PREFIX,
            to_base36(millis),
            entity,
            suffix
        ))
    }

    /// Parse an existing id, validating its shape.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('-').collect();
        if parts.len() < 4 || parts[0] != PREFIX {
            return Err(ChronicleError::new(
                ErrorCode::InvalidInput,
                format!("malformed correlation id: {}", raw),
            ));
        }
        from_base36(parts[1]).ok_or_else(|| {
            ChronicleError::new(
                ErrorCode::InvalidInput,
                format!("correlation id has a non-base36 timestamp: {}", raw),
            )
        })?;
        Ok(Self(raw.to_string()))
    }

    /// The timestamp encoded in the id.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let encoded = self.0.split('-').nth(1)?;
        let millis = from_base36(encoded)?;
        Utc.timestamp_millis_opt(millis as i64).single()
    }

    /// The originating entity id embedded in the id.
    pub fn entity_id(&self) -> Option<&str> {
        // prefix, millis, then entity; the suffix is the final segment and
        // the entity may itself contain dashes.
        let mut parts: Vec<&str> = self.0.split('-').collect();
        if parts.len() < 4 {
            return None;
        }
        parts.pop();
        let start = PREFIX.len() + 1 + parts[1].len() + 1;
        let end = self.0.len() - SUFFIX_LEN - 1;
        self.0.get(start..end)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

fn normalize_entity(entity_id: &str) -> String {
    let normalized: String = entity_id
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    // fixed width keeps lexicographic order equal to chronological order
    let mut out = String::new();
    for _ in digits.len()..9 {
        out.push('0');
    }
    out.push_str(std::str::from_utf8(&digits).unwrap_or("0"));
    out
}

fn from_base36(encoded: &str) -> Option<u64> {
    let mut value: u64 = 0;
    for c in encoded.chars() {
        let digit = c.to_digit(36)?;
        value = value.checked_mul(36)?.checked_add(digit as u64)?;
    }
    Some(value)
}

fn random_suffix() -> String {
    // uuid already ships in the dependency tree; its random bytes are a
    // fine entropy source for a short suffix.
    let bytes = uuid::Uuid::new_v4().into_bytes();
    bytes
        .iter()
        .take(SUFFIX_LEN)
        .map(|b| BASE36[(*b as usize) % 36] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_generate_and_parse_round_trip() {
        let id = CorrelationId::generate("issue-42");
        let parsed = CorrelationId::parse(id.as_str()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_sort_chronologically() {
        let t0 = Utc::now();
        let earlier = CorrelationId::generate_at("a", t0);
        let later = CorrelationId::generate_at("a", t0 + Duration::seconds(5));
        assert!(earlier.as_str() < later.as_str());
    }

    #[test]
    fn test_timestamp_extraction() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
        let id = CorrelationId::generate_at("pr-9", at);
        assert_eq!(id.timestamp(), Some(at));
    }

    #[test]
    fn test_entity_id_extraction() {
        let id = CorrelationId::generate("Issue_42");
        assert_eq!(id.entity_id(), Some("issue-42"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(CorrelationId::parse("not-a-correlation").is_err());
        assert!(CorrelationId::parse("x-123abc-entity-abcdef").is_err());
        assert!(CorrelationId::parse("").is_err());
    }

    #[test]
    fn test_empty_entity_falls_back() {
        let id = CorrelationId::generate("");
        assert_eq!(id.entity_id(), Some("unknown"));
    }
}
