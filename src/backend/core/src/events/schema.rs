//! Payload schema registry and validation.
//!
//! The registry is a plain value built at startup and handed to the event
//! store; there is no global registration. Validation is pure: it reads
//! the registry and the candidate event and reports every field error at
//! once rather than stopping at the first.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::events::envelope::NewEvent;

// ═══════════════════════════════════════════════════════════════════════════════
// Schema Definition
// ═══════════════════════════════════════════════════════════════════════════════

/// Expected JSON shape for a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// Any JSON value, including null.
    Any,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(kind: FieldKind) -> Self {
        Self { kind, required: true }
    }

    pub fn optional(kind: FieldKind) -> Self {
        Self { kind, required: false }
    }
}

/// Schema for one `(event_type, version)` pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadSchema {
    pub fields: BTreeMap<String, FieldSpec>,

    /// When false, fields not named in the schema are rejected.
    #[serde(default = "default_true")]
    pub allow_extra_fields: bool,
}

fn default_true() -> bool {
    true
}

impl PayloadSchema {
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
            allow_extra_fields: true,
        }
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn closed(mut self) -> Self {
        self.allow_extra_fields = false;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Validation Results
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Every problem found in one pass. Empty means valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<FieldError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Maps `(event_type, schema_version)` to a payload schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, BTreeMap<u32, PayloadSchema>>,

    /// When true, events of unregistered types pass through untouched.
    /// When false they are rejected as unknown.
    permissive: bool,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow unregistered event types through instead of rejecting them.
    pub fn permissive(mut self) -> Self {
        self.permissive = true;
        self
    }

    pub fn register(
        mut self,
        event_type: impl Into<String>,
        version: u32,
        schema: PayloadSchema,
    ) -> Self {
        self.schemas
            .entry(event_type.into())
            .or_default()
            .insert(version, schema);
        self
    }

    /// Latest registered version for a type. Used to default the version
    /// when a producer omits it.
    pub fn latest_version(&self, event_type: &str) -> Option<u32> {
        self.schemas
            .get(event_type)
            .and_then(|versions| versions.keys().next_back().copied())
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.schemas.contains_key(event_type)
    }

    /// Validate a candidate event against its schema.
    ///
    /// Pure: no side effects, all errors reported in one pass. The
    /// version checked is the one the producer supplied, or the latest
    /// registered version when omitted.
    pub fn validate(&self, event: &NewEvent) -> ValidationReport {
        let mut report = ValidationReport::default();

        if event.event_type.trim().is_empty() {
            report.push("eventType", "event type must be non-empty");
            return report;
        }

        let versions = match self.schemas.get(&event.event_type) {
            Some(versions) => versions,
            None => {
                if !self.permissive {
                    report.push(
                        "eventType",
                        format!("unknown event type: {}", event.event_type),
                    );
                }
                return report;
            }
        };

        let version = event
            .schema_version
            .or_else(|| versions.keys().next_back().copied())
            .unwrap_or(1);

        let schema = match versions.get(&version) {
            Some(schema) => schema,
            None => {
                report.push(
                    "schemaVersion",
                    format!(
                        "unknown schema version {} for type {}",
                        version, event.event_type
                    ),
                );
                return report;
            }
        };

        let payload = match event.payload.as_object() {
            Some(map) => map,
            None => {
                report.push("payload", "payload must be a JSON object");
                return report;
            }
        };

        for (name, spec) in &schema.fields {
            match payload.get(name) {
                None | Some(Value::Null) if spec.required => {
                    report.push(name, "required field is missing");
                }
                Some(value) if !value.is_null() && !spec.kind.matches(value) => {
                    report.push(
                        name,
                        format!("expected {}, got {}", spec.kind.name(), json_kind(value)),
                    );
                }
                _ => {}
            }
        }

        if !schema.allow_extra_fields {
            for name in payload.keys() {
                if !schema.fields.contains_key(name) {
                    report.push(name, "field is not part of the schema");
                }
            }
        }

        report
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The schema set for the development-workflow event vocabulary. Callers
/// may build their own registry instead; nothing below is special-cased.
pub fn default_registry() -> SchemaRegistry {
    SchemaRegistry::new()
        .register(
            "ISSUE.SELECTED",
            1,
            PayloadSchema::new()
                .field("issueId", FieldSpec::required(FieldKind::String))
                .field("title", FieldSpec::optional(FieldKind::String))
                .field("reason", FieldSpec::optional(FieldKind::String)),
        )
        .register(
            "ISSUE.STATUS.CHANGED",
            1,
            PayloadSchema::new()
                .field("issueId", FieldSpec::required(FieldKind::String))
                .field("from", FieldSpec::required(FieldKind::String))
                .field("to", FieldSpec::required(FieldKind::String)),
        )
        .register(
            "PR.CREATED",
            1,
            PayloadSchema::new()
                .field("prId", FieldSpec::required(FieldKind::String))
                .field("issueId", FieldSpec::optional(FieldKind::String))
                .field("branch", FieldSpec::optional(FieldKind::String)),
        )
        .register(
            "PR.DIFF.CAPTURED",
            1,
            PayloadSchema::new()
                .field("prId", FieldSpec::required(FieldKind::String))
                .field("blobId", FieldSpec::required(FieldKind::String))
                .field("files", FieldSpec::optional(FieldKind::Array)),
        )
        .register(
            "PR.MERGED",
            1,
            PayloadSchema::new()
                .field("prId", FieldSpec::required(FieldKind::String))
                .field("mergeCommit", FieldSpec::optional(FieldKind::String)),
        )
        .register(
            "WORKFLOW.STEP.STARTED",
            1,
            PayloadSchema::new()
                .field("step", FieldSpec::required(FieldKind::String))
                .field("input", FieldSpec::optional(FieldKind::Any)),
        )
        .register(
            "WORKFLOW.STEP.COMPLETED",
            1,
            PayloadSchema::new()
                .field("step", FieldSpec::required(FieldKind::String))
                .field("outcome", FieldSpec::required(FieldKind::String))
                .field("output", FieldSpec::optional(FieldKind::Any)),
        )
        .register(
            "AI.REQUEST.STARTED",
            1,
            PayloadSchema::new()
                .field("provider", FieldSpec::required(FieldKind::String))
                .field("model", FieldSpec::optional(FieldKind::String))
                .field("blobId", FieldSpec::optional(FieldKind::String)),
        )
        .register(
            "AI.RESPONSE.RECEIVED",
            1,
            PayloadSchema::new()
                .field("provider", FieldSpec::required(FieldKind::String))
                .field("blobId", FieldSpec::optional(FieldKind::String))
                .field("tokens", FieldSpec::optional(FieldKind::Number)),
        )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::envelope::Actor;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new().register(
            "ISSUE.SELECTED",
            1,
            PayloadSchema::new()
                .field("issueId", FieldSpec::required(FieldKind::String))
                .field("title", FieldSpec::optional(FieldKind::String)),
        )
    }

    fn event(event_type: &str, payload: serde_json::Value) -> NewEvent {
        NewEvent::new(event_type, Actor::user("alice"), payload)
    }

    #[test]
    fn test_valid_payload_passes() {
        let report = registry().validate(&event(
            "ISSUE.SELECTED",
            json!({"issueId": "42", "title": "fix the thing"}),
        ));
        assert!(report.is_valid());
    }

    #[test]
    fn test_all_errors_reported_at_once() {
        let report = registry().validate(&event(
            "ISSUE.SELECTED",
            json!({"title": 7}),
        ));
        assert_eq!(report.errors.len(), 2);
        let fields: Vec<&str> = report.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"issueId"));
        assert!(fields.contains(&"title"));
    }

    #[test]
    fn test_unknown_type_rejected_by_default() {
        let report = registry().validate(&event("MYSTERY.THING", json!({})));
        assert!(!report.is_valid());
    }

    #[test]
    fn test_permissive_mode_passes_unknown_types() {
        let report = registry()
            .permissive()
            .validate(&event("MYSTERY.THING", json!({"anything": true})));
        assert!(report.is_valid());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut e = event("ISSUE.SELECTED", json!({"issueId": "42"}));
        e.schema_version = Some(9);
        let report = registry().validate(&e);
        assert!(!report.is_valid());
        assert_eq!(report.errors[0].field, "schemaVersion");
    }

    #[test]
    fn test_latest_version_wins_when_omitted() {
        let registry = SchemaRegistry::new()
            .register(
                "PR.CREATED",
                1,
                PayloadSchema::new().field("prId", FieldSpec::required(FieldKind::String)),
            )
            .register(
                "PR.CREATED",
                2,
                PayloadSchema::new()
                    .field("prId", FieldSpec::required(FieldKind::String))
                    .field("branch", FieldSpec::required(FieldKind::String)),
            );

        assert_eq!(registry.latest_version("PR.CREATED"), Some(2));

        // v2 requires `branch`, so an omitted version validates against v2
        let report = registry.validate(&event("PR.CREATED", json!({"prId": "7"})));
        assert!(!report.is_valid());
    }

    #[test]
    fn test_closed_schema_rejects_extras() {
        let registry = SchemaRegistry::new().register(
            "PR.MERGED",
            1,
            PayloadSchema::new()
                .field("prId", FieldSpec::required(FieldKind::String))
                .closed(),
        );
        let report = registry.validate(&event(
            "PR.MERGED",
            json!({"prId": "7", "sneaky": true}),
        ));
        assert!(!report.is_valid());
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let report = registry().validate(&event("ISSUE.SELECTED", json!("just a string")));
        assert!(!report.is_valid());
        assert_eq!(report.errors[0].field, "payload");
    }

    #[test]
    fn test_default_registry_covers_workflow_vocabulary() {
        let registry = default_registry();
        assert!(registry.is_registered("ISSUE.SELECTED"));
        assert!(registry.is_registered("PR.DIFF.CAPTURED"));
        assert!(registry.is_registered("WORKFLOW.STEP.COMPLETED"));
        assert!(registry.is_registered("AI.REQUEST.STARTED"));
        assert!(registry.is_registered("AI.RESPONSE.RECEIVED"));
    }

    #[test]
    fn test_default_registry_accepts_ai_request_started() {
        let report = default_registry().validate(&event(
            "AI.REQUEST.STARTED",
            json!({"provider": "anthropic", "model": "claude"}),
        ));
        assert!(report.is_valid());
    }
}
