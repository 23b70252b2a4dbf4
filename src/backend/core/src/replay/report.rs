//! Offline replay reports.
//!
//! A report is a single self-contained Markdown document: header,
//! reconstructed states, then the timeline with resolved blob content
//! inlined (diffs in fenced blocks). It references nothing external, so
//! it can be attached to an incident ticket as-is.

use std::fmt::Write;

use super::{ReplayResult, ResolvedBlob};

/// Render a reconstruction as Markdown.
pub fn render_markdown(result: &ReplayResult) -> String {
    let mut out = String::new();

    // header
    let _ = writeln!(out, "# Replay report: {}", result.selector);
    let _ = writeln!(out);
    if let Some(as_of) = result.as_of {
        let _ = writeln!(out, "- As of: {}", as_of.to_rfc3339());
    }
    let _ = writeln!(out, "- Events: {}", result.event_count);
    let _ = writeln!(out, "- Missing blobs: {}", result.missing_blob_count);
    let _ = writeln!(out);

    if !result.warnings.is_empty() {
        let _ = writeln!(out, "## Warnings");
        let _ = writeln!(out);
        for warning in &result.warnings {
            let _ = writeln!(out, "- {}", warning);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "## Reconstructed state");
    let _ = writeln!(out);
    for (projection, entities) in &result.states {
        for (entity, state) in entities {
            let _ = writeln!(out, "### {} / {}", projection, entity);
            let _ = writeln!(out);
            let _ = writeln!(out, "```json");
            let _ = writeln!(
                out,
                "{}",
                serde_json::to_string_pretty(state).unwrap_or_else(|_| state.to_string())
            );
            let _ = writeln!(out, "```");
            let _ = writeln!(out);
        }
    }

    let _ = writeln!(out, "## Timeline");
    let _ = writeln!(out);
    for (index, entry) in result.timeline.iter().enumerate() {
        let event = &entry.event;
        let _ = writeln!(
            out,
            "### {}. {} at {}",
            index + 1,
            event.event_type,
            event.timestamp.to_rfc3339()
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "- Actor: {} ({})", event.actor.id, event.actor.kind);
        if !event.tags.is_empty() {
            let tags: Vec<String> = event
                .tags
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            let _ = writeln!(out, "- Tags: {}", tags.join(", "));
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "```json");
        let _ = writeln!(
            out,
            "{}",
            serde_json::to_string_pretty(&event.payload)
                .unwrap_or_else(|_| event.payload.to_string())
        );
        let _ = writeln!(out, "```");
        let _ = writeln!(out);

        for blob in &entry.blobs {
            render_blob(&mut out, blob);
        }
    }

    out
}

fn render_blob(out: &mut String, blob: &ResolvedBlob) {
    match blob {
        ResolvedBlob::Resolved {
            blob_id,
            content_type,
            size_bytes,
            text,
        } => {
            let _ = writeln!(
                out,
                "Blob `{}` ({}, {} bytes):",
                blob_id, content_type, size_bytes
            );
            let _ = writeln!(out);
            match text {
                Some(text) => {
                    let fence_lang = if is_diff(content_type, text) { "diff" } else { "" };
                    let _ = writeln!(out, "```{}", fence_lang);
                    let _ = writeln!(out, "{}", text.trim_end());
                    let _ = writeln!(out, "```");
                }
                None => {
                    let _ = writeln!(out, "_(binary content omitted)_");
                }
            }
            let _ = writeln!(out);
        }
        ResolvedBlob::Missing { blob_id } => {
            let _ = writeln!(out, "> Blob `{}` is UNAVAILABLE (expired or removed).", blob_id);
            let _ = writeln!(out);
        }
    }
}

fn is_diff(content_type: &str, text: &str) -> bool {
    content_type == "text/x-diff"
        || content_type == "text/x-patch"
        || text.starts_with("diff --git")
        || text.starts_with("--- ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::envelope::{Actor, DomainEvent, EventId};
    use crate::replay::{Selector, TimelineEntry};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sample_result() -> ReplayResult {
        let event = DomainEvent {
            id: EventId::new(),
            event_type: "PR.DIFF.CAPTURED".into(),
            timestamp: Utc::now(),
            schema_version: 1,
            actor: Actor::system("capture"),
            tags: [("prId".to_string(), "7".to_string())].into(),
            payload: json!({"prId": "7", "blobId": "abc"}),
            metadata: None,
        };

        let mut states = BTreeMap::new();
        let mut entities = BTreeMap::new();
        entities.insert("7".to_string(), json!({"status": "open"}));
        states.insert("pr-state".to_string(), entities);

        ReplayResult {
            selector: Selector::Pr("7".into()),
            as_of: None,
            event_count: 1,
            missing_blob_count: 1,
            states,
            timeline: vec![TimelineEntry {
                event,
                blobs: vec![
                    ResolvedBlob::Resolved {
                        blob_id: "abc".into(),
                        content_type: "text/x-diff".into(),
                        size_bytes: 20,
                        text: Some("diff --git a/x b/x\n+line".into()),
                    },
                    ResolvedBlob::Missing {
                        blob_id: "gone".into(),
                    },
                ],
            }],
            warnings: vec!["blob gone is unavailable; content omitted".into()],
        }
    }

    #[test]
    fn test_report_contains_all_sections() {
        let markdown = render_markdown(&sample_result());
        assert!(markdown.contains("# Replay report: prId=7"));
        assert!(markdown.contains("## Warnings"));
        assert!(markdown.contains("## Reconstructed state"));
        assert!(markdown.contains("### pr-state / 7"));
        assert!(markdown.contains("## Timeline"));
        assert!(markdown.contains("```diff"));
        assert!(markdown.contains("UNAVAILABLE"));
    }

    #[test]
    fn test_report_is_deterministic() {
        let result = sample_result();
        assert_eq!(render_markdown(&result), render_markdown(&result));
    }
}
