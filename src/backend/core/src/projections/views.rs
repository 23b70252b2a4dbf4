//! Built-in projection views for the development-workflow vocabulary.
//!
//! Each view is a small pure fold. State is plain JSON so records stay
//! inspectable in either backend without a schema migration when a view
//! grows a field.

use serde_json::{json, Value};

use super::Projection;
use crate::events::envelope::{tag, DomainEvent};

/// Current status of an issue, folded from `ISSUE.*` events.
pub struct IssueStatusView;

impl Projection for IssueStatusView {
    fn name(&self) -> &'static str {
        "issue-status"
    }

    fn entity_id(&self, event: &DomainEvent) -> Option<String> {
        if !event.event_type.starts_with("ISSUE.") {
            return None;
        }
        event.tag(tag::ISSUE_ID).map(String::from)
    }

    fn initial_state(&self) -> Value {
        json!({
            "status": "unknown",
            "title": null,
            "eventCount": 0,
            "lastEventType": null,
        })
    }

    fn apply(&self, mut state: Value, event: &DomainEvent) -> Value {
        match event.event_type.as_str() {
            "ISSUE.SELECTED" => {
                state["status"] = json!("selected");
                if let Some(title) = event.payload.get("title") {
                    state["title"] = title.clone();
                }
            }
            "ISSUE.STATUS.CHANGED" => {
                if let Some(to) = event.payload.get("to") {
                    state["status"] = to.clone();
                }
            }
            _ => {}
        }
        bump(&mut state, event);
        state
    }
}

/// Lifecycle of a pull request, folded from `PR.*` events.
pub struct PrStateView;

impl Projection for PrStateView {
    fn name(&self) -> &'static str {
        "pr-state"
    }

    fn entity_id(&self, event: &DomainEvent) -> Option<String> {
        if !event.event_type.starts_with("PR.") {
            return None;
        }
        event.tag(tag::PR_ID).map(String::from)
    }

    fn initial_state(&self) -> Value {
        json!({
            "status": "unknown",
            "issueId": null,
            "branch": null,
            "diffBlobIds": [],
            "eventCount": 0,
            "lastEventType": null,
        })
    }

    fn apply(&self, mut state: Value, event: &DomainEvent) -> Value {
        match event.event_type.as_str() {
            "PR.CREATED" => {
                state["status"] = json!("open");
                if let Some(issue) = event.payload.get("issueId") {
                    state["issueId"] = issue.clone();
                }
                if let Some(branch) = event.payload.get("branch") {
                    state["branch"] = branch.clone();
                }
            }
            "PR.DIFF.CAPTURED" => {
                if let Some(blob_id) = event.payload.get("blobId").cloned() {
                    if let Some(list) = state["diffBlobIds"].as_array_mut() {
                        list.push(blob_id);
                    }
                }
            }
            "PR.MERGED" => {
                state["status"] = json!("merged");
                if let Some(commit) = event.payload.get("mergeCommit") {
                    state["mergeCommit"] = commit.clone();
                }
            }
            _ => {}
        }
        bump(&mut state, event);
        state
    }
}

/// One workflow run, keyed by correlation id, folded from every event in
/// the run. Tracks step progress and counts everything else.
pub struct WorkflowRunView;

impl Projection for WorkflowRunView {
    fn name(&self) -> &'static str {
        "workflow-run"
    }

    fn entity_id(&self, event: &DomainEvent) -> Option<String> {
        event.tag(tag::CORRELATION_ID).map(String::from)
    }

    fn initial_state(&self) -> Value {
        json!({
            "steps": {},
            "startedAt": null,
            "lastActivityAt": null,
            "eventCount": 0,
            "lastEventType": null,
        })
    }

    fn apply(&self, mut state: Value, event: &DomainEvent) -> Value {
        let timestamp = json!(event.timestamp.to_rfc3339());
        if state["startedAt"].is_null() {
            state["startedAt"] = timestamp.clone();
        }
        state["lastActivityAt"] = timestamp;

        if let Some(step) = event.payload.get("step").and_then(Value::as_str) {
            let status = match event.event_type.as_str() {
                "WORKFLOW.STEP.STARTED" => Some("running"),
                "WORKFLOW.STEP.COMPLETED" => event
                    .payload
                    .get("outcome")
                    .and_then(Value::as_str)
                    .or(Some("completed")),
                _ => None,
            };
            if let Some(status) = status {
                if let Some(steps) = state["steps"].as_object_mut() {
                    steps.insert(step.to_string(), json!(status));
                }
            }
        }

        bump(&mut state, event);
        state
    }
}

fn bump(state: &mut Value, event: &DomainEvent) {
    let count = state["eventCount"].as_i64().unwrap_or(0);
    state["eventCount"] = json!(count + 1);
    state["lastEventType"] = json!(event.event_type);
}

/// The default view set registered at startup.
pub fn default_views() -> Vec<std::sync::Arc<dyn Projection>> {
    vec![
        std::sync::Arc::new(IssueStatusView),
        std::sync::Arc::new(PrStateView),
        std::sync::Arc::new(WorkflowRunView),
    ]
}
