//! Asynchronous event export.
//!
//! Elevated callers can request a bundle of matching events for audit
//! hand-off. The job runs in the background; the bundle carries a
//! manifest (filter, generation time, event count) so the artifact is
//! self-describing once it leaves the system.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::TryStreamExt;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::error::{ChronicleError, ErrorCode, Result};
use crate::events::envelope::DomainEvent;
use crate::query::Caller;
use crate::storage::{EventFilter, StorageBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportRequest {
    #[serde(default)]
    pub filter: EventFilter,
    pub format: ExportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportState {
    Running,
    Completed,
    Failed,
}

/// Job metadata returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub id: Uuid,
    pub state: ExportState,
    pub format: ExportFormat,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct JobEntry {
    job: ExportJob,
    bundle: Option<Vec<u8>>,
}

pub struct ExportService {
    backend: Arc<dyn StorageBackend>,
    jobs: Arc<DashMap<Uuid, JobEntry>>,
}

impl ExportService {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            jobs: Arc::new(DashMap::new()),
        }
    }

    /// Start an export job. Elevated role required.
    #[instrument(skip(self, caller, request), fields(caller = %caller.id))]
    pub fn start(&self, caller: &Caller, request: ExportRequest) -> Result<ExportJob> {
        if !caller.is_elevated() {
            return Err(ChronicleError::forbidden(
                "export requires the elevated role",
            ));
        }

        let job = ExportJob {
            id: Uuid::new_v4(),
            state: ExportState::Running,
            format: request.format,
            requested_by: caller.id.clone(),
            created_at: Utc::now(),
            event_count: None,
            error: None,
        };
        self.jobs.insert(
            job.id,
            JobEntry {
                job: job.clone(),
                bundle: None,
            },
        );
        gauge!("chronicle_export_jobs_active").increment(1.0);

        let backend = Arc::clone(&self.backend);
        let jobs = Arc::clone(&self.jobs);
        let job_id = job.id;
        tokio::spawn(async move {
            let outcome = build_bundle(&backend, &request).await;
            gauge!("chronicle_export_jobs_active").decrement(1.0);
            if let Some(mut entry) = jobs.get_mut(&job_id) {
                match outcome {
                    Ok((count, bundle)) => {
                        entry.job.state = ExportState::Completed;
                        entry.job.event_count = Some(count);
                        entry.bundle = Some(bundle);
                        info!(job_id = %job_id, events = count, "export completed");
                    }
                    Err(e) => {
                        entry.job.state = ExportState::Failed;
                        entry.job.error = Some(e.user_message().to_string());
                        error!(job_id = %job_id, error = %e, "export failed");
                    }
                }
            }
        });

        Ok(job)
    }

    pub fn get(&self, caller: &Caller, job_id: Uuid) -> Result<ExportJob> {
        if !caller.is_elevated() {
            return Err(ChronicleError::forbidden(
                "export requires the elevated role",
            ));
        }
        self.jobs
            .get(&job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| {
                ChronicleError::new(
                    ErrorCode::ExportJobNotFound,
                    format!("export job not found: {}", job_id),
                )
            })
    }

    /// The finished bundle. Running jobs are reported as such rather
    /// than returning partial content.
    pub fn download(&self, caller: &Caller, job_id: Uuid) -> Result<(ExportFormat, Vec<u8>)> {
        let job = self.get(caller, job_id)?;
        match job.state {
            ExportState::Completed => {
                let entry = self.jobs.get(&job_id).ok_or_else(|| {
                    ChronicleError::new(
                        ErrorCode::ExportJobNotFound,
                        format!("export job not found: {}", job_id),
                    )
                })?;
                let bundle = entry.bundle.clone().ok_or_else(|| {
                    ChronicleError::internal("completed export job has no bundle")
                })?;
                Ok((job.format, bundle))
            }
            ExportState::Running => Err(ChronicleError::new(
                ErrorCode::InvalidInput,
                "export job is still running",
            )),
            ExportState::Failed => Err(ChronicleError::internal(
                job.error.unwrap_or_else(|| "export job failed".to_string()),
            )),
        }
    }
}

async fn build_bundle(
    backend: &Arc<dyn StorageBackend>,
    request: &ExportRequest,
) -> Result<(u64, Vec<u8>)> {
    let events: Vec<DomainEvent> = backend
        .stream_events(request.filter.clone())
        .try_collect()
        .await?;
    let count = events.len() as u64;

    let bundle = match request.format {
        ExportFormat::Json => render_json(&request.filter, &events)?,
        ExportFormat::Csv => render_csv(&request.filter, &events)?,
    };
    Ok((count, bundle))
}

fn render_json(filter: &EventFilter, events: &[DomainEvent]) -> Result<Vec<u8>> {
    let bundle = serde_json::json!({
        "manifest": {
            "filter": filter,
            "generatedAt": Utc::now(),
            "eventCount": events.len(),
        },
        "events": events,
    });
    Ok(serde_json::to_vec_pretty(&bundle)?)
}

fn render_csv(filter: &EventFilter, events: &[DomainEvent]) -> Result<Vec<u8>> {
    let mut out = String::new();
    out.push_str(&format!(
        "# chronicle export, generated {}, {} event(s)\n",
        Utc::now().to_rfc3339(),
        events.len()
    ));
    out.push_str(&format!(
        "# filter: {}\n",
        serde_json::to_string(filter)?
    ));
    out.push_str("id,event_type,timestamp,schema_version,actor_kind,actor_id,tags,payload\n");
    for event in events {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{}\n",
            event.id,
            csv_escape(&event.event_type),
            event.timestamp.to_rfc3339(),
            event.schema_version,
            event.actor.kind,
            csv_escape(&event.actor.id),
            csv_escape(&serde_json::to_string(&event.tags)?),
            csv_escape(&serde_json::to_string(&event.payload)?),
        ));
    }
    Ok(out.into_bytes())
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::envelope::{Actor, EventId};
    use crate::storage::file::FileBackend;
    use serde_json::json;
    use tempfile::TempDir;

    fn service() -> (TempDir, ExportService, Arc<dyn StorageBackend>) {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FileBackend::open(dir.path()).unwrap());
        let service = ExportService::new(Arc::clone(&backend));
        (dir, service, backend)
    }

    async fn seed(backend: &Arc<dyn StorageBackend>, n: usize) {
        for i in 0..n {
            backend
                .append_event(&DomainEvent {
                    id: EventId::new(),
                    event_type: "ISSUE.SELECTED".into(),
                    timestamp: Utc::now(),
                    schema_version: 1,
                    actor: Actor::user("alice"),
                    tags: [("issueId".to_string(), i.to_string())].into(),
                    payload: json!({"issueId": i.to_string()}),
                    metadata: None,
                })
                .await
                .unwrap();
        }
    }

    async fn wait_for_completion(service: &ExportService, caller: &Caller, id: Uuid) -> ExportJob {
        for _ in 0..100 {
            let job = service.get(caller, id).unwrap();
            if job.state != ExportState::Running {
                return job;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("export job never finished");
    }

    #[tokio::test]
    async fn test_standard_caller_forbidden() {
        let (_dir, service, _backend) = service();
        let err = service
            .start(
                &Caller::standard("alice"),
                ExportRequest {
                    filter: EventFilter::default(),
                    format: ExportFormat::Json,
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_json_export_carries_manifest() {
        let (_dir, service, backend) = service();
        seed(&backend, 3).await;

        let caller = Caller::elevated("admin");
        let job = service
            .start(
                &caller,
                ExportRequest {
                    filter: EventFilter::default(),
                    format: ExportFormat::Json,
                },
            )
            .unwrap();

        let finished = wait_for_completion(&service, &caller, job.id).await;
        assert_eq!(finished.state, ExportState::Completed);
        assert_eq!(finished.event_count, Some(3));

        let (format, bundle) = service.download(&caller, job.id).unwrap();
        assert_eq!(format, ExportFormat::Json);
        let parsed: serde_json::Value = serde_json::from_slice(&bundle).unwrap();
        assert_eq!(parsed["manifest"]["eventCount"], 3);
        assert_eq!(parsed["events"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_csv_export_has_header_and_rows() {
        let (_dir, service, backend) = service();
        seed(&backend, 2).await;

        let caller = Caller::elevated("admin");
        let job = service
            .start(
                &caller,
                ExportRequest {
                    filter: EventFilter::default(),
                    format: ExportFormat::Csv,
                },
            )
            .unwrap();
        wait_for_completion(&service, &caller, job.id).await;

        let (_, bundle) = service.download(&caller, job.id).unwrap();
        let text = String::from_utf8(bundle).unwrap();
        assert!(text.contains("# chronicle export"));
        assert!(text.contains("id,event_type,timestamp"));
        assert_eq!(text.lines().filter(|l| l.contains("ISSUE.SELECTED")).count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_job_not_found() {
        let (_dir, service, _backend) = service();
        let err = service
            .get(&Caller::elevated("admin"), Uuid::new_v4())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExportJobNotFound);
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
