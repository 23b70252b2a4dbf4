//! Single-writer file backend.
//!
//! Layout under the data directory:
//!
//! ```text
//! events.ndjson        append-only, one JSON event per line
//! blobs/<id>           blob content
//! blobs/<id>.json      blob metadata
//! projections.json     all projection records, rewritten atomically
//! ```
//!
//! The whole log is held in memory alongside the file, so reads never
//! touch disk. One process owns the directory; the writer lock only
//! serializes threads within that process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{EventFilter, EventPage, StorageBackend, StoreStats};
use crate::blobs::BlobRecord;
use crate::error::{ChronicleError, ErrorCode, Result};
use crate::events::envelope::{DomainEvent, EventId};
use crate::projections::ProjectionRecord;

const EVENT_LOG: &str = "events.ndjson";
const BLOB_DIR: &str = "blobs";
const PROJECTIONS_FILE: &str = "projections.json";

pub struct FileBackend {
    root: PathBuf,
    /// Append handle for the event log. Guarded separately from the
    /// in-memory copy so readers never wait on disk.
    log: Mutex<File>,
    events: RwLock<Vec<DomainEvent>>,
    projections: RwLock<HashMap<String, ProjectionRecord>>,
}

impl FileBackend {
    /// Open (or create) the data directory and load the existing log.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        fs::create_dir_all(root.join(BLOB_DIR))?;

        let log_path = root.join(EVENT_LOG);
        let events = if log_path.exists() {
            load_event_log(&log_path)?
        } else {
            Vec::new()
        };

        let projections_path = root.join(PROJECTIONS_FILE);
        let projections = if projections_path.exists() {
            let raw = fs::read_to_string(&projections_path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        info!(
            root = %root.display(),
            events = events.len(),
            "file backend opened"
        );

        Ok(Self {
            root: root.to_path_buf(),
            log: Mutex::new(log),
            events: RwLock::new(events),
            projections: RwLock::new(projections),
        })
    }

    fn blob_data_path(&self, blob_id: &str) -> PathBuf {
        self.root.join(BLOB_DIR).join(blob_id)
    }

    fn blob_meta_path(&self, blob_id: &str) -> PathBuf {
        self.root.join(BLOB_DIR).join(format!("{}.json", blob_id))
    }

    /// Lines are serialized outside the lock; the lock covers only the
    /// write + flush so a batch lands contiguously and atomically with
    /// respect to other writers in this process.
    fn append_lines(&self, events: &[DomainEvent]) -> Result<()> {
        let mut buffer = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buffer, event)?;
            buffer.push(b'\n');
        }

        {
            let mut log = self.log.lock();
            log.write_all(&buffer)?;
            log.flush()?;
        }

        self.events.write().extend_from_slice(events);
        Ok(())
    }

    fn persist_projections(&self, snapshot: &HashMap<String, ProjectionRecord>) -> Result<()> {
        let path = self.root.join(PROJECTIONS_FILE);
        let tmp = self.root.join(format!("{}.tmp", PROJECTIONS_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn load_event_log(path: &Path) -> Result<Vec<DomainEvent>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DomainEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                // a torn final line from a crash is tolerated; anything
                // mid-file is corruption
                warn!(line = line_no + 1, error = %e, "skipping unreadable event log line");
            }
        }
    }
    Ok(events)
}

fn projection_key(name: &str, entity_id: &str) -> String {
    format!("{}::{}", name, entity_id)
}

fn blob_id_is_safe(blob_id: &str) -> bool {
    !blob_id.is_empty() && blob_id.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn append_event(&self, event: &DomainEvent) -> Result<()> {
        self.append_lines(std::slice::from_ref(event))
    }

    async fn append_events(&self, events: &[DomainEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.append_lines(events)
    }

    async fn get_event(&self, id: EventId) -> Result<Option<DomainEvent>> {
        Ok(self.events.read().iter().find(|e| e.id == id).cloned())
    }

    async fn query_events(
        &self,
        filter: &EventFilter,
        limit: u32,
        offset: u64,
    ) -> Result<EventPage> {
        let events = self.events.read();
        let mut matching: Vec<&DomainEvent> = events.iter().filter(|e| filter.matches(e)).collect();
        matching.sort_by_key(|e| e.id);

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();

        Ok(EventPage { events: page, total })
    }

    fn stream_events(&self, filter: EventFilter) -> BoxStream<'static, Result<DomainEvent>> {
        let mut matching: Vec<DomainEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.id);
        Box::pin(futures::stream::iter(matching.into_iter().map(Ok)))
    }

    async fn prune_events_before(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.write();
        let before = events.len();
        let retained: Vec<DomainEvent> = events
            .iter()
            .filter(|e| e.timestamp >= horizon)
            .cloned()
            .collect();
        let removed = (before - retained.len()) as u64;
        if removed == 0 {
            return Ok(0);
        }

        // rewrite the log under both locks so no append interleaves
        let mut log = self.log.lock();
        let tmp = self.root.join(format!("{}.tmp", EVENT_LOG));
        {
            let mut file = File::create(&tmp)?;
            for event in &retained {
                serde_json::to_writer(&mut file, event)?;
                file.write_all(b"\n")?;
            }
            file.flush()?;
        }
        fs::rename(&tmp, self.root.join(EVENT_LOG))?;
        *log = OpenOptions::new()
            .append(true)
            .open(self.root.join(EVENT_LOG))?;
        *events = retained;

        Ok(removed)
    }

    async fn put_blob(&self, blob: &BlobRecord) -> Result<()> {
        if !blob_id_is_safe(&blob.id) {
            return Err(ChronicleError::new(
                ErrorCode::InvalidInput,
                format!("blob id is not a hex digest: {}", blob.id),
            ));
        }
        fs::write(self.blob_data_path(&blob.id), &blob.data)?;
        fs::write(
            self.blob_meta_path(&blob.id),
            serde_json::to_vec_pretty(blob)?,
        )?;
        Ok(())
    }

    async fn get_blob(&self, blob_id: &str) -> Result<Option<BlobRecord>> {
        if !blob_id_is_safe(blob_id) {
            return Ok(None);
        }
        let meta_path = self.blob_meta_path(blob_id);
        if !meta_path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&meta_path)?;
        let mut record: BlobRecord = serde_json::from_str(&raw)?;
        record.data = fs::read(self.blob_data_path(blob_id))?;
        Ok(Some(record))
    }

    async fn delete_blob(&self, blob_id: &str) -> Result<bool> {
        if !blob_id_is_safe(blob_id) {
            return Ok(false);
        }
        let meta_path = self.blob_meta_path(blob_id);
        if !meta_path.exists() {
            return Ok(false);
        }
        fs::remove_file(self.blob_data_path(blob_id))?;
        fs::remove_file(meta_path)?;
        Ok(true)
    }

    async fn list_expired_blobs(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut expired = Vec::new();
        for entry in fs::read_dir(self.root.join(BLOB_DIR))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let record: BlobRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable blob metadata");
                    continue;
                }
            };
            if record.expires_at <= now {
                expired.push(record.id);
            }
        }
        Ok(expired)
    }

    async fn load_projection(
        &self,
        name: &str,
        entity_id: &str,
    ) -> Result<Option<ProjectionRecord>> {
        Ok(self
            .projections
            .read()
            .get(&projection_key(name, entity_id))
            .cloned())
    }

    async fn save_projection(&self, record: &ProjectionRecord) -> Result<()> {
        let snapshot = {
            let mut projections = self.projections.write();
            projections.insert(
                projection_key(&record.name, &record.entity_id),
                record.clone(),
            );
            projections.clone()
        };
        self.persist_projections(&snapshot)
    }

    async fn list_projections(&self, name: &str) -> Result<Vec<ProjectionRecord>> {
        let mut records: Vec<ProjectionRecord> = self
            .projections
            .read()
            .values()
            .filter(|r| r.name == name)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(records)
    }

    async fn max_projected_event_id(&self) -> Result<Option<EventId>> {
        Ok(self
            .projections
            .read()
            .values()
            .map(|r| r.last_event_id)
            .max())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let events = self.events.read();
        let mut by_type: HashMap<String, u64> = HashMap::new();
        for event in events.iter() {
            *by_type.entry(event.event_type.clone()).or_insert(0) += 1;
        }

        let mut blob_count = 0u64;
        let mut blob_bytes = 0u64;
        for entry in fs::read_dir(self.root.join(BLOB_DIR))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                continue;
            }
            blob_count += 1;
            blob_bytes += entry.metadata()?.len();
        }

        Ok(StoreStats {
            event_count: events.len() as u64,
            events_by_type: by_type,
            blob_count,
            blob_bytes,
        })
    }

    async fn ping(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(ChronicleError::new(
                ErrorCode::StorageConnectionFailed,
                "data directory is gone",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::envelope::Actor;
    use futures::StreamExt;
    use serde_json::json;
    use tempfile::TempDir;

    fn backend() -> (TempDir, FileBackend) {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        (dir, backend)
    }

    fn event(event_type: &str, tags: &[(&str, &str)]) -> DomainEvent {
        DomainEvent {
            id: EventId::new(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            schema_version: 1,
            actor: Actor::user("alice"),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            payload: json!({"x": 1}),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_get() {
        let (_dir, backend) = backend();
        let e = event("ISSUE.SELECTED", &[("issueId", "42")]);
        backend.append_event(&e).await.unwrap();

        let loaded = backend.get_event(e.id).await.unwrap().unwrap();
        assert_eq!(loaded, e);
    }

    #[tokio::test]
    async fn test_log_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let e = event("ISSUE.SELECTED", &[]);
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.append_event(&e).await.unwrap();
        }

        let reopened = FileBackend::open(dir.path()).unwrap();
        let loaded = reopened.get_event(e.id).await.unwrap().unwrap();
        assert_eq!(loaded, e);
    }

    #[tokio::test]
    async fn test_query_orders_by_id_ascending() {
        let (_dir, backend) = backend();
        let a = event("A.ONE", &[]);
        let b = event("B.TWO", &[]);
        let c = event("C.THREE", &[]);
        // append out of order on purpose
        backend.append_event(&c).await.unwrap();
        backend.append_event(&a).await.unwrap();
        backend.append_event(&b).await.unwrap();

        let page = backend
            .query_events(&EventFilter::default(), 10, 0)
            .await
            .unwrap();
        let mut ids: Vec<EventId> = page.events.iter().map(|e| e.id).collect();
        let sorted = {
            let mut s = ids.clone();
            s.sort();
            s
        };
        assert_eq!(ids, sorted);
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn test_query_filters_by_tag_and_paginates() {
        let (_dir, backend) = backend();
        for i in 0..5 {
            let issue = if i % 2 == 0 { "42" } else { "7" };
            backend
                .append_event(&event("ISSUE.SELECTED", &[("issueId", issue)]))
                .await
                .unwrap();
        }

        let mut filter = EventFilter::default();
        filter.tags.insert("issueId".into(), "42".into());

        let page = backend.query_events(&filter, 2, 0).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.events.len(), 2);

        let rest = backend.query_events(&filter, 2, 2).await.unwrap();
        assert_eq!(rest.events.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_is_chronological_and_finite() {
        let (_dir, backend) = backend();
        for _ in 0..10 {
            backend.append_event(&event("TICK.TOCK", &[])).await.unwrap();
        }

        let events: Vec<DomainEvent> = backend
            .stream_events(EventFilter::default())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(events.len(), 10);
        for pair in events.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[tokio::test]
    async fn test_batch_append_is_all_or_nothing_on_disk() {
        let (_dir, backend) = backend();
        let batch = vec![event("A.A", &[]), event("B.B", &[]), event("C.C", &[])];
        backend.append_events(&batch).await.unwrap();

        let page = backend
            .query_events(&EventFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn test_blob_round_trip_and_delete() {
        let (_dir, backend) = backend();
        let blob = BlobRecord {
            id: crate::blobs::content_address(b"diff content"),
            content_type: "text/x-diff".into(),
            size_bytes: 12,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(1),
            data: b"diff content".to_vec(),
        };
        backend.put_blob(&blob).await.unwrap();

        let loaded = backend.get_blob(&blob.id).await.unwrap().unwrap();
        assert_eq!(loaded.data, b"diff content");
        assert_eq!(loaded.content_type, "text/x-diff");

        assert!(backend.delete_blob(&blob.id).await.unwrap());
        assert!(backend.get_blob(&blob.id).await.unwrap().is_none());
        assert!(!backend.delete_blob(&blob.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_blobs_listed_but_still_readable() {
        let (_dir, backend) = backend();
        let blob = BlobRecord {
            id: crate::blobs::content_address(b"old"),
            content_type: "text/plain".into(),
            size_bytes: 3,
            created_at: Utc::now() - chrono::Duration::days(10),
            expires_at: Utc::now() - chrono::Duration::days(1),
            data: b"old".to_vec(),
        };
        backend.put_blob(&blob).await.unwrap();

        // expiry gates deletion, not access
        assert!(backend.get_blob(&blob.id).await.unwrap().is_some());

        let expired = backend.list_expired_blobs(Utc::now()).await.unwrap();
        assert_eq!(expired, vec![blob.id]);
    }

    #[tokio::test]
    async fn test_unsafe_blob_id_rejected() {
        let (_dir, backend) = backend();
        let blob = BlobRecord {
            id: "../escape".into(),
            content_type: "text/plain".into(),
            size_bytes: 1,
            created_at: Utc::now(),
            expires_at: Utc::now(),
            data: vec![1],
        };
        assert!(backend.put_blob(&blob).await.is_err());
        assert!(backend.get_blob("../escape").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_projection_round_trip_and_reopen() {
        let dir = TempDir::new().unwrap();
        let record = ProjectionRecord {
            name: "issue-status".into(),
            entity_id: "42".into(),
            state: json!({"status": "selected"}),
            last_event_id: EventId::new(),
            updated_at: Utc::now(),
        };
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.save_projection(&record).await.unwrap();
        }

        let reopened = FileBackend::open(dir.path()).unwrap();
        let loaded = reopened
            .load_projection("issue-status", "42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.state, record.state);
        assert_eq!(loaded.last_event_id, record.last_event_id);
    }

    #[tokio::test]
    async fn test_prune_events_before_horizon() {
        let (_dir, backend) = backend();
        let mut old = event("OLD.EVENT", &[]);
        old.timestamp = Utc::now() - chrono::Duration::days(400);
        let fresh = event("FRESH.EVENT", &[]);
        backend.append_event(&old).await.unwrap();
        backend.append_event(&fresh).await.unwrap();

        let removed = backend
            .prune_events_before(Utc::now() - chrono::Duration::days(365))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let page = backend
            .query_events(&EventFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].event_type, "FRESH.EVENT");
    }

    #[tokio::test]
    async fn test_stats_counts_by_type() {
        let (_dir, backend) = backend();
        backend.append_event(&event("A.A", &[])).await.unwrap();
        backend.append_event(&event("A.A", &[])).await.unwrap();
        backend.append_event(&event("B.B", &[])).await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.event_count, 3);
        assert_eq!(stats.events_by_type["A.A"], 2);
        assert_eq!(stats.events_by_type["B.B"], 1);
    }

    #[test]
    fn test_torn_final_line_tolerated() {
        let dir = TempDir::new().unwrap();
        let e = event("GOOD.LINE", &[]);
        let mut raw = serde_json::to_string(&e).unwrap();
        raw.push('\n');
        raw.push_str("{\"truncated\": ");
        fs::write(dir.path().join(EVENT_LOG), raw).unwrap();

        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.events.read().len(), 1);
    }
}
