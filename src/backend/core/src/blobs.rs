//! Content-addressable blob storage.
//!
//! Large artifacts (diffs, AI request/response bodies, build logs) live
//! here; events carry only the blob id. The id is the SHA-256 of the
//! masked content, so identical artifacts deduplicate and an id can be
//! verified against what it names. Masking happens before hashing, which
//! means secrets never reach disk under any address.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::masking::SecretMasker;
use crate::observability::metrics;
use crate::storage::StorageBackend;

/// A stored blob. `data` is not serialized with the metadata; each
/// backend persists content its own way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRecord {
    /// Lowercase hex SHA-256 of the content.
    pub id: String,

    pub content_type: String,

    pub size_bytes: u64,

    pub created_at: DateTime<Utc>,

    /// Eligibility for the retention sweep. Expiry never gates reads; a
    /// blob stays retrievable until the sweep actually removes it.
    pub expires_at: DateTime<Utc>,

    #[serde(skip)]
    pub data: Vec<u8>,
}

/// Compute the content address for already-masked bytes.
pub fn content_address(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// The blob store service.
pub struct BlobStore {
    backend: Arc<dyn StorageBackend>,
    masker: Arc<SecretMasker>,
    ttl: Duration,
}

impl BlobStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        masker: Arc<SecretMasker>,
        ttl: std::time::Duration,
    ) -> Self {
        Self {
            backend,
            masker,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(90)),
        }
    }

    /// Mask, address, and persist content. Returns the blob id.
    ///
    /// Storing identical content twice is a no-op returning the same id.
    #[instrument(skip(self, data), fields(content_type = %content_type, raw_bytes = data.len()))]
    pub async fn store(&self, data: &[u8], content_type: &str) -> Result<String> {
        let masked = self.masker.mask_bytes(data);
        let id = content_address(&masked);

        if self.backend.get_blob(&id).await?.is_some() {
            debug!(blob_id = %id, "blob already stored, deduplicating");
            return Ok(id);
        }

        let now = Utc::now();
        let record = BlobRecord {
            id: id.clone(),
            content_type: content_type.to_string(),
            size_bytes: masked.len() as u64,
            created_at: now,
            expires_at: now + self.ttl,
            data: masked,
        };

        self.backend.put_blob(&record).await?;
        metrics::record_blob_stored(record.size_bytes);
        debug!(blob_id = %id, size_bytes = record.size_bytes, "blob stored");
        Ok(id)
    }

    /// Fetch a blob by id. Expired-but-unswept blobs are still returned.
    pub async fn retrieve(&self, blob_id: &str) -> Result<Option<BlobRecord>> {
        self.backend.get_blob(blob_id).await
    }

    /// Remove every blob whose expiry has passed. Returns the count
    /// removed. This is the only deletion path.
    #[instrument(skip(self))]
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired = self.backend.list_expired_blobs(now).await?;
        let mut pruned = 0u64;
        for blob_id in expired {
            if self.backend.delete_blob(&blob_id).await? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            metrics::record_blobs_pruned(pruned);
            info!(pruned, "retention sweep removed expired blobs");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_address_is_sha256_hex() {
        let id = content_address(b"hello");
        assert_eq!(id.len(), 64);
        assert_eq!(
            id,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_identical_content_same_address() {
        assert_eq!(content_address(b"same"), content_address(b"same"));
        assert_ne!(content_address(b"same"), content_address(b"different"));
    }
}
