//! Represents the metadata recorded for one upload request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata persisted for a single `POST /upload` request.
///
/// One record aggregates every file sent in the request. `image_path` and
/// `storage_keys` are parallel: entry `i` of each describes the same object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    /// Record identifier, generated at upload time.
    pub id: Uuid,

    /// Addressable locations of the stored objects, in upload order.
    pub image_path: Vec<String>,

    /// Object storage keys, in upload order.
    #[serde(default)]
    pub storage_keys: Vec<String>,

    /// When the upload was recorded. Never changes afterwards.
    pub uploaded_at: DateTime<Utc>,
}

impl UploadRecord {
    /// Build a fresh record from the objects stored for one request.
    pub fn new(objects: &[StoredObject]) -> Self {
        Self {
            id: Uuid::new_v4(),
            image_path: objects.iter().map(|o| o.location.clone()).collect(),
            storage_keys: objects.iter().map(|o| o.key.clone()).collect(),
            uploaded_at: Utc::now(),
        }
    }

    /// Storage key of the first object in the record.
    ///
    /// Older records only carry locations; for those the key is recovered
    /// from the last path segment of the first location.
    pub fn primary_key(&self) -> Option<String> {
        if let Some(key) = self.storage_keys.first() {
            return Some(key.clone());
        }
        self.image_path
            .first()
            .and_then(|location| key_from_location(location))
    }

    /// All storage keys referenced by the record, falling back to the
    /// locations for older records.
    pub fn all_keys(&self) -> Vec<String> {
        if !self.storage_keys.is_empty() {
            return self.storage_keys.clone();
        }
        self.image_path
            .iter()
            .filter_map(|location| key_from_location(location))
            .collect()
    }
}

/// Partial update applied to an existing record.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecordPatch {
    pub image_path: Option<Vec<String>>,
    pub storage_keys: Option<Vec<String>>,
}

impl UploadRecordPatch {
    pub fn apply(self, record: &mut UploadRecord) {
        if let Some(image_path) = self.image_path {
            record.image_path = image_path;
        }
        if let Some(storage_keys) = self.storage_keys {
            record.storage_keys = storage_keys;
        }
    }
}

/// An object written to storage: its key and where it can be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub location: String,
}

/// Recover a storage key from a stored location (URL or plain key).
///
/// Takes the final non-empty path segment, ignoring query string and fragment.
pub fn key_from_location(location: &str) -> Option<String> {
    let path = location
        .split(['?', '#'])
        .next()
        .unwrap_or(location)
        .trim_end_matches('/');
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}
