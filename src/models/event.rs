//! Events announced on the notification topic.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::upload::UploadRecord;

/// Payload published after an upload or a delete completes.
///
/// Serialized as a flat JSON object tagged by `eventType`.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "eventType")]
pub enum FileEvent {
    #[serde(rename = "file.uploaded", rename_all = "camelCase")]
    Uploaded {
        file_id: Uuid,
        s3_keys: Vec<String>,
        uploaded_at: DateTime<Utc>,
    },

    #[serde(rename = "file.deleted", rename_all = "camelCase")]
    Deleted {
        file_id: Uuid,
        s3_key: String,
        s3_keys: Vec<String>,
        deleted_at: DateTime<Utc>,
        /// The record as it was before deletion.
        metadata: UploadRecord,
    },
}

impl FileEvent {
    pub fn uploaded(record: &UploadRecord) -> Self {
        Self::Uploaded {
            file_id: record.id,
            s3_keys: record.storage_keys.clone(),
            uploaded_at: record.uploaded_at,
        }
    }

    pub fn deleted(record: UploadRecord, keys: Vec<String>) -> Self {
        let s3_key = keys.first().cloned().unwrap_or_default();
        Self::Deleted {
            file_id: record.id,
            s3_key,
            s3_keys: keys,
            deleted_at: Utc::now(),
            metadata: record,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Uploaded { .. } => "file.uploaded",
            Self::Deleted { .. } => "file.deleted",
        }
    }

    pub fn file_id(&self) -> Uuid {
        match self {
            Self::Uploaded { file_id, .. } | Self::Deleted { file_id, .. } => *file_id,
        }
    }

    /// JSON-encode the event for publishing.
    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}
