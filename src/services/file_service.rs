//! FileService — request-scoped orchestration of uploads, lookups and
//! deletes over the three adapters (object storage, metadata store, event
//! topic). Steps run strictly in sequence; nothing is shared between
//! requests except the adapter clients.

use crate::{
    models::{
        event::FileEvent,
        upload::{StoredObject, UploadRecord},
    },
    services::{
        event_publisher::{EventPublisher, PublishError},
        metadata_store::{MetadataError, MetadataStore},
        object_storage::{ObjectBody, ObjectStorage, ObjectStorageError, generate_object_key},
    },
};
use std::{collections::BTreeMap, mem, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a failure is reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ClientInput,
    NotFound,
    Dependency,
}

#[derive(Debug, Error)]
pub enum FileServiceError {
    #[error("no files uploaded")]
    NoFiles,
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("file `{0}` has no stored object")]
    MissingObject(Uuid),
    #[error(transparent)]
    Storage(#[from] ObjectStorageError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl FileServiceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NoFiles => FailureKind::ClientInput,
            Self::NotFound(_) | Self::MissingObject(_) => FailureKind::NotFound,
            Self::Storage(_) | Self::Metadata(_) | Self::Publish(_) => FailureKind::Dependency,
        }
    }
}

pub type FileServiceResult<T> = Result<T, FileServiceError>;

/// Topic that upload and delete events are announced on.
#[derive(Clone)]
pub struct EventSink {
    publisher: Arc<dyn EventPublisher>,
    topic: String,
}

impl EventSink {
    pub fn new(publisher: Arc<dyn EventPublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }
}

#[derive(Clone)]
pub struct FileService {
    objects: Arc<dyn ObjectStorage>,
    metadata: Arc<dyn MetadataStore>,
    events: Option<EventSink>,
    presign_expiry: Duration,
}

impl FileService {
    pub fn new(
        objects: Arc<dyn ObjectStorage>,
        metadata: Arc<dyn MetadataStore>,
        events: Option<EventSink>,
        presign_expiry: Duration,
    ) -> Self {
        Self {
            objects,
            metadata,
            events,
            presign_expiry,
        }
    }

    /// Start an upload. Files are streamed into storage one at a time with
    /// [`UploadBatch::store`] and recorded together by [`UploadBatch::finish`].
    pub fn begin_upload(&self) -> UploadBatch {
        UploadBatch {
            service: self.clone(),
            stored: Vec::new(),
        }
    }

    pub async fn list(&self) -> FileServiceResult<Vec<UploadRecord>> {
        Ok(self.metadata.list_all().await?)
    }

    pub async fn get(&self, id: &str) -> FileServiceResult<UploadRecord> {
        let uuid = parse_id(id)?;
        self.metadata
            .get_by_id(uuid)
            .await?
            .ok_or_else(|| FileServiceError::NotFound(id.to_string()))
    }

    /// Time-limited read link for the first object of a record.
    pub async fn presigned_url(&self, id: &str) -> FileServiceResult<String> {
        let record = self.get(id).await?;
        let key = record
            .primary_key()
            .ok_or(FileServiceError::MissingObject(record.id))?;

        Ok(self
            .objects
            .presigned_get_url(&key, self.presign_expiry)
            .await?)
    }

    /// Delete the record's objects, then the record, then announce it.
    ///
    /// Returns the record as it was before deletion. Missing objects are
    /// not an error, so a retry after a partial failure completes the job.
    pub async fn delete(&self, id: &str) -> FileServiceResult<UploadRecord> {
        let record = self.get(id).await?;
        let keys = record.all_keys();
        if keys.is_empty() {
            return Err(FileServiceError::MissingObject(record.id));
        }

        for key in &keys {
            self.objects.delete_object(key).await?;
        }

        if !self.metadata.delete_by_id(record.id).await? {
            debug!(file_id = %record.id, "record already removed by a concurrent request");
        }
        info!(file_id = %record.id, objects = keys.len(), "file deleted");

        self.announce(FileEvent::deleted(record.clone(), keys))
            .await?;
        Ok(record)
    }

    pub async fn check_metadata(&self) -> FileServiceResult<()> {
        Ok(self.metadata.ping().await?)
    }

    pub async fn check_storage(&self) -> FileServiceResult<()> {
        Ok(self.objects.health_check().await?)
    }

    pub fn storage_backend(&self) -> &'static str {
        self.objects.backend_name()
    }

    /// Publish `event` once. Failures are logged and returned; earlier
    /// steps are not rolled back.
    async fn announce(&self, event: FileEvent) -> FileServiceResult<()> {
        let Some(sink) = &self.events else {
            debug!(event = event.event_type(), "no event topic configured, skipping publish");
            return Ok(());
        };

        let payload = event.to_payload().map_err(PublishError::from)?;
        let attributes = BTreeMap::from([
            ("eventType".to_string(), event.event_type().to_string()),
            ("fileId".to_string(), event.file_id().to_string()),
        ]);

        if let Err(err) = sink.publisher.publish(&sink.topic, payload, attributes).await {
            error!(
                topic = %sink.topic,
                event = event.event_type(),
                file_id = %event.file_id(),
                "failed to publish event: {}",
                err
            );
            return Err(err.into());
        }
        Ok(())
    }

    async fn discard_objects(&self, objects: &[StoredObject]) {
        for object in objects {
            if let Err(err) = self.objects.delete_object(&object.key).await {
                warn!(key = %object.key, "failed to remove orphaned object: {}", err);
            }
        }
    }
}

/// Objects written so far by one upload request.
///
/// Objects are removed again if the batch fails, is aborted, or is
/// dropped before [`UploadBatch::finish`] records them.
pub struct UploadBatch {
    service: FileService,
    stored: Vec<StoredObject>,
}

impl UploadBatch {
    /// Stream one file into storage under a freshly generated key.
    ///
    /// On failure every object of the batch is removed before the error
    /// is returned.
    pub async fn store(
        &mut self,
        file_name: &str,
        content_type: Option<&str>,
        body: ObjectBody<'_>,
    ) -> FileServiceResult<()> {
        let key = generate_object_key(file_name);
        debug!(key = %key, original = %file_name, "storing file");
        match self.service.objects.put_object(&key, content_type, body).await {
            Ok(object) => {
                self.stored.push(object);
                Ok(())
            }
            Err(err) => {
                self.discard().await;
                Err(err.into())
            }
        }
    }

    /// Record every stored file under one new id and announce the upload.
    pub async fn finish(mut self) -> FileServiceResult<UploadRecord> {
        if self.stored.is_empty() {
            return Err(FileServiceError::NoFiles);
        }

        let record = UploadRecord::new(&self.stored);
        if let Err(err) = self.service.metadata.insert(&record).await {
            self.discard().await;
            return Err(err.into());
        }
        let stored = mem::take(&mut self.stored);
        info!(file_id = %record.id, files = stored.len(), "upload recorded");

        self.service.announce(FileEvent::uploaded(&record)).await?;
        Ok(record)
    }

    /// Give up on the upload and remove what was already written.
    pub async fn abort(mut self) {
        self.discard().await;
    }

    async fn discard(&mut self) {
        let stored = mem::take(&mut self.stored);
        self.service.discard_objects(&stored).await;
    }
}

impl Drop for UploadBatch {
    fn drop(&mut self) {
        if self.stored.is_empty() {
            return;
        }
        let stored = mem::take(&mut self.stored);
        let service = self.service.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { service.discard_objects(&stored).await });
            }
            Err(_) => warn!(objects = stored.len(), "upload abandoned, objects left behind"),
        }
    }
}

/// Ids that are not UUIDs cannot exist in the store.
fn parse_id(id: &str) -> FileServiceResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| FileServiceError::NotFound(id.to_string()))
}
