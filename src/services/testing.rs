//! In-memory adapters for tests.

use crate::{
    models::upload::{StoredObject, UploadRecord, UploadRecordPatch},
    services::{
        event_publisher::{EventPublisher, PublishError, PublishResult},
        metadata_store::{MetadataError, MetadataResult, MetadataStore, SqliteMetadataStore},
        object_storage::{
            ObjectBody, ObjectStorage, ObjectStorageError, ObjectStorageResult, collect_body,
        },
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use reqwest::StatusCode;
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;

/// SQLite metadata store on a private in-memory database.
pub async fn memory_metadata_store() -> SqliteMetadataStore {
    // one connection: every in-memory connection is its own database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteMetadataStore::new(Arc::new(pool), "s3_image_info").unwrap();
    store.ensure_schema().await.unwrap();
    store
}

/// A body that yields `data` in one chunk.
pub fn object_body(data: &'static [u8]) -> ObjectBody<'static> {
    stream::once(async move { Ok(Bytes::from_static(data)) }).boxed()
}

/// Object storage kept in a map. Presigned links look like
/// `memory://uploads/{key}?expires_in={secs}`.
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<HashMap<String, (Option<String>, Bytes)>>,
    puts_before_failure: Mutex<Option<usize>>,
    fail_deletes: AtomicBool,
}

impl MemoryObjectStorage {
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).map(|(_, data)| data.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .and_then(|(content_type, _)| content_type.clone())
    }

    /// Let `n` more puts succeed, then fail every following one.
    pub fn fail_puts_after(&self, n: usize) {
        *self.puts_before_failure.lock().unwrap() = Some(n);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put_object(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: ObjectBody<'_>,
    ) -> ObjectStorageResult<StoredObject> {
        if let Some(remaining) = self.puts_before_failure.lock().unwrap().as_mut() {
            if *remaining == 0 {
                return Err(ObjectStorageError::Io(io::Error::other("injected put failure")));
            }
            *remaining -= 1;
        }
        let data = collect_body(body).await?;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (content_type.map(str::to_string), data));
        Ok(StoredObject {
            key: key.to_string(),
            location: format!("memory://uploads/{}", key),
        })
    }

    async fn presigned_get_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> ObjectStorageResult<String> {
        Ok(format!(
            "memory://uploads/{}?expires_in={}",
            key,
            expires_in.as_secs()
        ))
    }

    async fn delete_object(&self, key: &str) -> ObjectStorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ObjectStorageError::S3 {
                operation: "DeleteObject",
                message: "injected delete failure".into(),
            });
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn health_check(&self) -> ObjectStorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

pub type PublishedMessage = (String, Bytes, BTreeMap<String, String>);

/// Publisher that records every message it is handed.
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<PublishedMessage>>,
    failures: AtomicUsize,
}

impl RecordingPublisher {
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Reject the next publish call.
    pub fn fail_next(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        attributes: BTreeMap<String, String>,
    ) -> PublishResult<()> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(PublishError::Rejected {
                topic: topic.to_string(),
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "injected publish failure".into(),
            });
        }
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), payload, attributes));
        Ok(())
    }
}

/// Metadata store whose every call fails as if the database were gone.
pub struct BrokenMetadataStore;

#[async_trait]
impl MetadataStore for BrokenMetadataStore {
    async fn insert(&self, _record: &UploadRecord) -> MetadataResult<()> {
        Err(MetadataError::Sqlx(sqlx::Error::PoolClosed))
    }

    async fn get_by_id(&self, _id: Uuid) -> MetadataResult<Option<UploadRecord>> {
        Err(MetadataError::Sqlx(sqlx::Error::PoolClosed))
    }

    async fn list_all(&self) -> MetadataResult<Vec<UploadRecord>> {
        Err(MetadataError::Sqlx(sqlx::Error::PoolClosed))
    }

    async fn delete_by_id(&self, _id: Uuid) -> MetadataResult<bool> {
        Err(MetadataError::Sqlx(sqlx::Error::PoolClosed))
    }

    async fn update(
        &self,
        _id: Uuid,
        _patch: UploadRecordPatch,
    ) -> MetadataResult<Option<UploadRecord>> {
        Err(MetadataError::Sqlx(sqlx::Error::PoolClosed))
    }

    async fn ping(&self) -> MetadataResult<()> {
        Err(MetadataError::Sqlx(sqlx::Error::PoolClosed))
    }
}
