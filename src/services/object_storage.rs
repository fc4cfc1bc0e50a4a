//! Object storage abstraction shared by the S3 and local disk backends.

use crate::models::upload::StoredObject;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream::BoxStream};
use std::{io, path::Path, time::Duration};
use thiserror::Error;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_EXTENSION_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ObjectStorageError {
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("s3 {operation} failed: {message}")]
    S3 {
        operation: &'static str,
        message: String,
    },
    #[error("could not presign `{key}`: {message}")]
    Presign { key: String, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectStorageResult<T> = Result<T, ObjectStorageError>;

/// Object content as it arrives from the client.
pub type ObjectBody<'a> = BoxStream<'a, io::Result<Bytes>>;

/// Blob store the upload service writes to.
///
/// Implementations must be safe to share across requests.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `body` under `key`, returning where the object can be reached.
    ///
    /// An error yielded by `body` aborts the write and is returned as
    /// `ObjectStorageError::Io` with the original error inside.
    async fn put_object(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: ObjectBody<'_>,
    ) -> ObjectStorageResult<StoredObject>;

    /// Build a read link for `key` that stops working after `expires_in`.
    async fn presigned_get_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> ObjectStorageResult<String>;

    /// Remove `key`. Removing an object that does not exist succeeds.
    async fn delete_object(&self, key: &str) -> ObjectStorageResult<()>;

    /// Cheap round trip proving the backend is reachable.
    async fn health_check(&self) -> ObjectStorageResult<()>;

    /// Short name used in logs and readiness output.
    fn backend_name(&self) -> &'static str;
}

/// Drain `body` into one buffer, for backends that need the full length up front.
pub async fn collect_body(mut body: ObjectBody<'_>) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Generate a fresh storage key for an uploaded file.
///
/// The key is a random UUID followed by the original file extension, so
/// `photo.PNG` becomes `3f2c...-....PNG`. Extensions that are not plain
/// alphanumerics are dropped.
pub fn generate_object_key(original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| {
            !e.is_empty()
                && e.len() <= MAX_EXTENSION_LEN
                && e.chars().all(|c| c.is_ascii_alphanumeric())
        });

    match ext {
        Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
        None => Uuid::new_v4().to_string(),
    }
}

/// Basic key validation to avoid trivial path traversal vectors.
///
/// Rejects empty or oversized keys, keys that begin with `/`, contain `..`,
/// backslashes or control bytes.
pub fn ensure_key_safe(key: &str) -> ObjectStorageResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.contains("..")
        || key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');

    if invalid {
        Err(ObjectStorageError::InvalidObjectKey(key.to_string()))
    } else {
        Ok(())
    }
}
