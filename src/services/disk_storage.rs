//! Local disk object storage.
//!
//! Objects live beneath `base_path/{shard}/{shard}/{key}` where the shards
//! are the first two bytes of MD5(key). The content type given at upload
//! is kept in a parallel tree under `base_path/.content-types`. Read links
//! are served by this process at `/objects/{key}` and signed with
//! HMAC-SHA256 over a shared secret.

use crate::{
    config::LocalStorageConfig,
    models::upload::StoredObject,
    services::object_storage::{
        ObjectBody, ObjectStorage, ObjectStorageError, ObjectStorageResult, ensure_key_safe,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const CONTENT_TYPE_DIR: &str = ".content-types";

/// Why a signed local link was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("link expired")]
    Expired,
    #[error("signature mismatch")]
    BadSignature,
}

/// An object opened for reading.
#[derive(Debug)]
pub struct LocalObject {
    pub file: File,
    pub len: u64,
    /// Type recorded at upload, or guessed from the key's extension.
    pub content_type: String,
}

pub struct LocalObjectStorage {
    base_path: PathBuf,
    public_base_url: String,
    signer: HmacSha256,
}

impl LocalObjectStorage {
    pub fn new(config: &LocalStorageConfig) -> ObjectStorageResult<Self> {
        let signer = HmacSha256::new_from_slice(config.signing_secret.as_bytes()).map_err(|err| {
            ObjectStorageError::Io(io::Error::new(
                ErrorKind::InvalidInput,
                format!("unusable signing secret: {}", err),
            ))
        })?;
        Ok(Self {
            base_path: PathBuf::from(&config.storage_dir),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            signer,
        })
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(key) and returns the first two bytes as lowercase hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn sharded_path(root: &Path, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = root.to_path_buf();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn object_path(&self, key: &str) -> PathBuf {
        Self::sharded_path(&self.base_path, key)
    }

    fn content_type_path(&self, key: &str) -> PathBuf {
        Self::sharded_path(&self.base_path.join(CONTENT_TYPE_DIR), key)
    }

    fn location(&self, key: &str) -> String {
        format!("{}/objects/{}", self.public_base_url, key)
    }

    // keys never contain control bytes, so the newline cannot be forged
    fn link_mac(&self, key: &str, expires: i64) -> HmacSha256 {
        let mut mac = self.signer.clone();
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }

    fn sign(&self, key: &str, expires: i64) -> String {
        hex::encode(self.link_mac(key, expires).finalize().into_bytes())
    }

    /// Check a link's signature and expiry against `now` (unix seconds).
    pub fn verify_link(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
        now: i64,
    ) -> Result<(), LinkError> {
        let signature = hex::decode(signature).map_err(|_| LinkError::BadSignature)?;
        self.link_mac(key, expires)
            .verify_slice(&signature)
            .map_err(|_| LinkError::BadSignature)?;
        if now > expires {
            return Err(LinkError::Expired);
        }
        Ok(())
    }

    /// Open a stored object for streaming.
    pub async fn open_object(&self, key: &str) -> ObjectStorageResult<LocalObject> {
        ensure_key_safe(key)?;
        let path = self.object_path(key);
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStorageError::ObjectNotFound(key.to_string())
            } else {
                ObjectStorageError::Io(err)
            }
        })?;
        let len = file.metadata().await?.len();

        let content_type = match fs::read_to_string(self.content_type_path(key)).await {
            Ok(recorded) => recorded.trim().to_string(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                mime_guess::from_path(key).first_or_octet_stream().to_string()
            }
            Err(err) => return Err(ObjectStorageError::Io(err)),
        };

        Ok(LocalObject {
            file,
            len,
            content_type,
        })
    }

    /// Record (or forget) the content type that belongs to `key`.
    async fn record_content_type(&self, key: &str, content_type: Option<&str>) -> io::Result<()> {
        let path = self.content_type_path(key);
        match content_type.map(str::trim).filter(|ct| !ct.is_empty()) {
            Some(content_type) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&path, content_type).await
            }
            None => remove_if_present(&path).await,
        }
    }

    /// Recursively remove empty directories up to the storage root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    /// Streams into a temporary file, fsyncs, then renames into place.
    async fn put_object(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: ObjectBody<'_>,
    ) -> ObjectStorageResult<StoredObject> {
        ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ObjectStorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let size = match write_stream_synced(&tmp_path, body).await {
            Ok(size) => size,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                self.prune_empty_dirs(&parent).await;
                return Err(ObjectStorageError::Io(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStorageError::Io(err));
        }
        self.record_content_type(key, content_type).await?;

        debug!(key, size, "object written to {}", file_path.display());
        Ok(StoredObject {
            key: key.to_string(),
            location: self.location(key),
        })
    }

    async fn presigned_get_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> ObjectStorageResult<String> {
        ensure_key_safe(key)?;
        let expires = Utc::now().timestamp() + expires_in.as_secs() as i64;
        Ok(format!(
            "{}?expires={}&signature={}",
            self.location(key),
            expires,
            self.sign(key, expires)
        ))
    }

    async fn delete_object(&self, key: &str) -> ObjectStorageResult<()> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(ObjectStorageError::Io(err)),
        }

        let type_path = self.content_type_path(key);
        remove_if_present(&type_path).await?;

        for path in [&file_path, &type_path] {
            if let Some(parent) = path.parent() {
                self.prune_empty_dirs(parent).await;
            }
        }
        Ok(())
    }

    /// Write, read back and delete a probe file beneath the storage root.
    async fn health_check(&self) -> ObjectStorageResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;

        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await; // best-effort cleanup
        if read_back? != b"readyz" {
            return Err(ObjectStorageError::Io(io::Error::other(
                "probe file content mismatch",
            )));
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "disk"
    }
}

async fn write_stream_synced(path: &Path, mut body: ObjectBody<'_>) -> io::Result<u64> {
    let mut file = File::create(path).await?;
    let mut size = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(size)
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
