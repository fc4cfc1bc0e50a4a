//! Amazon S3 (or S3-compatible) object storage backend.

use crate::{
    config::S3Config,
    models::upload::StoredObject,
    services::object_storage::{
        ObjectBody, ObjectStorage, ObjectStorageError, ObjectStorageResult, collect_body,
        ensure_key_safe,
    },
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    Client,
    config::{Builder as S3ConfigBuilder, Credentials},
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::ObjectCannedAcl,
};
use std::time::Duration;
use tracing::{debug, info, instrument};

const CREDENTIALS_PROVIDER_NAME: &str = "upload-store-config";

/// S3 client bound to a single bucket.
pub struct S3ObjectStorage {
    client: Client,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    public_read: bool,
}

impl S3ObjectStorage {
    /// Build the client from configuration.
    ///
    /// Static credentials are used when both key id and secret are set,
    /// otherwise the SDK default provider chain applies.
    pub async fn new(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id.clone(),
                secret.clone(),
                config.session_token.clone(),
                None,
                CREDENTIALS_PROVIDER_NAME,
            ));
        }

        let shared = loader.load().await;
        let mut builder = S3ConfigBuilder::from(&shared);

        // MinIO / LocalStack
        if let Some(endpoint_url) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = Client::from_conf(builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 object storage initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            public_read: config.public_read,
        }
    }

    fn location(&self, key: &str) -> String {
        object_location(
            &self.bucket,
            &self.region,
            self.endpoint_url.as_deref(),
            key,
        )
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    /// PutObject needs the content length, so the body is buffered first.
    #[instrument(skip(self, body), fields(bucket = %self.bucket))]
    async fn put_object(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: ObjectBody<'_>,
    ) -> ObjectStorageResult<StoredObject> {
        ensure_key_safe(key)?;
        let body = collect_body(body).await?;
        let size = body.len();

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_content_type(content_type.map(str::to_string));
        if self.public_read {
            request = request.acl(ObjectCannedAcl::PublicRead);
        }

        request.send().await.map_err(|err| ObjectStorageError::S3 {
            operation: "PutObject",
            message: DisplayErrorContext(&err).to_string(),
        })?;

        debug!(key, size, "object stored in S3");
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

        let presigning = PresigningConfig::expires_in(expires_in).map_err(|err| {
            ObjectStorageError::Presign {
                key: key.to_string(),
                message: err.to_string(),
            }
        })?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| ObjectStorageError::Presign {
                key: key.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            })?;

        Ok(presigned.uri().to_string())
    }

    async fn delete_object(&self, key: &str) -> ObjectStorageResult<()> {
        ensure_key_safe(key)?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| ObjectStorageError::S3 {
                operation: "DeleteObject",
                message: DisplayErrorContext(&err).to_string(),
            })?;

        debug!(key, bucket = %self.bucket, "object deleted from S3");
        Ok(())
    }

    async fn health_check(&self) -> ObjectStorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| ObjectStorageError::S3 {
                operation: "HeadBucket",
                message: DisplayErrorContext(&err).to_string(),
            })?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

/// Public location of `key`.
///
/// Virtual-hosted AWS URL by default, path-style under a custom endpoint.
fn object_location(bucket: &str, region: &str, endpoint_url: Option<&str>, key: &str) -> String {
    match endpoint_url {
        Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key),
        None => format!("https://{}.s3.{}.amazonaws.com/{}", bucket, region, key),
    }
}
