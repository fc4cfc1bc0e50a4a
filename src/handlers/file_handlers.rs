//! HTTP handlers for uploads and file metadata.
//! Parsing and response shaping live here; every step with side effects is
//! delegated to `FileService`.

use crate::{
    errors::AppError,
    models::upload::UploadRecord,
    services::{
        disk_storage::LinkError,
        file_service::FileServiceError,
        object_storage::ObjectStorageError,
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{
        Path, Query, State,
        multipart::{Multipart, MultipartError},
    },
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Multipart form field that carries the uploaded files.
pub const UPLOAD_FIELD: &str = "fileData";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    pub file_id: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrlResponse {
    pub presigned_url: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Query string of a link produced by the local disk backend.
#[derive(Debug, Deserialize)]
pub struct SignedLinkQuery {
    pub expires: i64,
    pub signature: String,
}

/// `POST /upload` — stream every `fileData` part into storage and record
/// them as one upload.
pub async fn upload_files(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut batch = state.files.begin_upload();

    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                batch.abort().await;
                return Err(multipart_error(&err));
            }
        };

        if field.name() != Some(UPLOAD_FIELD) {
            debug!(field = ?field.name(), "ignoring unexpected multipart field");
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            debug!("ignoring `{}` part without a filename", UPLOAD_FIELD);
            continue;
        };
        let content_type = field.content_type().map(str::to_string);

        // browsers send an empty, unnamed part when no file was chosen
        let first_chunk = if file_name.is_empty() {
            match field.chunk().await {
                Ok(Some(chunk)) => Some(chunk),
                Ok(None) => continue,
                Err(err) => {
                    batch.abort().await;
                    return Err(multipart_error(&err));
                }
            }
        } else {
            None
        };

        let body = stream::iter(first_chunk.map(Ok))
            .chain(field.map_err(io::Error::other))
            .boxed();
        batch
            .store(&file_name, content_type.as_deref(), body)
            .await
            .map_err(upload_error)?;
    }

    let record = batch.finish().await.map_err(upload_error)?;

    Ok(Json(UploadResponse {
        message: "Files uploaded successfully".into(),
        file_id: record.id.to_string(),
        urls: record.image_path,
    }))
}

/// `GET /files` — every upload record.
pub async fn list_files(
    State(state): State<AppState>,
) -> Result<Json<Vec<UploadRecord>>, AppError> {
    let records = state
        .files
        .list()
        .await
        .map_err(|err| AppError::from_service(err, "Failed to fetch files metadata"))?;
    Ok(Json(records))
}

/// `GET /files/{id}`
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UploadRecord>, AppError> {
    let record = state
        .files
        .get(&id)
        .await
        .map_err(|err| AppError::from_service(err, "Failed to fetch file metadata"))?;
    Ok(Json(record))
}

/// `GET /files/{id}/presigned` — one-hour read link for the first file.
pub async fn get_presigned_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PresignedUrlResponse>, AppError> {
    let presigned_url = state
        .files
        .presigned_url(&id)
        .await
        .map_err(|err| AppError::from_service(err, "Failed to generate presigned URL"))?;
    Ok(Json(PresignedUrlResponse { presigned_url }))
}

/// `DELETE /files/{id}` — remove objects and record, then announce it.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    state
        .files
        .delete(&id)
        .await
        .map_err(|err| AppError::from_service(err, "Failed to delete file"))?;
    Ok(Json(MessageResponse {
        message: "File deleted successfully".into(),
    }))
}

/// `GET /objects/{*key}` — stream an object from the local disk backend
/// when the signed link is valid.
pub async fn download_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(link): Query<SignedLinkQuery>,
) -> Result<Response, AppError> {
    let Some(storage) = state.local_objects.as_ref() else {
        return Err(AppError::not_found("File not found"));
    };

    storage
        .verify_link(&key, link.expires, &link.signature, Utc::now().timestamp())
        .map_err(|err| match err {
            LinkError::Expired => AppError::new(StatusCode::FORBIDDEN, "Link expired"),
            LinkError::BadSignature => AppError::new(StatusCode::FORBIDDEN, "Invalid signature"),
        })?;

    let object = storage.open_object(&key).await.map_err(|err| match err {
        ObjectStorageError::ObjectNotFound(_) | ObjectStorageError::InvalidObjectKey(_) => {
            AppError::not_found("File not found")
        }
        other => {
            warn!(key = %key, "failed to open object: {}", other);
            AppError::internal("Failed to read file")
        }
    })?;

    let content_type = HeaderValue::from_str(&object.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));

    let mut response = Response::new(Body::from_stream(ReaderStream::new(object.file)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.len));
    Ok(response)
}

fn multipart_error(err: &MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

/// Errors raised while reading the request body are the client's, even
/// when they surface from inside the storage write.
fn upload_error(err: FileServiceError) -> AppError {
    let body_error = match &err {
        FileServiceError::Storage(ObjectStorageError::Io(io_err)) => io_err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<MultipartError>()),
        _ => None,
    };
    match body_error {
        Some(body_error) => multipart_error(body_error),
        None => AppError::from_service(err, "Failed to upload files"),
    }
}
