//! Defines routes for upload, metadata and health endpoints.
//!
//! ## Structure
//! - **Uploads**
//!   - `POST   /upload` — multipart upload (`fileData` parts)
//!
//! - **File metadata**
//!   - `GET    /files` — list every upload record
//!   - `GET    /files/{id}` — one record
//!   - `GET    /files/{id}/presigned` — one-hour read link for the first file
//!   - `DELETE /files/{id}` — delete objects and record, publish `file.deleted`
//!
//! - **Local backend downloads**
//!   - `GET    /objects/{*key}?expires=&signature=` — signed object download

use crate::{
    handlers::{
        file_handlers::{
            delete_file, download_object, get_file, get_presigned_url, list_files, upload_files,
        },
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Build the router carrying `AppState` to all handlers.
///
/// Request bodies above `max_upload_bytes` are rejected with 413.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/upload", post(upload_files))
        .route("/files", get(list_files))
        .route("/files/{id}", get(get_file).delete(delete_file))
        .route("/files/{id}/presigned", get(get_presigned_url))
        .route("/objects/{*key}", get(download_object))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::LocalStorageConfig,
        services::{
            disk_storage::LocalObjectStorage,
            file_service::{EventSink, FileService},
            metadata_store::MetadataStore,
            object_storage::ObjectStorage,
            testing::{
                BrokenMetadataStore, MemoryObjectStorage, RecordingPublisher,
                memory_metadata_store,
            },
        },
    };
    use axum::{
        body::{Body, Bytes},
        http::{Method, Request, StatusCode, header},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::{sync::Arc, time::Duration};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "upload-store-test-boundary";
    const LIMIT: usize = 1024 * 1024;

    struct TestApp {
        router: Router,
        objects: Arc<MemoryObjectStorage>,
        publisher: Arc<RecordingPublisher>,
    }

    async fn test_app() -> TestApp {
        let objects = Arc::new(MemoryObjectStorage::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let files = FileService::new(
            objects.clone(),
            Arc::new(memory_metadata_store().await),
            Some(EventSink::new(publisher.clone(), "file-events")),
            Duration::from_secs(3600),
        );
        let router = routes(LIMIT).with_state(AppState {
            files,
            local_objects: None,
        });
        TestApp {
            router,
            objects,
            publisher,
        }
    }

    fn multipart(parts: &[(&str, Option<&str>, &str)]) -> Request<Body> {
        let typed: Vec<_> = parts
            .iter()
            .map(|&(name, filename, data)| (name, filename, None, data))
            .collect();
        typed_multipart(&typed)
    }

    /// Parts are `(field, filename, content type, data)`.
    fn typed_multipart(parts: &[(&str, Option<&str>, Option<&str>, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, filename, content_type, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            let mut headers = match filename {
                Some(filename) => format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    name, filename
                ),
                None => format!("Content-Disposition: form-data; name=\"{}\"\r\n", name),
            };
            if let Some(content_type) = content_type {
                headers.push_str(&format!("Content-Type: {}\r\n", content_type));
            }
            headers.push_str("\r\n");
            body.extend_from_slice(headers.as_bytes());
            body.extend_from_slice(data.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn upload_two_files_then_fetch_record() {
        let app = test_app().await;
        let (status, body) = send(
            &app.router,
            multipart(&[
                ("fileData", Some("a.png"), "png-bytes"),
                ("fileData", Some("b.jpg"), "jpg-bytes"),
            ]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Files uploaded successfully");
        let file_id = body["fileId"].as_str().unwrap().to_string();
        let urls = body["urls"].as_array().unwrap().clone();
        assert_eq!(urls.len(), 2);
        assert_eq!(app.objects.len(), 2);

        let (status, record) =
            send(&app.router, request(Method::GET, &format!("/files/{}", file_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["id"], file_id);
        assert_eq!(record["imagePath"].as_array().unwrap(), &urls);
        assert!(record["uploadedAt"].is_string());
    }

    #[tokio::test]
    async fn upload_without_files_is_rejected() {
        let app = test_app().await;
        let (status, body) = send(&app.router, multipart(&[("note", None, "hello")])).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No files uploaded");
        assert_eq!(body["status"], 400);
        assert_eq!(app.objects.len(), 0);

        let (_, list) = send(&app.router, request(Method::GET, "/files")).await;
        assert_eq!(list.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn upload_ignores_empty_browser_part() {
        let app = test_app().await;
        let (status, _) = send(&app.router, multipart(&[("fileData", Some(""), "")])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_with_non_multipart_body_is_rejected() {
        let app = test_app().await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _) = send(&app.router, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let app = test_app().await;
        let big = "x".repeat(LIMIT + 1);
        let (status, _) = send(
            &app.router,
            multipart(&[("fileData", Some("big.bin"), big.as_str())]),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(app.objects.len(), 0);
    }

    /// Re-send `req`'s body in 64 KiB chunks, like a client upload.
    async fn chunked(req: Request<Body>) -> Request<Body> {
        let (parts, body) = req.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        let chunks: Vec<Result<Bytes, std::io::Error>> = bytes
            .chunks(64 * 1024)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Request::from_parts(parts, Body::from_stream(futures::stream::iter(chunks)))
    }

    #[tokio::test]
    async fn body_failure_after_first_file_removes_it() {
        let app = test_app().await;
        let big = "x".repeat(LIMIT);
        let req = chunked(multipart(&[
            ("fileData", Some("small.png"), "a"),
            ("fileData", Some("big.bin"), big.as_str()),
        ]))
        .await;
        let (status, _) = send(&app.router, req).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(app.objects.len(), 0);
        let (_, list) = send(&app.router, request(Method::GET, "/files")).await;
        assert_eq!(list.as_array().unwrap().len(), 0);
        assert!(app.publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn upload_passes_part_content_type_to_storage() {
        let app = test_app().await;
        let (status, body) = send(
            &app.router,
            typed_multipart(&[("fileData", Some("a.png"), Some("image/png"), "png-bytes")]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let key = body["urls"][0].as_str().unwrap().rsplit('/').next().unwrap();
        assert_eq!(app.objects.content_type(key).as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn list_returns_every_record() {
        let app = test_app().await;
        send(&app.router, multipart(&[("fileData", Some("a.png"), "a")])).await;
        send(&app.router, multipart(&[("fileData", Some("b.png"), "b")])).await;

        let (status, list) = send(&app.router, request(Method::GET, "/files")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_file_is_404() {
        let app = test_app().await;
        let uri = format!("/files/{}", uuid::Uuid::new_v4());
        let (status, body) = send(&app.router, request(Method::GET, &uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "File not found");

        let (status, _) = send(&app.router, request(Method::GET, "/files/not-a-uuid")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app.router, request(Method::DELETE, &uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            send(&app.router, request(Method::GET, &format!("{}/presigned", uri))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn presigned_url_references_first_key() {
        let app = test_app().await;
        let (_, body) = send(
            &app.router,
            multipart(&[
                ("fileData", Some("a.png"), "a"),
                ("fileData", Some("b.png"), "b"),
            ]),
        )
        .await;
        let file_id = body["fileId"].as_str().unwrap();
        let first_url = body["urls"][0].as_str().unwrap();
        let first_key = first_url.rsplit('/').next().unwrap();

        let (status, presigned) = send(
            &app.router,
            request(Method::GET, &format!("/files/{}/presigned", file_id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let url = presigned["presignedUrl"].as_str().unwrap();
        assert_eq!(url, format!("memory://uploads/{}?expires_in=3600", first_key));
    }

    #[tokio::test]
    async fn delete_then_get_is_404_and_object_is_gone() {
        let app = test_app().await;
        let (_, body) = send(&app.router, multipart(&[("fileData", Some("a.png"), "a")])).await;
        let file_id = body["fileId"].as_str().unwrap().to_string();
        let uri = format!("/files/{}", file_id);

        let (status, body) = send(&app.router, request(Method::DELETE, &uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "File deleted successfully");

        let (status, _) = send(&app.router, request(Method::GET, &uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(app.objects.len(), 0);

        let events = app.publisher.messages();
        assert_eq!(events.last().unwrap().2["eventType"], "file.deleted");
    }

    #[tokio::test]
    async fn metadata_outage_is_opaque_500() {
        let files = FileService::new(
            Arc::new(MemoryObjectStorage::default()),
            Arc::new(BrokenMetadataStore),
            None,
            Duration::from_secs(3600),
        );
        let router = routes(LIMIT).with_state(AppState {
            files,
            local_objects: None,
        });

        let (status, body) = send(&router, request(Method::GET, "/files")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to fetch files metadata");

        let (status, body) = send(&router, multipart(&[("fileData", Some("a.png"), "a")])).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to upload files");

        let (status, body) = send(&router, request(Method::GET, "/readyz")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["metadata"]["ok"], false);
        assert_eq!(body["checks"]["storage"]["ok"], true);
    }

    #[tokio::test]
    async fn health_endpoints_report_ok() {
        let app = test_app().await;
        let (status, body) = send(&app.router, request(Method::GET, "/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app.router, request(Method::GET, "/readyz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["storage"]["backend"], "memory");
    }

    async fn local_router(dir: &TempDir) -> Router {
        let local = Arc::new(
            LocalObjectStorage::new(&LocalStorageConfig {
                storage_dir: dir.path().to_string_lossy().into_owned(),
                public_base_url: "http://localhost:3000".into(),
                signing_secret: "secret".into(),
            })
            .unwrap(),
        );
        let metadata: Arc<dyn MetadataStore> = Arc::new(memory_metadata_store().await);
        let objects: Arc<dyn ObjectStorage> = local.clone();
        let files = FileService::new(objects, metadata, None, Duration::from_secs(3600));
        routes(LIMIT).with_state(AppState {
            files,
            local_objects: Some(local),
        })
    }

    /// Upload one file and return the path of its signed download link.
    async fn upload_and_link(router: &Router, req: Request<Body>) -> (String, String) {
        let (status, body) = send(router, req).await;
        assert_eq!(status, StatusCode::OK);
        let file_id = body["fileId"].as_str().unwrap().to_string();
        let (_, presigned) = send(
            router,
            request(Method::GET, &format!("/files/{}/presigned", file_id)),
        )
        .await;
        let url = presigned["presignedUrl"].as_str().unwrap();
        let path = url.trim_start_matches("http://localhost:3000").to_string();
        (file_id, path)
    }

    #[tokio::test]
    async fn local_backend_serves_uploaded_content_type() {
        let dir = TempDir::new().unwrap();
        let router = local_router(&dir).await;
        let (_, path) = upload_and_link(
            &router,
            typed_multipart(&[("fileData", Some("a.bin"), Some("image/png"), "png")]),
        )
        .await;

        let response = router
            .clone()
            .oneshot(request(Method::GET, &path))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    }

    #[tokio::test]
    async fn local_backend_serves_signed_links_only() {
        let dir = TempDir::new().unwrap();
        let router = local_router(&dir).await;
        let (file_id, path) =
            upload_and_link(&router, multipart(&[("fileData", Some("a.txt"), "hello")])).await;
        let path = path.as_str();

        let response = router
            .clone()
            .oneshot(request(Method::GET, path))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");

        let tampered = path.replace("signature=", "signature=0");
        let (status, _) = send(&router, request(Method::GET, &tampered)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(&router, request(Method::DELETE, &format!("/files/{}", file_id))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&router, request(Method::GET, path)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
