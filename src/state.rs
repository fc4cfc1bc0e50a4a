use crate::services::{disk_storage::LocalObjectStorage, file_service::FileService};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub files: FileService,
    /// Set only with the local disk backend, which serves its own signed links.
    pub local_objects: Option<Arc<LocalObjectStorage>>,
}
