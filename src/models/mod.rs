//! Core data models for the upload service.
//!
//! `UploadRecord` is the only persisted entity; `FileEvent` is what gets
//! announced on the notification topic. Both serialize as camelCase JSON.

pub mod event;
pub mod upload;
