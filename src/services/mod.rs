pub mod disk_storage;
pub mod event_publisher;
pub mod file_service;
pub mod metadata_store;
pub mod object_storage;
pub mod s3_storage;

#[cfg(test)]
pub mod testing;
