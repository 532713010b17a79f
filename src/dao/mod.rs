/// Rotating snapshot files on local disk.
pub mod local_store;
/// Persisted document layout.
pub mod models;
/// Save/load pipeline over every storage tier.
pub mod persistence;
/// Remote document stores.
pub mod remote_store;
/// Storage error types shared by every backend.
pub mod storage;
