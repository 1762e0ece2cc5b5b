//! Durable state for seqpipe jobs.
//!
//! Provides the [`CheckpointStore`](backend::CheckpointStore) trait with a
//! JSON-file implementation used for crash-resume, and the
//! [`JobStatusBackend`](backend::JobStatusBackend) trait with a `SQLite`
//! implementation for run history, phase status and sequence-output
//! persistence.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod json_file;
pub mod memory;
pub mod sqlite;

pub use backend::{load_checkpoint, save_checkpoint, CheckpointStore, JobStatusBackend};
pub use error::StateError;
pub use json_file::JsonFileCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteStatusBackend;
