//! Storage contracts for checkpoints and job status.

use serde::de::DeserializeOwned;
use serde::Serialize;

use seqpipe_types::checkpoint::{CheckpointState, CHECKPOINT_VERSION};
use seqpipe_types::sequence::SequenceOutput;
use seqpipe_types::state::{JobId, RunStatus};

use crate::error::{self, StateError};

/// Durable home of one job's (or partition's) checkpoint document.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn CheckpointStore>`.
pub trait CheckpointStore: Send + Sync {
    /// Read the stored document, or `Ok(None)` when none exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn read(&self) -> error::Result<Option<Vec<u8>>>;

    /// Replace the stored document. The new content must be durable when
    /// this returns, and a crash during the call must leave either the old
    /// or the new document in place.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn write(&self, bytes: &[u8]) -> error::Result<()>;

    /// Delete the stored document. Returns `true` if one existed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn remove(&self) -> error::Result<bool>;

    /// Human-readable location for logs.
    fn location(&self) -> String;
}

/// Load and version-check a checkpoint.
///
/// # Errors
///
/// Returns [`StateError::Serde`] for a malformed document and
/// [`StateError::SchemaMismatch`] for an unsupported version.
pub fn load_checkpoint<A: DeserializeOwned>(
    store: &dyn CheckpointStore,
) -> error::Result<Option<CheckpointState<A>>> {
    let Some(bytes) = store.read()? else {
        return Ok(None);
    };
    let raw: serde_json::Value = serde_json::from_slice(&bytes)?;
    let found = raw
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0);
    if found != CHECKPOINT_VERSION {
        return Err(StateError::SchemaMismatch {
            found,
            expected: CHECKPOINT_VERSION,
        });
    }
    Ok(Some(serde_json::from_value(raw)?))
}

/// Serialize and durably write a checkpoint.
///
/// # Errors
///
/// Returns [`StateError`] on encoding or storage failure.
pub fn save_checkpoint<A: Serialize>(
    store: &dyn CheckpointStore,
    state: &CheckpointState<A>,
) -> error::Result<()> {
    let bytes = serde_json::to_vec_pretty(state)?;
    store.write(&bytes)
}

/// A recorded job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: i64,
    pub job: String,
    pub status: RunStatus,
    pub phase: Option<String>,
    pub error_message: Option<String>,
}

/// Storage contract for job run history and deliverables.
pub trait JobStatusBackend: Send + Sync {
    /// Begin a new run of `job`, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn start_run(&self, job: &JobId) -> error::Result<i64>;

    /// Report the phase a run is currently in.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn set_phase(&self, run_id: i64, phase: &str) -> error::Result<()>;

    /// Mark a run as being cancelled; the run finishes later through
    /// [`complete_run`](Self::complete_run).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn request_cancel(&self, run_id: i64) -> error::Result<()>;

    /// Finalize a run.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, error_message: Option<&str>) -> error::Result<()>;

    /// Persist a finished deliverable, returning its row id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn record_sequence_output(&self, run_id: i64, output: &SequenceOutput) -> error::Result<i64>;

    /// Fetch a run by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn get_run(&self, run_id: i64) -> error::Result<Option<RunRecord>>;

    /// Deliverables recorded for a run, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn sequence_outputs(&self, run_id: i64) -> error::Result<Vec<SequenceOutput>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCheckpointStore;
    use seqpipe_types::artifact::FileArtifact;

    #[test]
    fn traits_are_object_safe() {
        fn _assert_store(_: &dyn CheckpointStore) {}
        fn _assert_status(_: &dyn JobStatusBackend) {}
    }

    #[test]
    fn missing_checkpoint_loads_as_none() {
        let store = MemoryCheckpointStore::new();
        let loaded: Option<CheckpointState<FileArtifact>> = load_checkpoint(&store).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let store = MemoryCheckpointStore::new();
        store.write(br#"{"version": 2, "workDir": "/w"}"#).unwrap();
        let err = load_checkpoint::<FileArtifact>(&store).unwrap_err();
        assert!(matches!(err, StateError::SchemaMismatch { found: 2, expected: 1 }));
    }

    #[test]
    fn malformed_checkpoint_is_serde_error() {
        let store = MemoryCheckpointStore::new();
        store.write(b"{not json").unwrap();
        let err = load_checkpoint::<FileArtifact>(&store).unwrap_err();
        assert!(matches!(err, StateError::Serde(_)));
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = MemoryCheckpointStore::new();
        let mut state: CheckpointState<FileArtifact> = CheckpointState::new("/w");
        state.ledger_state.add_command("echo hi");
        save_checkpoint(&store, &state).unwrap();
        let back = load_checkpoint::<FileArtifact>(&store).unwrap().unwrap();
        assert_eq!(back, state);
    }
}
