//! In-process checkpoint store for tests and dry runs.

use std::sync::Mutex;

use crate::backend::CheckpointStore;
use crate::error::{self, StateError};

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    doc: Mutex<Option<Vec<u8>>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn read(&self) -> error::Result<Option<Vec<u8>>> {
        let doc = self.doc.lock().map_err(|_| StateError::LockPoisoned)?;
        Ok(doc.clone())
    }

    fn write(&self, bytes: &[u8]) -> error::Result<()> {
        let mut doc = self.doc.lock().map_err(|_| StateError::LockPoisoned)?;
        *doc = Some(bytes.to_vec());
        Ok(())
    }

    fn remove(&self) -> error::Result<bool> {
        let mut doc = self.doc.lock().map_err(|_| StateError::LockPoisoned)?;
        Ok(doc.take().is_some())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
