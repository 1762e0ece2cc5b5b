//! Artifacts produced by object-processing steps and cached per step in
//! checkpoints.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths::{rebase_path, Rebase};

/// A processed object file (e.g. a serialized single-cell dataset) handed
/// from one step to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectArtifact {
    pub dataset_id: String,
    pub dataset_name: String,
    pub file: PathBuf,
    /// Row id of the persisted sequence output, once registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_output_id: Option<i64>,
    /// Readset the object was derived from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readset_id: Option<i64>,
}

impl ObjectArtifact {
    #[must_use]
    pub fn new(dataset_id: impl Into<String>, dataset_name: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            dataset_name: dataset_name.into(),
            file: file.into(),
            sequence_output_id: None,
            readset_id: None,
        }
    }

    #[must_use]
    pub fn with_readset(mut self, readset_id: Option<i64>) -> Self {
        self.readset_id = readset_id;
        self
    }
}

impl Rebase for ObjectArtifact {
    fn rebase(&mut self, from: &Path, to: &Path) {
        self.file = rebase_path(&self.file, from, to);
    }
}

/// A plain file artifact, used by steps whose hand-off is just files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileArtifact {
    pub file: PathBuf,
    pub role: String,
}

impl Rebase for FileArtifact {
    fn rebase(&mut self, from: &Path, to: &Path) {
        self.file = rebase_path(&self.file, from, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_artifact_rebases_file() {
        let mut obj = ObjectArtifact::new("ds1", "Sample 1", "/old/Sample1.seurat.rds");
        obj.rebase(Path::new("/old"), Path::new("/new"));
        assert_eq!(obj.file, PathBuf::from("/new/Sample1.seurat.rds"));
    }

    #[test]
    fn optional_ids_are_omitted() {
        let obj = ObjectArtifact::new("ds1", "Sample 1", "a.rds");
        let json = serde_json::to_value(&obj).unwrap();
        assert!(json.get("sequenceOutputId").is_none());
        assert_eq!(json["datasetName"], "Sample 1");
    }
}
