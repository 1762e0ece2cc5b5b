//! Recorded actions: the audit trail of work performed by a job.
//!
//! An [`Action`] is opened when a step begins, collects the files it read
//! and wrote, and is closed when the step completes. Once handed to a job's
//! action list it is never mutated by the engine.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::paths::{rebase_path, Rebase};

/// A file paired with the role it played.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRole {
    pub file: PathBuf,
    pub role: String,
}

impl FileRole {
    #[must_use]
    pub fn new(file: impl Into<PathBuf>, role: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            role: role.into(),
        }
    }
}

/// A file written by an action.
///
/// `transient` outputs are scratch products that are not expected to
/// survive the job (e.g. a copied reference or a per-step markdown file).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionOutput {
    pub file: PathBuf,
    pub role: String,
    pub transient: bool,
}

/// A named unit of recorded work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inputs: Vec<FileRole>,
    #[serde(default)]
    pub outputs: Vec<ActionOutput>,
}

impl Action {
    /// Open a new action, stamping the start time.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            started_at: Utc::now(),
            ended_at: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Record an input. Inputs behave as a set: repeating a (file, role)
    /// pair is a no-op.
    pub fn add_input(&mut self, file: impl Into<PathBuf>, role: impl Into<String>) {
        let entry = FileRole::new(file, role);
        if !self.inputs.contains(&entry) {
            self.inputs.push(entry);
        }
    }

    /// Record an output. Re-adding the same file with the same role only
    /// updates its transient flag.
    pub fn add_output(&mut self, file: impl Into<PathBuf>, role: impl Into<String>, transient: bool) {
        let file = file.into();
        let role = role.into();
        if let Some(existing) = self
            .outputs
            .iter_mut()
            .find(|o| o.file == file && o.role == role)
        {
            existing.transient = transient;
            return;
        }
        self.outputs.push(ActionOutput {
            file,
            role,
            transient,
        });
    }

    /// Close the action, stamping the end time.
    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Wall-clock duration, once finished.
    #[must_use]
    pub fn duration_secs(&self) -> Option<f64> {
        self.ended_at.map(|end| {
            #[allow(clippy::cast_precision_loss)]
            let millis = (end - self.started_at).num_milliseconds() as f64;
            millis / 1000.0
        })
    }

    /// Output files recorded under `role`.
    pub fn outputs_of_role<'a>(&'a self, role: &'a str) -> impl Iterator<Item = &'a Path> + 'a {
        self.outputs
            .iter()
            .filter(move |o| o.role == role)
            .map(|o| o.file.as_path())
    }

    #[must_use]
    pub fn has_output(&self, file: &Path) -> bool {
        self.outputs.iter().any(|o| o.file == file)
    }
}

impl Rebase for Action {
    fn rebase(&mut self, from: &Path, to: &Path) {
        for input in &mut self.inputs {
            input.file = rebase_path(&input.file, from, to);
        }
        for output in &mut self.outputs {
            output.file = rebase_path(&output.file, from, to);
        }
    }
}
