//! Durable resume state for one job or partition.
//!
//! A [`CheckpointState`] is pure data. It records every completed step index
//! with the step's [`Action`], the artifacts it handed to its successor and
//! any report files, plus the full [`FileLedger`] at the time of the
//! snapshot. Binding it to a live job happens elsewhere.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::ledger::FileLedger;
use crate::paths::{rebase_path, Rebase};

/// Schema version written into every checkpoint file.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Report files a step produced alongside its artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReports {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<PathBuf>,
}

impl StepReports {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markdown.is_none() && self.html.is_none()
    }
}

impl Rebase for StepReports {
    fn rebase(&mut self, from: &Path, to: &Path) {
        self.markdown.rebase(from, to);
        self.html.rebase(from, to);
    }
}

/// Everything a finished task handed to its job: the actions and ledger of
/// its steps plus whatever the task registered itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub ledger: FileLedger,
}

impl Rebase for TaskOutcome {
    fn rebase(&mut self, from: &Path, to: &Path) {
        for action in &mut self.actions {
            action.rebase(from, to);
        }
        self.ledger.rebase(from, to);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointState<A> {
    pub version: u32,
    /// Work directory the snapshot was written from.
    pub work_dir: PathBuf,
    /// Actions of completed steps, in completion order.
    #[serde(default)]
    pub recorded_actions: Vec<Action>,
    #[serde(default)]
    pub ledger_state: FileLedger,
    /// Artifacts keyed by step index. Every completed index has an entry;
    /// an empty list means the step kept its predecessor's artifacts.
    #[serde(default = "BTreeMap::new")]
    pub per_step_artifacts: BTreeMap<u32, Vec<A>>,
    #[serde(default = "BTreeMap::new")]
    pub per_step_reports: BTreeMap<u32, StepReports>,
    /// Set once the owning task finished. A task with an outcome is
    /// replayed from it instead of being run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_outcome: Option<TaskOutcome>,
}

impl<A> CheckpointState<A> {
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            work_dir: work_dir.into(),
            recorded_actions: Vec::new(),
            ledger_state: FileLedger::default(),
            per_step_artifacts: BTreeMap::new(),
            per_step_reports: BTreeMap::new(),
            task_outcome: None,
        }
    }

    #[must_use]
    pub fn is_step_complete(&self, index: u32) -> bool {
        self.per_step_artifacts.contains_key(&index)
    }

    /// Completed step indices in ascending order.
    pub fn completed_steps(&self) -> impl Iterator<Item = u32> + '_ {
        self.per_step_artifacts.keys().copied()
    }

    /// Artifacts in effect after step `index`: the step's own list, or the
    /// nearest earlier non-empty list when the step produced none.
    #[must_use]
    pub fn effective_artifacts(&self, index: u32) -> Option<&[A]> {
        self.per_step_artifacts
            .range(..=index)
            .rev()
            .map(|(_, artifacts)| artifacts.as_slice())
            .find(|artifacts| !artifacts.is_empty())
    }

    /// Record a completed step. Re-recording an index replaces its
    /// artifacts and reports but keeps the action recorded first.
    pub fn record_step(&mut self, index: u32, action: Action, artifacts: Vec<A>, reports: StepReports) {
        if self.per_step_artifacts.insert(index, artifacts).is_none() {
            self.recorded_actions.push(action);
        }
        if reports.is_empty() {
            self.per_step_reports.remove(&index);
        } else {
            self.per_step_reports.insert(index, reports);
        }
    }
}

impl<A: Rebase> CheckpointState<A> {
    /// Move every recorded path onto `new_work_dir` and adopt it as the
    /// snapshot's work directory.
    pub fn rebase_work_dir(&mut self, new_work_dir: &Path) {
        let old = self.work_dir.clone();
        if old == new_work_dir {
            return;
        }
        for action in &mut self.recorded_actions {
            action.rebase(&old, new_work_dir);
        }
        self.ledger_state.rebase(&old, new_work_dir);
        for artifacts in self.per_step_artifacts.values_mut() {
            artifacts.rebase(&old, new_work_dir);
        }
        for reports in self.per_step_reports.values_mut() {
            reports.rebase(&old, new_work_dir);
        }
        self.task_outcome.rebase(&old, new_work_dir);
        self.work_dir = rebase_path(&old, &old, new_work_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FileArtifact;

    fn file(path: &str) -> FileArtifact {
        FileArtifact {
            file: path.into(),
            role: "FASTQ".into(),
        }
    }

    fn action(name: &str, output: &str) -> Action {
        let mut a = Action::start(name);
        a.add_output(output, "FASTQ", false);
        a.finish();
        a
    }

    #[test]
    fn round_trip_preserves_completed_steps() {
        let mut state = CheckpointState::new("/w");
        state.record_step(0, action("Trim", "/w/s1.trim.fastq"), vec![file("/w/s1.trim.fastq")], StepReports::default());
        state.record_step(1, action("Align", "/w/s1.bam"), vec![file("/w/s1.bam")], StepReports::default());
        state.ledger_state.add_intermediate_file("/w/s1.trim.fastq");

        let json = serde_json::to_string(&state).unwrap();
        let back: CheckpointState<FileArtifact> = serde_json::from_str(&json).unwrap();

        assert!(back.is_step_complete(0));
        assert!(back.is_step_complete(1));
        assert!(!back.is_step_complete(2));
        assert_eq!(back.recorded_actions, state.recorded_actions);
        assert_eq!(back, state);
    }

    #[test]
    fn json_uses_documented_keys() {
        let state: CheckpointState<FileArtifact> = CheckpointState::new("/w");
        let json = serde_json::to_value(&state).unwrap();
        for key in ["version", "workDir", "recordedActions", "ledgerState", "perStepArtifacts", "perStepReports"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn empty_artifacts_fall_back_to_prior_step() {
        let mut state = CheckpointState::new("/w");
        state.record_step(0, action("A", "/w/a"), vec![file("/w/a")], StepReports::default());
        state.record_step(1, action("B", "/w/b"), Vec::new(), StepReports::default());
        assert_eq!(state.effective_artifacts(1).unwrap()[0].file, PathBuf::from("/w/a"));
        assert!(state.effective_artifacts(1).is_some());
    }

    #[test]
    fn rerecording_an_index_does_not_duplicate_action() {
        let mut state = CheckpointState::new("/w");
        state.record_step(0, action("A", "/w/a"), vec![file("/w/a")], StepReports::default());
        state.record_step(0, action("A", "/w/a"), vec![file("/w/a")], StepReports::default());
        assert_eq!(state.recorded_actions.len(), 1);
    }

    #[test]
    fn rebase_moves_artifacts_reports_and_actions() {
        let mut state = CheckpointState::new("/old");
        state.record_step(
            0,
            action("A", "/old/a.rds"),
            vec![file("/old/a.rds")],
            StepReports {
                markdown: Some("/old/a.md".into()),
                html: Some("/final/a.html".into()),
            },
        );
        state.rebase_work_dir(Path::new("/new"));
        assert_eq!(state.work_dir, PathBuf::from("/new"));
        assert_eq!(state.per_step_artifacts[&0][0].file, PathBuf::from("/new/a.rds"));
        assert_eq!(state.per_step_reports[&0].markdown, Some(PathBuf::from("/new/a.md")));
        assert_eq!(state.per_step_reports[&0].html, Some(PathBuf::from("/final/a.html")));
        assert_eq!(state.recorded_actions[0].outputs[0].file, PathBuf::from("/new/a.rds"));
    }

    #[test]
    fn task_outcome_survives_round_trip_and_rebase() {
        let mut state: CheckpointState<FileArtifact> = CheckpointState::new("/old");
        assert!(serde_json::to_value(&state).unwrap().get("taskOutcome").is_none());

        let mut outcome = TaskOutcome::default();
        outcome.actions.push(action("Sort", "/old/s1.bam"));
        outcome.ledger.add_output("/old/s1.bam", "Alignment");
        state.task_outcome = Some(outcome);

        let json = serde_json::to_string(&state).unwrap();
        let mut back: CheckpointState<FileArtifact> = serde_json::from_str(&json).unwrap();
        back.rebase_work_dir(Path::new("/new"));
        let outcome = back.task_outcome.unwrap();
        assert_eq!(outcome.actions[0].outputs[0].file, PathBuf::from("/new/s1.bam"));
        assert_eq!(outcome.ledger.outputs()[0].file, PathBuf::from("/new/s1.bam"));
    }
}
