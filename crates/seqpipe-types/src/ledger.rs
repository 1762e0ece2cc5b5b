//! File ledger: bookkeeping of the files one unit of work consumed,
//! produced, and may reclaim.
//!
//! Invariant: a file registered as an output or as a sequence output is
//! never listed as an intermediate file, whichever order the calls arrive
//! in. Registering an output retracts any earlier intermediate entry and
//! later intermediate registrations of that file are ignored.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::action::FileRole;
use crate::paths::{rebase_path, Rebase};
use crate::sequence::{MetricSource, PicardMetricsOutput, SequenceOutput};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLedger {
    #[serde(default)]
    inputs: Vec<FileRole>,
    #[serde(default)]
    outputs: Vec<FileRole>,
    #[serde(default)]
    intermediate_files: Vec<PathBuf>,
    #[serde(default)]
    deferred_delete_files: Vec<PathBuf>,
    #[serde(default)]
    sequence_outputs: Vec<SequenceOutput>,
    #[serde(default)]
    picard_metrics_files: Vec<PicardMetricsOutput>,
    #[serde(default)]
    commands: Vec<String>,
}

impl FileLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, file: impl Into<PathBuf>, role: impl Into<String>) {
        self.inputs.push(FileRole::new(file, role));
    }

    #[must_use]
    pub fn inputs(&self) -> &[FileRole] {
        &self.inputs
    }

    /// Register a produced file. Removes it from the intermediate list.
    pub fn add_output(&mut self, file: impl Into<PathBuf>, role: impl Into<String>) {
        let entry = FileRole::new(file, role);
        self.retract_intermediate(&entry.file);
        self.outputs.push(entry);
    }

    #[must_use]
    pub fn outputs(&self) -> &[FileRole] {
        &self.outputs
    }

    /// Detach the registered outputs, leaving the rest of the ledger intact.
    pub fn take_outputs(&mut self) -> Vec<FileRole> {
        std::mem::take(&mut self.outputs)
    }

    #[must_use]
    pub fn outputs_of_role(&self, role: &str) -> Vec<&Path> {
        self.outputs
            .iter()
            .filter(|o| o.role == role)
            .map(|o| o.file.as_path())
            .collect()
    }

    /// Mark a file as reclaimable once the unit of work completes. Ignored
    /// when the file is already retained as an output or deliverable.
    pub fn add_intermediate_file(&mut self, file: impl Into<PathBuf>) {
        let file = file.into();
        if self.is_retained(&file) || self.intermediate_files.contains(&file) {
            return;
        }
        self.intermediate_files.push(file);
    }

    pub fn add_intermediate_files<I, P>(&mut self, files: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for file in files {
            self.add_intermediate_file(file);
        }
    }

    pub fn remove_intermediate_file(&mut self, file: &Path) {
        self.retract_intermediate(file);
    }

    #[must_use]
    pub fn intermediate_files(&self) -> &[PathBuf] {
        &self.intermediate_files
    }

    /// Files whose deletion waits beyond normal intermediate cleanup.
    pub fn add_deferred_delete_file(&mut self, file: impl Into<PathBuf>) {
        let file = file.into();
        if !self.deferred_delete_files.contains(&file) {
            self.deferred_delete_files.push(file);
        }
    }

    #[must_use]
    pub fn deferred_delete_files(&self) -> &[PathBuf] {
        &self.deferred_delete_files
    }

    /// Register a final deliverable. Removes the file from the intermediate
    /// list.
    pub fn add_sequence_output(&mut self, output: SequenceOutput) {
        self.retract_intermediate(&output.file);
        self.sequence_outputs.push(output);
    }

    #[must_use]
    pub fn sequence_outputs(&self) -> &[SequenceOutput] {
        &self.sequence_outputs
    }

    pub fn add_picard_metrics_file(&mut self, readset_id: i64, metric_file: impl Into<PathBuf>, source: MetricSource) {
        self.picard_metrics_files.push(PicardMetricsOutput {
            metric_file: metric_file.into(),
            source,
            readset_id,
        });
    }

    #[must_use]
    pub fn picard_metrics_files(&self) -> &[PicardMetricsOutput] {
        &self.picard_metrics_files
    }

    pub fn add_command(&mut self, command: impl Into<String>) {
        self.commands.push(command.into());
    }

    pub fn add_commands<I, S>(&mut self, commands: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
    }

    /// Command lines executed, in order.
    #[must_use]
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// True when `file` is registered as an output or a deliverable.
    #[must_use]
    pub fn is_retained(&self, file: &Path) -> bool {
        self.outputs.iter().any(|o| o.file == file)
            || self.sequence_outputs.iter().any(|s| s.file == file)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
            && self.outputs.is_empty()
            && self.intermediate_files.is_empty()
            && self.deferred_delete_files.is_empty()
            && self.sequence_outputs.is_empty()
            && self.picard_metrics_files.is_empty()
            && self.commands.is_empty()
    }

    /// Fold `other` into this ledger, keeping the output-over-intermediate
    /// invariant across both.
    pub fn merge(&mut self, other: FileLedger) {
        self.inputs.extend(other.inputs);
        for output in other.outputs {
            self.add_output(output.file, output.role);
        }
        for output in other.sequence_outputs {
            self.add_sequence_output(output);
        }
        self.add_intermediate_files(other.intermediate_files);
        for file in other.deferred_delete_files {
            self.add_deferred_delete_file(file);
        }
        self.picard_metrics_files.extend(other.picard_metrics_files);
        self.commands.extend(other.commands);
    }

    fn retract_intermediate(&mut self, file: &Path) {
        self.intermediate_files.retain(|f| f != file);
    }
}

impl Rebase for FileLedger {
    fn rebase(&mut self, from: &Path, to: &Path) {
        for entry in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            entry.file = rebase_path(&entry.file, from, to);
        }
        self.intermediate_files.rebase(from, to);
        self.deferred_delete_files.rebase(from, to);
        for output in &mut self.sequence_outputs {
            output.file = rebase_path(&output.file, from, to);
        }
        for metrics in &mut self.picard_metrics_files {
            metrics.metric_file = rebase_path(&metrics.metric_file, from, to);
            if let MetricSource::InputFile { file } = &mut metrics.source {
                *file = rebase_path(file, from, to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::MetricCategory;

    #[test]
    fn output_after_intermediate_retracts_it() {
        let mut ledger = FileLedger::new();
        ledger.add_intermediate_file("/w/a.bam");
        ledger.add_output("/w/a.bam", "Aligned Reads");
        assert!(ledger.intermediate_files().is_empty());
    }

    #[test]
    fn intermediate_after_output_is_ignored() {
        let mut ledger = FileLedger::new();
        ledger.add_output("/w/a.bam", "Aligned Reads");
        ledger.add_intermediate_file("/w/a.bam");
        assert!(ledger.intermediate_files().is_empty());
    }

    #[test]
    fn sequence_output_retracts_intermediate_both_orders() {
        let mut ledger = FileLedger::new();
        ledger.add_intermediate_file("/w/a.rds");
        ledger.add_sequence_output(SequenceOutput::new("/w/a.rds", "a", "Seurat Object"));
        ledger.add_intermediate_file("/w/a.rds");
        assert!(ledger.intermediate_files().is_empty());
        assert_eq!(ledger.sequence_outputs().len(), 1);
    }

    #[test]
    fn intermediates_are_deduplicated() {
        let mut ledger = FileLedger::new();
        ledger.add_intermediate_files(["/w/a", "/w/a", "/w/b"]);
        assert_eq!(ledger.intermediate_files().len(), 2);
    }

    #[test]
    fn outputs_of_role_filters() {
        let mut ledger = FileLedger::new();
        ledger.add_output("/w/s1.bam", "Aligned Reads");
        ledger.add_output("/w/s1.bam.bai", "Aligned Reads Index");
        assert_eq!(ledger.outputs_of_role("Aligned Reads"), vec![Path::new("/w/s1.bam")]);
        assert!(ledger.outputs_of_role("VCF").is_empty());
    }

    #[test]
    fn merge_applies_invariant_across_ledgers() {
        let mut job = FileLedger::new();
        job.add_intermediate_file("/w/final.bam");
        job.add_command("samtools index /w/final.bam");

        let mut step = FileLedger::new();
        step.add_output("/w/final.bam", "Aligned Reads");
        step.add_intermediate_file("/w/tmp.sam");
        step.add_command("bwa mem ref.fa r1.fq");

        job.merge(step);
        assert_eq!(job.intermediate_files(), &[PathBuf::from("/w/tmp.sam")]);
        assert_eq!(job.commands().len(), 2);
        assert!(job.is_retained(Path::new("/w/final.bam")));
    }

    #[test]
    fn take_outputs_leaves_bookkeeping() {
        let mut ledger = FileLedger::new();
        ledger.add_output("/w/trim.fastq", "FASTQ");
        ledger.add_intermediate_file("/w/trim.log");
        let outputs = ledger.take_outputs();
        assert_eq!(outputs.len(), 1);
        assert!(ledger.outputs().is_empty());
        assert_eq!(ledger.intermediate_files().len(), 1);
    }

    #[test]
    fn rebase_moves_work_dir_paths_only() {
        let mut ledger = FileLedger::new();
        ledger.add_intermediate_file("/old/s1/trim.fastq");
        ledger.add_sequence_output(SequenceOutput::new("/data/s1.bam", "s1.bam", "Alignment"));
        ledger.add_picard_metrics_file(
            1,
            "/old/s1/insert.metrics",
            MetricSource::Category {
                category: MetricCategory::InsertSize,
            },
        );
        ledger.rebase(Path::new("/old"), Path::new("/new"));
        assert_eq!(ledger.intermediate_files(), &[PathBuf::from("/new/s1/trim.fastq")]);
        assert_eq!(ledger.sequence_outputs()[0].file, PathBuf::from("/data/s1.bam"));
        assert_eq!(
            ledger.picard_metrics_files()[0].metric_file,
            PathBuf::from("/new/s1/insert.metrics")
        );
    }

    #[test]
    fn serde_uses_camel_case_keys() {
        let mut ledger = FileLedger::new();
        ledger.add_intermediate_file("/w/a");
        let json = serde_json::to_value(&ledger).unwrap();
        assert!(json.get("intermediateFiles").is_some());
        assert!(json.get("sequenceOutputs").is_some());
        let back: FileLedger = serde_json::from_value(json).unwrap();
        assert_eq!(back, ledger);
    }
}
