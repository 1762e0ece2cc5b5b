//! Per-execution job context.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use seqpipe_state::JobStatusBackend;
use seqpipe_types::action::Action;
use seqpipe_types::ledger::FileLedger;
use seqpipe_types::sequence::{Readset, ReferenceGenome};
use seqpipe_types::state::JobId;
use tracing::{info, warn};

use crate::bam::BamTools;
use crate::config::types::{IntervalSet, JobConfig, PartitionConfig, StepConfigEntry};
use crate::registry::{JobParams, StepRegistry};

/// Where phase updates go.
#[derive(Clone)]
pub struct StatusReporter {
    backend: Arc<dyn JobStatusBackend>,
    run_id: i64,
}

impl StatusReporter {
    #[must_use]
    pub fn new(backend: Arc<dyn JobStatusBackend>, run_id: i64) -> Self {
        Self { backend, run_id }
    }

    #[must_use]
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn JobStatusBackend> {
        &self.backend
    }
}

/// State for one job (or one partition of a job) while it executes.
///
/// The ledger and action list are owned exclusively by this context.
pub struct JobContext {
    pub job: JobId,
    pub work_dir: PathBuf,
    /// Durable directory holding the checkpoint.
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub params: JobParams,
    pub step_config: BTreeMap<String, StepConfigEntry>,
    pub readsets: Vec<Readset>,
    pub genome: Option<ReferenceGenome>,
    pub input_files: Vec<PathBuf>,
    pub threads: u32,
    pub delete_intermediates: bool,
    /// Genomic intervals a partition is restricted to.
    pub intervals: Option<IntervalSet>,
    pub ledger: FileLedger,
    pub actions: Vec<Action>,
    pub registry: Arc<StepRegistry>,
    pub bam_tools: Arc<dyn BamTools>,
    status: Option<StatusReporter>,
}

impl JobContext {
    /// Minimal context; remaining fields are public and set by the caller.
    #[must_use]
    pub fn new(
        job: JobId,
        work_dir: impl Into<PathBuf>,
        source_dir: impl Into<PathBuf>,
        registry: Arc<StepRegistry>,
        bam_tools: Arc<dyn BamTools>,
    ) -> Self {
        let source_dir = source_dir.into();
        Self {
            job,
            work_dir: work_dir.into(),
            output_dir: source_dir.clone(),
            source_dir,
            params: JobParams::new(),
            step_config: BTreeMap::new(),
            readsets: Vec::new(),
            genome: None,
            input_files: Vec::new(),
            threads: 1,
            delete_intermediates: true,
            intervals: None,
            ledger: FileLedger::new(),
            actions: Vec::new(),
            registry,
            bam_tools,
            status: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &JobConfig, registry: Arc<StepRegistry>, bam_tools: Arc<dyn BamTools>) -> Self {
        let mut ctx = Self::new(
            JobId::new(config.job.clone()),
            config.work_dir.clone(),
            config.source_dir.clone(),
            registry,
            bam_tools,
        );
        ctx.output_dir = config.output_dir().to_path_buf();
        ctx.params = config.params.clone();
        ctx.step_config = config.step_config.clone();
        ctx.readsets = config.readsets.clone();
        ctx.genome = config.genome.clone();
        ctx.input_files = config.input_files.clone();
        ctx.threads = config.resources.threads;
        ctx.delete_intermediates = config.resources.delete_intermediates;
        ctx
    }

    /// Context for one slice of this job: its own work and checkpoint
    /// directories, readsets and inputs narrowed to the slice, and a fresh
    /// ledger and action list.
    #[must_use]
    pub fn for_partition(&self, partition: &PartitionConfig) -> Self {
        let mut ctx = Self::new(
            self.job.partition(&partition.name),
            self.work_dir.join(&partition.name),
            self.source_dir.join(&partition.name),
            Arc::clone(&self.registry),
            Arc::clone(&self.bam_tools),
        );
        ctx.output_dir = self.output_dir.clone();
        ctx.params = self.params.clone();
        ctx.step_config = self.step_config.clone();
        ctx.readsets = if partition.readsets.is_empty() {
            self.readsets.clone()
        } else {
            self.readsets
                .iter()
                .filter(|r| partition.readsets.contains(&r.id))
                .cloned()
                .collect()
        };
        ctx.input_files = if partition.input_files.is_empty() {
            self.input_files.clone()
        } else {
            partition.input_files.clone()
        };
        ctx.genome = self.genome.clone();
        ctx.threads = self.threads;
        ctx.delete_intermediates = self.delete_intermediates;
        ctx.intervals = partition.intervals.clone().or_else(|| self.intervals.clone());
        ctx.status = self.status.clone();
        ctx
    }

    pub fn set_status_reporter(&mut self, reporter: StatusReporter) {
        self.status = Some(reporter);
    }

    #[must_use]
    pub fn status_reporter(&self) -> Option<&StatusReporter> {
        self.status.as_ref()
    }

    /// Report the phase the job entered. Status backend failures are
    /// logged and do not fail the job.
    pub fn set_status(&self, phase: &str) {
        info!(job = %self.job, phase, "Job status");
        if let Some(reporter) = &self.status {
            if let Err(e) = reporter.backend.set_phase(reporter.run_id, phase) {
                warn!(job = %self.job, phase, error = %e, "Failed to record job status");
            }
        }
    }

    /// Configuration for repetition `index` of provider `name`.
    #[must_use]
    pub fn step_config_for(&self, name: &str, index: u32) -> serde_json::Value {
        self.step_config
            .get(name)
            .map_or(serde_json::Value::Null, |entry| entry.for_index(index))
    }

    /// Record a finished action in the job's action list.
    pub fn add_action(&mut self, mut action: Action) {
        if !action.is_finished() {
            action.finish();
        }
        info!(
            job = %self.job,
            action = %action.name,
            inputs = action.inputs.len(),
            outputs = action.outputs.len(),
            duration_secs = action.duration_secs().unwrap_or_default(),
            "Action complete"
        );
        self.actions.push(action);
    }

    #[must_use]
    pub fn readset(&self, id: i64) -> Option<&Readset> {
        self.readsets.iter().find(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bam::tests::FakeBamTools;
    use serde_json::json;

    fn ctx() -> JobContext {
        let mut ctx = JobContext::new(
            JobId::new("j"),
            "/scratch/j",
            "/data/j",
            Arc::new(StepRegistry::with_default_step_types()),
            Arc::new(FakeBamTools::default()),
        );
        ctx.readsets = vec![
            Readset { id: 1, name: "s1".into(), file1: "s1.fastq".into(), file2: None },
            Readset { id: 2, name: "s2".into(), file1: "s2.fastq".into(), file2: None },
        ];
        ctx
    }

    #[test]
    fn test_step_config_lookup() {
        let mut ctx = ctx();
        ctx.step_config.insert(
            "Trim".into(),
            StepConfigEntry::PerIndex(vec![json!({"min_length": 50}), json!({"min_length": 30})]),
        );
        assert_eq!(ctx.step_config_for("Trim", 1)["min_length"], 30);
        assert!(ctx.step_config_for("Filter", 0).is_null());
    }

    #[test]
    fn test_partition_context_is_isolated() {
        let mut parent = ctx();
        parent.ledger.add_command("echo parent");
        let partition = PartitionConfig {
            name: "chr1".into(),
            readsets: vec![2],
            input_files: Vec::new(),
            intervals: Some(IntervalSet {
                name: "chr1".into(),
                intervals: vec!["chr1:1-1000".into(), "chr1:5001-9000".into()],
            }),
        };
        let child = parent.for_partition(&partition);
        assert_eq!(child.job.as_str(), "j/chr1");
        assert_eq!(child.work_dir, PathBuf::from("/scratch/j/chr1"));
        assert_eq!(child.source_dir, PathBuf::from("/data/j/chr1"));
        assert_eq!(child.readsets.len(), 1);
        assert_eq!(child.readsets[0].id, 2);
        assert!(child.ledger.is_empty());
        let intervals = child.intervals.unwrap();
        assert_eq!(intervals.name, "chr1");
        assert_eq!(intervals.joined(), "chr1:1-1000,chr1:5001-9000");
        assert!(parent.intervals.is_none());
    }

    #[test]
    fn test_add_action_closes_it() {
        let mut ctx = ctx();
        ctx.add_action(Action::start("Copy Reference"));
        assert!(ctx.actions[0].is_finished());
    }
}
