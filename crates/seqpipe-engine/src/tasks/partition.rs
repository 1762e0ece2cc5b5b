//! Concurrent execution of independent job partitions.
//!
//! Each partition runs the full task sequence on its own blocking thread
//! with its own work directory, ledger and checkpoints. The first failure
//! aborts the partitions that have not started yet; merging partition
//! outputs is left to the caller.
//!
//! A partition restricted to an interval set reports one primary scatter
//! output. When that file was written under the partition's work directory
//! it is copied to the same relative path under the partition's source
//! directory, and the copy is what the manifest names.

use std::path::PathBuf;

use seqpipe_types::action::FileRole;
use seqpipe_types::sequence::SequenceOutput;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::{copy_file, run_tasks};
use crate::cleanup::delete_deferred_files;
use crate::config::types::PartitionConfig;
use crate::context::JobContext;
use crate::error::PipelineError;

/// What one partition produced.
#[derive(Debug, Clone)]
pub struct PartitionResult {
    pub name: String,
    pub work_dir: PathBuf,
    pub outputs: Vec<FileRole>,
    pub sequence_outputs: Vec<SequenceOutput>,
    pub actions: usize,
    /// Interval set the partition covered, if any.
    pub interval_set: Option<String>,
    /// Primary output of an interval partition.
    pub scatter_output: Option<PathBuf>,
}

/// Per-partition output lists, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct PartitionManifest {
    pub partitions: Vec<PartitionResult>,
}

impl PartitionManifest {
    /// Every sequence output across partitions.
    pub fn sequence_outputs(&self) -> impl Iterator<Item = &SequenceOutput> {
        self.partitions.iter().flat_map(|p| p.sequence_outputs.iter())
    }
}

/// Run a single partition to completion on the current thread.
///
/// # Errors
///
/// Propagates the first task failure.
pub fn run_partition(mut ctx: JobContext, name: &str) -> Result<PartitionResult, PipelineError> {
    info!(job = %ctx.job, partition = name, work_dir = %ctx.work_dir.display(), "Partition started");
    if let Some(set) = &ctx.intervals {
        info!(job = %ctx.job, interval_set = %set.name, total = set.intervals.len(), "Using intervals");
    }
    run_tasks(&mut ctx)?;
    let scatter_output = if ctx.intervals.is_some() {
        deliver_scatter_output(&ctx)?
    } else {
        None
    };
    if ctx.delete_intermediates {
        delete_deferred_files(&ctx.ledger);
    }
    Ok(PartitionResult {
        name: name.to_string(),
        work_dir: ctx.work_dir.clone(),
        outputs: ctx.ledger.outputs().to_vec(),
        sequence_outputs: ctx.ledger.sequence_outputs().to_vec(),
        actions: ctx.actions.len(),
        interval_set: ctx.intervals.as_ref().map(|set| set.name.clone()),
        scatter_output,
    })
}

/// The first sequence output (or, failing that, the first output) of the
/// partition, delivered into the source directory when it is still under
/// the work directory.
fn deliver_scatter_output(ctx: &JobContext) -> Result<Option<PathBuf>, PipelineError> {
    let primary = ctx
        .ledger
        .sequence_outputs()
        .first()
        .map(|output| output.file.clone())
        .or_else(|| ctx.ledger.outputs().first().map(|output| output.file.clone()));
    let Some(primary) = primary else {
        debug!(job = %ctx.job, "No primary scatter output produced");
        return Ok(None);
    };
    let Ok(relative) = primary.strip_prefix(&ctx.work_dir) else {
        debug!(job = %ctx.job, output = %primary.display(), "Scatter output already outside the work directory");
        return Ok(Some(primary));
    };
    let delivered = ctx.source_dir.join(relative);
    copy_file(&primary, &delivered)?;
    debug!(job = %ctx.job, output = %delivered.display(), "Final scatter output");
    Ok(Some(delivered))
}

/// Run every partition of `ctx` concurrently.
///
/// # Errors
///
/// Returns the first partition failure; remaining partitions are aborted.
pub async fn run_partitions(
    ctx: &JobContext,
    partitions: &[PartitionConfig],
) -> Result<PartitionManifest, PipelineError> {
    let mut set = JoinSet::new();
    for (position, partition) in partitions.iter().enumerate() {
        let part_ctx = ctx.for_partition(partition);
        let name = partition.name.clone();
        set.spawn_blocking(move || (position, run_partition(part_ctx, &name)));
    }

    let mut results: Vec<Option<PartitionResult>> = vec![None; partitions.len()];
    let mut first_error: Option<PipelineError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((position, Ok(result))) => {
                info!(partition = %result.name, outputs = result.outputs.len(), "Partition completed");
                results[position] = Some(result);
            }
            Ok((position, Err(err))) => {
                error!(partition = %partitions[position].name, error = %err, "Partition failed");
                if first_error.is_none() {
                    first_error = Some(err);
                    set.abort_all();
                }
            }
            Err(join_err) => {
                if first_error.is_some() && join_err.is_cancelled() {
                    continue;
                }
                if first_error.is_none() {
                    first_error = Some(PipelineError::Infrastructure(anyhow::anyhow!(
                        "partition task panicked: {join_err}"
                    )));
                    set.abort_all();
                }
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }
    Ok(PartitionManifest {
        partitions: results.into_iter().flatten().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bam::tests::FakeBamTools;
    use crate::config::types::IntervalSet;
    use crate::registry::{StepCtx, StepProvider, StepRegistry};
    use crate::step::{GenericOutputHandler, HandlerOutput, Step, StepInstance};
    use seqpipe_types::capability::Capability;
    use seqpipe_types::ledger::FileLedger;
    use seqpipe_types::sequence::InputRecord;
    use seqpipe_types::state::JobId;
    use std::path::Path;
    use std::sync::Arc;

    /// Registers one deliverable per input file; fails on a marker file.
    struct Publish;

    impl Step for Publish {}

    impl GenericOutputHandler for Publish {
        fn process_outputs(&self, inputs: &[InputRecord], _output_dir: &Path) -> Result<HandlerOutput, PipelineError> {
            let mut ledger = FileLedger::new();
            for input in inputs {
                if input.name == "bad.txt" {
                    return Err(PipelineError::tool("publish", "rejected input"));
                }
                ledger.add_sequence_output(SequenceOutput::new(&input.file, &input.name, "Published"));
            }
            Ok(HandlerOutput { ledger })
        }
    }

    struct PublishProvider;

    impl StepProvider for PublishProvider {
        fn name(&self) -> &str {
            "Publish"
        }
        fn label(&self) -> &str {
            "Publish Files"
        }
        fn capability(&self) -> Capability {
            Capability::GenericOutputHandler
        }
        fn create(&self, _ctx: &StepCtx<'_>) -> Result<StepInstance, PipelineError> {
            Ok(StepInstance::OutputHandler(Box::new(Publish)))
        }
    }

    fn ctx(dir: &Path) -> JobContext {
        let mut registry = StepRegistry::with_default_step_types();
        registry.register(Arc::new(PublishProvider)).unwrap();
        let mut ctx = JobContext::new(
            JobId::new("split"),
            dir.join("work"),
            dir.join("source"),
            Arc::new(registry),
            Arc::new(FakeBamTools::default()),
        );
        ctx.params.insert("outputHandlers".into(), "Publish".into());
        ctx
    }

    fn partition(name: &str, file: PathBuf) -> PartitionConfig {
        PartitionConfig {
            name: name.into(),
            readsets: Vec::new(),
            input_files: vec![file],
            intervals: None,
        }
    }

    /// Writes one call file per interval set into the partition work dir.
    struct Scatter {
        work_dir: PathBuf,
        intervals: Option<IntervalSet>,
    }

    impl Step for Scatter {}

    impl GenericOutputHandler for Scatter {
        fn process_outputs(&self, _inputs: &[InputRecord], _output_dir: &Path) -> Result<HandlerOutput, PipelineError> {
            let mut ledger = FileLedger::new();
            let Some(set) = &self.intervals else {
                return Ok(HandlerOutput { ledger });
            };
            let calls = self.work_dir.join("calls").join(format!("{}.vcf", set.name));
            std::fs::create_dir_all(self.work_dir.join("calls")).map_err(|e| PipelineError::io(&self.work_dir, e))?;
            std::fs::write(&calls, set.joined()).map_err(|e| PipelineError::io(&calls, e))?;
            ledger.add_sequence_output(SequenceOutput::new(&calls, &set.name, "VCF File"));
            Ok(HandlerOutput { ledger })
        }
    }

    struct ScatterProvider;

    impl StepProvider for ScatterProvider {
        fn name(&self) -> &str {
            "Scatter"
        }
        fn label(&self) -> &str {
            "Call Variants"
        }
        fn capability(&self) -> Capability {
            Capability::GenericOutputHandler
        }
        fn create(&self, ctx: &StepCtx<'_>) -> Result<StepInstance, PipelineError> {
            Ok(StepInstance::OutputHandler(Box::new(Scatter {
                work_dir: ctx.job.work_dir.clone(),
                intervals: ctx.job.intervals.clone(),
            })))
        }
    }

    #[tokio::test]
    async fn test_interval_partitions_deliver_scatter_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = StepRegistry::with_default_step_types();
        registry.register(Arc::new(ScatterProvider)).unwrap();
        let mut ctx = JobContext::new(
            JobId::new("calls"),
            dir.path().join("work"),
            dir.path().join("source"),
            Arc::new(registry),
            Arc::new(FakeBamTools::default()),
        );
        ctx.params.insert("outputHandlers".into(), "Scatter".into());
        let mut chr1 = partition("chr1", dir.path().join("a.txt"));
        chr1.intervals = Some(IntervalSet {
            name: "chr1".into(),
            intervals: vec!["chr1:1-100".into(), "chr1:200-300".into()],
        });
        let whole = partition("rest", dir.path().join("a.txt"));

        let manifest = run_partitions(&ctx, &[chr1, whole]).await.unwrap();
        let scattered = &manifest.partitions[0];
        let delivered = dir.path().join("source/chr1/calls/chr1.vcf");
        assert_eq!(scattered.interval_set.as_deref(), Some("chr1"));
        assert_eq!(scattered.scatter_output.as_deref(), Some(delivered.as_path()));
        assert_eq!(std::fs::read_to_string(&delivered).unwrap(), "chr1:1-100,chr1:200-300");
        assert!(dir.path().join("work/chr1/calls/chr1.vcf").exists());

        assert!(manifest.partitions[1].interval_set.is_none());
        assert!(manifest.partitions[1].scatter_output.is_none());
    }

    #[tokio::test]
    async fn test_partitions_collected_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let parts = vec![
            partition("chr1", dir.path().join("a.txt")),
            partition("chr2", dir.path().join("b.txt")),
        ];

        let manifest = run_partitions(&ctx, &parts).await.unwrap();
        let names: Vec<&str> = manifest.partitions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["chr1", "chr2"]);
        assert_eq!(manifest.partitions[1].work_dir, dir.path().join("work/chr2"));
        assert_eq!(manifest.sequence_outputs().count(), 2);
        assert!(dir.path().join("source/chr1").join(crate::tasks::output_handler::OUTPUT_HANDLER_CHECKPOINT).exists());
    }

    #[tokio::test]
    async fn test_first_failure_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let parts = vec![
            partition("ok", dir.path().join("a.txt")),
            partition("broken", dir.path().join("bad.txt")),
        ];
        let err = run_partitions(&ctx, &parts).await.unwrap_err();
        assert!(matches!(err, PipelineError::Tool { .. }));
    }
}
