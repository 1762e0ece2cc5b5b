//! Job runner: validation, status tracking, retries and partitions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use seqpipe_state::{CheckpointStore, JobStatusBackend, JsonFileCheckpointStore};
use seqpipe_types::action::{Action, FileRole};
use seqpipe_types::sequence::SequenceOutput;
use seqpipe_types::state::{JobId, RunStatus};
use tracing::{error, info, warn};

use crate::bam::{BamTools, Samtools};
use crate::cleanup::delete_deferred_files;
use crate::config::types::JobConfig;
use crate::config::validator::validate_job;
use crate::context::{JobContext, StatusReporter};
use crate::error::{compute_backoff, PipelineError};
use crate::registry::StepRegistry;
use crate::resolve::{create_status_backend, resolve_steps};
use crate::result::{CheckResult, JobResult, ResolvedStepSummary};
use crate::steps::CommandTemplateProvider;
use crate::tasks::alignment::ALIGNMENT_CHECKPOINT;
use crate::tasks::object_processing::SINGLE_CELL_CHECKPOINT;
use crate::tasks::output_handler::OUTPUT_HANDLER_CHECKPOINT;
use crate::tasks::{plan_tasks, run_partitions, run_tasks, PartitionManifest};

/// Collaborators a run needs besides its configuration.
#[derive(Clone)]
pub struct ExecutionOptions {
    pub bam_tools: Arc<dyn BamTools>,
    /// Backend to record the run in instead of the one the job configures.
    pub status_backend: Option<Arc<dyn JobStatusBackend>>,
}

impl ExecutionOptions {
    /// Use `samtools` and the status backend as configured for the job.
    #[must_use]
    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            bam_tools: Arc::new(Samtools::new(&config.resources.samtools, config.resources.threads)),
            status_backend: None,
        }
    }
}

/// Registry with the default capability bindings and one provider per tool
/// defined in the job.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] if two tools share a name within a
/// capability.
pub fn build_registry(config: &JobConfig) -> Result<StepRegistry, PipelineError> {
    let mut registry = StepRegistry::with_default_step_types();
    CommandTemplateProvider::register_all(&mut registry, &config.tools)?;
    Ok(registry)
}

struct JobOutcome {
    actions: Vec<Action>,
    outputs: Vec<FileRole>,
    sequence_outputs: Vec<SequenceOutput>,
    partitions: Option<PartitionManifest>,
}

/// Run a job to completion. Retries retryable failures up to
/// `resources.max_retries` times; every retry resumes from the checkpoints
/// the failed attempt left behind. Checkpoints of every task and partition
/// stay until the job succeeds and are removed then, unless
/// `resources.keep_checkpoint` is set.
///
/// # Errors
///
/// Returns a `PipelineError` for invalid configuration, or when the job
/// fails after exhausting retries or with a non-retryable error.
pub async fn run_job(
    config: &JobConfig,
    registry: Arc<StepRegistry>,
    options: &ExecutionOptions,
) -> Result<JobResult, PipelineError> {
    validate_job(config).map_err(|e| PipelineError::config(format!("{e:#}")))?;
    resolve_steps(&registry, &config.params)?;

    let backend = match &options.status_backend {
        Some(backend) => Arc::clone(backend),
        None => create_status_backend(config)?,
    };
    let job = JobId::new(&config.job);
    let run_id = backend.start_run(&job).map_err(state_failure)?;
    let reporter = StatusReporter::new(Arc::clone(&backend), run_id);
    info!(job = %job, run_id, "Job started");

    let start = Instant::now();
    let max_retries = config.resources.max_retries;
    let mut attempt = 0u32;
    let outcome = loop {
        attempt += 1;
        if cancel_requested(backend.as_ref(), run_id) {
            warn!(job = %job, run_id, attempt, "Cancellation requested, not starting attempt");
            backend.complete_run(run_id, RunStatus::Cancelled, None).map_err(state_failure)?;
            return Ok(JobResult {
                run_id,
                status: RunStatus::Cancelled,
                actions: Vec::new(),
                outputs: Vec::new(),
                sequence_outputs: Vec::new(),
                partitions: None,
                retry_count: attempt.saturating_sub(1),
                duration_secs: start.elapsed().as_secs_f64(),
            });
        }

        match execute_job_once(config, &registry, options, &reporter).await {
            Ok(outcome) => break Ok(outcome),
            Err(ref err) if err.is_retryable() && attempt <= max_retries => {
                let delay = compute_backoff(config.resources.retry_base_ms, attempt);
                #[allow(clippy::cast_possible_truncation)]
                let delay_ms = delay.as_millis() as u64;
                warn!(
                    attempt,
                    max_retries,
                    delay_ms,
                    category = err.category(),
                    error = %err,
                    "Retryable error, will retry"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    error!(attempt, max_retries, category = err.category(), error = %err, "Max retries exhausted, failing job");
                } else {
                    error!(category = err.category(), error = %err, "Non-retryable error, failing job");
                }
                break Err(err);
            }
        }
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            if let Err(e) = backend.complete_run(run_id, RunStatus::Failed, Some(&err.to_string())) {
                warn!(run_id, error = %e, "Failed to record job failure");
            }
            return Err(err);
        }
    };

    for output in &outcome.sequence_outputs {
        backend.record_sequence_output(run_id, output).map_err(state_failure)?;
    }
    backend.complete_run(run_id, RunStatus::Completed, None).map_err(state_failure)?;
    if !config.resources.keep_checkpoint {
        match reset_job(config) {
            Ok(removed) => info!(job = %job, removed = removed.len(), "Checkpoints removed"),
            Err(e) => warn!(job = %job, error = %e, "Failed to remove checkpoints"),
        }
    }
    let duration_secs = start.elapsed().as_secs_f64();
    info!(
        job = %job,
        run_id,
        actions = outcome.actions.len(),
        sequence_outputs = outcome.sequence_outputs.len(),
        duration_secs,
        "Job completed"
    );

    Ok(JobResult {
        run_id,
        status: RunStatus::Completed,
        actions: outcome.actions,
        outputs: outcome.outputs,
        sequence_outputs: outcome.sequence_outputs,
        partitions: outcome.partitions,
        retry_count: attempt.saturating_sub(1),
        duration_secs,
    })
}

async fn execute_job_once(
    config: &JobConfig,
    registry: &Arc<StepRegistry>,
    options: &ExecutionOptions,
    reporter: &StatusReporter,
) -> Result<JobOutcome, PipelineError> {
    let mut ctx = JobContext::from_config(config, Arc::clone(registry), Arc::clone(&options.bam_tools));
    ctx.set_status_reporter(reporter.clone());

    if !config.partitions.is_empty() {
        let manifest = run_partitions(&ctx, &config.partitions).await?;
        return Ok(JobOutcome {
            actions: Vec::new(),
            outputs: manifest.partitions.iter().flat_map(|p| p.outputs.iter().cloned()).collect(),
            sequence_outputs: manifest.sequence_outputs().cloned().collect(),
            partitions: Some(manifest),
        });
    }

    let ctx = tokio::task::spawn_blocking(move || -> Result<JobContext, PipelineError> {
        run_tasks(&mut ctx)?;
        if ctx.delete_intermediates {
            delete_deferred_files(&ctx.ledger);
        }
        Ok(ctx)
    })
    .await
    .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("job task panicked: {e}")))??;

    Ok(JobOutcome {
        outputs: ctx.ledger.outputs().to_vec(),
        sequence_outputs: ctx.ledger.sequence_outputs().to_vec(),
        actions: ctx.actions,
        partitions: None,
    })
}

fn cancel_requested(backend: &dyn JobStatusBackend, run_id: i64) -> bool {
    match backend.get_run(run_id) {
        Ok(Some(record)) => record.status == RunStatus::Cancelling,
        Ok(None) => false,
        Err(e) => {
            warn!(run_id, error = %e, "Could not read run status");
            false
        }
    }
}

fn state_failure(err: seqpipe_state::StateError) -> PipelineError {
    PipelineError::Infrastructure(anyhow::Error::new(err).context("status backend failure"))
}

/// Validate a job without running it: configuration, step resolution and
/// schemas, step initialisation and the status backend.
///
/// # Errors
///
/// Returns an error describing the first invalid part of the job.
pub fn check_job(config: &JobConfig, registry: Arc<StepRegistry>) -> anyhow::Result<CheckResult> {
    info!(job = config.job, "Checking job configuration");
    validate_job(config)?;

    let resolved = resolve_steps(&registry, &config.params)?;
    let steps = resolved
        .groups
        .iter()
        .flat_map(|(capability, defs)| {
            defs.iter().map(|def| ResolvedStepSummary {
                capability: *capability,
                name: def.name().to_string(),
                label: def.action_name(),
                index: def.index(),
            })
        })
        .collect();

    let ctx = JobContext::from_config(config, registry, Arc::new(Samtools::new(&config.resources.samtools, 1)));
    let tasks = plan_tasks(&ctx)?.iter().map(crate::tasks::Task::name).collect();

    let state_ok = match create_status_backend(config) {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "Status backend unavailable");
            false
        }
    };

    Ok(CheckResult { steps, tasks, state_ok })
}

/// Delete every checkpoint of the job so the next run starts from scratch.
/// Returns the files removed.
///
/// # Errors
///
/// Returns an error if an existing checkpoint cannot be removed.
pub fn reset_job(config: &JobConfig) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs = vec![config.source_dir.clone()];
    dirs.extend(config.partitions.iter().map(|p| config.source_dir.join(&p.name)));

    let mut removed = Vec::new();
    for dir in &dirs {
        for name in [ALIGNMENT_CHECKPOINT, SINGLE_CELL_CHECKPOINT, OUTPUT_HANDLER_CHECKPOINT] {
            let store = JsonFileCheckpointStore::new(dir, name);
            if store
                .remove()
                .with_context(|| format!("Failed to remove checkpoint {}", store.location()))?
            {
                info!(checkpoint = store.location(), "Checkpoint removed");
                removed.push(store.path().to_path_buf());
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bam::tests::FakeBamTools;
    use crate::config::parser::parse_job_str;
    use seqpipe_state::SqliteStatusBackend;
    use std::fs;
    use std::path::Path;

    fn job_yaml(dir: &Path, extra: &str) -> String {
        format!(
            r#"
version: "1.0"
job: unit
work_dir: {work}
source_dir: {source}
params:
  outputHandlers: "Touch"
input_files: [{source}/a.txt]
tools:
  - name: Touch
    capability: generic_output_handler
    command: ["sh", "-c", "cp \"$0\" \"$1\"/copied.txt", "{{input1}}", "{{output_dir}}"]
state:
  backend: sqlite
  connection: {db}
{extra}
"#,
            work = dir.join("work").display(),
            source = dir.join("source").display(),
            db = dir.join("status.db").display(),
        )
    }

    fn options() -> ExecutionOptions {
        ExecutionOptions {
            bam_tools: Arc::new(FakeBamTools::default()),
            status_backend: None,
        }
    }

    #[test]
    fn test_build_registry_registers_tools() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_job_str(&job_yaml(dir.path(), "")).unwrap();
        let registry = build_registry(&config).unwrap();
        assert!(registry
            .get_provider_by_name("Touch", seqpipe_types::capability::Capability::GenericOutputHandler)
            .is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_job_records_completed_run() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("source")).unwrap();
        fs::write(dir.path().join("source/a.txt"), "payload").unwrap();
        let config = parse_job_str(&job_yaml(dir.path(), "")).unwrap();
        let registry = Arc::new(build_registry(&config).unwrap());

        let result = run_job(&config, registry, &options()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.retry_count, 0);
        assert_eq!(result.actions.len(), 1);
        assert_eq!(fs::read_to_string(dir.path().join("source/copied.txt")).unwrap(), "payload");

        let backend = SqliteStatusBackend::open(&dir.path().join("status.db")).unwrap();
        let run = backend.get_run(result.run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_failure_retried_then_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_job_str(&job_yaml(
            dir.path(),
            "resources: { max_retries: 1, retry_base_ms: 1 }",
        ))
        .unwrap();
        let registry = Arc::new(build_registry(&config).unwrap());

        let err = run_job(&config, registry, &options()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Tool { .. }));

        let backend = SqliteStatusBackend::open(&dir.path().join("status.db")).unwrap();
        let run = backend.get_run(1).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.unwrap().contains("failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_checkpoints_removed_only_after_success() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("source")).unwrap();
        fs::write(dir.path().join("source/a.txt"), "payload").unwrap();
        let config = parse_job_str(&job_yaml(dir.path(), "")).unwrap();
        let checkpoint = dir.path().join("source").join(OUTPUT_HANDLER_CHECKPOINT);

        run_job(&config, Arc::new(build_registry(&config).unwrap()), &options()).await.unwrap();
        assert!(!checkpoint.exists());

        let kept = parse_job_str(&job_yaml(dir.path(), "resources: { keep_checkpoint: true }")).unwrap();
        run_job(&kept, Arc::new(build_registry(&kept).unwrap()), &options()).await.unwrap();
        assert!(checkpoint.exists());
    }

    /// Requests cancellation as soon as a run is started.
    struct CancelOnStart(SqliteStatusBackend);

    impl JobStatusBackend for CancelOnStart {
        fn start_run(&self, job: &JobId) -> seqpipe_state::error::Result<i64> {
            let run_id = self.0.start_run(job)?;
            self.0.request_cancel(run_id)?;
            Ok(run_id)
        }
        fn set_phase(&self, run_id: i64, phase: &str) -> seqpipe_state::error::Result<()> {
            self.0.set_phase(run_id, phase)
        }
        fn request_cancel(&self, run_id: i64) -> seqpipe_state::error::Result<()> {
            self.0.request_cancel(run_id)
        }
        fn complete_run(&self, run_id: i64, status: RunStatus, error_message: Option<&str>) -> seqpipe_state::error::Result<()> {
            self.0.complete_run(run_id, status, error_message)
        }
        fn record_sequence_output(&self, run_id: i64, output: &SequenceOutput) -> seqpipe_state::error::Result<i64> {
            self.0.record_sequence_output(run_id, output)
        }
        fn get_run(&self, run_id: i64) -> seqpipe_state::error::Result<Option<seqpipe_state::backend::RunRecord>> {
            self.0.get_run(run_id)
        }
        fn sequence_outputs(&self, run_id: i64) -> seqpipe_state::error::Result<Vec<SequenceOutput>> {
            self.0.sequence_outputs(run_id)
        }
    }

    #[tokio::test]
    async fn test_cancel_before_first_attempt_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("source")).unwrap();
        fs::write(dir.path().join("source/a.txt"), "payload").unwrap();
        let config = parse_job_str(&job_yaml(dir.path(), "")).unwrap();
        let backend = Arc::new(CancelOnStart(SqliteStatusBackend::in_memory().unwrap()));
        let mut options = options();
        options.status_backend = Some(Arc::clone(&backend) as Arc<dyn JobStatusBackend>);

        let result = run_job(&config, Arc::new(build_registry(&config).unwrap()), &options)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.retry_count, 0);
        assert!(result.actions.is_empty());
        assert!(!dir.path().join("source/copied.txt").exists());
        assert!(!dir.path().join("source").join(OUTPUT_HANDLER_CHECKPOINT).exists());
        let run = backend.get_run(result.run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_step_fails_before_run_starts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = parse_job_str(&job_yaml(dir.path(), "")).unwrap();
        config.params.insert("alignment".into(), "Missing".into());
        let registry = Arc::new(build_registry(&config).unwrap());

        let err = run_job(&config, registry, &options()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(!dir.path().join("status.db").exists());
    }

    #[test]
    fn test_check_job_lists_steps_and_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_job_str(&job_yaml(dir.path(), "")).unwrap();
        let registry = Arc::new(build_registry(&config).unwrap());
        let check = check_job(&config, registry).unwrap();
        assert_eq!(check.steps.len(), 1);
        assert_eq!(check.steps[0].name, "Touch");
        assert_eq!(check.tasks, ["output-handler"]);
        assert!(check.state_ok);
    }

    #[test]
    fn test_reset_removes_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_job_str(&job_yaml(dir.path(), "partitions: [{ name: p1 }]")).unwrap();
        let partition_dir = dir.path().join("source/p1");
        fs::create_dir_all(&partition_dir).unwrap();
        fs::write(partition_dir.join(ALIGNMENT_CHECKPOINT), "{}").unwrap();
        fs::write(dir.path().join("source").join(OUTPUT_HANDLER_CHECKPOINT), "{}").unwrap();

        let removed = reset_job(&config).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!partition_dir.join(ALIGNMENT_CHECKPOINT).exists());
        assert!(reset_job(&config).unwrap().is_empty());
    }
}
