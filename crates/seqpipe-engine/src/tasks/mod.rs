//! Task orchestrators.
//!
//! A task runs one job phase: an ordered list of steps of one or more
//! capabilities, threaded output to input, with one action and one
//! checkpoint entry per step. Every task of a job is built before any of
//! them runs, so configuration errors surface before a process starts.

pub mod alignment;
pub mod object_processing;
pub mod output_handler;
pub mod partition;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use seqpipe_state::{CheckpointStore, JsonFileCheckpointStore};
use seqpipe_types::action::Action;
use seqpipe_types::ledger::FileLedger;
use tracing::info;

use crate::cleanup::delete_intermediate_files;
use crate::command::partial_path;
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::registry::StepDef;
use crate::step::StepInstance;

pub use alignment::AlignmentTask;
pub use object_processing::ObjectProcessingTask;
pub use output_handler::OutputHandlerTask;
pub use partition::{run_partitions, PartitionManifest, PartitionResult};

/// A created and initialised step together with its definition.
pub struct ConfiguredStep<T: ?Sized> {
    pub def: StepDef,
    pub step: Box<T>,
}

/// Create and initialise the step for `def`, then unwrap its capability.
pub(crate) fn instantiate<T: ?Sized>(
    ctx: &JobContext,
    def: StepDef,
    unwrap: impl FnOnce(StepInstance) -> Result<Box<T>, PipelineError>,
) -> Result<ConfiguredStep<T>, PipelineError> {
    let instance = def.create(ctx)?;
    instance.init(ctx)?;
    Ok(ConfiguredStep {
        step: unwrap(instance)?,
        def,
    })
}

/// Checkpoint store for `file_name` in the job's source directory.
#[must_use]
pub fn checkpoint_store(ctx: &JobContext, file_name: &str) -> Arc<dyn CheckpointStore> {
    Arc::new(JsonFileCheckpointStore::new(&ctx.source_dir, file_name))
}

/// Move a step's declared outputs from its ledger onto its action.
pub(crate) fn record_outputs(action: &mut Action, ledger: &mut FileLedger) {
    for output in ledger.take_outputs() {
        action.add_output(output.file, output.role, false);
    }
}

/// Move `src` to `dest`, copying when a rename crosses file systems.
pub(crate) fn move_file(src: &Path, dest: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    copy_file(src, dest)?;
    fs::remove_file(src).map_err(|e| PipelineError::io(src, e))
}

/// Copy `src` to `dest` through a partial file; `src` stays in place.
pub(crate) fn copy_file(src: &Path, dest: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    let partial = partial_path(dest);
    fs::copy(src, &partial).map_err(|e| PipelineError::io(src, e))?;
    fs::rename(&partial, dest).map_err(|e| PipelineError::io(dest, e))
}

/// Delete the job's intermediate files if the job asks for it.
pub(crate) fn finish_task(ctx: &JobContext, task: &str) {
    if ctx.delete_intermediates {
        delete_intermediate_files(&ctx.ledger);
    }
    info!(job = %ctx.job, task, actions = ctx.actions.len(), "Task finished");
}

/// Every task the job parameters configure, in execution order.
pub enum Task {
    Alignment(AlignmentTask),
    ObjectProcessing(ObjectProcessingTask),
    OutputHandler(OutputHandlerTask),
}

impl Task {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Alignment(_) => "alignment",
            Self::ObjectProcessing(_) => "single-cell",
            Self::OutputHandler(_) => "output-handler",
        }
    }

    /// Run this task to completion on `ctx`.
    ///
    /// The task works on an empty ledger and action list, which are merged
    /// into the job's afterwards; its checkpointed outcome then holds only
    /// its own work.
    ///
    /// # Errors
    ///
    /// Propagates the first step, I/O or checkpoint failure.
    pub fn run(&self, ctx: &mut JobContext) -> Result<(), PipelineError> {
        let job_ledger = std::mem::take(&mut ctx.ledger);
        let job_actions = std::mem::take(&mut ctx.actions);
        let result = match self {
            Self::Alignment(task) => task.run(ctx),
            Self::ObjectProcessing(task) => task.run(ctx),
            Self::OutputHandler(task) => task.run(ctx),
        };
        let task_ledger = std::mem::replace(&mut ctx.ledger, job_ledger);
        let task_actions = std::mem::replace(&mut ctx.actions, job_actions);
        ctx.ledger.merge(task_ledger);
        ctx.actions.extend(task_actions);
        result
    }
}

/// Build every configured task for `ctx`.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] for any unresolvable step list, step
/// configuration or step that refuses to initialise.
pub fn plan_tasks(ctx: &JobContext) -> Result<Vec<Task>, PipelineError> {
    let mut tasks = Vec::new();
    if let Some(task) = AlignmentTask::new(ctx)? {
        tasks.push(Task::Alignment(task));
    }
    if let Some(task) = ObjectProcessingTask::new(ctx)? {
        tasks.push(Task::ObjectProcessing(task));
    }
    if let Some(task) = OutputHandlerTask::new(ctx)? {
        tasks.push(Task::OutputHandler(task));
    }
    Ok(tasks)
}

/// Plan and run every task of `ctx` in order.
///
/// # Errors
///
/// Propagates the first planning or task failure.
pub fn run_tasks(ctx: &mut JobContext) -> Result<(), PipelineError> {
    let tasks = plan_tasks(ctx)?;
    if tasks.is_empty() {
        info!(job = %ctx.job, "No steps configured");
    }
    for task in &tasks {
        info!(job = %ctx.job, task = task.name(), "Starting task");
        task.run(ctx)?;
    }
    Ok(())
}
