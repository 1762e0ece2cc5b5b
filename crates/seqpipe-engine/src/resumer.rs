//! Checkpointed progress through an ordered list of steps.
//!
//! A [`Resumer`] owns the checkpoint of one task in one job or partition.
//! Every completed step is recorded with its action, artifacts, reports and
//! ledger contribution, and the whole checkpoint is written to its store
//! before [`Resumer::set_step_complete`] returns. The step ledgers stay in
//! the resumer until [`Resumer::mark_complete`] merges them into the job, so
//! a resumed run never records the same work twice. A finished task leaves
//! its outcome in the checkpoint and is replayed, not rerun, until the job
//! as a whole succeeds and the runner removes its checkpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use seqpipe_state::{load_checkpoint, save_checkpoint, CheckpointStore};
use seqpipe_types::action::Action;
use seqpipe_types::checkpoint::{CheckpointState, StepReports, TaskOutcome};
use seqpipe_types::ledger::FileLedger;
use seqpipe_types::paths::Rebase;

use crate::context::JobContext;
use crate::error::PipelineError;

pub struct Resumer<A> {
    store: Arc<dyn CheckpointStore>,
    state: CheckpointState<A>,
    resumed: bool,
}

impl<A> Resumer<A>
where
    A: Serialize + DeserializeOwned + Rebase,
{
    /// Load the checkpoint from `store`, if any, and bind it to `ctx`'s
    /// work directory.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Checkpoint`] if a stored checkpoint cannot be
    /// read, is malformed or has an unsupported version. Such a checkpoint
    /// is never partially recovered.
    pub fn create(ctx: &JobContext, store: Arc<dyn CheckpointStore>) -> Result<Self, PipelineError> {
        match load_checkpoint::<A>(store.as_ref())? {
            Some(mut state) => {
                state.rebase_work_dir(&ctx.work_dir);
                info!(
                    job = ctx.job.as_str(),
                    checkpoint = store.location(),
                    completed = state.per_step_artifacts.len(),
                    "Resuming from checkpoint"
                );
                Ok(Self {
                    store,
                    state,
                    resumed: true,
                })
            }
            None => Ok(Self {
                store,
                state: CheckpointState::new(&ctx.work_dir),
                resumed: false,
            }),
        }
    }

    /// Record step `index` as complete and persist the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Checkpoint`] if the checkpoint cannot be
    /// written. The step then counts as not completed.
    pub fn set_step_complete(
        &mut self,
        index: u32,
        mut action: Action,
        artifacts: Vec<A>,
        reports: StepReports,
        ledger: FileLedger,
    ) -> Result<(), PipelineError> {
        if !action.is_finished() {
            action.finish();
        }
        debug!(index, action = %action.name, "Recording completed step");
        self.state.ledger_state.merge(ledger);
        self.state.record_step(index, action, artifacts, reports);
        save_checkpoint(self.store.as_ref(), &self.state)?;
        Ok(())
    }

    /// Finish the task on `ctx`.
    ///
    /// A checkpoint that already holds the task's outcome is replayed onto
    /// `ctx`. Otherwise the recorded step actions and ledger are merged
    /// into `ctx`, whose actions and ledger then become the saved outcome,
    /// so `ctx` must carry nothing but this task's work. The checkpoint
    /// stays in its store; only a successful job removes it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Checkpoint`] if the outcome cannot be
    /// written.
    pub fn mark_complete(mut self, ctx: &mut JobContext) -> Result<(), PipelineError> {
        let location = self.store.location();
        if let Some(outcome) = self.state.task_outcome.take() {
            info!(
                job = ctx.job.as_str(),
                checkpoint = location,
                actions = outcome.actions.len(),
                "Task already complete, replaying recorded outcome"
            );
            ctx.actions.extend(outcome.actions);
            ctx.ledger.merge(outcome.ledger);
            return Ok(());
        }

        ctx.actions.extend(self.state.recorded_actions.iter().cloned());
        ctx.ledger.merge(self.state.ledger_state.clone());
        self.state.task_outcome = Some(TaskOutcome {
            actions: ctx.actions.clone(),
            ledger: ctx.ledger.clone(),
        });
        save_checkpoint(self.store.as_ref(), &self.state)?;
        info!(
            job = ctx.job.as_str(),
            checkpoint = location,
            steps = self.state.per_step_artifacts.len(),
            "Task complete, outcome recorded"
        );
        Ok(())
    }
}

impl<A> Resumer<A> {
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Whether the checkpoint records the whole task as finished.
    #[must_use]
    pub fn is_task_complete(&self) -> bool {
        self.state.task_outcome.is_some()
    }

    #[must_use]
    pub fn is_step_complete(&self, index: u32) -> bool {
        self.state.is_step_complete(index)
    }

    /// Artifacts recorded for `index` itself; empty when the step handed
    /// its predecessor's artifacts through.
    #[must_use]
    pub fn artifacts_from_step(&self, index: u32) -> Option<&[A]> {
        self.state.per_step_artifacts.get(&index).map(Vec::as_slice)
    }

    /// Artifacts in effect after `index`.
    #[must_use]
    pub fn effective_artifacts(&self, index: u32) -> Option<&[A]> {
        self.state.effective_artifacts(index)
    }

    /// Reports of every completed step, in index order.
    #[must_use]
    pub fn reports(&self) -> &BTreeMap<u32, StepReports> {
        &self.state.per_step_reports
    }

    #[must_use]
    pub fn recorded_actions(&self) -> &[Action] {
        &self.state.recorded_actions
    }
}
