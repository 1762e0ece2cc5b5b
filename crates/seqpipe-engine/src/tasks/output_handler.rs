//! Generic output handlers run over the job's input files.

use std::fs;

use seqpipe_types::action::Action;
use seqpipe_types::artifact::FileArtifact;
use seqpipe_types::capability::Capability;
use seqpipe_types::checkpoint::StepReports;
use seqpipe_types::sequence::InputRecord;
use tracing::info;

use super::{checkpoint_store, finish_task, instantiate, record_outputs, ConfiguredStep};
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::fastq::file_name;
use crate::resumer::Resumer;
use crate::step::{GenericOutputHandler, StepInstance};

pub const OUTPUT_HANDLER_CHECKPOINT: &str = "outputHandlerCheckpoint.json";

pub struct OutputHandlerTask {
    steps: Vec<ConfiguredStep<dyn GenericOutputHandler>>,
}

impl OutputHandlerTask {
    /// Build the task; `None` when no output handler is configured.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for an unresolvable step list or
    /// step configuration.
    pub fn new(ctx: &JobContext) -> Result<Option<Self>, PipelineError> {
        let steps = ctx
            .registry
            .get_steps(&ctx.params, Capability::GenericOutputHandler)?
            .into_iter()
            .map(|def| instantiate(ctx, def, StepInstance::into_output_handler))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((!steps.is_empty()).then_some(Self { steps }))
    }

    /// Run every handler in order.
    ///
    /// # Errors
    ///
    /// Propagates the first step, I/O or checkpoint failure.
    pub fn run(&self, ctx: &mut JobContext) -> Result<(), PipelineError> {
        for dir in [&ctx.work_dir, &ctx.output_dir] {
            fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
        }
        let mut resumer = Resumer::<FileArtifact>::create(ctx, checkpoint_store(ctx, OUTPUT_HANDLER_CHECKPOINT))?;
        if resumer.is_task_complete() {
            return resumer.mark_complete(ctx);
        }
        let records = input_records(ctx);

        for (position, configured) in self.steps.iter().enumerate() {
            let index = u32::try_from(position).unwrap_or(u32::MAX);
            let name = configured.def.action_name();
            if resumer.is_step_complete(index) {
                info!(job = %ctx.job, step = %name, index, "Step already complete, skipping");
                continue;
            }
            let mut action = Action::start(&name);
            for record in &records {
                action.add_input(&record.file, "Input File");
            }
            let mut out = configured.step.process_outputs(&records, &ctx.output_dir)?;
            record_outputs(&mut action, &mut out.ledger);
            resumer.set_step_complete(index, action, Vec::new(), StepReports::default(), out.ledger)?;
        }

        resumer.mark_complete(ctx)?;
        finish_task(ctx, "output-handler");
        Ok(())
    }
}

fn input_records(ctx: &JobContext) -> Vec<InputRecord> {
    ctx.input_files
        .iter()
        .zip(1i64..)
        .map(|(file, row_id)| {
            let name = file_name(file);
            let readset = ctx
                .readsets
                .iter()
                .find(|r| r.file1 == name || r.file2.as_deref() == Some(name.as_str()));
            InputRecord {
                row_id,
                name,
                file: file.clone(),
                readset_id: readset.map(|r| r.id),
                library_id: None,
            }
        })
        .collect()
}
