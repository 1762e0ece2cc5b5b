//! Single-cell object processing.
//!
//! Step 0 wraps the job's raw count inputs as objects; every configured
//! single-cell step then transforms the current object list. A step that
//! produces nothing hands the prior objects on. Each completed step may
//! contribute report files, which are gathered in index order into a final
//! report manifest.

use std::fmt::Write as _;
use std::fs;

use seqpipe_types::action::Action;
use seqpipe_types::artifact::ObjectArtifact;
use seqpipe_types::capability::Capability;
use seqpipe_types::checkpoint::StepReports;
use seqpipe_types::ledger::FileLedger;
use seqpipe_types::sequence::SequenceOutput;
use tracing::info;

use super::{checkpoint_store, finish_task, instantiate, record_outputs, ConfiguredStep};
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::fastq::file_name;
use crate::resumer::Resumer;
use crate::step::{SingleCellStep, StepInstance};

pub const SINGLE_CELL_CHECKPOINT: &str = "processSingleCellCheckpoint.json";
pub const PREPARE_RAW_COUNTS_ACTION: &str = "Prepare Raw Counts";

const OBJECT_CATEGORY: &str = "Seurat Object";
const REPORT_CATEGORY: &str = "Seurat Report";

pub struct ObjectProcessingTask {
    steps: Vec<ConfiguredStep<dyn SingleCellStep>>,
}

impl ObjectProcessingTask {
    /// Build the task; `None` when no single-cell step is configured.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for an unresolvable step list or
    /// step configuration.
    pub fn new(ctx: &JobContext) -> Result<Option<Self>, PipelineError> {
        let steps = ctx
            .registry
            .get_steps(&ctx.params, Capability::SingleCellProcessing)?
            .into_iter()
            .map(|def| instantiate(ctx, def, StepInstance::into_single_cell))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((!steps.is_empty()).then_some(Self { steps }))
    }

    /// File-name prefix for a step's outputs: `<job>.<provider>[-<index>]`.
    fn output_prefix(ctx: &JobContext, configured: &ConfiguredStep<dyn SingleCellStep>) -> String {
        let job: String = ctx
            .job
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{job}.{}", configured.def.unique_name())
    }

    /// Run every step over the job's objects.
    ///
    /// # Errors
    ///
    /// Propagates the first step, I/O or checkpoint failure, and fails when
    /// a step that must create objects produced none.
    pub fn run(&self, ctx: &mut JobContext) -> Result<(), PipelineError> {
        fs::create_dir_all(&ctx.work_dir).map_err(|e| PipelineError::io(&ctx.work_dir, e))?;
        let mut resumer = Resumer::<ObjectArtifact>::create(ctx, checkpoint_store(ctx, SINGLE_CELL_CHECKPOINT))?;
        if resumer.is_task_complete() {
            return resumer.mark_complete(ctx);
        }

        let mut objects = if resumer.is_step_complete(0) {
            info!(job = %ctx.job, step = PREPARE_RAW_COUNTS_ACTION, index = 0, "Step already complete, skipping");
            resumer.artifacts_from_step(0).unwrap_or_default().to_vec()
        } else {
            prepare_raw_counts(ctx, &mut resumer)?
        };

        for (position, configured) in self.steps.iter().enumerate() {
            let index = u32::try_from(position + 1).unwrap_or(u32::MAX);
            let name = configured.def.action_name();
            if resumer.is_step_complete(index) {
                info!(job = %ctx.job, step = %name, index, "Step already complete, skipping");
                if let Some(recorded) = resumer.artifacts_from_step(index).filter(|a| !a.is_empty()) {
                    objects = recorded.to_vec();
                }
                continue;
            }
            if !configured.step.is_included(&objects) {
                info!(job = %ctx.job, step = %name, index, "Step not included for these inputs, skipping");
                continue;
            }

            let mut action = Action::start(&name).with_description(format!("{} object(s)", objects.len()));
            for object in &objects {
                action.add_input(&object.file, OBJECT_CATEGORY);
            }
            let prefix = Self::output_prefix(ctx, configured);
            let mut out = configured.step.execute(&objects, &prefix, &ctx.work_dir)?;

            if out.objects.is_empty() && configured.step.creates_objects() {
                return Err(PipelineError::tool(
                    configured.def.name(),
                    "step is expected to create objects but produced none",
                ));
            }
            record_outputs(&mut action, &mut out.ledger);
            for object in &out.objects {
                out.ledger.add_intermediate_file(&object.file);
            }
            let reports = StepReports {
                markdown: out.markdown.take(),
                html: out.html.take(),
            };
            info!(step = %name, index, objects = out.objects.len(), "Single-cell step complete");
            if !out.objects.is_empty() {
                objects.clone_from(&out.objects);
            }
            resumer.set_step_complete(index, action, out.objects, reports, out.ledger)?;
        }

        register_outputs(ctx, &resumer, &objects)?;
        resumer.mark_complete(ctx)?;
        finish_task(ctx, "single-cell");
        Ok(())
    }
}

fn prepare_raw_counts(ctx: &JobContext, resumer: &mut Resumer<ObjectArtifact>) -> Result<Vec<ObjectArtifact>, PipelineError> {
    if ctx.input_files.is_empty() {
        return Err(PipelineError::config("Single-cell processing requires at least one input file"));
    }
    let mut action = Action::start(PREPARE_RAW_COUNTS_ACTION);
    let mut objects = Vec::with_capacity(ctx.input_files.len());
    for file in &ctx.input_files {
        if !file.exists() {
            return Err(PipelineError::io(
                file,
                std::io::Error::new(std::io::ErrorKind::NotFound, "raw counts input not found"),
            ));
        }
        let name = file_name(file);
        let dataset_id = name.split('.').next().unwrap_or(&name).to_string();
        let readset_id = ctx
            .readsets
            .iter()
            .find(|r| r.file1 == name || r.name == dataset_id)
            .map(|r| r.id);
        action.add_input(file, "Raw Counts");
        objects.push(ObjectArtifact::new(dataset_id, name, file).with_readset(readset_id));
    }
    resumer.set_step_complete(0, action, objects.clone(), StepReports::default(), FileLedger::new())?;
    Ok(objects)
}

/// Write the report manifest and register the final objects.
fn register_outputs(
    ctx: &mut JobContext,
    resumer: &Resumer<ObjectArtifact>,
    objects: &[ObjectArtifact],
) -> Result<(), PipelineError> {
    fs::create_dir_all(&ctx.output_dir).map_err(|e| PipelineError::io(&ctx.output_dir, e))?;
    let manifest = ctx.output_dir.join(format!("{}.reports.md", ctx.job.as_str().replace('/', "_")));
    let mut body = String::from("# Reports\n\n");
    for (index, reports) in resumer.reports() {
        for file in reports.markdown.iter().chain(reports.html.iter()) {
            let _ = writeln!(body, "- step {index}: {}", file.display());
            ctx.ledger.add_output(file, "Report");
        }
    }
    fs::write(&manifest, body).map_err(|e| PipelineError::io(&manifest, e))?;
    ctx.ledger.add_output(&manifest, "Report Manifest");

    for object in objects {
        ctx.ledger.add_output(&object.file, OBJECT_CATEGORY);
        ctx.ledger.add_sequence_output(
            SequenceOutput::new(&object.file, format!("{}: {OBJECT_CATEGORY}", object.dataset_name), OBJECT_CATEGORY)
                .with_readset(object.readset_id),
        );
        ctx.ledger.add_sequence_output(
            SequenceOutput::new(&manifest, format!("{}: Report", object.dataset_name), REPORT_CATEGORY)
                .with_readset(object.readset_id),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bam::tests::FakeBamTools;
    use crate::registry::{StepCtx, StepProvider, StepRegistry};
    use crate::step::{SingleCellOutput, Step};
    use seqpipe_types::state::JobId;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Copies each object to `<prefix>.<dataset>.rds` and writes a report.
    struct Normalize {
        calls: Arc<AtomicUsize>,
        produce: bool,
        creates: bool,
    }

    impl Step for Normalize {}

    impl SingleCellStep for Normalize {
        fn creates_objects(&self) -> bool {
            self.creates
        }

        fn execute(
            &self,
            inputs: &[ObjectArtifact],
            output_prefix: &str,
            output_dir: &Path,
        ) -> Result<SingleCellOutput, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out = SingleCellOutput::default();
            if !self.produce {
                return Ok(out);
            }
            for input in inputs {
                let file = output_dir.join(format!("{output_prefix}.{}.rds", input.dataset_id));
                fs::copy(&input.file, &file).unwrap();
                out.objects.push(ObjectArtifact::new(&input.dataset_id, &input.dataset_name, file));
            }
            let report = output_dir.join(format!("{output_prefix}.md"));
            fs::write(&report, "ok").unwrap();
            out.markdown = Some(report);
            Ok(out)
        }
    }

    struct NormalizeProvider {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        produce: bool,
        creates: bool,
    }

    impl StepProvider for NormalizeProvider {
        fn name(&self) -> &str {
            self.name
        }
        fn label(&self) -> &str {
            self.name
        }
        fn capability(&self) -> Capability {
            Capability::SingleCellProcessing
        }
        fn create(&self, _ctx: &StepCtx<'_>) -> Result<StepInstance, PipelineError> {
            Ok(StepInstance::SingleCell(Box::new(Normalize {
                calls: Arc::clone(&self.calls),
                produce: self.produce,
                creates: self.creates,
            })))
        }
    }

    fn setup(dir: &Path, providers: Vec<NormalizeProvider>, steps: &str) -> JobContext {
        let mut registry = StepRegistry::with_default_step_types();
        for provider in providers {
            registry.register(Arc::new(provider)).unwrap();
        }
        let mut ctx = JobContext::new(
            JobId::new("sc"),
            dir.join("work"),
            dir.join("source"),
            Arc::new(registry),
            Arc::new(FakeBamTools::default()),
        );
        ctx.params.insert("singleCell".into(), steps.into());
        let counts = dir.join("pbmc.counts.h5");
        fs::write(&counts, "matrix").unwrap();
        ctx.input_files = vec![counts];
        ctx
    }

    #[test]
    fn test_objects_flow_and_outputs_registered() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut ctx = setup(
            dir.path(),
            vec![NormalizeProvider {
                name: "Normalize",
                calls: Arc::clone(&calls),
                produce: true,
                creates: true,
            }],
            "Normalize;Normalize",
        );
        let task = ObjectProcessingTask::new(&ctx).unwrap().unwrap();
        task.run(&mut ctx).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let names: Vec<&str> = ctx.actions.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, [PREPARE_RAW_COUNTS_ACTION, "Normalize", "Normalize (2)"]);

        let final_object = ctx.work_dir.join("sc.Normalize-1.pbmc.rds");
        assert!(final_object.exists(), "final object survives cleanup");
        assert!(!ctx.work_dir.join("sc.Normalize.pbmc.rds").exists());
        let categories: Vec<&str> = ctx.ledger.sequence_outputs().iter().map(|s| s.category.as_str()).collect();
        assert_eq!(categories, [OBJECT_CATEGORY, REPORT_CATEGORY]);

        let manifest = fs::read_to_string(ctx.source_dir.join("sc.reports.md")).unwrap();
        let first = manifest.find("sc.Normalize.md").unwrap();
        let second = manifest.find("sc.Normalize-1.md").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_empty_output_keeps_prior_objects() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut ctx = setup(
            dir.path(),
            vec![NormalizeProvider {
                name: "Inspect",
                calls: Arc::clone(&calls),
                produce: false,
                creates: false,
            }],
            "Inspect",
        );
        ObjectProcessingTask::new(&ctx).unwrap().unwrap().run(&mut ctx).unwrap();
        assert_eq!(ctx.ledger.sequence_outputs()[0].file, dir.path().join("pbmc.counts.h5"));
    }

    #[test]
    fn test_missing_objects_fail_when_required() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = setup(
            dir.path(),
            vec![NormalizeProvider {
                name: "Broken",
                calls: Arc::new(AtomicUsize::new(0)),
                produce: false,
                creates: true,
            }],
            "Broken",
        );
        let err = ObjectProcessingTask::new(&ctx).unwrap().unwrap().run(&mut ctx).unwrap_err();
        assert!(matches!(err, PipelineError::Tool { .. }));
    }

    #[test]
    fn test_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = setup(dir.path(), Vec::new(), "");
        assert!(ObjectProcessingTask::new(&ctx).unwrap().is_none());
    }
}
