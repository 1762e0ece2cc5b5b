//! Step providers described in job configuration.
//!
//! A [`ToolDefinition`] is an argument-vector template. Placeholders of the
//! form `{name}` are filled from built-in values (`input1`, `input2`,
//! `output1`, `output2`, `output_dir`, `work_dir`, `basename`, `readset`,
//! `readset_id`, `fasta`, `genome`, `bam`, `dataset`, `report`, `threads`,
//! and `intervals` and `interval_set` inside an interval partition) and from
//! scalar values of the step's configuration. An argument that is
//! exactly `{inputs}` expands to one argument per input file.
//!
//! Outputs referenced by the template are written into a staging directory
//! and moved next to their final names only after the tool succeeds; a
//! referenced output the tool did not create fails the step.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use seqpipe_types::artifact::ObjectArtifact;
use seqpipe_types::capability::Capability;
use seqpipe_types::ledger::FileLedger;
use seqpipe_types::sequence::{FastqPair, InputRecord, Readset, ReferenceGenome};
use tracing::warn;

use crate::command::CommandRunner;
use crate::config::types::ToolDefinition;
use crate::error::PipelineError;
use crate::fastq::{file_name, minimal_basename};
use crate::registry::{RegistryError, StepCtx, StepProvider, StepRegistry};
use crate::step::{
    AlignmentOutput, AlignmentStep, AssemblyOutput, AssemblyStep, BamProcessingOutput, BamProcessingStep,
    GenericOutputHandler, HandlerOutput, PreprocessingOutput, PreprocessingStep, SingleCellOutput,
    SingleCellStep, Step, StepInstance,
};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"));

pub struct CommandTemplateProvider {
    tool: Arc<ToolDefinition>,
}

impl CommandTemplateProvider {
    #[must_use]
    pub fn new(tool: ToolDefinition) -> Self {
        Self { tool: Arc::new(tool) }
    }

    /// Register one provider per tool definition.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] if a tool name collides
    /// within its capability.
    pub fn register_all(registry: &mut StepRegistry, tools: &[ToolDefinition]) -> Result<(), RegistryError> {
        for tool in tools {
            registry.register(Arc::new(Self::new(tool.clone())))?;
        }
        Ok(())
    }
}

impl StepProvider for CommandTemplateProvider {
    fn name(&self) -> &str {
        &self.tool.name
    }

    fn label(&self) -> &str {
        self.tool.label()
    }

    fn description(&self) -> Option<&str> {
        self.tool.description.as_deref()
    }

    fn capability(&self) -> Capability {
        self.tool.capability
    }

    fn parameter_schema(&self) -> Option<&serde_json::Value> {
        self.tool.parameters.as_ref()
    }

    fn create(&self, ctx: &StepCtx<'_>) -> Result<StepInstance, PipelineError> {
        let mut vars = BTreeMap::new();
        match &ctx.config {
            serde_json::Value::Null => {}
            serde_json::Value::Object(map) => {
                for (key, value) in map {
                    match value {
                        serde_json::Value::String(s) => {
                            vars.insert(key.clone(), s.clone());
                        }
                        serde_json::Value::Number(n) => {
                            vars.insert(key.clone(), n.to_string());
                        }
                        serde_json::Value::Bool(b) => {
                            vars.insert(key.clone(), b.to_string());
                        }
                        _ => {}
                    }
                }
            }
            other => {
                return Err(PipelineError::config(format!(
                    "Step '{}' configuration must be an object, got {other}",
                    self.tool.name
                )))
            }
        }
        vars.insert("threads".to_string(), ctx.job.threads.to_string());
        vars.insert("work_dir".to_string(), ctx.job.work_dir.to_string_lossy().into_owned());
        if let Some(set) = &ctx.job.intervals {
            vars.insert("intervals".to_string(), set.joined());
            vars.insert("interval_set".to_string(), set.name.clone());
        }

        let step = TemplateStep {
            tool: Arc::clone(&self.tool),
            unique_name: ctx.def.unique_name(),
            vars,
            runner: CommandRunner::new().in_dir(&ctx.job.work_dir),
        };
        Ok(match self.tool.capability {
            Capability::Preprocessing => StepInstance::Preprocessing(Box::new(step)),
            Capability::Alignment => StepInstance::Alignment(Box::new(step)),
            Capability::BamProcessing => StepInstance::BamProcessing(Box::new(step)),
            Capability::Assembly => StepInstance::Assembly(Box::new(step)),
            Capability::SingleCellProcessing => StepInstance::SingleCell(Box::new(step)),
            Capability::GenericOutputHandler => StepInstance::OutputHandler(Box::new(step)),
            Capability::Any => {
                return Err(PipelineError::config(format!(
                    "Step '{}' has no concrete capability",
                    self.tool.name
                )))
            }
        })
    }
}

/// Scratch directory for one invocation's outputs.
struct Staging {
    dir: PathBuf,
}

impl Staging {
    /// Create a fresh staging directory, discarding leftovers of an
    /// interrupted earlier attempt.
    fn new(output_dir: &Path, name: &str) -> Result<Self, PipelineError> {
        let dir = output_dir.join(format!(".{name}.partial"));
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        }
        fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        Ok(Self { dir })
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}

/// One planned output: where the tool writes it and where it ends up.
struct PlannedOutput {
    staged: PathBuf,
    dest: PathBuf,
}

struct TemplateStep {
    tool: Arc<ToolDefinition>,
    unique_name: String,
    vars: BTreeMap<String, String>,
    runner: CommandRunner,
}

impl TemplateStep {
    fn template(&self, paired: bool) -> Result<&[String], PipelineError> {
        match (&self.tool.paired_command, paired) {
            (Some(cmd), true) => Ok(cmd.as_slice()),
            (None, true) if self.references("input2") => Ok(self.tool.command.as_slice()),
            (None, true) => Err(PipelineError::config(format!(
                "Step '{}' received paired-end input but defines no paired_command",
                self.tool.name
            ))),
            (_, false) => Ok(self.tool.command.as_slice()),
        }
    }

    /// Whether any command template or the stdout target uses `{name}`.
    fn references(&self, name: &str) -> bool {
        let needle = format!("{{{name}}}");
        self.tool
            .command
            .iter()
            .chain(self.tool.paired_command.iter().flatten())
            .chain(self.tool.stdout.iter())
            .any(|arg| arg.contains(&needle))
    }

    fn render_arg(&self, arg: &str, vars: &BTreeMap<String, String>, missing: &mut Vec<String>) -> String {
        PLACEHOLDER_RE
            .replace_all(arg, |cap: &regex::Captures<'_>| {
                vars.get(&cap[1]).cloned().unwrap_or_else(|| {
                    missing.push(cap[1].to_string());
                    String::new()
                })
            })
            .into_owned()
    }

    fn render(
        &self,
        template: &[String],
        vars: &BTreeMap<String, String>,
        inputs: &[String],
    ) -> Result<(Vec<String>, Option<PathBuf>), PipelineError> {
        let mut missing = Vec::new();
        let mut args = Vec::with_capacity(template.len());
        for arg in template {
            if arg == "{inputs}" {
                args.extend(inputs.iter().cloned());
            } else {
                args.push(self.render_arg(arg, vars, &mut missing));
            }
        }
        let stdout = self
            .tool
            .stdout
            .as_deref()
            .map(|s| PathBuf::from(self.render_arg(s, vars, &mut missing)));
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(PipelineError::config(format!(
                "Step '{}': no value for placeholder(s) {}",
                self.tool.name,
                missing.iter().map(|m| format!("{{{m}}}")).collect::<Vec<_>>().join(", ")
            )));
        }
        Ok((args, stdout))
    }

    /// Render and run the command for one unit of work, then move every
    /// planned output into place.
    fn run(
        &self,
        mut vars: BTreeMap<String, String>,
        paired: bool,
        inputs: &[String],
        outputs: &[(&str, PlannedOutput)],
        ledger: &mut FileLedger,
    ) -> Result<(), PipelineError> {
        for (key, planned) in outputs {
            vars.insert((*key).to_string(), planned.staged.to_string_lossy().into_owned());
        }
        let template = self.template(paired)?;
        let (args, stdout) = self.render(template, &vars, inputs)?;
        match stdout {
            Some(path) => self.runner.execute_to_file(&args, &path, ledger)?,
            None => {
                self.runner.execute(&args, ledger)?;
            }
        }
        let program = args.first().map_or(self.tool.name.as_str(), String::as_str);
        for (key, planned) in outputs {
            if !planned.staged.exists() {
                return Err(PipelineError::tool(
                    program,
                    format!("expected output {{{key}}} was not created: {}", planned.staged.display()),
                ));
            }
        }
        for (_, planned) in outputs {
            commit_file(&planned.staged, &planned.dest)?;
        }
        Ok(())
    }

    fn base_vars(&self, output_dir: &Path) -> BTreeMap<String, String> {
        let mut vars = self.vars.clone();
        vars.insert("output_dir".to_string(), output_dir.to_string_lossy().into_owned());
        vars
    }

    fn readset_vars(&self, vars: &mut BTreeMap<String, String>, readset: &Readset, basename: &str) {
        vars.insert("readset".to_string(), readset.name.clone());
        vars.insert("readset_id".to_string(), readset.id.to_string());
        vars.insert("basename".to_string(), basename.to_string());
    }

    /// Plan `key` at `file_name` if the template references it.
    fn plan(&self, staging: &Staging, output_dir: &Path, key: &'static str, file_name: &str) -> Option<(&'static str, PlannedOutput)> {
        self.references(key).then(|| {
            (
                key,
                PlannedOutput {
                    staged: staging.path(file_name),
                    dest: output_dir.join(file_name),
                },
            )
        })
    }
}

fn commit_file(staged: &Path, dest: &Path) -> Result<(), PipelineError> {
    fs::rename(staged, dest).map_err(|e| PipelineError::io(dest, e))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Step for TemplateStep {}

impl PreprocessingStep for TemplateStep {
    fn process_input_file(
        &self,
        readset: &Readset,
        input: &FastqPair,
        output_dir: &Path,
    ) -> Result<PreprocessingOutput, PipelineError> {
        let basename = minimal_basename(&file_name(&input.first));
        let paired = input.second.is_some();
        let staging = Staging::new(output_dir, &self.unique_name)?;

        let mut vars = self.base_vars(output_dir);
        self.readset_vars(&mut vars, readset, &basename);
        vars.insert("input1".to_string(), path_string(&input.first));
        if let Some(second) = &input.second {
            vars.insert("input2".to_string(), path_string(second));
        }

        let (name1, name2) = if paired {
            (
                format!("{basename}.{}.R1.fastq", self.unique_name),
                Some(format!("{basename}.{}.R2.fastq", self.unique_name)),
            )
        } else {
            (format!("{basename}.{}.fastq", self.unique_name), None)
        };
        let mut outputs: Vec<(&str, PlannedOutput)> = Vec::new();
        outputs.extend(self.plan(&staging, output_dir, "output1", &name1));
        if let Some(name2) = &name2 {
            outputs.extend(self.plan(&staging, output_dir, "output2", name2));
        }

        let mut ledger = FileLedger::new();
        for file in input.files() {
            ledger.add_input(file, "Input FASTQ");
        }
        let inputs: Vec<String> = input.files().map(path_string).collect();
        self.run(vars, paired, &inputs, &outputs, &mut ledger)?;

        let dest = |key: &str| outputs.iter().find(|(k, _)| *k == key).map(|(_, p)| p.dest.clone());
        let processed = match (dest("output1"), dest("output2")) {
            (Some(first), Some(second)) => Some(FastqPair::paired(first, second)),
            (Some(first), None) if !paired => Some(FastqPair::single(first)),
            (Some(_), None) => {
                return Err(PipelineError::config(format!(
                    "Step '{}' writes {{output1}} but not {{output2}} for paired-end input",
                    self.tool.name
                )))
            }
            (None, _) => None,
        };
        if let Some(pair) = &processed {
            for file in pair.files() {
                ledger.add_output(file, "Processed FASTQ");
            }
        }
        Ok(PreprocessingOutput { processed, ledger })
    }
}

impl AlignmentStep for TemplateStep {
    fn perform_alignment(
        &self,
        readset: &Readset,
        input: &FastqPair,
        genome: &ReferenceGenome,
        output_dir: &Path,
        basename: &str,
    ) -> Result<AlignmentOutput, PipelineError> {
        let staging = Staging::new(output_dir, &self.unique_name)?;
        let mut vars = self.base_vars(output_dir);
        self.readset_vars(&mut vars, readset, basename);
        vars.insert("input1".to_string(), path_string(&input.first));
        if let Some(second) = &input.second {
            vars.insert("input2".to_string(), path_string(second));
        }
        vars.insert("fasta".to_string(), path_string(genome.effective_fasta()));
        vars.insert("genome".to_string(), genome.name.clone());

        let bam_name = format!("{basename}.bam");
        let outputs: Vec<(&str, PlannedOutput)> = self
            .plan(&staging, output_dir, "output1", &bam_name)
            .into_iter()
            .collect();
        if outputs.is_empty() {
            return Err(PipelineError::config(format!(
                "Alignment step '{}' must write {{output1}}",
                self.tool.name
            )));
        }

        let mut ledger = FileLedger::new();
        for file in input.files() {
            ledger.add_input(file, "Input FASTQ");
        }
        ledger.add_input(genome.effective_fasta(), "Reference FASTA");
        let inputs: Vec<String> = input.files().map(path_string).collect();
        self.run(vars, input.second.is_some(), &inputs, &outputs, &mut ledger)?;

        let bam = output_dir.join(bam_name);
        ledger.add_output(&bam, "BAM");
        Ok(AlignmentOutput { bam, ledger })
    }
}

impl BamProcessingStep for TemplateStep {
    fn process_bam(
        &self,
        readset: &Readset,
        bam: &Path,
        genome: &ReferenceGenome,
        output_dir: &Path,
    ) -> Result<BamProcessingOutput, PipelineError> {
        let stem = bam
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| readset.name.clone());
        let staging = Staging::new(output_dir, &self.unique_name)?;
        let mut vars = self.base_vars(output_dir);
        self.readset_vars(&mut vars, readset, &stem);
        vars.insert("bam".to_string(), path_string(bam));
        vars.insert("input1".to_string(), path_string(bam));
        vars.insert("fasta".to_string(), path_string(genome.effective_fasta()));
        vars.insert("genome".to_string(), genome.name.clone());

        let out_name = format!("{stem}.{}.bam", self.unique_name);
        let outputs: Vec<(&str, PlannedOutput)> = self
            .plan(&staging, output_dir, "output1", &out_name)
            .into_iter()
            .collect();

        let mut ledger = FileLedger::new();
        ledger.add_input(bam, "Input BAM");
        self.run(vars, false, &[path_string(bam)], &outputs, &mut ledger)?;

        let out = (!outputs.is_empty()).then(|| output_dir.join(out_name));
        if let Some(out) = &out {
            ledger.add_output(out, "BAM");
        }
        Ok(BamProcessingOutput { bam: out, ledger })
    }
}

impl AssemblyStep for TemplateStep {
    fn assemble(
        &self,
        readset: &Readset,
        input: &FastqPair,
        output_dir: &Path,
        basename: &str,
    ) -> Result<AssemblyOutput, PipelineError> {
        let staging = Staging::new(output_dir, &self.unique_name)?;
        let mut vars = self.base_vars(output_dir);
        self.readset_vars(&mut vars, readset, basename);
        vars.insert("input1".to_string(), path_string(&input.first));
        if let Some(second) = &input.second {
            vars.insert("input2".to_string(), path_string(second));
        }

        let contigs_name = format!("{basename}.{}.contigs.fasta", self.unique_name);
        let outputs: Vec<(&str, PlannedOutput)> = self
            .plan(&staging, output_dir, "output1", &contigs_name)
            .into_iter()
            .collect();
        if outputs.is_empty() {
            return Err(PipelineError::config(format!(
                "Assembly step '{}' must write {{output1}}",
                self.tool.name
            )));
        }

        let mut ledger = FileLedger::new();
        for file in input.files() {
            ledger.add_input(file, "Input FASTQ");
        }
        let inputs: Vec<String> = input.files().map(path_string).collect();
        self.run(vars, input.second.is_some(), &inputs, &outputs, &mut ledger)?;

        let contigs = output_dir.join(contigs_name);
        ledger.add_output(&contigs, "Contigs");
        Ok(AssemblyOutput { contigs, ledger })
    }
}

impl SingleCellStep for TemplateStep {
    fn creates_objects(&self) -> bool {
        self.tool.creates_objects
    }

    fn execute(
        &self,
        inputs: &[ObjectArtifact],
        output_prefix: &str,
        output_dir: &Path,
    ) -> Result<SingleCellOutput, PipelineError> {
        let mut output = SingleCellOutput::default();
        let mut reports = Vec::new();
        let all_inputs: Vec<String> = inputs.iter().map(|o| path_string(&o.file)).collect();

        for object in inputs {
            let staging = Staging::new(output_dir, &format!("{}-{}", self.unique_name, object.dataset_id))?;
            let mut vars = self.base_vars(output_dir);
            vars.insert("input1".to_string(), path_string(&object.file));
            vars.insert("dataset".to_string(), object.dataset_id.clone());
            vars.insert("basename".to_string(), output_prefix.to_string());

            let object_name = format!("{output_prefix}.{}.seurat.rds", object.dataset_id);
            let report_name = format!("{output_prefix}.{}.md", object.dataset_id);
            let mut planned: Vec<(&str, PlannedOutput)> = Vec::new();
            planned.extend(self.plan(&staging, output_dir, "output1", &object_name));
            let report = self.plan(&staging, output_dir, "report", &report_name);
            if let Some((key, report)) = &report {
                vars.insert((*key).to_string(), path_string(&report.staged));
            }

            output.ledger.add_input(&object.file, "Seurat Object");
            self.run(vars, false, &all_inputs, &planned, &mut output.ledger)?;

            if let Some((_, report)) = report {
                if report.staged.exists() {
                    commit_file(&report.staged, &report.dest)?;
                    reports.push(report.dest);
                }
            }
            if !planned.is_empty() {
                let file = output_dir.join(object_name);
                output.ledger.add_output(&file, "Seurat Object");
                output.objects.push(
                    ObjectArtifact::new(object.dataset_id.clone(), object.dataset_name.clone(), file)
                        .with_readset(object.readset_id),
                );
            }
        }

        if !reports.is_empty() {
            let markdown = output_dir.join(format!("{output_prefix}.md"));
            let mut combined = String::new();
            for report in &reports {
                combined.push_str(&fs::read_to_string(report).map_err(|e| PipelineError::io(report, e))?);
                combined.push('\n');
            }
            fs::write(&markdown, combined).map_err(|e| PipelineError::io(&markdown, e))?;
            output.ledger.add_intermediate_files(reports);
            output.markdown = Some(markdown);
        }
        Ok(output)
    }
}

impl GenericOutputHandler for TemplateStep {
    fn process_outputs(&self, inputs: &[InputRecord], output_dir: &Path) -> Result<HandlerOutput, PipelineError> {
        let mut vars = self.base_vars(output_dir);
        if let Some(first) = inputs.first() {
            vars.insert("input1".to_string(), path_string(&first.file));
        }
        let files: Vec<String> = inputs.iter().map(|i| path_string(&i.file)).collect();
        let mut ledger = FileLedger::new();
        for input in inputs {
            ledger.add_input(&input.file, "Input File");
        }
        self.run(vars, false, &files, &[], &mut ledger)?;
        Ok(HandlerOutput { ledger })
    }
}
