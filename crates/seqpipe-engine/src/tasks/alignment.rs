//! Read preprocessing, alignment and BAM post-processing for each readset.
//!
//! Step indices are global across readsets: the readset at position `p` in
//! the job owns the block starting at `p * steps_per_readset`, laid out as
//! its preprocessing steps, the aligner, its BAM steps and the assembler.
//! Decompression, reference copying and BAM finalisation are not
//! checkpointed; they are repeated (or recognised as done) on every run.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use seqpipe_types::action::Action;
use seqpipe_types::artifact::FileArtifact;
use seqpipe_types::capability::Capability;
use seqpipe_types::checkpoint::StepReports;
use seqpipe_types::sequence::{FastqPair, Readset, ReferenceGenome, SequenceOutput};
use tracing::{info, warn};

use super::{checkpoint_store, copy_file, finish_task, instantiate, move_file, record_outputs, ConfiguredStep};
use crate::bam::{index_path, SortOrder};
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::fastq::{count_records, decompress, file_name, is_gzipped, minimal_basename};
use crate::resumer::Resumer;
use crate::step::{AlignmentStep, AssemblyStep, BamProcessingStep, PreprocessingStep, StepInstance};

pub const ALIGNMENT_CHECKPOINT: &str = "alignmentCheckpoint.json";

pub const DECOMPRESS_ACTION: &str = "Decompressing Inputs";
pub const COPY_REFERENCE_ACTION: &str = "Copy Reference";
pub const ALIGNMENT_ACTION: &str = "Performing Alignment";
pub const SORT_ACTION: &str = "Sorting BAM";
pub const INDEX_ACTION: &str = "Indexing BAM";
pub const NORMALIZE_ACTION: &str = "Normalizing File Names";

const PREPROCESSING_STATUS: &str = "PREPROCESSING FASTQ FILES";
const ALIGNMENT_STATUS: &str = "PERFORMING ALIGNMENT";

const FASTQ_ROLE: &str = "FASTQ";
const BAM_ROLE: &str = "BAM";

/// One readset whose input files were found.
struct ReadsetInput {
    position: u32,
    readset: Readset,
    raw: FastqPair,
}

/// Reads currently flowing through one readset's pipeline.
struct Reads {
    pair: FastqPair,
    /// Still the job's input files rather than a step's output.
    raw: bool,
    decompressed: bool,
}

impl Reads {
    fn adopt(&mut self, artifacts: &[FileArtifact]) {
        if let Some(pair) = pair_from_artifacts(artifacts) {
            self.pair = pair;
            self.raw = false;
        }
    }
}

pub struct AlignmentTask {
    preprocessing: Vec<ConfiguredStep<dyn PreprocessingStep>>,
    alignment: Option<ConfiguredStep<dyn AlignmentStep>>,
    bam_processing: Vec<ConfiguredStep<dyn BamProcessingStep>>,
    assembly: Option<ConfiguredStep<dyn AssemblyStep>>,
}

impl AlignmentTask {
    /// Build the task from the job parameters; `None` if no preprocessing,
    /// alignment, BAM or assembly step is configured.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for unresolvable step lists, more
    /// than one aligner or assembler, or an aligner without a genome.
    pub fn new(ctx: &JobContext) -> Result<Option<Self>, PipelineError> {
        let registry = Arc::clone(&ctx.registry);
        let preprocessing = registry
            .get_steps(&ctx.params, Capability::Preprocessing)?
            .into_iter()
            .map(|def| instantiate(ctx, def, StepInstance::into_preprocessing))
            .collect::<Result<Vec<_>, _>>()?;
        let alignment = registry
            .get_single_step(&ctx.params, Capability::Alignment)?
            .map(|def| instantiate(ctx, def, StepInstance::into_alignment))
            .transpose()?;
        let bam_processing = registry
            .get_steps(&ctx.params, Capability::BamProcessing)?
            .into_iter()
            .map(|def| instantiate(ctx, def, StepInstance::into_bam_processing))
            .collect::<Result<Vec<_>, _>>()?;
        let assembly = registry
            .get_single_step(&ctx.params, Capability::Assembly)?
            .map(|def| instantiate(ctx, def, StepInstance::into_assembly))
            .transpose()?;

        if preprocessing.is_empty() && alignment.is_none() && bam_processing.is_empty() && assembly.is_none() {
            return Ok(None);
        }
        if alignment.is_some() && ctx.genome.is_none() {
            return Err(PipelineError::config("Alignment requires a reference genome"));
        }
        if alignment.is_none() {
            info!(job = %ctx.job, "No alignment step configured, alignment will be skipped");
            if !bam_processing.is_empty() {
                warn!(
                    job = %ctx.job,
                    steps = bam_processing.len(),
                    "BAM processing steps configured without an aligner will not run"
                );
            }
        }
        Ok(Some(Self {
            preprocessing,
            alignment,
            bam_processing,
            assembly,
        }))
    }

    /// Number of checkpointed step indices each readset occupies.
    #[must_use]
    pub fn steps_per_readset(&self) -> u32 {
        let mut count = self.preprocessing.len();
        if self.alignment.is_some() {
            count += 1 + self.bam_processing.len();
        }
        if self.assembly.is_some() {
            count += 1;
        }
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Names of every action this task may record.
    #[must_use]
    pub fn allowable_action_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = [
            DECOMPRESS_ACTION,
            COPY_REFERENCE_ACTION,
            ALIGNMENT_ACTION,
            SORT_ACTION,
            INDEX_ACTION,
            NORMALIZE_ACTION,
        ]
        .into_iter()
        .map(String::from)
        .collect();
        names.extend(self.preprocessing.iter().map(|s| s.def.action_name()));
        names.extend(self.alignment.iter().map(|s| s.def.action_name()));
        names.extend(self.bam_processing.iter().map(|s| s.def.action_name()));
        names.extend(self.assembly.iter().map(|s| s.def.action_name()));
        names
    }

    /// Run every readset through the configured steps.
    ///
    /// # Errors
    ///
    /// Propagates the first step, I/O or checkpoint failure. Steps
    /// completed before the failure stay recorded in the checkpoint.
    pub fn run(&self, ctx: &mut JobContext) -> Result<(), PipelineError> {
        fs::create_dir_all(&ctx.work_dir).map_err(|e| PipelineError::io(&ctx.work_dir, e))?;
        let mut resumer = Resumer::<FileArtifact>::create(ctx, checkpoint_store(ctx, ALIGNMENT_CHECKPOINT))?;
        if resumer.is_task_complete() {
            return resumer.mark_complete(ctx);
        }

        let inputs = group_inputs(ctx);
        if inputs.is_empty() {
            warn!(job = %ctx.job, "No input files found for any readset");
        }
        if self.alignment.is_some() && !inputs.is_empty() {
            copy_reference(ctx)?;
        }

        let mut reported = BTreeSet::new();
        for input in &inputs {
            self.process_readset(ctx, &mut resumer, input, &mut reported)?;
        }

        resumer.mark_complete(ctx)?;
        finish_task(ctx, "alignment");
        Ok(())
    }

    fn process_readset(
        &self,
        ctx: &mut JobContext,
        resumer: &mut Resumer<FileArtifact>,
        input: &ReadsetInput,
        reported: &mut BTreeSet<&'static str>,
    ) -> Result<(), PipelineError> {
        let readset = &input.readset;
        let basename = minimal_basename(&file_name(&input.raw.first));
        let base = input.position * self.steps_per_readset();
        let mut reads = Reads {
            pair: input.raw.clone(),
            raw: true,
            decompressed: false,
        };
        let mut index = base;

        for (i, configured) in self.preprocessing.iter().enumerate() {
            let last = i + 1 == self.preprocessing.len();
            if resumer.is_step_complete(index) {
                skip_logged(ctx, &configured.def.action_name(), index, readset);
                reads.adopt(resumer.artifacts_from_step(index).unwrap_or_default());
            } else {
                report_once(ctx, reported, PREPROCESSING_STATUS);
                self.preprocess(ctx, resumer, configured, index, readset, &mut reads, &basename, last)?;
            }
            index += 1;
        }

        if let Some(aligner) = &self.alignment {
            let genome = ctx
                .genome
                .clone()
                .ok_or_else(|| PipelineError::config("Alignment requires a reference genome"))?;
            let mut bam = if resumer.is_step_complete(index) {
                skip_logged(ctx, &aligner.def.action_name(), index, readset);
                effective_file(resumer, index)?
            } else {
                report_once(ctx, reported, ALIGNMENT_STATUS);
                ensure_decompressed(ctx, readset, &mut reads)?;
                log_fastq_count(&aligner.def.action_name(), readset, &reads.pair, "before alignment");
                let align_dir = ctx.work_dir.join("Alignment");
                fs::create_dir_all(&align_dir).map_err(|e| PipelineError::io(&align_dir, e))?;

                let mut action = Action::start(aligner.def.action_name())
                    .with_description(format!("{ALIGNMENT_ACTION}: {} against {}", readset.name, genome.name));
                for file in reads.pair.files() {
                    action.add_input(file, "Input FASTQ");
                }
                let mut out = aligner
                    .step
                    .perform_alignment(readset, &reads.pair, &genome, &align_dir, &basename)?;
                record_outputs(&mut action, &mut out.ledger);
                out.ledger.add_intermediate_file(&out.bam);
                log_bam_count(ctx, &aligner.def.action_name(), readset, &out.bam);
                resumer.set_step_complete(
                    index,
                    action,
                    vec![file_artifact(&out.bam, BAM_ROLE)],
                    StepReports::default(),
                    out.ledger,
                )?;
                out.bam
            };
            index += 1;

            for configured in &self.bam_processing {
                if resumer.is_step_complete(index) {
                    skip_logged(ctx, &configured.def.action_name(), index, readset);
                    if let Some(file) = resumer.artifacts_from_step(index).and_then(|artifacts| artifacts.first()) {
                        bam = file.file.clone();
                    }
                } else {
                    let mut action = Action::start(configured.def.action_name()).with_description(readset.name.clone());
                    action.add_input(&bam, "Input BAM");
                    let mut out = configured
                        .step
                        .process_bam(readset, &bam, &genome, &ctx.work_dir.join("Alignment"))?;
                    record_outputs(&mut action, &mut out.ledger);
                    let mut artifacts = Vec::new();
                    if let Some(produced) = out.bam.take() {
                        out.ledger.add_intermediate_file(&produced);
                        log_bam_count(ctx, &configured.def.action_name(), readset, &produced);
                        artifacts.push(file_artifact(&produced, BAM_ROLE));
                        bam = produced;
                    }
                    resumer.set_step_complete(index, action, artifacts, StepReports::default(), out.ledger)?;
                }
                index += 1;
            }

            finalize_bam(ctx, readset, &genome, &bam, &basename)?;
        }

        if let Some(assembler) = &self.assembly {
            if resumer.is_step_complete(index) {
                skip_logged(ctx, &assembler.def.action_name(), index, readset);
            } else {
                ensure_decompressed(ctx, readset, &mut reads)?;
                let assembly_dir = ctx.work_dir.join("Assembly");
                fs::create_dir_all(&assembly_dir).map_err(|e| PipelineError::io(&assembly_dir, e))?;
                let mut action = Action::start(assembler.def.action_name()).with_description(readset.name.clone());
                for file in reads.pair.files() {
                    action.add_input(file, "Input FASTQ");
                }
                let mut out = assembler.step.assemble(readset, &reads.pair, &assembly_dir, &basename)?;
                out.ledger.add_sequence_output(
                    SequenceOutput::new(&out.contigs, format!("{}: Assembly", readset.name), "Assembly")
                        .with_readset(Some(readset.id)),
                );
                record_outputs(&mut action, &mut out.ledger);
                resumer.set_step_complete(
                    index,
                    action,
                    vec![file_artifact(&out.contigs, "Contigs")],
                    StepReports::default(),
                    out.ledger,
                )?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn preprocess(
        &self,
        ctx: &mut JobContext,
        resumer: &mut Resumer<FileArtifact>,
        configured: &ConfiguredStep<dyn PreprocessingStep>,
        index: u32,
        readset: &Readset,
        reads: &mut Reads,
        basename: &str,
        last: bool,
    ) -> Result<(), PipelineError> {
        let name = configured.def.action_name();
        ensure_decompressed(ctx, readset, reads)?;
        let before = log_fastq_count(&name, readset, &reads.pair, "before");

        let mut action = Action::start(&name).with_description(readset.name.clone());
        for file in reads.pair.files() {
            action.add_input(file, "Input FASTQ");
        }
        let mut out = configured.step.process_input_file(readset, &reads.pair, &ctx.work_dir)?;
        let mut outputs = out.ledger.take_outputs();
        let produced = out.processed.take();
        if let Some(pair) = produced.clone() {
            let after = log_fastq_count(&name, readset, &pair, "after");
            if let (Some(before), Some(after)) = (before, after) {
                if after == 0 && before > 0 {
                    warn!(step = %name, readset = %readset.name, "Step removed every read");
                }
            }
            for file in pair.files() {
                out.ledger.add_intermediate_file(file);
            }
            reads.pair = pair;
            reads.raw = false;
        }

        let mut artifacts = produced.as_ref().map(pair_artifacts).unwrap_or_default();
        if last && !reads.raw {
            let renamed = normalized_pair(&ctx.work_dir, basename, &reads.pair);
            for (old, new) in reads.pair.files().zip(renamed.files()) {
                if produced.is_some() {
                    move_file(old, new)?;
                    out.ledger.remove_intermediate_file(old);
                } else {
                    // The file belongs to an already checkpointed step.
                    copy_file(old, new)?;
                }
                out.ledger.add_intermediate_file(new);
                out.ledger.add_command(format!("{NORMALIZE_ACTION}: {} -> {}", old.display(), new.display()));
                for output in &mut outputs {
                    if output.file == old {
                        output.file = new.to_path_buf();
                    }
                }
            }
            artifacts = pair_artifacts(&renamed);
            reads.pair = renamed;
        }
        for output in outputs {
            action.add_output(output.file, output.role, false);
        }
        resumer.set_step_complete(index, action, artifacts, StepReports::default(), out.ledger)
    }
}

/// Locate each readset's input files. Readsets with a missing file are
/// skipped so a partition can run with only its own subset present.
fn group_inputs(ctx: &JobContext) -> Vec<ReadsetInput> {
    let mut grouped = Vec::new();
    for (position, readset) in ctx.readsets.iter().enumerate() {
        let Some(first) = locate_input(ctx, &readset.file1) else {
            warn!(readset = %readset.name, file = %readset.file1, "Input file not found, skipping readset");
            continue;
        };
        let raw = match &readset.file2 {
            None => FastqPair::single(first),
            Some(name) => match locate_input(ctx, name) {
                Some(second) => FastqPair::paired(first, second),
                None => {
                    warn!(readset = %readset.name, file = %name, "Mate file not found, skipping readset");
                    continue;
                }
            },
        };
        grouped.push(ReadsetInput {
            position: u32::try_from(position).unwrap_or(u32::MAX),
            readset: readset.clone(),
            raw,
        });
    }
    grouped
}

fn locate_input(ctx: &JobContext, name: &str) -> Option<PathBuf> {
    ctx.input_files
        .iter()
        .find(|path| path.as_path() == Path::new(name) || path.file_name().is_some_and(|n| n == name))
        .filter(|path| path.exists())
        .cloned()
        .or_else(|| {
            let candidate = ctx.source_dir.join(name);
            candidate.exists().then_some(candidate)
        })
}

/// Replace gzipped input files with decompressed copies in the work dir.
fn ensure_decompressed(ctx: &mut JobContext, readset: &Readset, reads: &mut Reads) -> Result<(), PipelineError> {
    if !reads.raw || reads.decompressed {
        return Ok(());
    }
    reads.decompressed = true;
    if !reads.pair.files().any(is_gzipped) {
        return Ok(());
    }

    let mut action = Action::start(DECOMPRESS_ACTION).with_description(readset.name.clone());
    let mut convert = |file: &Path| -> Result<PathBuf, PipelineError> {
        if !is_gzipped(file) {
            return Ok(file.to_path_buf());
        }
        let plain = decompress(file, &ctx.work_dir)?;
        action.add_input(file, "Compressed FASTQ");
        action.add_output(&plain, FASTQ_ROLE, true);
        ctx.ledger.add_intermediate_file(&plain);
        Ok(plain)
    };
    let first = convert(&reads.pair.first)?;
    let second = reads.pair.second.as_deref().map(&mut convert).transpose()?;
    reads.pair = FastqPair { first, second };
    ctx.add_action(action);
    Ok(())
}

/// Copy the reference FASTA and its companion files into
/// `<work_dir>/Shared` once per job.
fn copy_reference(ctx: &mut JobContext) -> Result<(), PipelineError> {
    let Some(mut genome) = ctx.genome.clone() else {
        return Ok(());
    };
    let fasta = genome.fasta.clone();
    if !fasta.is_file() {
        return Err(PipelineError::io(
            &fasta,
            std::io::Error::new(std::io::ErrorKind::NotFound, "reference FASTA not found"),
        ));
    }
    let shared = ctx.work_dir.join("Shared");
    fs::create_dir_all(&shared).map_err(|e| PipelineError::io(&shared, e))?;

    let fasta_name = file_name(&fasta);
    let stem = fasta.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let dict_name = format!("{stem}.dict");
    let source_dir = fasta.parent().unwrap_or_else(|| Path::new("."));

    let mut action = Action::start(COPY_REFERENCE_ACTION).with_description(genome.name.clone());
    let entries = fs::read_dir(source_dir).map_err(|e| PipelineError::io(source_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(source_dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let role = if name == fasta_name {
            "Reference FASTA"
        } else if name.starts_with(&format!("{fasta_name}.")) || name == dict_name {
            "Reference Index"
        } else {
            continue;
        };
        let dest = shared.join(&name);
        fs::copy(entry.path(), &dest).map_err(|e| PipelineError::io(&dest, e))?;
        action.add_input(entry.path(), role);
        action.add_output(&dest, role, true);
    }

    ctx.ledger.add_intermediate_file(&shared);
    genome.working_fasta = Some(shared.join(&fasta_name));
    ctx.genome = Some(genome);
    ctx.add_action(action);
    Ok(())
}

/// Sort if needed, move the BAM to its canonical name, index it and
/// register it. Safe to repeat after a crash part-way through.
fn finalize_bam(
    ctx: &mut JobContext,
    readset: &Readset,
    genome: &ReferenceGenome,
    bam: &Path,
    basename: &str,
) -> Result<(), PipelineError> {
    let tools = Arc::clone(&ctx.bam_tools);
    let final_bam = ctx.output_dir.join(format!("{basename}.bam"));
    let final_index = index_path(&final_bam);

    let reindex = if bam.exists() {
        let mut source = bam.to_path_buf();
        if tools.sort_order(bam)? != SortOrder::Coordinate {
            let sorted = bam.with_file_name(format!("{basename}.sorted.bam"));
            let mut action = Action::start(SORT_ACTION).with_description(readset.name.clone());
            action.add_input(bam, BAM_ROLE);
            tools.sort(bam, &sorted, &mut ctx.ledger)?;
            action.add_output(&sorted, "Sorted BAM", true);
            ctx.ledger.add_intermediate_file(&sorted);
            ctx.add_action(action);
            source = sorted;
        }
        if source != final_bam {
            move_file(&source, &final_bam)?;
        }
        true
    } else if final_bam.exists() {
        info!(readset = %readset.name, bam = %final_bam.display(), "BAM already finalized");
        !final_index.exists()
    } else {
        return Err(PipelineError::io(
            bam,
            std::io::Error::new(std::io::ErrorKind::NotFound, "aligned BAM not found"),
        ));
    };

    if reindex {
        let mut action = Action::start(INDEX_ACTION).with_description(readset.name.clone());
        action.add_input(&final_bam, BAM_ROLE);
        let index = tools.index(&final_bam, &mut ctx.ledger)?;
        action.add_output(&index, "BAM Index", false);
        ctx.add_action(action);
    }

    ctx.ledger.add_output(&final_bam, "Aligned Reads");
    ctx.ledger.add_output(&final_index, "Aligned Reads Index");
    ctx.ledger.add_sequence_output(
        SequenceOutput::new(&final_bam, format!("{}: Alignment", readset.name), "Alignment")
            .with_readset(Some(readset.id))
            .with_genome(Some(genome.id)),
    );
    log_bam_count(ctx, "Final BAM", readset, &final_bam);
    Ok(())
}

fn normalized_pair(dir: &Path, basename: &str, pair: &FastqPair) -> FastqPair {
    match pair.second {
        None => FastqPair::single(dir.join(format!("{basename}.preprocessed.fastq"))),
        Some(_) => FastqPair::paired(
            dir.join(format!("{basename}_R1.preprocessed.fastq")),
            dir.join(format!("{basename}_R2.preprocessed.fastq")),
        ),
    }
}

fn file_artifact(file: &Path, role: &str) -> FileArtifact {
    FileArtifact {
        file: file.to_path_buf(),
        role: role.to_string(),
    }
}

fn pair_artifacts(pair: &FastqPair) -> Vec<FileArtifact> {
    pair.files().map(|f| file_artifact(f, FASTQ_ROLE)).collect()
}

fn pair_from_artifacts(artifacts: &[FileArtifact]) -> Option<FastqPair> {
    let first = artifacts.first()?;
    Some(FastqPair {
        first: first.file.clone(),
        second: artifacts.get(1).map(|a| a.file.clone()),
    })
}

fn effective_file(resumer: &Resumer<FileArtifact>, index: u32) -> Result<PathBuf, PipelineError> {
    resumer
        .effective_artifacts(index)
        .and_then(|artifacts| artifacts.first())
        .map(|a| a.file.clone())
        .ok_or_else(|| PipelineError::config(format!("Checkpoint entry {index} records no file")))
}

fn report_once(ctx: &JobContext, reported: &mut BTreeSet<&'static str>, status: &'static str) {
    if reported.insert(status) {
        ctx.set_status(status);
    }
}

fn skip_logged(ctx: &JobContext, step: &str, index: u32, readset: &Readset) {
    info!(job = %ctx.job, step, index, readset = %readset.name, "Step already complete, skipping");
}

fn log_fastq_count(step: &str, readset: &Readset, pair: &FastqPair, stage: &str) -> Option<u64> {
    match count_records(&pair.first) {
        Ok(count) => {
            info!(step, readset = %readset.name, stage, sequences = count, "Sequence count");
            Some(count)
        }
        Err(e) => {
            warn!(step, readset = %readset.name, stage, error = %e, "Could not count sequences");
            None
        }
    }
}

fn log_bam_count(ctx: &JobContext, step: &str, readset: &Readset, bam: &Path) {
    match ctx.bam_tools.count_records(bam) {
        Ok(count) => info!(step, readset = %readset.name, records = count, "Alignment count"),
        Err(e) => warn!(step, readset = %readset.name, error = %e, "Could not count alignments"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bam::tests::FakeBamTools;
    use crate::fastq::tests::fastq_text;
    use crate::registry::StepRegistry;
    use seqpipe_types::state::JobId;

    fn readset(file1: &str, file2: Option<&str>) -> Readset {
        Readset {
            id: 1,
            name: "Sample 1".into(),
            file1: file1.into(),
            file2: file2.map(String::from),
        }
    }

    fn ctx(dir: &Path) -> JobContext {
        JobContext::new(
            JobId::new("job"),
            dir.join("work"),
            dir.join("source"),
            Arc::new(StepRegistry::with_default_step_types()),
            Arc::new(FakeBamTools::default()),
        )
    }

    #[test]
    fn test_no_steps_means_no_task() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AlignmentTask::new(&ctx(dir.path())).unwrap().is_none());
    }

    #[test]
    fn test_group_inputs_skips_missing_mates() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path());
        fs::create_dir_all(&ctx.source_dir).unwrap();
        fs::write(ctx.source_dir.join("a_R1.fastq"), fastq_text(1)).unwrap();
        fs::write(ctx.source_dir.join("b_R1.fastq"), fastq_text(1)).unwrap();
        fs::write(ctx.source_dir.join("b_R2.fastq"), fastq_text(1)).unwrap();
        ctx.readsets = vec![
            readset("a_R1.fastq", Some("a_R2.fastq")),
            Readset {
                id: 2,
                ..readset("b_R1.fastq", Some("b_R2.fastq"))
            },
        ];

        let grouped = group_inputs(&ctx);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].readset.id, 2);
        assert_eq!(grouped[0].position, 1);
        assert!(grouped[0].raw.second.is_some());
    }

    #[test]
    fn test_decompression_recorded_once() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path());
        fs::create_dir_all(&ctx.work_dir).unwrap();
        let gz = dir.path().join("s1_R1.fastq.gz");
        let mut enc = GzEncoder::new(fs::File::create(&gz).unwrap(), Compression::default());
        enc.write_all(fastq_text(3).as_bytes()).unwrap();
        enc.finish().unwrap();

        let rs = readset("s1_R1.fastq.gz", None);
        let mut reads = Reads {
            pair: FastqPair::single(&gz),
            raw: true,
            decompressed: false,
        };
        ensure_decompressed(&mut ctx, &rs, &mut reads).unwrap();
        ensure_decompressed(&mut ctx, &rs, &mut reads).unwrap();

        assert_eq!(reads.pair.first, ctx.work_dir.join("s1_R1.fastq"));
        assert_eq!(count_records(&reads.pair.first).unwrap(), 3);
        assert_eq!(ctx.actions.len(), 1);
        assert_eq!(ctx.actions[0].name, DECOMPRESS_ACTION);
        assert_eq!(ctx.ledger.intermediate_files(), [reads.pair.first.clone()]);
    }

    #[test]
    fn test_copy_reference_brings_companions() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path());
        let refs = dir.path().join("refs");
        fs::create_dir_all(&refs).unwrap();
        fs::write(refs.join("g.fasta"), ">chr1\nACGT\n").unwrap();
        fs::write(refs.join("g.fasta.fai"), "chr1\t4\n").unwrap();
        fs::write(refs.join("g.dict"), "@HD\n").unwrap();
        fs::write(refs.join("other.txt"), "x").unwrap();
        ctx.genome = Some(ReferenceGenome::new(7, "g", refs.join("g.fasta")));

        copy_reference(&mut ctx).unwrap();

        let shared = ctx.work_dir.join("Shared");
        assert!(shared.join("g.fasta.fai").exists());
        assert!(shared.join("g.dict").exists());
        assert!(!shared.join("other.txt").exists());
        assert_eq!(ctx.genome.as_ref().unwrap().effective_fasta(), shared.join("g.fasta"));
        assert_eq!(ctx.actions[0].name, COPY_REFERENCE_ACTION);
        assert_eq!(ctx.actions[0].outputs.len(), 3);
    }

    #[test]
    fn test_finalize_sorts_unsorted_bam() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path());
        let align_dir = ctx.work_dir.join("Alignment");
        fs::create_dir_all(&align_dir).unwrap();
        let bam = align_dir.join("s1.bam");
        fs::write(&bam, "r2\nr1\n").unwrap();
        let genome = ReferenceGenome::new(7, "g", "/refs/g.fasta");

        finalize_bam(&mut ctx, &readset("s1_R1.fastq", None), &genome, &bam, "s1").unwrap();
        let final_bam = ctx.source_dir.join("s1.bam");
        assert!(fs::read_to_string(&final_bam).unwrap().starts_with("@HD"));
        assert!(index_path(&final_bam).exists());
        let names: Vec<&str> = ctx.actions.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, [SORT_ACTION, INDEX_ACTION]);
        assert_eq!(ctx.ledger.outputs_of_role("Aligned Reads"), [final_bam.as_path()]);
        assert!(ctx.ledger.is_retained(&index_path(&final_bam)));
        assert_eq!(ctx.ledger.sequence_outputs()[0].category, "Alignment");
    }

    #[test]
    fn test_finalize_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = ctx(dir.path());
        let align_dir = first.work_dir.join("Alignment");
        fs::create_dir_all(&align_dir).unwrap();
        let bam = align_dir.join("s1.bam");
        fs::write(&bam, "@HD\tVN:1.6\tSO:coordinate\nr1\n").unwrap();
        let genome = ReferenceGenome::new(7, "g", "/refs/g.fasta");
        let rs = readset("s1_R1.fastq", None);

        finalize_bam(&mut first, &rs, &genome, &bam, "s1").unwrap();
        assert!(!bam.exists());
        assert_eq!(first.actions.len(), 1);

        let mut again = ctx(dir.path());
        finalize_bam(&mut again, &rs, &genome, &bam, "s1").unwrap();
        assert!(again.actions.is_empty());
        assert_eq!(again.ledger.outputs().len(), 2);
        assert_eq!(again.ledger.sequence_outputs().len(), 1);
    }

    #[test]
    fn test_normalized_names() {
        let single = normalized_pair(Path::new("/w"), "s1", &FastqPair::single("/w/s1.Trim.fastq"));
        assert_eq!(single.first, Path::new("/w/s1.preprocessed.fastq"));
        let paired = normalized_pair(Path::new("/w"), "s1", &FastqPair::paired("/w/a", "/w/b"));
        assert_eq!(paired.second.unwrap(), Path::new("/w/s1_R2.preprocessed.fastq"));
    }
}
