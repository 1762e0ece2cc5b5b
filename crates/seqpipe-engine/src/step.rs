//! Step execution protocol.
//!
//! A step is created once per job from its provider, prepared with
//! [`Step::init`], and then invoked once per unit of work through the
//! operation of its capability. Every operation returns an output that
//! embeds a [`FileLedger`] mergeable into the job ledger. An `Err` is a
//! fatal failure of that invocation; the engine never retries a step
//! in-process.
//!
//! Steps must write their primary outputs under a temporary name and move
//! them into place only once complete.

use std::path::{Path, PathBuf};

use seqpipe_types::artifact::ObjectArtifact;
use seqpipe_types::capability::Capability;
use seqpipe_types::ledger::FileLedger;
use seqpipe_types::sequence::{FastqPair, InputRecord, Readset, ReferenceGenome};

use crate::context::JobContext;
use crate::error::PipelineError;

/// Behaviour shared by every capability.
pub trait Step: Send + Sync {
    /// One-time preparation before the first unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the step cannot run in this job at all.
    fn init(&self, _job: &JobContext) -> Result<(), PipelineError> {
        Ok(())
    }
}

pub trait PreprocessingStep: Step {
    /// Transform one readset's FASTQ files.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails or its outputs are missing.
    fn process_input_file(
        &self,
        readset: &Readset,
        input: &FastqPair,
        output_dir: &Path,
    ) -> Result<PreprocessingOutput, PipelineError>;
}

pub trait AlignmentStep: Step {
    /// Align one readset's reads against `genome`, producing `<basename>.bam`
    /// (or any BAM path) in `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails or its outputs are missing.
    fn perform_alignment(
        &self,
        readset: &Readset,
        input: &FastqPair,
        genome: &ReferenceGenome,
        output_dir: &Path,
        basename: &str,
    ) -> Result<AlignmentOutput, PipelineError>;
}

pub trait BamProcessingStep: Step {
    /// Post-process an aligned BAM.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails or its outputs are missing.
    fn process_bam(
        &self,
        readset: &Readset,
        bam: &Path,
        genome: &ReferenceGenome,
        output_dir: &Path,
    ) -> Result<BamProcessingOutput, PipelineError>;
}

pub trait AssemblyStep: Step {
    /// Assemble one readset's reads into contigs.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails or its outputs are missing.
    fn assemble(
        &self,
        readset: &Readset,
        input: &FastqPair,
        output_dir: &Path,
        basename: &str,
    ) -> Result<AssemblyOutput, PipelineError>;
}

pub trait SingleCellStep: Step {
    /// Whether this step takes part in the run for these inputs. A step
    /// that is not included is skipped but still consumes its index.
    fn is_included(&self, _inputs: &[ObjectArtifact]) -> bool {
        true
    }

    /// Whether producing no objects is an error.
    fn creates_objects(&self) -> bool;

    /// Process the current objects. Outputs must be named with
    /// `output_prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails or its outputs are missing.
    fn execute(
        &self,
        inputs: &[ObjectArtifact],
        output_prefix: &str,
        output_dir: &Path,
    ) -> Result<SingleCellOutput, PipelineError>;
}

pub trait GenericOutputHandler: Step {
    /// Process the job's input files.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails or its outputs are missing.
    fn process_outputs(
        &self,
        inputs: &[InputRecord],
        output_dir: &Path,
    ) -> Result<HandlerOutput, PipelineError>;
}

#[derive(Debug, Default)]
pub struct PreprocessingOutput {
    pub processed: Option<FastqPair>,
    pub ledger: FileLedger,
}

#[derive(Debug)]
pub struct AlignmentOutput {
    pub bam: PathBuf,
    pub ledger: FileLedger,
}

/// `bam` is `None` when the step only inspected its input.
#[derive(Debug, Default)]
pub struct BamProcessingOutput {
    pub bam: Option<PathBuf>,
    pub ledger: FileLedger,
}

#[derive(Debug)]
pub struct AssemblyOutput {
    pub contigs: PathBuf,
    pub ledger: FileLedger,
}

#[derive(Debug, Default)]
pub struct SingleCellOutput {
    pub objects: Vec<ObjectArtifact>,
    pub markdown: Option<PathBuf>,
    pub html: Option<PathBuf>,
    pub ledger: FileLedger,
}

#[derive(Debug, Default)]
pub struct HandlerOutput {
    pub ledger: FileLedger,
}

/// A step built by a provider, tagged by capability.
pub enum StepInstance {
    Preprocessing(Box<dyn PreprocessingStep>),
    Alignment(Box<dyn AlignmentStep>),
    BamProcessing(Box<dyn BamProcessingStep>),
    Assembly(Box<dyn AssemblyStep>),
    SingleCell(Box<dyn SingleCellStep>),
    OutputHandler(Box<dyn GenericOutputHandler>),
}

macro_rules! into_variant {
    ($fn_name:ident, $variant:ident, $trait_name:ident) => {
        /// Unwrap the expected capability.
        ///
        /// # Errors
        ///
        /// Returns [`PipelineError::Config`] for any other capability.
        pub fn $fn_name(self) -> Result<Box<dyn $trait_name>, PipelineError> {
            match self {
                Self::$variant(step) => Ok(step),
                other => Err(PipelineError::config(format!(
                    "expected a {} step, got {}",
                    stringify!($variant),
                    other.capability()
                ))),
            }
        }
    };
}

impl StepInstance {
    #[must_use]
    pub fn capability(&self) -> Capability {
        match self {
            Self::Preprocessing(_) => Capability::Preprocessing,
            Self::Alignment(_) => Capability::Alignment,
            Self::BamProcessing(_) => Capability::BamProcessing,
            Self::Assembly(_) => Capability::Assembly,
            Self::SingleCell(_) => Capability::SingleCellProcessing,
            Self::OutputHandler(_) => Capability::GenericOutputHandler,
        }
    }

    /// Run the step's one-time preparation.
    ///
    /// # Errors
    ///
    /// Propagates the step's [`Step::init`] error.
    pub fn init(&self, job: &JobContext) -> Result<(), PipelineError> {
        match self {
            Self::Preprocessing(s) => s.init(job),
            Self::Alignment(s) => s.init(job),
            Self::BamProcessing(s) => s.init(job),
            Self::Assembly(s) => s.init(job),
            Self::SingleCell(s) => s.init(job),
            Self::OutputHandler(s) => s.init(job),
        }
    }

    into_variant!(into_preprocessing, Preprocessing, PreprocessingStep);
    into_variant!(into_alignment, Alignment, AlignmentStep);
    into_variant!(into_bam_processing, BamProcessing, BamProcessingStep);
    into_variant!(into_assembly, Assembly, AssemblyStep);
    into_variant!(into_single_cell, SingleCell, SingleCellStep);
    into_variant!(into_output_handler, OutputHandler, GenericOutputHandler);
}

/// Output of any step, tagged by capability.
#[derive(Debug)]
pub enum StepOutput {
    Preprocessing(PreprocessingOutput),
    Alignment(AlignmentOutput),
    BamProcessing(BamProcessingOutput),
    Assembly(AssemblyOutput),
    SingleCell(SingleCellOutput),
    OutputHandler(HandlerOutput),
}

impl StepOutput {
    #[must_use]
    pub fn ledger(&self) -> &FileLedger {
        match self {
            Self::Preprocessing(o) => &o.ledger,
            Self::Alignment(o) => &o.ledger,
            Self::BamProcessing(o) => &o.ledger,
            Self::Assembly(o) => &o.ledger,
            Self::SingleCell(o) => &o.ledger,
            Self::OutputHandler(o) => &o.ledger,
        }
    }

    pub fn ledger_mut(&mut self) -> &mut FileLedger {
        match self {
            Self::Preprocessing(o) => &mut o.ledger,
            Self::Alignment(o) => &mut o.ledger,
            Self::BamProcessing(o) => &mut o.ledger,
            Self::Assembly(o) => &mut o.ledger,
            Self::SingleCell(o) => &mut o.ledger,
            Self::OutputHandler(o) => &mut o.ledger,
        }
    }

    /// The primary files this output hands to the next step, in order.
    #[must_use]
    pub fn primary_files(&self) -> Vec<&Path> {
        match self {
            Self::Preprocessing(o) => o.processed.as_ref().map(|p| p.files().collect()).unwrap_or_default(),
            Self::Alignment(o) => vec![o.bam.as_path()],
            Self::BamProcessing(o) => o.bam.as_deref().into_iter().collect(),
            Self::Assembly(o) => vec![o.contigs.as_path()],
            Self::SingleCell(o) => o.objects.iter().map(|obj| obj.file.as_path()).collect(),
            Self::OutputHandler(_) => Vec::new(),
        }
    }
}
