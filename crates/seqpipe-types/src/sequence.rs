//! Sequencing inputs and deliverables: readsets, reference genomes, FASTQ
//! pairs, sequence outputs and metric files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths::{rebase_path, Rebase};

/// A sequencing readset and the raw file names expected for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readset {
    pub id: i64,
    pub name: String,
    /// Forward (or single-end) read file name.
    pub file1: String,
    /// Reverse read file name for paired-end data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file2: Option<String>,
}

impl Readset {
    #[must_use]
    pub fn is_paired(&self) -> bool {
        self.file2.as_deref().is_some_and(|f| !f.trim().is_empty())
    }
}

/// Reference genome handle resolved for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceGenome {
    pub id: i64,
    pub name: String,
    /// Source FASTA; companion files (`.fai`, `.dict`, aligner indexes)
    /// share its base name.
    pub fasta: PathBuf,
    /// Local copy inside the work directory, once copied.
    #[serde(skip)]
    pub working_fasta: Option<PathBuf>,
}

impl ReferenceGenome {
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>, fasta: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            fasta: fasta.into(),
            working_fasta: None,
        }
    }

    /// FASTA that steps should read: the working copy when present.
    #[must_use]
    pub fn effective_fasta(&self) -> &Path {
        self.working_fasta.as_deref().unwrap_or(&self.fasta)
    }
}

/// One readset's FASTQ inputs: single-end (`second == None`) or paired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastqPair {
    pub first: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second: Option<PathBuf>,
}

impl FastqPair {
    #[must_use]
    pub fn single(first: impl Into<PathBuf>) -> Self {
        Self {
            first: first.into(),
            second: None,
        }
    }

    #[must_use]
    pub fn paired(first: impl Into<PathBuf>, second: impl Into<PathBuf>) -> Self {
        Self {
            first: first.into(),
            second: Some(second.into()),
        }
    }

    /// Both files, in order.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.first.as_path()).chain(self.second.as_deref())
    }
}

impl Rebase for FastqPair {
    fn rebase(&mut self, from: &Path, to: &Path) {
        self.first = rebase_path(&self.first, from, to);
        self.second.rebase(from, to);
    }
}

/// A finished deliverable to be persisted once the job succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceOutput {
    pub file: PathBuf,
    pub label: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readset_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genome_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SequenceOutput {
    #[must_use]
    pub fn new(file: impl Into<PathBuf>, label: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            label: label.into(),
            category: category.into(),
            readset_id: None,
            analysis_id: None,
            genome_id: None,
            description: None,
        }
    }

    #[must_use]
    pub fn with_readset(mut self, readset_id: Option<i64>) -> Self {
        self.readset_id = readset_id;
        self
    }

    #[must_use]
    pub fn with_analysis(mut self, analysis_id: Option<i64>) -> Self {
        self.analysis_id = analysis_id;
        self
    }

    #[must_use]
    pub fn with_genome(mut self, genome_id: Option<i64>) -> Self {
        self.genome_id = genome_id;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Kind of metric captured in a typed metrics file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    Reads,
    Alignment,
    InsertSize,
    Wgs,
    Duplication,
}

/// What a metrics file describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSource {
    /// Metrics computed over a specific input file.
    InputFile { file: PathBuf },
    /// Metrics of a known category for the whole readset.
    Category { category: MetricCategory },
}

/// A metrics file tied to a readset row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PicardMetricsOutput {
    pub metric_file: PathBuf,
    pub source: MetricSource,
    pub readset_id: i64,
}

/// A previously registered output file handed to a job as input
/// (e.g. a count matrix consumed by single-cell processing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub row_id: i64,
    pub name: String,
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readset_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_id: Option<i64>,
}
