//! BAM housekeeping used by the alignment task: sort-order detection,
//! coordinate sorting, indexing and record counts.

use std::fs;
use std::path::{Path, PathBuf};

use seqpipe_types::ledger::FileLedger;

use crate::command::{partial_path, CommandRunner};
use crate::error::PipelineError;

/// `@HD SO:` value of a BAM header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Coordinate,
    Queryname,
    Unsorted,
    Unknown,
}

impl SortOrder {
    /// Parse the sort order from SAM header text.
    #[must_use]
    pub fn from_header(header: &str) -> Self {
        header
            .lines()
            .find(|l| l.starts_with("@HD"))
            .and_then(|hd| hd.split('\t').find_map(|field| field.strip_prefix("SO:")))
            .map_or(Self::Unknown, |so| match so.trim() {
                "coordinate" => Self::Coordinate,
                "queryname" => Self::Queryname,
                "unsorted" => Self::Unsorted,
                _ => Self::Unknown,
            })
    }
}

/// Index file written next to `bam`.
#[must_use]
pub fn index_path(bam: &Path) -> PathBuf {
    let mut name = bam.file_name().unwrap_or_default().to_os_string();
    name.push(".bai");
    bam.with_file_name(name)
}

pub trait BamTools: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the header cannot be read.
    fn sort_order(&self, bam: &Path) -> Result<SortOrder, PipelineError>;

    /// Coordinate-sort `bam` into `output`.
    ///
    /// # Errors
    ///
    /// Returns an error if sorting fails.
    fn sort(&self, bam: &Path, output: &Path, ledger: &mut FileLedger) -> Result<(), PipelineError>;

    /// Index `bam`, returning the index path.
    ///
    /// # Errors
    ///
    /// Returns an error if indexing fails.
    fn index(&self, bam: &Path, ledger: &mut FileLedger) -> Result<PathBuf, PipelineError>;

    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    fn count_records(&self, bam: &Path) -> Result<u64, PipelineError>;
}

/// [`BamTools`] backed by the `samtools` executable.
#[derive(Debug, Clone)]
pub struct Samtools {
    executable: String,
    threads: u32,
    runner: CommandRunner,
}

impl Samtools {
    #[must_use]
    pub fn new(executable: impl Into<String>, threads: u32) -> Self {
        Self {
            executable: executable.into(),
            threads: threads.max(1),
            runner: CommandRunner::new(),
        }
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        std::iter::once(self.executable.as_str())
            .chain(rest.iter().copied())
            .map(str::to_string)
            .collect()
    }
}

impl BamTools for Samtools {
    fn sort_order(&self, bam: &Path) -> Result<SortOrder, PipelineError> {
        let path = bam.to_string_lossy();
        let header = self.runner.execute(&self.args(&["view", "-H", &path]), &mut FileLedger::new())?;
        Ok(SortOrder::from_header(&header))
    }

    fn sort(&self, bam: &Path, output: &Path, ledger: &mut FileLedger) -> Result<(), PipelineError> {
        let partial = partial_path(output);
        let threads = self.threads.to_string();
        let args = self.args(&[
            "sort",
            "-@",
            &threads,
            "-O",
            "bam",
            "-o",
            &partial.to_string_lossy(),
            &bam.to_string_lossy(),
        ]);
        self.runner.execute(&args, ledger)?;
        fs::rename(&partial, output).map_err(|e| PipelineError::io(output, e))
    }

    fn index(&self, bam: &Path, ledger: &mut FileLedger) -> Result<PathBuf, PipelineError> {
        let index = index_path(bam);
        let partial = partial_path(&index);
        let args = self.args(&["index", &bam.to_string_lossy(), &partial.to_string_lossy()]);
        self.runner.execute(&args, ledger)?;
        fs::rename(&partial, &index).map_err(|e| PipelineError::io(&index, e))?;
        Ok(index)
    }

    fn count_records(&self, bam: &Path) -> Result<u64, PipelineError> {
        let path = bam.to_string_lossy();
        let out = self.runner.execute(&self.args(&["view", "-c", &path]), &mut FileLedger::new())?;
        out.trim()
            .parse()
            .map_err(|_| PipelineError::tool(&self.executable, format!("unexpected record count output '{}'", out.trim())))
    }
}
