//! Job YAML configuration types.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use seqpipe_types::capability::Capability;
use seqpipe_types::sequence::{Readset, ReferenceGenome};

/// Top-level job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub version: String,
    pub job: String,
    /// Scratch directory the job works in.
    pub work_dir: PathBuf,
    /// Durable directory; checkpoints live here.
    pub source_dir: PathBuf,
    /// Where deliverables are copied. Defaults to `source_dir`.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Flat job parameters, e.g. `fastqProcessing: "Trim;Trim;Filter"`.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Per-provider configuration, one entry per repetition index.
    #[serde(default)]
    pub step_config: BTreeMap<String, StepConfigEntry>,
    #[serde(default)]
    pub readsets: Vec<Readset>,
    #[serde(default)]
    pub genome: Option<ReferenceGenome>,
    #[serde(default)]
    pub input_files: Vec<PathBuf>,
    /// Command-template step providers.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    /// Optional split into independent slices.
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

impl JobConfig {
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        self.output_dir.as_deref().unwrap_or(&self.source_dir)
    }
}

/// Configuration for one provider: a single object applies to every
/// repetition, a list is indexed by repetition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StepConfigEntry {
    PerIndex(Vec<serde_json::Value>),
    Shared(serde_json::Value),
}

impl StepConfigEntry {
    /// Configuration for repetition `index`; `Value::Null` when a list is
    /// shorter than the number of repetitions.
    #[must_use]
    pub fn for_index(&self, index: u32) -> serde_json::Value {
        match self {
            Self::Shared(value) => value.clone(),
            Self::PerIndex(values) => values
                .get(index as usize)
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

/// A step provider described entirely in configuration: an argument-vector
/// template with `{placeholder}` substitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub capability: Capability,
    /// Command for single-end input (or the only command).
    pub command: Vec<String>,
    /// Command for paired-end input.
    #[serde(default)]
    pub paired_command: Option<Vec<String>>,
    /// Redirect the tool's stdout into this (templated) path.
    #[serde(default)]
    pub stdout: Option<String>,
    /// JSON Schema for this tool's `step_config` entries.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    /// Single-cell steps only: producing no object is an error.
    #[serde(default)]
    pub creates_objects: bool,
}

impl ToolDefinition {
    #[must_use]
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_backend")]
    pub backend: StateBackendKind,
    /// Database path. When absent, run history is kept in memory only.
    #[serde(default)]
    pub connection: Option<String>,
}

fn default_backend() -> StateBackendKind {
    StateBackendKind::Sqlite
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            connection: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_true")]
    pub delete_intermediates: bool,
    #[serde(default)]
    pub keep_checkpoint: bool,
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Path or name of the samtools executable.
    #[serde(default = "default_samtools")]
    pub samtools: String,
}

fn default_max_retries() -> u32 {
    0
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_true() -> bool {
    true
}
fn default_threads() -> u32 {
    1
}
fn default_samtools() -> String {
    "samtools".to_string()
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            delete_intermediates: default_true(),
            keep_checkpoint: false,
            threads: default_threads(),
            samtools: default_samtools(),
        }
    }
}

/// One independent slice of a split job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    /// Readset ids processed by this slice; empty means all.
    #[serde(default)]
    pub readsets: Vec<i64>,
    /// Input files handled by this slice; empty means all.
    #[serde(default)]
    pub input_files: Vec<PathBuf>,
    /// Genomic intervals handled by this slice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intervals: Option<IntervalSet>,
}

/// A named list of genomic intervals such as `chr1` or `chr2:1-50000`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSet {
    pub name: String,
    pub intervals: Vec<String>,
}

impl IntervalSet {
    /// Intervals joined with commas, as tools take them on one argument.
    #[must_use]
    pub fn joined(&self) -> String {
        self.intervals.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_defaults() {
        let r = ResourceConfig::default();
        assert_eq!(r.max_retries, 0);
        assert_eq!(r.retry_base_ms, 1_000);
        assert!(r.delete_intermediates);
        assert!(!r.keep_checkpoint);
        assert_eq!(r.threads, 1);
    }

    #[test]
    fn test_step_config_shared_and_indexed() {
        let shared: StepConfigEntry = serde_yaml::from_str("{ min_length: 50 }").unwrap();
        assert_eq!(shared.for_index(3)["min_length"], 50);

        let indexed: StepConfigEntry =
            serde_yaml::from_str("[{ min_length: 50 }, { min_length: 30 }]").unwrap();
        assert_eq!(indexed.for_index(1)["min_length"], 30);
        assert!(indexed.for_index(2).is_null());
    }

    #[test]
    fn test_output_dir_defaults_to_source_dir() {
        let yaml = r"
version: '1.0'
job: j
work_dir: /scratch/j
source_dir: /data/j
";
        let config: JobConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.output_dir(), Path::new("/data/j"));
        assert_eq!(config.state.backend, StateBackendKind::Sqlite);
        assert!(config.partitions.is_empty());
    }
}
