//! Job YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::JobConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            missing.push(cap[1].to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        missing.dedup();
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Parse a job YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_job_str(yaml_str: &str) -> Result<JobConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: JobConfig = serde_yaml::from_str(&substituted).context("Failed to parse job YAML")?;
    Ok(config)
}

/// Parse a job YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_job(path: &Path) -> Result<JobConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    parse_job_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqpipe_types::capability::Capability;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("SP_TEST_SCRATCH", "/scratch/run42");
        let result = substitute_env_vars("work_dir: ${SP_TEST_SCRATCH}/job").unwrap();
        assert_eq!(result, "work_dir: /scratch/run42/job");
        std::env::remove_var("SP_TEST_SCRATCH");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "job: plain\nversion: '1.0'";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let err = substitute_env_vars("${SP_MISSING_X} and ${SP_MISSING_Y}")
            .unwrap_err()
            .to_string();
        assert!(err.contains("SP_MISSING_X"));
        assert!(err.contains("SP_MISSING_Y"));
    }

    #[test]
    fn test_parse_job_from_string() {
        std::env::set_var("SP_TEST_REFS", "/refs");
        let yaml = r#"
version: "1.0"
job: align_batch
work_dir: /scratch/align_batch
source_dir: /data/align_batch
params:
  fastqProcessing: "Trim;Trim;Filter"
  alignment: BWA
step_config:
  Trim: [{ min_length: 50 }, { min_length: 30 }]
readsets:
  - { id: 1, name: "Sample 1", file1: s1_R1.fastq.gz, file2: s1_R2.fastq.gz }
genome: { id: 7, name: GRCh38, fasta: "${SP_TEST_REFS}/grch38.fasta" }
tools:
  - name: Trim
    label: Adapter Trimming
    capability: preprocessing
    command: [cutadapt, -m, "{min_length}", -o, "{output1}", "{input1}"]
resources: { max_retries: 2, threads: 4 }
"#;
        let config = parse_job_str(yaml).unwrap();
        assert_eq!(config.job, "align_batch");
        assert_eq!(config.params["fastqProcessing"], "Trim;Trim;Filter");
        assert_eq!(config.readsets.len(), 1);
        assert!(config.readsets[0].is_paired());
        let genome = config.genome.unwrap();
        assert_eq!(genome.fasta, Path::new("/refs/grch38.fasta"));
        assert_eq!(config.tools[0].capability, Capability::Preprocessing);
        assert_eq!(config.tools[0].label(), "Adapter Trimming");
        assert_eq!(config.resources.max_retries, 2);
        std::env::remove_var("SP_TEST_REFS");
    }

    #[test]
    fn test_parse_job_missing_file() {
        let err = parse_job(Path::new("/nonexistent/job.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read job file"));
    }
}
