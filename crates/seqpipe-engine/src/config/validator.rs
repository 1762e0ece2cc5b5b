//! Semantic validation for parsed job configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};
use seqpipe_types::capability::Capability;

use crate::config::types::JobConfig;

const MAX_RETRIES_LIMIT: u32 = 10;

/// Validate a parsed job configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the job config.
pub fn validate_job(config: &JobConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported job version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.job.trim().is_empty() {
        errors.push("Job name must not be empty".to_string());
    }

    if config.work_dir.as_os_str().is_empty() {
        errors.push("work_dir must not be empty".to_string());
    }
    if config.source_dir.as_os_str().is_empty() {
        errors.push("source_dir must not be empty".to_string());
    }

    let mut readset_ids = HashSet::new();
    for (i, readset) in config.readsets.iter().enumerate() {
        if readset.file1.trim().is_empty() {
            errors.push(format!("Readset {i} ('{}') has no file1", readset.name));
        }
        if !readset_ids.insert(readset.id) {
            errors.push(format!("Duplicate readset id {}", readset.id));
        }
    }

    let mut tool_names = HashSet::new();
    for (i, tool) in config.tools.iter().enumerate() {
        if tool.name.trim().is_empty() {
            errors.push(format!("Tool {i} has an empty name"));
        }
        if tool.capability == Capability::Any {
            errors.push(format!("Tool '{}' must declare a concrete capability", tool.name));
        }
        if tool.command.is_empty() {
            errors.push(format!("Tool '{}' has an empty command", tool.name));
        }
        if tool.paired_command.as_ref().is_some_and(Vec::is_empty) {
            errors.push(format!("Tool '{}' has an empty paired_command", tool.name));
        }
        if !tool_names.insert((tool.capability, tool.name.as_str())) {
            errors.push(format!(
                "Tool '{}' is defined more than once for capability {}",
                tool.name, tool.capability
            ));
        }
    }

    if config.resources.max_retries > MAX_RETRIES_LIMIT {
        errors.push(format!(
            "max_retries must be at most {MAX_RETRIES_LIMIT}, got {}",
            config.resources.max_retries
        ));
    }
    if config.resources.threads == 0 {
        errors.push("threads must be at least 1".to_string());
    }

    let mut partition_names = HashSet::new();
    for (i, partition) in config.partitions.iter().enumerate() {
        if partition.name.trim().is_empty() {
            errors.push(format!("Partition {i} has an empty name"));
        } else if partition.name.contains(['/', '\\']) {
            errors.push(format!(
                "Partition name '{}' must not contain path separators",
                partition.name
            ));
        }
        if !partition_names.insert(partition.name.as_str()) {
            errors.push(format!("Duplicate partition name '{}'", partition.name));
        }
        for id in &partition.readsets {
            if !readset_ids.contains(id) {
                errors.push(format!(
                    "Partition '{}' references unknown readset {id}",
                    partition.name
                ));
            }
        }
        if let Some(set) = &partition.intervals {
            if set.name.trim().is_empty() {
                errors.push(format!("Partition '{}' has an unnamed interval set", partition.name));
            }
            if set.intervals.is_empty() {
                errors.push(format!("Partition '{}' has an empty interval set", partition.name));
            }
            if set.intervals.iter().any(|i| i.trim().is_empty()) {
                errors.push(format!("Partition '{}' has a blank interval", partition.name));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Job validation failed:\n  - {}", errors.join("\n  - "));
    }
}
