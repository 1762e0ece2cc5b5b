use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use seqpipe_engine::config::{parser, validator};
use seqpipe_engine::{build_registry, check_job};

/// Execute the `check` command: validate the job without running any step.
pub fn execute(job_path: &Path) -> Result<()> {
    let config = parser::parse_job(job_path)
        .with_context(|| format!("Failed to parse job: {}", job_path.display()))?;

    validator::validate_job(&config)?;
    println!("Job structure:     OK");

    let registry = Arc::new(build_registry(&config)?);
    let result = check_job(&config, registry)?;

    println!("Steps:             {}", result.steps.len());
    for step in &result.steps {
        println!("  {:24} {} [{}]", step.capability.to_string(), step.label, step.name);
    }
    if result.tasks.is_empty() {
        println!("Tasks:             none");
    } else {
        println!("Tasks:             {}", result.tasks.join(", "));
    }

    if result.state_ok {
        println!("Status backend:    OK");
        println!("\nAll checks passed.");
        Ok(())
    } else {
        println!("Status backend:    FAILED");
        anyhow::bail!("One or more checks failed")
    }
}
