use std::path::Path;

use anyhow::{Context, Result};

use seqpipe_engine::config::parser;
use seqpipe_engine::reset_job;

/// Execute the `reset` command: remove every checkpoint of the job.
pub fn execute(job_path: &Path) -> Result<()> {
    let config = parser::parse_job(job_path)
        .with_context(|| format!("Failed to parse job: {}", job_path.display()))?;

    let removed = reset_job(&config)?;
    if removed.is_empty() {
        println!("No checkpoints found for job '{}'.", config.job);
    } else {
        println!("Removed {} checkpoint(s) for job '{}':", removed.len(), config.job);
        for path in &removed {
            println!("  {}", path.display());
        }
    }
    Ok(())
}
