use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use seqpipe_engine::config::parser;
use seqpipe_engine::{build_registry, run_job, ExecutionOptions};
use seqpipe_types::state::RunStatus;

/// Execute the `run` command: parse, build the step registry and run the job.
pub async fn execute(job_path: &Path) -> Result<()> {
    let config = parser::parse_job(job_path)
        .with_context(|| format!("Failed to parse job: {}", job_path.display()))?;

    let registry = Arc::new(build_registry(&config)?);
    tracing::info!(
        job = %config.job,
        readsets = config.readsets.len(),
        tools = config.tools.len(),
        partitions = config.partitions.len(),
        "Job loaded"
    );

    let options = ExecutionOptions::from_config(&config);
    let result = run_job(&config, registry, &options).await?;

    if result.status == RunStatus::Cancelled {
        println!("Job '{}' was cancelled (run {}).", config.job, result.run_id);
        return Ok(());
    }

    println!("Job '{}' completed successfully (run {}).", config.job, result.run_id);
    println!("  Actions:          {}", result.actions.len());
    println!("  Outputs:          {}", result.outputs.len());
    println!("  Sequence outputs: {}", result.sequence_outputs.len());
    if result.retry_count > 0 {
        println!("  Retries:          {}", result.retry_count);
    }
    println!("  Duration:         {:.2}s", result.duration_secs);
    for output in &result.sequence_outputs {
        println!("    [{}] {} -> {}", output.category, output.label, output.file.display());
    }
    if let Some(manifest) = &result.partitions {
        println!("  Partitions:");
        for partition in &manifest.partitions {
            println!(
                "    {:16} {} output(s), {} action(s)",
                partition.name,
                partition.outputs.len(),
                partition.actions
            );
            if let Some(scatter) = &partition.scatter_output {
                println!("      scatter output: {}", scatter.display());
            }
        }
    }
    Ok(())
}
