//! Log setup for the `seqpipe` binary.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

/// Targets that follow `--log-level`. Dependencies stay at `warn`.
const SEQPIPE_TARGETS: [&str; 4] = ["seqpipe", "seqpipe_engine", "seqpipe_state", "seqpipe_types"];

fn default_directives(level: &str) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(SEQPIPE_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

/// Install the global subscriber. A set `RUST_LOG` replaces the directives
/// derived from `--log-level`.
pub fn init(log_level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(log_level))
            .with_context(|| format!("Invalid log level '{log_level}'"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();
    Ok(())
}
