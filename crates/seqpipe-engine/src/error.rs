//! Pipeline error model and retry backoff policy helpers.

use std::time::Duration;

use seqpipe_state::StateError;

const BACKOFF_MAX_MS: u64 = 60_000;

/// Categorized job error for retry decisions.
///
/// `Tool` and `Io` failures are retryable: re-running the job resumes from
/// the last checkpoint and re-invokes only the failed step. `Config` and
/// `Checkpoint` failures are not.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Unknown provider, missing parameter, malformed step configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// External tool exited non-zero or did not produce its output.
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    /// File-system failure during step bookkeeping.
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint unreadable, incompatible or not writable.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] StateError),

    /// Anything else (task join failures, status backend setup, ...).
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short category label used in logs and run records.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Tool { .. } => "tool",
            Self::Io { .. } => "io",
            Self::Checkpoint(_) => "checkpoint",
            Self::Infrastructure(_) => "infrastructure",
        }
    }

    /// Returns `true` if re-running the job may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Tool { .. } | Self::Io { .. })
    }
}

/// Compute retry delay for `attempt` (1-based) from a base delay.
pub(crate) fn compute_backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay_ms = base_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_and_io_are_retryable() {
        assert!(PipelineError::tool("bwa", "exit status 1").is_retryable());
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(PipelineError::io("/w/a.bam", io).is_retryable());
    }

    #[test]
    fn test_config_and_checkpoint_not_retryable() {
        assert!(!PipelineError::config("unknown provider").is_retryable());
        let err = PipelineError::from(StateError::SchemaMismatch {
            found: 9,
            expected: 1,
        });
        assert!(matches!(err, PipelineError::Checkpoint(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_infrastructure_from_anyhow() {
        let err: PipelineError = anyhow::anyhow!("join failed").into();
        assert_eq!(err.category(), "infrastructure");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "join failed");
    }

    #[test]
    fn test_display_includes_context() {
        let err = PipelineError::tool("samtools sort", "exit status 2");
        assert_eq!(err.to_string(), "samtools sort failed: exit status 2");
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let msg = PipelineError::io("/w/s1.fastq", io).to_string();
        assert!(msg.contains("/w/s1.fastq"), "got: {msg}");
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(compute_backoff(1000, 1), Duration::from_millis(1000));
        assert_eq!(compute_backoff(1000, 2), Duration::from_millis(2000));
        assert_eq!(compute_backoff(1000, 3), Duration::from_millis(4000));
        assert_eq!(compute_backoff(100, 2), Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_capped_at_60s() {
        assert_eq!(compute_backoff(1000, 20), Duration::from_millis(60_000));
        assert_eq!(compute_backoff(1000, 200), Duration::from_millis(60_000));
    }
}
