//! Job execution and check result types.

use seqpipe_types::action::{Action, FileRole};
use seqpipe_types::capability::Capability;
use seqpipe_types::sequence::SequenceOutput;
use seqpipe_types::state::RunStatus;

use crate::tasks::PartitionManifest;

/// Result of a job run.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub run_id: i64,
    pub status: RunStatus,
    /// Actions of an unpartitioned run; empty when partitioned.
    pub actions: Vec<Action>,
    pub outputs: Vec<FileRole>,
    pub sequence_outputs: Vec<SequenceOutput>,
    pub partitions: Option<PartitionManifest>,
    pub retry_count: u32,
    pub duration_secs: f64,
}

/// One resolved step as reported by a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStepSummary {
    pub capability: Capability,
    pub name: String,
    pub label: String,
    pub index: u32,
}

/// Result of a job check.
#[derive(Debug)]
pub struct CheckResult {
    pub steps: Vec<ResolvedStepSummary>,
    /// Tasks the job would run, in order.
    pub tasks: Vec<&'static str>,
    pub state_ok: bool,
}
