//! Step execution and resumable job engine for sequencing pipelines.
//!
//! | Module      | Responsibility |
//! |-------------|----------------|
//! | `registry`  | Step providers, capability bindings, step list resolution |
//! | `step`      | Capability traits and their outputs |
//! | `steps`     | Built-in command-template providers |
//! | `resumer`   | Checkpointed progress through a step list |
//! | `tasks`     | Alignment, single-cell and output-handler orchestrators, partitions |
//! | `runner`    | Job runs with status tracking and retries |
//! | `config`    | YAML job configuration |

pub mod bam;
pub mod cleanup;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod fastq;
pub mod registry;
pub mod resolve;
pub mod result;
pub mod resumer;
pub mod runner;
pub mod step;
pub mod steps;
pub mod tasks;

pub use context::JobContext;
pub use error::PipelineError;
pub use registry::{StepProvider, StepRegistry};
pub use result::{CheckResult, JobResult};
pub use resumer::Resumer;
pub use runner::{build_registry, check_job, reset_job, run_job, ExecutionOptions};
