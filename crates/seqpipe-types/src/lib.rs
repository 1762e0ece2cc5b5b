//! Shared seqpipe data model.
//!
//! Pure serde types shared by the state and engine crates: recorded
//! [`Action`](action::Action)s, the per-unit-of-work
//! [`FileLedger`](ledger::FileLedger), step capabilities, sequence
//! deliverables and resumable checkpoint snapshots. Nothing in this crate
//! touches the file system.

pub mod action;
pub mod artifact;
pub mod capability;
pub mod checkpoint;
pub mod ledger;
pub mod paths;
pub mod sequence;
pub mod state;
