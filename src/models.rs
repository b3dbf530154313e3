use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::report::Report;

/// Final verdict for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Passed,
    Failed { error: String },
}

/// Produced by a worker when it finishes a file, consumed once by the
/// report aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub outcome: Outcome,
}

/// Sent from the engine to the front-end for live progress.
#[derive(Debug, Clone)]
pub enum ValidationEvent {
    /// `total_to_process` changed (a file was enqueued or a scan spliced).
    TotalChanged(usize),
    /// A worker finished a file, pass or fail.
    FileFinished(FileRecord),
    /// Short human-readable engine state.
    Status(String),
    /// Transient message worth showing but not keeping.
    StatusTransient(String),
    ScanStarted(PathBuf),
    ScanFinished(PathBuf),
    /// The run drained: all workers idle, both queues empty. Delivered once
    /// per run.
    RunFinished(Report),
}
