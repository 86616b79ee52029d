//! Error types for the safeguarded-copy validation pipeline

use thiserror::Error;

use crate::domain::model::{JobKind, JobStatus, MountSpec};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the pipeline
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Static Input
    // =========================================================================
    /// Bad static input (plan file, adapter list, command arguments)
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML plan could not be parsed
    #[error("Failed to parse workflow plan: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Command Execution
    // =========================================================================
    /// A local or remote command exited non-zero, timed out, or could not be spawned
    #[error("Command '{command}' on {target} failed (exit status {}): {stderr}", exit_label(.exit_status))]
    Command {
        target: String,
        command: String,
        stderr: String,
        exit_status: Option<i32>,
    },

    // =========================================================================
    // Stage Errors
    // =========================================================================
    /// A lookup returned nothing (no recovery points, no recovered volume)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Recovery or presentation of a safeguarded copy failed
    #[error("Recovery of point {point_id} failed: {source}")]
    Recovery {
        point_id: String,
        #[source]
        source: Box<Error>,
    },

    /// Import or activation of a volume group failed
    #[error("Activation of volume group {volume_group} failed: {source}")]
    Activation {
        volume_group: String,
        #[source]
        source: Box<Error>,
    },

    /// A mount (or the export backing it) failed
    #[error("Mount {spec} failed: {source}")]
    Mount {
        spec: Box<MountSpec>,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // External Jobs
    // =========================================================================
    /// The job API refused to start a job
    #[error("Failed to start {kind} job: {reason}")]
    JobStart { kind: JobKind, reason: String },

    /// A job reached a terminal state other than Done
    #[error("{} job {} ended in state {}", .status.kind, .status.job_id, .status.state)]
    JobFailed { status: JobStatus },

    /// A job did not reach a terminal state before its deadline
    #[error("Job {job_id} did not finish within {waited}")]
    Timeout { job_id: String, waited: String },

    /// Network-level failure talking to a job API (retryable while polling)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A job API answered with something we could not interpret
    #[error("Unexpected job API response: {0}")]
    Protocol(String),

    // =========================================================================
    // Reporting & Control
    // =========================================================================
    /// The report could not be handed to the mail transport
    #[error("Mail dispatch failed: {0}")]
    Mail(String),

    /// The operator aborted the run
    #[error("Run aborted: {0}")]
    Aborted(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `Config` error from anything displayable.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether a poll that failed with this error may simply be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

fn exit_label(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}
