//! Safecopy - Safeguarded-Copy Validation Pipeline
//!
//! Proves that an immutable storage copy is usable: recovers the newest
//! recovery point, brings its volume group up on the source host, mounts
//! the filesystems on a scan host over NFS, runs a malware scan and a
//! backup against them in parallel, then tears everything down and mails
//! a report.
//!
//! # Architecture
//!
//! ```text
//! Recovery → Activation → Mount → { Scan ∥ Backup } → Teardown → Report
//! ```
//!
//! Teardown and report run on every exit path.
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`config`] - YAML workflow plan and validation
//! - [`domain`] - Value objects, host commands, run ledger, events and ports
//! - [`error`] - Error types
//! - [`jobs`] - External job polling
//! - [`metrics`] - Prometheus run metrics
//! - [`orchestrator`] - End-to-end pipeline driver
//! - [`stages`] - The individual pipeline stages

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod orchestrator;
pub mod stages;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use domain::run::{PipelineRun, Stage, StageOutcome};
pub use error::{Error, Result};
pub use jobs::{JobPoller, PollPolicy};
pub use metrics::RunMetrics;
pub use orchestrator::{Collaborators, PipelineOrchestrator};
