//! Domain Ports (Port/Adapter Pattern)
//!
//! Narrow interfaces to every external collaborator the pipeline drives.
//! Stages depend only on these traits; `crate::adapters` provides the
//! process/SSH, storage-controller CLI, HTTP job API and mail
//! implementations, plus in-memory doubles for tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  CommandRunner │ StorageController │ JobApi │ Mailer │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ProcessCommandRunner │ SvcCliController │ HttpJobApi │ ...  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use super::command::HostCommand;
use super::events::PipelineEvent;
use super::model::{JobHandle, JobKind, JobStatus, RecoveryPoint, Target};
use crate::error::Result;

// =============================================================================
// Command Execution Port
// =============================================================================

/// Captured output of a command that exited zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_status: 0,
        }
    }

    /// Non-empty trimmed stdout lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }
}

/// Port for running commands locally or on a remote host.
///
/// Implementations return `Error::Command` for non-zero exits. They are not
/// idempotent: mounting an already-mounted path surfaces the host's error.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, target: &Target, command: &HostCommand) -> Result<CommandOutput>;
}

// =============================================================================
// Storage Controller Port
// =============================================================================

/// Port for the storage controller holding the safeguarded copies.
#[async_trait]
pub trait StorageController: Send + Sync {
    /// List recovery points of a consistency group, in vendor order.
    async fn list_recovery_points(&self, consistency_group: &str) -> Result<Vec<RecoveryPoint>>;

    /// Recover a point into a new volume; returns the volume id.
    async fn recover(&self, point: &RecoveryPoint, target_name: &str) -> Result<String>;

    /// Map a volume to a host.
    async fn present(&self, volume_id: &str, host: &str) -> Result<()>;

    /// Remove a volume-to-host mapping.
    async fn unpresent(&self, volume_id: &str, host: &str) -> Result<()>;
}

// =============================================================================
// Job API Port
// =============================================================================

/// Optional PolicyExec fields forwarded to the scan engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ScanExtras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_fqdn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,
}

/// Request to start an external job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRequest {
    /// Run a scan policy against an exported path
    Scan {
        policy: String,
        export_path: String,
        extras: ScanExtras,
    },
    /// Back up one path
    Backup { path: String },
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Scan { .. } => JobKind::Scan,
            JobRequest::Backup { .. } => JobKind::Backup,
        }
    }
}

/// Port for an external asynchronous job system.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Submit a job and return its handle.
    async fn start(&self, request: &JobRequest) -> Result<JobHandle>;

    /// Fetch the current status of a job.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Ask the job system to cancel a job.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;
}

// =============================================================================
// Mail Port
// =============================================================================

/// Port for dispatching the final report.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, subject: &str, body: &str, recipient: &str) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing pipeline events.
///
/// This trait abstracts event publishing, allowing different backends
/// (tracing, run-log file, in-memory) to be used.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a pipeline event.
    async fn publish(&self, event: PipelineEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<PipelineEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    /// Publish, logging instead of returning a failure. Stages use this so
    /// a broken event sink never fails a stage.
    async fn emit(&self, event: PipelineEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.publish(event).await {
            warn!("Failed to publish {} event: {}", event_type, e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
