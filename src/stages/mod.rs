//! Pipeline Stages
//!
//! One module per stage of the validation run, plus the adapter
//! round-robin used by the mount stage.
//!
//! ```text
//! Recovery → Activation → Mount → { Scan ∥ Backup } → Teardown → Report
//! ```
//!
//! Forward stages record every side effect in the `PipelineRun` ledger the
//! moment it succeeds; `TeardownStage` drains that ledger.

mod activation;
mod adapter;
mod backup;
mod mount;
mod recovery;
mod report;
mod scan;
mod teardown;

use std::sync::Arc;
use std::time::Duration;

use crate::domain::command::HostCommand;
use crate::domain::events::PipelineEvent;
use crate::domain::model::{HostPlatform, JobHandle, JobKind, JobState, JobStatus, Target};
use crate::domain::ports::{CommandOutput, CommandRunner, EventPublisher};
use crate::domain::run::{PipelineRun, Stage, StageOutcome};
use crate::error::{Error, Result};

pub use activation::VolumeActivationStage;
pub use adapter::AdapterAssigner;
pub use backup::BackupStage;
pub use mount::MountStage;
pub use recovery::{copy_name, StorageRecoveryStage};
pub use report::{Report, ReportStage};
pub use scan::ScanStage;
pub use teardown::TeardownStage;

// =============================================================================
// Host Sessions
// =============================================================================

/// A host the pipeline runs commands on, with its command flavour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSession {
    pub target: Target,
    pub platform: HostPlatform,
    /// Prefix commands with sudo
    pub privileged: bool,
}

impl HostSession {
    pub fn new(target: Target, platform: HostPlatform, privileged: bool) -> Self {
        Self {
            target,
            platform,
            privileged,
        }
    }

    pub async fn run(
        &self,
        runner: &dyn CommandRunner,
        command: HostCommand,
    ) -> Result<CommandOutput> {
        let command = if self.privileged {
            command.privileged()
        } else {
            command
        };
        runner.execute(&self.target, &command).await
    }
}

// =============================================================================
// Job Stage Outcome
// =============================================================================

/// What a scan or backup stage did, recorded into the run once both
/// concurrent stages have finished.
#[derive(Debug)]
pub struct JobStageOutcome {
    pub kind: JobKind,
    pub handles: Vec<JobHandle>,
    pub statuses: Vec<JobStatus>,
    pub result: Result<()>,
    pub duration: Duration,
}

impl JobStageOutcome {
    /// Report label: the terminal state shared by every job, else the
    /// first state that is not Done.
    pub fn terminal_label(&self) -> Option<String> {
        if self.statuses.is_empty() || self.statuses.len() < self.handles.len() {
            return None;
        }
        let state = self
            .statuses
            .iter()
            .map(|s| s.state)
            .find(|s| *s != JobState::Done)
            .unwrap_or(JobState::Done);
        Some(state.to_string())
    }

    /// Record jobs and the stage result into the run; returns the stage's
    /// own result.
    pub async fn record(self, run: &mut PipelineRun, events: &dyn EventPublisher) -> Result<()> {
        let stage = Stage::from(self.kind);
        let label = self.terminal_label();

        for handle in &self.handles {
            run.track_job(handle.clone());
        }
        for status in &self.statuses {
            run.update_job(status.clone());
        }

        match &self.result {
            Ok(()) => {
                run.record(stage, StageOutcome::Succeeded, label, None, self.duration);
                events
                    .emit(PipelineEvent::stage_completed(stage, self.duration))
                    .await;
            }
            Err(e) => {
                run.record(
                    stage,
                    StageOutcome::Failed,
                    label,
                    Some(e.to_string()),
                    self.duration,
                );
                events.emit(PipelineEvent::stage_failed(stage, e)).await;
            }
        }
        self.result
    }
}

/// Status carried by a job error, if any.
pub(crate) fn status_of(error: &Error) -> Option<&JobStatus> {
    match error {
        Error::JobFailed { status } => Some(status),
        _ => None,
    }
}

/// Shared handles every stage publishes through.
pub(crate) type Events = Arc<dyn EventPublisher>;
