//! Pipeline Events
//!
//! Immutable records of what happened during a run. Stages publish them
//! through the injected `EventPublisher` port; adapters turn them into
//! tracing output, run-log lines, or in-memory lists for tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::model::{JobKind, JobState};
use super::run::Stage;

/// Event representing a significant occurrence in a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    // =========================================================================
    // Run Lifecycle
    // =========================================================================
    /// A run started.
    RunStarted {
        run_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A run finished (after teardown and report).
    RunFinished {
        run_id: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Stage Lifecycle
    // =========================================================================
    /// A stage started.
    StageStarted {
        stage: String,
        timestamp: DateTime<Utc>,
    },

    /// A stage completed successfully.
    StageCompleted {
        stage: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A stage failed.
    StageFailed {
        stage: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A stage did not run because an earlier one failed.
    StageSkipped {
        stage: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Resources
    // =========================================================================
    /// A remote resource was created (presentation, mount, export...).
    ResourceAcquired {
        resource: String,
        host: String,
        timestamp: DateTime<Utc>,
    },

    /// A remote resource was released during teardown.
    ResourceReleased {
        resource: String,
        host: String,
        timestamp: DateTime<Utc>,
    },

    /// Teardown could not release a resource.
    ResourceLeaked {
        resource: String,
        host: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // External Jobs
    // =========================================================================
    /// A scan or backup job was submitted.
    JobSubmitted {
        kind: JobKind,
        job_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A job status was observed while polling.
    JobObserved {
        kind: JobKind,
        job_id: String,
        state: JobState,
        timestamp: DateTime<Utc>,
    },

    /// A job was explicitly canceled.
    JobCancelRequested {
        kind: JobKind,
        job_id: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Report
    // =========================================================================
    /// The report was handed to the mail transport.
    ReportDispatched {
        recipient: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::RunStarted { .. } => "RunStarted",
            PipelineEvent::RunFinished { .. } => "RunFinished",
            PipelineEvent::StageStarted { .. } => "StageStarted",
            PipelineEvent::StageCompleted { .. } => "StageCompleted",
            PipelineEvent::StageFailed { .. } => "StageFailed",
            PipelineEvent::StageSkipped { .. } => "StageSkipped",
            PipelineEvent::ResourceAcquired { .. } => "ResourceAcquired",
            PipelineEvent::ResourceReleased { .. } => "ResourceReleased",
            PipelineEvent::ResourceLeaked { .. } => "ResourceLeaked",
            PipelineEvent::JobSubmitted { .. } => "JobSubmitted",
            PipelineEvent::JobObserved { .. } => "JobObserved",
            PipelineEvent::JobCancelRequested { .. } => "JobCancelRequested",
            PipelineEvent::ReportDispatched { .. } => "ReportDispatched",
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::RunStarted { timestamp, .. }
            | PipelineEvent::RunFinished { timestamp, .. }
            | PipelineEvent::StageStarted { timestamp, .. }
            | PipelineEvent::StageCompleted { timestamp, .. }
            | PipelineEvent::StageFailed { timestamp, .. }
            | PipelineEvent::StageSkipped { timestamp, .. }
            | PipelineEvent::ResourceAcquired { timestamp, .. }
            | PipelineEvent::ResourceReleased { timestamp, .. }
            | PipelineEvent::ResourceLeaked { timestamp, .. }
            | PipelineEvent::JobSubmitted { timestamp, .. }
            | PipelineEvent::JobObserved { timestamp, .. }
            | PipelineEvent::JobCancelRequested { timestamp, .. }
            | PipelineEvent::ReportDispatched { timestamp, .. } => *timestamp,
        }
    }

    /// Get the stage name if applicable.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineEvent::StageStarted { stage, .. }
            | PipelineEvent::StageCompleted { stage, .. }
            | PipelineEvent::StageFailed { stage, .. }
            | PipelineEvent::StageSkipped { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// One human-readable line, used for the plain-text run log.
    pub fn describe(&self) -> String {
        match self {
            PipelineEvent::RunStarted { run_id, .. } => format!("Run {} started", run_id),
            PipelineEvent::RunFinished {
                run_id,
                success,
                duration_ms,
                ..
            } => format!(
                "Run {} finished {} after {} ms",
                run_id,
                if *success { "successfully" } else { "with failures" },
                duration_ms
            ),
            PipelineEvent::StageStarted { stage, .. } => format!("{} started", stage),
            PipelineEvent::StageCompleted {
                stage, duration_ms, ..
            } => format!("{} completed in {} ms", stage, duration_ms),
            PipelineEvent::StageFailed { stage, reason, .. } => {
                format!("{} failed: {}", stage, reason)
            }
            PipelineEvent::StageSkipped { stage, .. } => format!("{} skipped", stage),
            PipelineEvent::ResourceAcquired { resource, host, .. } => {
                format!("Acquired {} on {}", resource, host)
            }
            PipelineEvent::ResourceReleased { resource, host, .. } => {
                format!("Released {} on {}", resource, host)
            }
            PipelineEvent::ResourceLeaked {
                resource,
                host,
                reason,
                ..
            } => format!("Could not release {} on {}: {}", resource, host, reason),
            PipelineEvent::JobSubmitted { kind, job_id, .. } => {
                format!("{} job {} submitted", kind, job_id)
            }
            PipelineEvent::JobObserved {
                kind,
                job_id,
                state,
                ..
            } => format!("{} job {} is {}", kind, job_id, state),
            PipelineEvent::JobCancelRequested { kind, job_id, .. } => {
                format!("{} job {} cancel requested", kind, job_id)
            }
            PipelineEvent::ReportDispatched { recipient, .. } => {
                format!("Report sent to {}", recipient)
            }
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl PipelineEvent {
    pub fn run_started(run_id: impl ToString) -> Self {
        PipelineEvent::RunStarted {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn run_finished(run_id: impl ToString, success: bool, duration: Duration) -> Self {
        PipelineEvent::RunFinished {
            run_id: run_id.to_string(),
            success,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn stage_started(stage: Stage) -> Self {
        PipelineEvent::StageStarted {
            stage: stage.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn stage_completed(stage: Stage, duration: Duration) -> Self {
        PipelineEvent::StageCompleted {
            stage: stage.to_string(),
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn stage_failed(stage: Stage, reason: impl ToString) -> Self {
        PipelineEvent::StageFailed {
            stage: stage.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn stage_skipped(stage: Stage) -> Self {
        PipelineEvent::StageSkipped {
            stage: stage.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn resource_acquired(resource: impl Into<String>, host: impl ToString) -> Self {
        PipelineEvent::ResourceAcquired {
            resource: resource.into(),
            host: host.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn resource_released(resource: impl Into<String>, host: impl ToString) -> Self {
        PipelineEvent::ResourceReleased {
            resource: resource.into(),
            host: host.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn resource_leaked(
        resource: impl Into<String>,
        host: impl ToString,
        reason: impl ToString,
    ) -> Self {
        PipelineEvent::ResourceLeaked {
            resource: resource.into(),
            host: host.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn job_submitted(kind: JobKind, job_id: impl Into<String>) -> Self {
        PipelineEvent::JobSubmitted {
            kind,
            job_id: job_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn job_observed(kind: JobKind, job_id: impl Into<String>, state: JobState) -> Self {
        PipelineEvent::JobObserved {
            kind,
            job_id: job_id.into(),
            state,
            timestamp: Utc::now(),
        }
    }

    pub fn job_cancel_requested(kind: JobKind, job_id: impl Into<String>) -> Self {
        PipelineEvent::JobCancelRequested {
            kind,
            job_id: job_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn report_dispatched(recipient: impl Into<String>) -> Self {
        PipelineEvent::ReportDispatched {
            recipient: recipient.into(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = PipelineEvent::stage_failed(Stage::Mount, "mount.nfs: access denied");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("StageFailed"));
        assert!(json.contains("access denied"));

        let deserialized: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type(), "StageFailed");
        assert_eq!(deserialized.stage(), Some("Mount"));
    }

    #[test]
    fn test_timestamp() {
        let before = Utc::now();
        let event = PipelineEvent::stage_started(Stage::Recovery);
        let after = Utc::now();

        assert!(event.timestamp() >= before);
        assert!(event.timestamp() <= after);
    }

    #[test]
    fn test_describe() {
        let event = PipelineEvent::job_observed(JobKind::Scan, "123", JobState::Running);
        assert_eq!(event.describe(), "Scan job 123 is Running");

        let leaked = PipelineEvent::resource_leaked("mount /mnt/data1", "suse01", "device busy");
        assert_eq!(
            leaked.describe(),
            "Could not release mount /mnt/data1 on suse01: device busy"
        );
        assert_eq!(leaked.stage(), None);
    }
}
