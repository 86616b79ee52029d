//! Pipeline Run Ledger
//!
//! `PipelineRun` is the single source of truth for one workflow instance:
//! what each stage did, and which resources are currently held on remote
//! systems. Teardown drains the resource ledger; the report reads the stage
//! results.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::model::{
    ExportedShare, JobHandle, JobKind, JobStatus, MountedFilesystem, PresentedVolume,
    VolumeGroupState,
};

// =============================================================================
// Stages
// =============================================================================

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    Recovery,
    Activation,
    Mount,
    Scan,
    Backup,
    Teardown,
    Report,
}

impl Stage {
    /// All stages in canonical order.
    pub const ALL: [Stage; 7] = [
        Stage::Recovery,
        Stage::Activation,
        Stage::Mount,
        Stage::Scan,
        Stage::Backup,
        Stage::Teardown,
        Stage::Report,
    ];

    /// Stages that only run while everything before them succeeded.
    pub const FORWARD: [Stage; 5] = [
        Stage::Recovery,
        Stage::Activation,
        Stage::Mount,
        Stage::Scan,
        Stage::Backup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Recovery => "Recovery",
            Stage::Activation => "Activation",
            Stage::Mount => "Mount",
            Stage::Scan => "Scan",
            Stage::Backup => "Backup",
            Stage::Teardown => "Teardown",
            Stage::Report => "Report",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<JobKind> for Stage {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::Scan => Stage::Scan,
            JobKind::Backup => Stage::Backup,
        }
    }
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Succeeded => write!(f, "Succeeded"),
            StageOutcome::Failed => write!(f, "Failed"),
            StageOutcome::Skipped => write!(f, "Skipped"),
        }
    }
}

/// One entry in the stage ledger.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: Stage,
    pub outcome: StageOutcome,
    /// Short label overriding the outcome in reports (job terminal state)
    pub detail: Option<String>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub duration: Duration,
}

impl StageResult {
    /// Label for the report: the detail when present, else the outcome.
    pub fn label(&self) -> String {
        match (self.outcome, &self.detail) {
            (StageOutcome::Skipped, _) => StageOutcome::Skipped.to_string(),
            (_, Some(detail)) => detail.clone(),
            (outcome, None) => outcome.to_string(),
        }
    }
}

/// Last known status of an external job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub handle: JobHandle,
    pub last_status: Option<JobStatus>,
}

// =============================================================================
// Pipeline Run
// =============================================================================

/// Process-scoped record of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    stage_results: Vec<StageResult>,

    // Resource ledger, in acquisition order
    pub presented: Option<PresentedVolume>,
    pub volume_group: Option<VolumeGroupState>,
    pub host_mounts: Vec<MountedFilesystem>,
    pub exports: Vec<ExportedShare>,
    pub network_mounts: Vec<MountedFilesystem>,

    pub jobs: Vec<JobRecord>,
    /// Resources teardown could not release
    pub leftovers: Vec<String>,
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRun {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            stage_results: Vec::new(),
            presented: None,
            volume_group: None,
            host_mounts: Vec::new(),
            exports: Vec::new(),
            network_mounts: Vec::new(),
            jobs: Vec::new(),
            leftovers: Vec::new(),
        }
    }

    // =========================================================================
    // Stage Ledger
    // =========================================================================

    /// Record a stage result. Each stage owns one slot; recording again
    /// replaces the previous entry.
    pub fn record(
        &mut self,
        stage: Stage,
        outcome: StageOutcome,
        detail: Option<String>,
        error: Option<String>,
        duration: Duration,
    ) {
        let result = StageResult {
            stage,
            outcome,
            detail,
            error,
            recorded_at: Utc::now(),
            duration,
        };
        match self.stage_results.iter_mut().find(|r| r.stage == stage) {
            Some(slot) => *slot = result,
            None => self.stage_results.push(result),
        }
    }

    pub fn succeed(&mut self, stage: Stage, duration: Duration) {
        self.record(stage, StageOutcome::Succeeded, None, None, duration);
    }

    pub fn fail(&mut self, stage: Stage, error: impl fmt::Display, duration: Duration) {
        self.record(
            stage,
            StageOutcome::Failed,
            None,
            Some(error.to_string()),
            duration,
        );
    }

    pub fn skip(&mut self, stage: Stage) {
        self.record(stage, StageOutcome::Skipped, None, None, Duration::ZERO);
    }

    /// Mark every listed stage without a result as skipped; returns the
    /// stages it marked.
    pub fn skip_unrecorded(&mut self, stages: &[Stage]) -> Vec<Stage> {
        let unrecorded: Vec<Stage> = stages
            .iter()
            .copied()
            .filter(|stage| self.result_of(*stage).is_none())
            .collect();
        for stage in &unrecorded {
            self.skip(*stage);
        }
        unrecorded
    }

    pub fn result_of(&self, stage: Stage) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.stage == stage)
    }

    pub fn outcome_of(&self, stage: Stage) -> Option<StageOutcome> {
        self.result_of(stage).map(|r| r.outcome)
    }

    /// Stage results in the order they were first recorded.
    pub fn stage_results(&self) -> &[StageResult] {
        &self.stage_results
    }

    /// Every forward stage plus teardown succeeded.
    pub fn is_success(&self) -> bool {
        Stage::FORWARD
            .iter()
            .chain(std::iter::once(&Stage::Teardown))
            .all(|stage| self.outcome_of(*stage) == Some(StageOutcome::Succeeded))
    }

    /// First forward stage that failed.
    pub fn first_failure(&self) -> Option<&StageResult> {
        Stage::FORWARD
            .iter()
            .filter_map(|stage| self.result_of(*stage))
            .find(|r| r.outcome == StageOutcome::Failed)
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub fn track_job(&mut self, handle: JobHandle) {
        let tracked = self
            .jobs
            .iter()
            .any(|j| j.handle.job_id == handle.job_id && j.handle.kind == handle.kind);
        if !tracked {
            self.jobs.push(JobRecord {
                handle,
                last_status: None,
            });
        }
    }

    pub fn update_job(&mut self, status: JobStatus) {
        if let Some(record) = self
            .jobs
            .iter_mut()
            .find(|j| j.handle.job_id == status.job_id && j.handle.kind == status.kind)
        {
            record.last_status = Some(status);
        }
    }

    pub fn jobs_of(&self, kind: JobKind) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter().filter(move |j| j.handle.kind == kind)
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Nothing is presented, imported, mounted or exported.
    pub fn holds_no_resources(&self) -> bool {
        self.presented.is_none()
            && self.volume_group.is_none()
            && self.host_mounts.is_empty()
            && self.exports.is_empty()
            && self.network_mounts.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
