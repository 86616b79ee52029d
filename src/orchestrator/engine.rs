//! Pipeline Orchestrator Engine
//!
//! Sequences the stages of one run:
//!
//! ```text
//! Recovery → Activation → Mount → { Scan ∥ Backup } → Teardown → Report
//! ```
//!
//! # Guarantees
//!
//! 1. The plan is validated before any side effect
//! 2. The first forward failure skips every remaining forward stage
//! 3. Teardown and report run on every exit path, after both job stages
//!    have finished
//! 4. Scan and backup run concurrently; one failing never cancels the other

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::domain::events::PipelineEvent;
use crate::domain::model::{Filesystem, MountedFilesystem, PresentedVolume};
use crate::domain::ports::{CommandRunner, EventPublisher, JobApi, Mailer, StorageController};
use crate::domain::run::{PipelineRun, Stage};
use crate::error::{Error, Result};
use crate::jobs::JobPoller;
use crate::stages::{
    AdapterAssigner, BackupStage, HostSession, MountStage, ReportStage, ScanStage,
    StorageRecoveryStage, TeardownStage, VolumeActivationStage,
};

// =============================================================================
// Collaborators
// =============================================================================

/// External systems one run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub storage: Arc<dyn StorageController>,
    pub scan_api: Arc<dyn JobApi>,
    pub backup_api: Arc<dyn JobApi>,
    pub mailer: Arc<dyn Mailer>,
    pub events: Arc<dyn EventPublisher>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Drives one validation run from recovery to report.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    events: Arc<dyn EventPublisher>,
    recovery: StorageRecoveryStage,
    activation: VolumeActivationStage,
    mount: MountStage,
    scan: ScanStage,
    backup: BackupStage,
    teardown: TeardownStage,
    report: ReportStage,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("consistency_group", &self.config.storage.consistency_group)
            .field("mounts", &self.config.mounts.len())
            .finish()
    }
}

impl PipelineOrchestrator {
    /// Validate the plan and wire the stages. Fails with `Error::Config`
    /// before anything touches a host.
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let assigner = AdapterAssigner::new(config.adapters.clone())?;

        let Collaborators {
            runner,
            storage,
            scan_api,
            backup_api,
            mailer,
            events,
        } = collaborators;

        let source = HostSession::new(
            config.source.target.clone(),
            config.source.platform,
            config.source.privileged,
        );
        let scan_host = HostSession::new(
            config.scan_host.target.clone(),
            config.scan_host.platform,
            config.scan_host.privileged,
        );

        let recovery = StorageRecoveryStage::new(
            storage.clone(),
            events.clone(),
            &config.storage.consistency_group,
            &config.storage.copy_prefix,
            &config.storage.present_to,
        );
        let activation = VolumeActivationStage::new(
            runner.clone(),
            events.clone(),
            source.clone(),
            &config.source.volume_group,
            &config.source.disk,
            config.source.filesystems.clone(),
        );
        let mount = MountStage::new(
            runner.clone(),
            events.clone(),
            assigner,
            source,
            scan_host,
            config.source.nfs_version,
        );
        let scan = ScanStage::new(
            JobPoller::new(scan_api, events.clone()),
            &config.scan.policy,
            config.scan_export(),
            config.scan.extras.clone(),
            config.scan_poll_policy(),
        );
        let backup = BackupStage::new(
            JobPoller::new(backup_api, events.clone()),
            config.backup_paths(),
            config.backup_poll_policy(),
        );
        let teardown = TeardownStage::new(runner, storage, events.clone());
        let report = ReportStage::new(mailer, events.clone(), &config.report.subject);

        Ok(Self {
            config,
            events,
            recovery,
            activation,
            mount,
            scan,
            backup,
            teardown,
            report,
        })
    }

    /// Execute a full run. Never fails: every outcome, including an abort
    /// through `cancel`, ends up in the returned ledger.
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> PipelineRun {
        let mut run = PipelineRun::new();
        let started = Instant::now();
        info!("Starting validation run {}", run.run_id);
        self.events.emit(PipelineEvent::run_started(run.run_id)).await;

        if let Err(e) = self.run_forward(&mut run, &cancel).await {
            error!("Run {} stopped early: {}", run.run_id, e);
        }
        for stage in run.skip_unrecorded(&Stage::FORWARD) {
            self.events.emit(PipelineEvent::stage_skipped(stage)).await;
        }

        self.teardown.teardown(&mut run).await;

        run.finish();
        let report = self.report.render(&run);
        match &self.config.report.recipient {
            Some(recipient) => self.report.dispatch(&report, recipient, &mut run).await,
            None => {
                info!("No report recipient configured\n{}", report.text);
                run.skip(Stage::Report);
            }
        }

        let success = run.is_success();
        info!(
            "Run {} finished {}",
            run.run_id,
            if success { "successfully" } else { "with failures" }
        );
        self.events
            .emit(PipelineEvent::run_finished(run.run_id, success, started.elapsed()))
            .await;
        run
    }

    /// Forward stages; returns the first failure.
    async fn run_forward(&self, run: &mut PipelineRun, cancel: &CancellationToken) -> Result<()> {
        let started = self.enter(Stage::Recovery, run, cancel).await?;
        let result = self.recovery.run(run).await;
        let presented: PresentedVolume = self.leave(Stage::Recovery, run, started, result).await?;

        let started = self.enter(Stage::Activation, run, cancel).await?;
        let result = self.activation.activate(&presented, run).await;
        let filesystems: Vec<Filesystem> =
            self.leave(Stage::Activation, run, started, result).await?;

        let started = self.enter(Stage::Mount, run, cancel).await?;
        let specs = self.config.mount_specs();
        let result = self.mount.mount_all(&filesystems, &specs, run).await;
        let _mounted: Vec<MountedFilesystem> =
            self.leave(Stage::Mount, run, started, result).await?;

        self.enter(Stage::Scan, run, cancel).await?;
        self.events
            .emit(PipelineEvent::stage_started(Stage::Backup))
            .await;
        let (scan, backup) = tokio::join!(self.scan.run(cancel), self.backup.run(cancel));

        let scan_result = scan.record(run, self.events.as_ref()).await;
        let backup_result = backup.record(run, self.events.as_ref()).await;
        scan_result.and(backup_result)
    }

    /// Begin a forward stage unless the run was aborted.
    async fn enter(
        &self,
        stage: Stage,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<Instant> {
        if cancel.is_cancelled() {
            let error = Error::Aborted(format!("abort requested before {}", stage));
            warn!("{}", error);
            run.fail(stage, &error, Default::default());
            self.events
                .emit(PipelineEvent::stage_failed(stage, &error))
                .await;
            return Err(error);
        }
        info!("{} stage starting", stage);
        self.events.emit(PipelineEvent::stage_started(stage)).await;
        Ok(Instant::now())
    }

    /// Record a forward stage's result.
    async fn leave<T>(
        &self,
        stage: Stage,
        run: &mut PipelineRun,
        started: Instant,
        result: Result<T>,
    ) -> Result<T> {
        let elapsed = started.elapsed();
        match &result {
            Ok(_) => {
                info!("{} stage succeeded in {:?}", stage, elapsed);
                run.succeed(stage, elapsed);
                self.events
                    .emit(PipelineEvent::stage_completed(stage, elapsed))
                    .await;
            }
            Err(e) => {
                error!("{} stage failed: {}", stage, e);
                run.fail(stage, e, elapsed);
                self.events
                    .emit(PipelineEvent::stage_failed(stage, e))
                    .await;
            }
        }
        result
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::in_memory::{
        InMemoryEventCollector, InMemoryMailer, InMemoryStorageController,
        RecordingCommandRunner, ScriptedJobApi,
    };
    use crate::domain::model::{JobKind, RecoveryPoint};
    use crate::domain::run::StageOutcome;
    use assert_matches::assert_matches;
    use chrono::Utc;

    const PLAN: &str = r#"
storage:
  controller: { kind: local }
  consistency_group: cg_123
  present_to: aix_server
source:
  target: { kind: local }
  volume_group: datavg
  disk: /dev/hdisk4
  filesystems: [{ mount_point: /data1 }]
scan_host:
  target: { kind: local }
adapters: [10.0.1.1]
mounts:
  - { export_path: /data1, mount_point: /mnt/data1 }
scan:
  api: { base_url: "http://scanner" }
  policy: DailyIntegrity
backup:
  api: { base_url: "http://backup" }
polling: { interval_secs: 1, scan_timeout_secs: 60, backup_timeout_secs: 60 }
"#;

    fn collaborators() -> (
        Collaborators,
        Arc<RecordingCommandRunner>,
        Arc<InMemoryEventCollector>,
    ) {
        let runner = Arc::new(RecordingCommandRunner::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let collaborators = Collaborators {
            runner: runner.clone(),
            storage: Arc::new(InMemoryStorageController::new(
                vec![RecoveryPoint::new("7", "cg_123", Utc::now())],
                "57",
            )),
            scan_api: Arc::new(ScriptedJobApi::new()),
            backup_api: Arc::new(ScriptedJobApi::new()),
            mailer: Arc::new(InMemoryMailer::new()),
            events: events.clone(),
        };
        (collaborators, runner, events)
    }

    #[test]
    fn test_invalid_plan_rejected_before_side_effects() {
        let mut config: PipelineConfig = serde_yaml::from_str(PLAN).unwrap();
        config.adapters.clear();
        let (collaborators, runner, _) = collaborators();

        let result = PipelineOrchestrator::new(config, collaborators);
        assert_matches!(result, Err(Error::Config(_)));
        assert_eq!(runner.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_without_recipient_skips_report() {
        let config: PipelineConfig = serde_yaml::from_str(PLAN).unwrap();
        let (collaborators, _, events) = collaborators();
        let orchestrator = PipelineOrchestrator::new(config, collaborators).unwrap();

        let run = orchestrator.run(CancellationToken::new()).await;
        assert!(run.is_success());
        assert_eq!(run.outcome_of(Stage::Report), Some(StageOutcome::Skipped));
        assert_eq!(events.events_of_type("RunStarted").len(), 1);
        assert_eq!(events.events_of_type("RunFinished").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_before_start_runs_teardown_only() {
        let config: PipelineConfig = serde_yaml::from_str(PLAN).unwrap();
        let (collaborators, runner, events) = collaborators();
        let orchestrator = PipelineOrchestrator::new(config, collaborators).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = orchestrator.run(cancel).await;

        assert_eq!(runner.count(), 0);
        assert_eq!(run.outcome_of(Stage::Recovery), Some(StageOutcome::Failed));
        assert_eq!(run.outcome_of(Stage::Backup), Some(StageOutcome::Skipped));
        assert_eq!(events.events_of_type("StageSkipped").len(), 4);
        assert_eq!(run.outcome_of(Stage::Teardown), Some(StageOutcome::Succeeded));
        assert!(run.jobs_of(JobKind::Scan).next().is_none());
    }
}
