//! Pipeline End-to-End Tests
//!
//! Drive `PipelineOrchestrator` against in-memory collaborators:
//! - Happy path across two adapters
//! - Failure in the middle of the mount stage
//! - One job failing while its sibling completes
//! - Abort while jobs are running
//! - Source host and scan host sharing one target
//! - Teardown failures surfacing in the report

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use safecopy::adapters::in_memory::{
    InMemoryEventCollector, InMemoryMailer, InMemoryStorageController, RecordingCommandRunner,
    ScriptedJobApi,
};
use safecopy::adapters::RunLogPublisher;
use safecopy::domain::model::{JobKind, JobState, RecoveryPoint, RemoteHost, Target};
use safecopy::domain::ports::JobRequest;
use safecopy::{
    Collaborators, PipelineConfig, PipelineOrchestrator, PipelineRun, Stage, StageOutcome,
};

// =============================================================================
// Fixture
// =============================================================================

const PLAN: &str = r#"
storage:
  controller: { kind: local }
  consistency_group: cg_123
  present_to: aix_server
source:
  target: { kind: local }
  platform: aix
  volume_group: datavg
  disk: /dev/hdisk4
  filesystems:
    - { mount_point: /data1 }
    - { mount_point: /data2 }
scan_host:
  target: { kind: ssh, name: suse01, address: 10.1.1.5, user: scan }
adapters: [10.0.1.1, 10.0.1.2]
mounts:
  - { export_path: /data1, mount_point: /mnt/data1 }
  - { export_path: /data2, mount_point: /mnt/data2 }
scan:
  api: { base_url: "https://scanner/api" }
  policy: DailyIntegrity
backup:
  api: { base_url: "https://backup/api" }
polling: { interval_secs: 30, scan_timeout_secs: 3600, backup_timeout_secs: 3600 }
report:
  recipient: ops@example.com
"#;

struct Harness {
    runner: Arc<RecordingCommandRunner>,
    storage: Arc<InMemoryStorageController>,
    scan_api: Arc<ScriptedJobApi>,
    backup_api: Arc<ScriptedJobApi>,
    mailer: Arc<InMemoryMailer>,
    events: Arc<InMemoryEventCollector>,
}

impl Harness {
    fn new() -> Self {
        let at = |h| Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap();
        Self {
            runner: Arc::new(RecordingCommandRunner::new()),
            storage: Arc::new(InMemoryStorageController::new(
                vec![
                    RecoveryPoint::new("p1", "cg_123", at(1)),
                    RecoveryPoint::new("p3", "cg_123", at(3)),
                    RecoveryPoint::new("p2", "cg_123", at(2)),
                ],
                "57",
            )),
            scan_api: Arc::new(ScriptedJobApi::new()),
            backup_api: Arc::new(ScriptedJobApi::new()),
            mailer: Arc::new(InMemoryMailer::new()),
            events: Arc::new(InMemoryEventCollector::new()),
        }
    }

    fn orchestrator(&self) -> PipelineOrchestrator {
        self.orchestrator_for(PLAN)
    }

    fn orchestrator_for(&self, plan: &str) -> PipelineOrchestrator {
        let config = PipelineConfig::from_yaml(plan).unwrap();
        let collaborators = Collaborators {
            runner: self.runner.clone(),
            storage: self.storage.clone(),
            scan_api: self.scan_api.clone(),
            backup_api: self.backup_api.clone(),
            mailer: self.mailer.clone(),
            events: self.events.clone(),
        };
        PipelineOrchestrator::new(config, collaborators).unwrap()
    }

    async fn run(&self) -> PipelineRun {
        self.orchestrator().run(CancellationToken::new()).await
    }

    fn scan_host_lines(&self) -> Vec<String> {
        self.runner.lines_on(&scan_host())
    }

    fn report(&self) -> String {
        let sent = self.mailer.sent();
        assert_eq!(sent.len(), 1);
        sent[0].body.clone()
    }
}

fn scan_host() -> Target {
    Target::Ssh(RemoteHost {
        name: "suse01".to_string(),
        address: "10.1.1.5".to_string(),
        user: "scan".to_string(),
        port: 22,
        identity_file: None,
    })
}

fn position(lines: &[String], needle: &str) -> usize {
    lines
        .iter()
        .position(|l| l.contains(needle))
        .unwrap_or_else(|| panic!("no command containing {:?} in {:#?}", needle, lines))
}

// =============================================================================
// Happy Path
// =============================================================================

mod happy_path {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_full_run_succeeds() {
        let h = Harness::new();
        h.scan_api
            .script(JobKind::Scan, vec![JobState::Pending, JobState::Running, JobState::Done]);
        h.backup_api
            .script(JobKind::Backup, vec![JobState::Running, JobState::Done]);

        let run = h.run().await;

        assert!(run.is_success(), "{:#?}", run.stage_results());
        for stage in Stage::ALL {
            assert_eq!(run.outcome_of(stage), Some(StageOutcome::Succeeded), "{}", stage);
        }
        assert!(run.holds_no_resources());
        assert!(run.leftovers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newest_recovery_point_is_recovered_and_unpresented() {
        let h = Harness::new();
        h.run().await;

        let calls = h.storage.calls();
        assert_eq!(calls[0], "list cg_123");
        assert!(calls[1].starts_with("recover p3 safecopy_"), "{}", calls[1]);
        assert_eq!(calls[2], "present 57 aix_server");
        assert_eq!(calls.last().unwrap(), "unpresent 57 aix_server");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mounts_alternate_adapters_and_unmount_in_reverse() {
        let h = Harness::new();
        h.run().await;

        let lines = h.scan_host_lines();
        let first = position(&lines, "10.0.1.1:/data1 /mnt/data1");
        let second = position(&lines, "10.0.1.2:/data2 /mnt/data2");
        let unmount_second = position(&lines, "umount /mnt/data2");
        let unmount_first = position(&lines, "umount /mnt/data1");
        assert!(first < second);
        assert!(second < unmount_second);
        assert!(unmount_second < unmount_first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_host_sequence() {
        let h = Harness::new();
        h.run().await;

        let lines = h.runner.lines_on(&Target::Local);
        let order = [
            "cfgmgr",
            "importvg -y datavg /dev/hdisk4",
            "varyonvg datavg",
            "mount /data1",
            "mount /data2",
            "mknfsexp -d /data1",
            "mknfsexp -d /data2",
            "rmnfsexp -d /data2",
            "rmnfsexp -d /data1",
            "umount /data2",
            "umount /data1",
            "varyoffvg datavg",
            "exportvg datavg",
        ];
        let positions: Vec<usize> = order.iter().map(|n| position(&lines, n)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:#?}", lines);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_target_mounted_paths() {
        let h = Harness::new();
        h.run().await;

        let scans = h.scan_api.started();
        assert_eq!(scans.len(), 1);
        match &scans[0].1 {
            JobRequest::Scan {
                policy,
                export_path,
                ..
            } => {
                assert_eq!(policy, "DailyIntegrity");
                assert_eq!(export_path, "/mnt/data1");
            }
            other => panic!("unexpected request {:?}", other),
        }

        let backups: Vec<_> = h
            .backup_api
            .started()
            .into_iter()
            .map(|(_, request)| request)
            .collect();
        assert_eq!(
            backups,
            vec![
                JobRequest::Backup {
                    path: "/mnt/data1".to_string()
                },
                JobRequest::Backup {
                    path: "/mnt/data2".to_string()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_contents() {
        let h = Harness::new();
        h.run().await;

        let report = h.report();
        assert!(report.starts_with("Daily Integrity Report\n"));
        assert!(report.contains("Status: SUCCESS"));
        assert!(report.contains("Recovery: Succeeded\n"));
        assert!(report.contains("Scan: Done\n"));
        assert!(report.contains("Backup: Done\n"));
        assert!(report.contains("Teardown: Succeeded\n"));
        assert!(report.contains("Scan job scan-1: Done"));
        assert!(report.contains("Backup job backup-2: Done"));
        assert_eq!(h.mailer.sent()[0].recipient, "ops@example.com");
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_bracket_the_run() {
        let h = Harness::new();
        h.run().await;

        let events = h.events.events();
        assert_eq!(events.first().unwrap().event_type(), "RunStarted");
        assert_eq!(events.last().unwrap().event_type(), "RunFinished");
        assert_eq!(h.events.events_of_type("ReportDispatched").len(), 1);
        assert_eq!(
            h.events.events_of_type("ResourceAcquired").len(),
            h.events.events_of_type("ResourceReleased").len()
        );
    }
}

// =============================================================================
// Failures
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_second_mount_failure_skips_jobs_and_cleans_up() {
        let h = Harness::new();
        h.runner
            .fail_when("10.0.1.2:/data2", "mount.nfs: access denied by server");

        let run = h.run().await;

        assert!(!run.is_success());
        assert_eq!(run.outcome_of(Stage::Mount), Some(StageOutcome::Failed));
        assert_eq!(run.outcome_of(Stage::Scan), Some(StageOutcome::Skipped));
        assert_eq!(run.outcome_of(Stage::Backup), Some(StageOutcome::Skipped));
        assert_eq!(run.outcome_of(Stage::Teardown), Some(StageOutcome::Succeeded));
        assert!(h.scan_api.started().is_empty());
        assert!(h.backup_api.started().is_empty());

        let lines = h.scan_host_lines();
        assert!(lines.iter().any(|l| l == "umount /mnt/data1"));
        assert!(!lines.iter().any(|l| l == "umount /mnt/data2"));
        assert!(h
            .runner
            .command_lines()
            .contains(&"varyoffvg datavg".to_string()));

        let report = h.report();
        assert!(report.contains("Mount: Failed - "));
        assert!(report.contains("access denied"));
        assert!(report.contains("Scan: Skipped\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_failure_touches_no_host() {
        let h = Harness::new();
        h.storage.fail_recover();

        let run = h.run().await;

        assert_eq!(run.outcome_of(Stage::Recovery), Some(StageOutcome::Failed));
        assert_eq!(run.outcome_of(Stage::Activation), Some(StageOutcome::Skipped));
        assert_eq!(h.runner.count(), 0);
        assert_eq!(run.outcome_of(Stage::Teardown), Some(StageOutcome::Succeeded));
        assert!(h.report().contains("Status: FAILED"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_does_not_stop_backup() {
        let h = Harness::new();
        h.scan_api
            .script(JobKind::Scan, vec![JobState::Running, JobState::Failed]);
        h.backup_api.script(
            JobKind::Backup,
            vec![JobState::Running, JobState::Running, JobState::Running, JobState::Done],
        );

        let run = h.run().await;

        assert!(!run.is_success());
        assert_eq!(run.outcome_of(Stage::Scan), Some(StageOutcome::Failed));
        assert_eq!(run.result_of(Stage::Scan).unwrap().label(), "Failed");
        assert_eq!(run.outcome_of(Stage::Backup), Some(StageOutcome::Succeeded));
        assert_eq!(h.backup_api.poll_count("backup-1"), 4);
        assert!(h.backup_api.canceled().is_empty());
        assert_eq!(run.outcome_of(Stage::Teardown), Some(StageOutcome::Succeeded));

        let report = h.report();
        assert!(report.contains("Scan: Failed"));
        assert!(report.contains("Backup: Done\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_leaves_backup_running_to_completion() {
        let h = Harness::new();
        h.scan_api.script(JobKind::Scan, vec![JobState::Running]);
        let mut backup = vec![JobState::Running; 6];
        backup.push(JobState::Done);
        h.backup_api.script(JobKind::Backup, backup);
        let plan = PLAN.replace("scan_timeout_secs: 3600", "scan_timeout_secs: 120");

        let run = h.orchestrator_for(&plan).run(CancellationToken::new()).await;

        let scan = run.result_of(Stage::Scan).unwrap();
        assert_eq!(scan.outcome, StageOutcome::Failed);
        assert!(
            scan.error.as_deref().unwrap().contains("did not finish within"),
            "{:?}",
            scan.error
        );
        assert_eq!(run.outcome_of(Stage::Backup), Some(StageOutcome::Succeeded));
        assert_eq!(h.backup_api.poll_count("backup-1"), 7);
        assert!(h.scan_api.canceled().is_empty());
        assert!(h.backup_api.canceled().is_empty());
        assert_eq!(run.outcome_of(Stage::Teardown), Some(StageOutcome::Succeeded));
        assert!(run.holds_no_resources());

        let report = h.report();
        assert!(report.contains("Scan: Failed"));
        assert!(report.contains("Backup: Done\n"));
        assert!(report.contains("Teardown: Succeeded\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_failure_is_reported_as_left_in_place() {
        let h = Harness::new();
        h.runner.fail_when("varyoffvg", "0516-012 lvm busy");

        let run = h.run().await;

        assert_eq!(run.outcome_of(Stage::Teardown), Some(StageOutcome::Failed));
        assert!(!run.is_success());
        assert!(h
            .runner
            .command_lines()
            .contains(&"exportvg datavg".to_string()));
        assert_eq!(
            h.storage.calls().last().unwrap(),
            "unpresent 57 aix_server"
        );

        let report = h.report();
        assert!(report.contains("Teardown: Failed - 1 resource(s) left in place"));
        assert!(report.contains("Left in place:\n  volume group datavg (active)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mail_failure_keeps_stage_outcomes() {
        let h = Harness::new();
        h.mailer.fail();

        let run = h.run().await;

        assert_eq!(run.outcome_of(Stage::Report), Some(StageOutcome::Failed));
        assert!(run.is_success());
    }
}

// =============================================================================
// Teardown Idempotence
// =============================================================================

mod idempotence {
    use super::*;
    use safecopy::stages::TeardownStage;

    #[tokio::test(start_paused = true)]
    async fn test_second_teardown_after_run_is_noop() {
        let h = Harness::new();
        h.runner.fail_when("umount /mnt/data2", "device busy");
        let mut run = h.run().await;
        let commands = h.runner.count();
        let storage_calls = h.storage.calls().len();
        let first = run.result_of(Stage::Teardown).cloned().unwrap();

        let teardown = TeardownStage::new(h.runner.clone(), h.storage.clone(), h.events.clone());
        teardown.teardown(&mut run).await;

        assert_eq!(h.runner.count(), commands);
        assert_eq!(h.storage.calls().len(), storage_calls);
        let second = run.result_of(Stage::Teardown).unwrap();
        assert_eq!(second.outcome, StageOutcome::Failed);
        assert_eq!(second.error, first.error);
        assert_eq!(run.leftovers.len(), 1);
    }
}

// =============================================================================
// Shared Target
// =============================================================================

mod shared_target {
    use super::*;

    fn plan() -> String {
        PLAN.replace(
            "  target: { kind: ssh, name: suse01, address: 10.1.1.5, user: scan }",
            "  target: { kind: local }\n  platform: linux\n  privileged: true",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_host_torn_down_with_its_own_commands() {
        let h = Harness::new();

        let run = h.orchestrator_for(&plan()).run(CancellationToken::new()).await;

        assert!(run.is_success(), "{:#?}", run.stage_results());
        let lines = h.runner.lines_on(&Target::Local);
        let order = [
            "sudo umount /mnt/data2",
            "sudo umount /mnt/data1",
            "rmnfsexp -d /data2",
            "rmnfsexp -d /data1",
            "umount /data2",
            "umount /data1",
            "varyoffvg datavg",
            "exportvg datavg",
        ];
        let positions: Vec<usize> = order.iter().map(|n| position(&lines, n)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:#?}", lines);
        assert!(lines.contains(&"umount /data1".to_string()));

        for wrong in ["vgchange", "vgexport", "exportfs", "sudo varyoffvg", "sudo rmnfsexp"] {
            assert!(!lines.iter().any(|l| l.starts_with(wrong)), "{}: {:#?}", wrong, lines);
        }
        assert!(run.leftovers.is_empty());
    }
}

// =============================================================================
// Cancellation
// =============================================================================

mod cancellation {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_jobs_run_cancels_and_tears_down() {
        let h = Harness::new();
        h.scan_api.script(JobKind::Scan, vec![JobState::Running]);
        h.backup_api.script(JobKind::Backup, vec![JobState::Running]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(95)).await;
            trigger.cancel();
        });

        let run = h.orchestrator().run(cancel).await;

        assert_eq!(h.scan_api.canceled(), vec!["scan-1"]);
        let mut backups = h.backup_api.canceled();
        backups.sort();
        assert_eq!(backups, vec!["backup-1", "backup-2"]);

        assert_eq!(run.outcome_of(Stage::Scan), Some(StageOutcome::Failed));
        assert_eq!(run.result_of(Stage::Scan).unwrap().label(), "Canceled");
        assert_eq!(run.outcome_of(Stage::Backup), Some(StageOutcome::Failed));
        assert_eq!(run.outcome_of(Stage::Teardown), Some(StageOutcome::Succeeded));
        assert!(run.holds_no_resources());
        assert_eq!(h.events.events_of_type("JobCancelRequested").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_before_start_skips_everything() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = h.orchestrator().run(cancel).await;

        assert_eq!(run.outcome_of(Stage::Recovery), Some(StageOutcome::Failed));
        assert!(run
            .result_of(Stage::Recovery)
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("abort"));
        for stage in [Stage::Activation, Stage::Mount, Stage::Scan, Stage::Backup] {
            assert_eq!(run.outcome_of(stage), Some(StageOutcome::Skipped));
        }
        assert_eq!(h.events.events_of_type("StageSkipped").len(), 4);
        assert!(h.storage.calls().is_empty());
        assert_eq!(h.runner.count(), 0);
    }
}

// =============================================================================
// Run Log
// =============================================================================

mod run_log {
    use super::*;
    use safecopy::adapters::CompositeEventPublisher;

    #[tokio::test]
    async fn test_run_log_records_every_stage() {
        let h = Harness::new();
        let path = std::env::temp_dir().join(format!("safecopy-run-{}.log", uuid::Uuid::new_v4()));
        let events = CompositeEventPublisher::new()
            .with_publisher(RunLogPublisher::new(&path))
            .with_publisher(h.events.clone());

        let config = PipelineConfig::from_yaml(PLAN).unwrap();
        let orchestrator = PipelineOrchestrator::new(
            config,
            Collaborators {
                runner: h.runner.clone(),
                storage: h.storage.clone(),
                scan_api: h.scan_api.clone(),
                backup_api: h.backup_api.clone(),
                mailer: h.mailer.clone(),
                events: Arc::new(events),
            },
        )
        .unwrap();
        let run = orchestrator.run(CancellationToken::new()).await;
        assert!(run.is_success());

        let log = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), h.events.len());
        assert!(lines[0].contains("RunStarted"));
        assert!(lines.last().unwrap().contains("RunFinished"));
        for stage in ["Recovery", "Activation", "Mount", "Scan", "Backup", "Teardown"] {
            assert!(
                lines
                    .iter()
                    .any(|l| l.contains("StageCompleted") && l.contains(stage)),
                "{}",
                stage
            );
        }

        let _ = tokio::fs::remove_file(&path).await;
    }
}
