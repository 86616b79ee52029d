//! Report Stage
//!
//! Renders the run ledger into a plain-text report and mails it.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument};

use super::Events;
use crate::domain::events::PipelineEvent;
use crate::domain::ports::Mailer;
use crate::domain::run::{PipelineRun, Stage, StageOutcome};

/// Rendered report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub subject: String,
    pub text: String,
}

pub struct ReportStage {
    mailer: Arc<dyn Mailer>,
    events: Events,
    subject: String,
}

impl std::fmt::Debug for ReportStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportStage")
            .field("subject", &self.subject)
            .finish()
    }
}

impl ReportStage {
    pub fn new(mailer: Arc<dyn Mailer>, events: Events, subject: impl Into<String>) -> Self {
        Self {
            mailer,
            events,
            subject: subject.into(),
        }
    }

    /// One line per stage, then jobs and leftovers.
    pub fn render(&self, run: &PipelineRun) -> Report {
        let mut text = String::new();
        let _ = writeln!(text, "{}", self.subject);
        let _ = writeln!(text, "Run: {}", run.run_id);
        let _ = writeln!(text, "Started: {}", run.started_at.to_rfc3339());
        if let Some(ended) = run.ended_at {
            let _ = writeln!(text, "Ended: {}", ended.to_rfc3339());
        }
        let _ = writeln!(
            text,
            "Status: {}",
            if run.is_success() { "SUCCESS" } else { "FAILED" }
        );
        text.push('\n');

        for stage in Stage::ALL.iter().filter(|s| **s != Stage::Report) {
            match run.result_of(*stage) {
                Some(result) => {
                    let _ = write!(text, "{}: {}", stage, result.label());
                    if result.outcome == StageOutcome::Failed {
                        if let Some(cause) = &result.error {
                            let _ = write!(text, " - {}", cause);
                        }
                    }
                    text.push('\n');
                }
                None => {
                    let _ = writeln!(text, "{}: {}", stage, StageOutcome::Skipped);
                }
            }
        }

        if !run.jobs.is_empty() {
            text.push_str("\nJobs:\n");
            for job in &run.jobs {
                let state = job
                    .last_status
                    .as_ref()
                    .map(|s| s.state.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let _ = writeln!(
                    text,
                    "  {} job {}: {}",
                    job.handle.kind, job.handle.job_id, state
                );
            }
        }

        if !run.leftovers.is_empty() {
            text.push_str("\nLeft in place:\n");
            for leftover in &run.leftovers {
                let _ = writeln!(text, "  {}", leftover);
            }
        }

        Report {
            subject: self.subject.clone(),
            text,
        }
    }

    /// Send the report. Failure is logged and recorded as the Report
    /// stage's outcome; earlier stage results are untouched.
    #[instrument(skip(self, report, run))]
    pub async fn dispatch(&self, report: &Report, recipient: &str, run: &mut PipelineRun) {
        match self.mailer.send(&report.subject, &report.text, recipient).await {
            Ok(()) => {
                info!("Report sent to {}", recipient);
                run.succeed(Stage::Report, Duration::ZERO);
                self.events
                    .emit(PipelineEvent::report_dispatched(recipient))
                    .await;
            }
            Err(e) => {
                error!("Report could not be sent to {}: {}", recipient, e);
                run.fail(Stage::Report, &e, Duration::ZERO);
                self.events
                    .emit(PipelineEvent::stage_failed(Stage::Report, &e))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::in_memory::{InMemoryEventCollector, InMemoryMailer};
    use crate::domain::model::{JobHandle, JobKind, JobState, JobStatus};

    fn stage(mailer: Arc<InMemoryMailer>) -> ReportStage {
        ReportStage::new(
            mailer,
            Arc::new(InMemoryEventCollector::new()),
            "Daily Integrity Report",
        )
    }

    #[test]
    fn test_render_lists_every_stage() {
        let mut run = PipelineRun::new();
        run.succeed(Stage::Recovery, Duration::ZERO);
        run.succeed(Stage::Activation, Duration::ZERO);
        run.fail(Stage::Mount, "mount.nfs: access denied", Duration::ZERO);
        run.skip(Stage::Scan);
        run.succeed(Stage::Teardown, Duration::ZERO);
        run.leftovers.push("mount /mnt/x on suse01: busy".to_string());

        let report = stage(Arc::new(InMemoryMailer::new())).render(&run);
        assert_eq!(report.subject, "Daily Integrity Report");
        assert!(report.text.contains("Status: FAILED"));
        assert!(report.text.contains("Recovery: Succeeded\n"));
        assert!(report.text.contains("Mount: Failed - mount.nfs: access denied\n"));
        assert!(report.text.contains("Scan: Skipped\n"));
        // Never recorded
        assert!(report.text.contains("Backup: Skipped\n"));
        assert!(report.text.contains("Left in place:\n  mount /mnt/x on suse01: busy"));
        assert!(!report.text.contains("Report:"));
    }

    #[test]
    fn test_render_job_states() {
        let mut run = PipelineRun::new();
        let handle = JobHandle::new("4711", JobKind::Scan);
        run.track_job(handle.clone());
        run.update_job(JobStatus::new(&handle, JobState::Done, "{}"));
        run.record(
            Stage::Scan,
            StageOutcome::Succeeded,
            Some("Done".to_string()),
            None,
            Duration::ZERO,
        );

        let report = stage(Arc::new(InMemoryMailer::new())).render(&run);
        assert!(report.text.contains("Scan: Done\n"));
        assert!(report.text.contains("Scan job 4711: Done"));
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_recorded_only_on_report() {
        let mailer = Arc::new(InMemoryMailer::new());
        mailer.fail();
        let stage = stage(mailer.clone());
        let mut run = PipelineRun::new();
        run.succeed(Stage::Recovery, Duration::ZERO);

        let report = stage.render(&run);
        stage.dispatch(&report, "ops@example.com", &mut run).await;

        assert_eq!(run.outcome_of(Stage::Report), Some(StageOutcome::Failed));
        assert_eq!(run.outcome_of(Stage::Recovery), Some(StageOutcome::Succeeded));
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_sends() {
        let mailer = Arc::new(InMemoryMailer::new());
        let stage = stage(mailer.clone());
        let mut run = PipelineRun::new();

        let report = stage.render(&run);
        stage.dispatch(&report, "ops@example.com", &mut run).await;

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "ops@example.com");
        assert_eq!(run.outcome_of(Stage::Report), Some(StageOutcome::Succeeded));
    }
}
