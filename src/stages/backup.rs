//! Backup Stage
//!
//! One backup job per path. Every start must succeed before any job is
//! monitored; the jobs are then followed concurrently and the stage
//! succeeds only if all of them finish Done.

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::{status_of, JobStageOutcome};
use crate::domain::model::JobKind;
use crate::domain::ports::JobRequest;
use crate::error::{Error, Result};
use crate::jobs::{JobPoller, PollPolicy};

#[derive(Debug)]
pub struct BackupStage {
    poller: JobPoller,
    paths: Vec<String>,
    poll: PollPolicy,
}

impl BackupStage {
    pub fn new(poller: JobPoller, paths: Vec<String>, poll: PollPolicy) -> Self {
        Self {
            poller,
            paths,
            poll,
        }
    }

    #[instrument(skip_all, fields(paths = self.paths.len()))]
    pub async fn run(&self, cancel: &CancellationToken) -> JobStageOutcome {
        let started = Instant::now();
        let mut outcome = JobStageOutcome {
            kind: JobKind::Backup,
            handles: Vec::new(),
            statuses: Vec::new(),
            result: Ok(()),
            duration: Default::default(),
        };

        for path in &self.paths {
            let request = JobRequest::Backup { path: path.clone() };
            match self.poller.start(&request).await {
                Ok(handle) => outcome.handles.push(handle),
                Err(e) => {
                    error!("Backup of {} could not be started: {}", path, e);
                    self.cancel_started(&outcome).await;
                    outcome.result = Err(e);
                    outcome.duration = started.elapsed();
                    return outcome;
                }
            }
        }
        info!("Started {} backup jobs", outcome.handles.len());

        let waits = outcome
            .handles
            .iter()
            .map(|handle| self.poller.wait_until_terminal_or_cancel(handle, self.poll, cancel));
        let results: Vec<Result<_>> = join_all(waits).await;

        let mut first_error: Option<Error> = None;
        for result in results {
            match result {
                Ok(status) => outcome.statuses.push(status),
                Err(e) => {
                    if let Some(status) = status_of(&e) {
                        outcome.statuses.push(status.clone());
                    }
                    error!("Backup job did not complete: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            outcome.result = Err(e);
        }
        outcome.duration = started.elapsed();
        outcome
    }

    /// Explicitly cancel jobs already started when a later start fails.
    async fn cancel_started(&self, outcome: &JobStageOutcome) {
        for handle in &outcome.handles {
            warn!("Canceling backup job {} after failed start", handle.job_id);
            if let Err(e) = self.poller.cancel(handle).await {
                warn!("Cancel of backup job {} failed: {}", handle.job_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::in_memory::{InMemoryEventCollector, ScriptedJobApi};
    use crate::domain::model::JobState;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;

    fn stage(api: &Arc<ScriptedJobApi>, paths: &[&str]) -> BackupStage {
        let poller = JobPoller::new(api.clone(), Arc::new(InMemoryEventCollector::new()));
        BackupStage::new(
            poller,
            paths.iter().map(|p| p.to_string()).collect(),
            PollPolicy::new(Duration::from_secs(30), Duration::from_secs(600)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_job_per_path() {
        let api = Arc::new(ScriptedJobApi::new());
        api.script(JobKind::Backup, vec![JobState::Running, JobState::Done]);

        let outcome = stage(&api, &["/mnt/data1", "/mnt/data2"])
            .run(&CancellationToken::new())
            .await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.handles.len(), 2);
        assert_eq!(outcome.statuses.len(), 2);
        assert_eq!(outcome.terminal_label().as_deref(), Some("Done"));
        assert_eq!(api.total_polls(JobKind::Backup), 4);
    }

    #[tokio::test]
    async fn test_failed_start_cancels_started_and_never_polls() {
        let api = Arc::new(ScriptedJobApi::new());
        api.fail_start(JobKind::Backup, 2);

        let outcome = stage(&api, &["/mnt/data1", "/mnt/data2", "/mnt/data3"])
            .run(&CancellationToken::new())
            .await;

        assert_matches!(outcome.result, Err(Error::JobStart { .. }));
        assert_eq!(api.canceled(), vec!["backup-1".to_string()]);
        assert_eq!(api.total_polls(JobKind::Backup), 0);
        assert_eq!(api.started().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_stage_without_cancel() {
        let api = Arc::new(ScriptedJobApi::new());
        api.script(JobKind::Backup, vec![JobState::Running]);

        let outcome = stage(&api, &["/mnt/data1", "/mnt/data2"])
            .run(&CancellationToken::new())
            .await;

        assert_matches!(outcome.result, Err(Error::Timeout { .. }));
        assert!(outcome.statuses.is_empty());
        assert_eq!(outcome.terminal_label(), None);
        assert!(api.canceled().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failed_job_fails_stage() {
        let api = Arc::new(ScriptedJobApi::new());
        api.script(JobKind::Backup, vec![JobState::Failed]);

        let outcome = stage(&api, &["/mnt/data1"])
            .run(&CancellationToken::new())
            .await;
        assert_matches!(outcome.result, Err(Error::JobFailed { .. }));
        assert_eq!(outcome.terminal_label().as_deref(), Some("Failed"));
    }
}
