//! Scan Stage
//!
//! Starts one integrity-scan job for the exported data and follows it to
//! a terminal state.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument};

use super::{status_of, JobStageOutcome};
use crate::domain::model::JobKind;
use crate::domain::ports::{JobRequest, ScanExtras};
use crate::jobs::{JobPoller, PollPolicy};

#[derive(Debug)]
pub struct ScanStage {
    poller: JobPoller,
    policy: String,
    export_path: String,
    extras: ScanExtras,
    poll: PollPolicy,
}

impl ScanStage {
    pub fn new(
        poller: JobPoller,
        policy: impl Into<String>,
        export_path: impl Into<String>,
        extras: ScanExtras,
        poll: PollPolicy,
    ) -> Self {
        Self {
            poller,
            policy: policy.into(),
            export_path: export_path.into(),
            extras,
            poll,
        }
    }

    pub fn request(&self) -> JobRequest {
        JobRequest::Scan {
            policy: self.policy.clone(),
            export_path: self.export_path.clone(),
            extras: self.extras.clone(),
        }
    }

    #[instrument(skip_all, fields(policy = %self.policy, export = %self.export_path))]
    pub async fn run(&self, cancel: &CancellationToken) -> JobStageOutcome {
        let started = Instant::now();
        let mut outcome = JobStageOutcome {
            kind: JobKind::Scan,
            handles: Vec::new(),
            statuses: Vec::new(),
            result: Ok(()),
            duration: Default::default(),
        };

        let handle = match self.poller.start(&self.request()).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Scan job could not be started: {}", e);
                outcome.result = Err(e);
                outcome.duration = started.elapsed();
                return outcome;
            }
        };
        outcome.handles.push(handle.clone());

        match self
            .poller
            .wait_until_terminal_or_cancel(&handle, self.poll, cancel)
            .await
        {
            Ok(status) => outcome.statuses.push(status),
            Err(e) => {
                if let Some(status) = status_of(&e) {
                    outcome.statuses.push(status.clone());
                }
                error!("Scan job {} did not complete: {}", handle.job_id, e);
                outcome.result = Err(e);
            }
        }
        outcome.duration = started.elapsed();
        outcome
    }
}
