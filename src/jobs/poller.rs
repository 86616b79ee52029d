//! Job Poller
//!
//! Drives one external job from submission to a terminal state.
//!
//! # State Machine
//!
//! ```text
//! Pending ─┐
//!          ├─▶ (poll, sleep interval, poll ...) ─┬─▶ Done      → Ok(status)
//! Running ─┘                                     ├─▶ Failed    → Err(JobFailed)
//!                                                ├─▶ Canceled  → Err(JobFailed)
//!                                                └─▶ deadline  → Err(Timeout)
//! ```
//!
//! Transport errors while polling are retried until the deadline; every
//! other error ends the wait immediately. A timeout never cancels the
//! remote job: cancellation is always an explicit request.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::events::PipelineEvent;
use crate::domain::model::{JobHandle, JobState, JobStatus};
use crate::domain::ports::{EventPublisher, JobApi, JobRequest};
use crate::error::{Error, Result};

/// Polling cadence and budget for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// Polls one job API.
#[derive(Clone)]
pub struct JobPoller {
    api: Arc<dyn JobApi>,
    events: Arc<dyn EventPublisher>,
}

impl std::fmt::Debug for JobPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPoller").finish_non_exhaustive()
    }
}

impl JobPoller {
    pub fn new(api: Arc<dyn JobApi>, events: Arc<dyn EventPublisher>) -> Self {
        Self { api, events }
    }

    /// Submit a job.
    #[instrument(skip(self, request), fields(kind = %request.kind()))]
    pub async fn start(&self, request: &JobRequest) -> Result<JobHandle> {
        let handle = self.api.start(request).await?;
        info!("Submitted {} job {}", handle.kind, handle.job_id);
        self.events
            .emit(PipelineEvent::job_submitted(handle.kind, &handle.job_id))
            .await;
        Ok(handle)
    }

    /// Fetch one status observation.
    pub async fn poll(&self, handle: &JobHandle) -> Result<JobStatus> {
        let status = self.api.status(handle).await?;
        debug!("{} job {} is {}", handle.kind, handle.job_id, status.state);
        self.events
            .emit(PipelineEvent::job_observed(
                handle.kind,
                &handle.job_id,
                status.state,
            ))
            .await;
        Ok(status)
    }

    /// Explicitly cancel a job.
    #[instrument(skip(self, handle), fields(job_id = %handle.job_id))]
    pub async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        self.events
            .emit(PipelineEvent::job_cancel_requested(handle.kind, &handle.job_id))
            .await;
        self.api.cancel(handle).await
    }

    /// Poll until the job reaches a terminal state or `timeout` elapses.
    pub async fn wait_until_terminal(
        &self,
        handle: &JobHandle,
        interval: Duration,
        timeout: Duration,
    ) -> Result<JobStatus> {
        self.wait_until_terminal_or_cancel(
            handle,
            PollPolicy::new(interval, timeout),
            &CancellationToken::new(),
        )
        .await
    }

    /// Like `wait_until_terminal`, but when `cancel` fires the job is
    /// explicitly canceled once and polling continues until the job
    /// reports a terminal state (or the deadline passes).
    #[instrument(skip(self, handle, cancel), fields(kind = %handle.kind, job_id = %handle.job_id))]
    pub async fn wait_until_terminal_or_cancel(
        &self,
        handle: &JobHandle,
        policy: PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<JobStatus> {
        let started = Instant::now();
        let deadline = started + policy.timeout;
        let mut cancel_requested = false;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.poll(handle).await {
                Ok(status) if status.state.is_terminal() => {
                    info!(
                        "{} job {} reached {} after {} polls",
                        handle.kind, handle.job_id, status.state, polls
                    );
                    return match status.state {
                        JobState::Done => Ok(status),
                        _ => Err(Error::JobFailed { status }),
                    };
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!("Transient error polling job {}: {}", handle.job_id, e);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "{} job {} still not terminal after {:?}; leaving it running",
                    handle.kind, handle.job_id, policy.timeout
                );
                return Err(Error::Timeout {
                    job_id: handle.job_id.clone(),
                    waited: format!("{:?}", policy.timeout),
                });
            }

            let nap = policy.interval.min(deadline - now);
            if cancel_requested {
                sleep(nap).await;
                continue;
            }
            tokio::select! {
                _ = sleep(nap) => {}
                _ = cancel.cancelled() => {
                    cancel_requested = true;
                    warn!("Abort requested; canceling {} job {}", handle.kind, handle.job_id);
                    if let Err(e) = self.cancel(handle).await {
                        warn!("Cancel of job {} failed: {}", handle.job_id, e);
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
