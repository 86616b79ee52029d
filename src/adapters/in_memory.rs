//! In-Memory Adapters
//!
//! Scriptable stand-ins for every external collaborator, used by unit and
//! integration tests to drive stages and the orchestrator without hosts,
//! a storage controller, or job APIs.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::command::HostCommand;
use crate::domain::model::{JobHandle, JobKind, JobState, JobStatus, RecoveryPoint, Target};
use crate::domain::ports::{
    CommandOutput, CommandRunner, JobApi, JobRequest, Mailer, StorageController,
};
use crate::error::{Error, Result};

pub use super::event_publisher::InMemoryEventCollector;

// =============================================================================
// Command Runner
// =============================================================================

/// Records every command and answers from canned responses.
///
/// Commands whose rendered line contains a registered failure pattern fail
/// with `Error::Command`; everything else succeeds with the response
/// registered for its program, or empty output.
#[derive(Debug, Default)]
pub struct RecordingCommandRunner {
    executed: Mutex<Vec<(Target, HostCommand)>>,
    responses: Mutex<HashMap<String, CommandOutput>>,
    failures: Mutex<Vec<(String, String)>>,
}

impl RecordingCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every invocation of `program` with `output`.
    pub fn respond(&self, program: &str, output: CommandOutput) {
        self.responses.lock().insert(program.to_string(), output);
    }

    /// Fail every command whose line contains `pattern`.
    pub fn fail_when(&self, pattern: &str, stderr: &str) {
        self.failures
            .lock()
            .push((pattern.to_string(), stderr.to_string()));
    }

    /// Stop failing commands matching `pattern`.
    pub fn clear_failure(&self, pattern: &str) {
        self.failures.lock().retain(|(p, _)| p != pattern);
    }

    /// Rendered command lines in execution order (including failed ones).
    pub fn command_lines(&self) -> Vec<String> {
        self.executed
            .lock()
            .iter()
            .map(|(_, command)| command.to_string())
            .collect()
    }

    /// Commands executed on a specific target.
    pub fn lines_on(&self, target: &Target) -> Vec<String> {
        self.executed
            .lock()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, command)| command.to_string())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.executed.lock().len()
    }
}

#[async_trait]
impl CommandRunner for RecordingCommandRunner {
    async fn execute(&self, target: &Target, command: &HostCommand) -> Result<CommandOutput> {
        let line = command.to_string();
        self.executed.lock().push((target.clone(), command.clone()));

        let failure = self
            .failures
            .lock()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, stderr)| stderr.clone());
        if let Some(stderr) = failure {
            return Err(Error::Command {
                target: target.to_string(),
                command: line,
                stderr,
                exit_status: Some(1),
            });
        }

        Ok(self
            .responses
            .lock()
            .get(command.program())
            .cloned()
            .unwrap_or_default())
    }
}

// =============================================================================
// Storage Controller
// =============================================================================

/// Storage controller holding a fixed list of recovery points.
#[derive(Debug)]
pub struct InMemoryStorageController {
    points: Vec<RecoveryPoint>,
    volume_id: String,
    fail_recover: Mutex<bool>,
    fail_present: Mutex<bool>,
    fail_unpresent: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

impl InMemoryStorageController {
    pub fn new(points: Vec<RecoveryPoint>, volume_id: impl Into<String>) -> Self {
        Self {
            points,
            volume_id: volume_id.into(),
            fail_recover: Mutex::new(false),
            fail_present: Mutex::new(false),
            fail_unpresent: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_recover(&self) {
        *self.fail_recover.lock() = true;
    }

    pub fn fail_present(&self) {
        *self.fail_present.lock() = true;
    }

    pub fn fail_unpresent(&self) {
        *self.fail_unpresent.lock() = true;
    }

    /// Calls in order, e.g. `recover 12 safecopy_x`, `present 57 aix01`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn controller_error(&self, command: String) -> Error {
        Error::Command {
            target: "controller".to_string(),
            command,
            stderr: "CMMVC5700E The parameter list is not valid".to_string(),
            exit_status: Some(1),
        }
    }
}

#[async_trait]
impl StorageController for InMemoryStorageController {
    async fn list_recovery_points(&self, consistency_group: &str) -> Result<Vec<RecoveryPoint>> {
        self.calls.lock().push(format!("list {}", consistency_group));
        Ok(self
            .points
            .iter()
            .filter(|p| p.consistency_group_id == consistency_group)
            .cloned()
            .collect())
    }

    async fn recover(&self, point: &RecoveryPoint, target_name: &str) -> Result<String> {
        let call = format!("recover {} {}", point.id, target_name);
        self.calls.lock().push(call.clone());
        if *self.fail_recover.lock() {
            return Err(self.controller_error(call));
        }
        Ok(self.volume_id.clone())
    }

    async fn present(&self, volume_id: &str, host: &str) -> Result<()> {
        let call = format!("present {} {}", volume_id, host);
        self.calls.lock().push(call.clone());
        if *self.fail_present.lock() {
            return Err(self.controller_error(call));
        }
        Ok(())
    }

    async fn unpresent(&self, volume_id: &str, host: &str) -> Result<()> {
        let call = format!("unpresent {} {}", volume_id, host);
        self.calls.lock().push(call.clone());
        if *self.fail_unpresent.lock() {
            return Err(self.controller_error(call));
        }
        Ok(())
    }
}

// =============================================================================
// Job API
// =============================================================================

/// One scripted answer to a status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    State(JobState),
    TransportError,
}

impl From<JobState> for PollStep {
    fn from(state: JobState) -> Self {
        PollStep::State(state)
    }
}

#[derive(Debug, Default)]
struct JobApiState {
    scripts: HashMap<JobKind, Vec<PollStep>>,
    queues: HashMap<String, VecDeque<PollStep>>,
    last: HashMap<String, JobState>,
    fail_starts: HashMap<JobKind, Vec<usize>>,
    started: Vec<(JobKind, JobRequest)>,
    start_attempts: HashMap<JobKind, usize>,
    polls: HashMap<String, usize>,
    canceled: Vec<String>,
}

/// Job API whose jobs follow a scripted sequence of states.
///
/// Every job of a kind gets its own copy of the kind's script; once the
/// script is exhausted the last state repeats. A canceled job reports
/// `Canceled` from then on.
#[derive(Debug, Default)]
pub struct ScriptedJobApi {
    state: Mutex<JobApiState>,
}

impl ScriptedJobApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll script for jobs of `kind`.
    pub fn script<S: Into<PollStep>>(&self, kind: JobKind, steps: Vec<S>) {
        self.state
            .lock()
            .scripts
            .insert(kind, steps.into_iter().map(Into::into).collect());
    }

    /// Make the `nth` (1-based) start of `kind` fail.
    pub fn fail_start(&self, kind: JobKind, nth: usize) {
        self.state
            .lock()
            .fail_starts
            .entry(kind)
            .or_default()
            .push(nth);
    }

    /// Requests that were accepted, in order.
    pub fn started(&self) -> Vec<(JobKind, JobRequest)> {
        self.state.lock().started.clone()
    }

    pub fn poll_count(&self, job_id: &str) -> usize {
        self.state.lock().polls.get(job_id).copied().unwrap_or(0)
    }

    pub fn total_polls(&self, kind: JobKind) -> usize {
        let prefix = job_prefix(kind);
        self.state
            .lock()
            .polls
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(_, n)| n)
            .sum()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.state.lock().canceled.clone()
    }
}

fn job_prefix(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Scan => "scan-",
        JobKind::Backup => "backup-",
    }
}

#[async_trait]
impl JobApi for ScriptedJobApi {
    async fn start(&self, request: &JobRequest) -> Result<JobHandle> {
        let kind = request.kind();
        let mut state = self.state.lock();

        let attempt = {
            let counter = state.start_attempts.entry(kind).or_insert(0);
            *counter += 1;
            *counter
        };
        if state
            .fail_starts
            .get(&kind)
            .map(|n| n.contains(&attempt))
            .unwrap_or(false)
        {
            return Err(Error::JobStart {
                kind,
                reason: format!("HTTP 500 on start attempt {}", attempt),
            });
        }

        let job_id = format!("{}{}", job_prefix(kind), attempt);
        let script: VecDeque<PollStep> = state
            .scripts
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| vec![PollStep::State(JobState::Done)])
            .into();
        state.queues.insert(job_id.clone(), script);
        state.started.push((kind, request.clone()));

        Ok(JobHandle::new(job_id, kind))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let mut state = self.state.lock();
        *state.polls.entry(handle.job_id.clone()).or_insert(0) += 1;

        if state.canceled.contains(&handle.job_id) {
            return Ok(JobStatus::new(handle, JobState::Canceled, "canceled"));
        }

        let step = match state.queues.get_mut(&handle.job_id) {
            Some(queue) => queue.pop_front(),
            None => return Err(Error::Protocol(format!("unknown job {}", handle.job_id))),
        };
        let job_state = match step {
            Some(PollStep::State(s)) => s,
            Some(PollStep::TransportError) => {
                return Err(Error::Transport("connection reset by peer".to_string()))
            }
            None => state
                .last
                .get(&handle.job_id)
                .copied()
                .unwrap_or(JobState::Running),
        };
        state.last.insert(handle.job_id.clone(), job_state);

        Ok(JobStatus::new(
            handle,
            job_state,
            format!("{{\"state\":\"{}\"}}", job_state),
        ))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        self.state.lock().canceled.push(handle.job_id.clone());
        Ok(())
    }
}

// =============================================================================
// Mailer
// =============================================================================

/// A message captured by `InMemoryMailer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub subject: String,
    pub body: String,
    pub recipient: String,
}

/// Mailer that keeps messages in memory.
#[derive(Debug, Default)]
pub struct InMemoryMailer {
    sent: Mutex<Vec<SentMail>>,
    fail: Mutex<bool>,
}

impl InMemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send fail.
    pub fn fail(&self) {
        *self.fail.lock() = true;
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Mailer for InMemoryMailer {
    async fn send(&self, subject: &str, body: &str, recipient: &str) -> Result<()> {
        if *self.fail.lock() {
            return Err(Error::Mail("relay refused connection".to_string()));
        }
        self.sent.lock().push(SentMail {
            subject: subject.to_string(),
            body: body.to_string(),
            recipient: recipient.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_recording_runner_failure_rules() {
        let runner = RecordingCommandRunner::new();
        runner.fail_when("varyonvg", "0516-013");

        let ok = HostCommand::unmount("/data").unwrap();
        assert!(runner.execute(&Target::Local, &ok).await.is_ok());

        let bad = HostCommand::activate_volume_group(Default::default(), "datavg").unwrap();
        assert_matches!(
            runner.execute(&Target::Local, &bad).await,
            Err(Error::Command { .. })
        );

        runner.clear_failure("varyonvg");
        assert!(runner.execute(&Target::Local, &bad).await.is_ok());
        assert_eq!(runner.count(), 3);
    }

    #[tokio::test]
    async fn test_scripted_job_api_repeats_last_state() {
        let api = ScriptedJobApi::new();
        api.script(JobKind::Scan, vec![JobState::Running, JobState::Done]);

        let handle = api
            .start(&JobRequest::Backup {
                path: "/mnt/a".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(handle.job_id, "backup-1");
        // No backup script: default is immediately Done
        assert_eq!(api.status(&handle).await.unwrap().state, JobState::Done);
        assert_eq!(api.status(&handle).await.unwrap().state, JobState::Done);
        assert_eq!(api.poll_count("backup-1"), 2);
    }

    #[tokio::test]
    async fn test_scripted_job_api_cancel() {
        let api = ScriptedJobApi::new();
        api.script(JobKind::Backup, vec![JobState::Running]);
        let handle = api
            .start(&JobRequest::Backup {
                path: "/mnt/a".to_string(),
            })
            .await
            .unwrap();

        api.cancel(&handle).await.unwrap();
        assert_eq!(api.status(&handle).await.unwrap().state, JobState::Canceled);
        assert_eq!(api.canceled(), vec!["backup-1".to_string()]);
    }
}
