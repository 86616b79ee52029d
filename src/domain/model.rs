//! Domain Value Objects
//!
//! Plain data records that flow between stages: recovery points, presented
//! volumes, volume groups, mounts, and job handles/statuses.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Execution Targets
// =============================================================================

/// Connection details for a host reached over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHost {
    /// Logical name used in logs and reports
    pub name: String,
    /// Address or DNS name to connect to
    pub address: String,
    /// Login user
    pub user: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key to authenticate with (agent/default keys otherwise)
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Where a command runs: the local shell or a specific remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    Local,
    Ssh(RemoteHost),
}

impl Target {
    /// Short name for logs.
    pub fn name(&self) -> &str {
        match self {
            Target::Local => "local",
            Target::Ssh(host) => &host.name,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => write!(f, "local"),
            Target::Ssh(host) => write!(f, "{}@{}", host.user, host.name),
        }
    }
}

/// Operating system flavour of a host, selecting the volume-group and
/// NFS-export command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostPlatform {
    #[default]
    Aix,
    Linux,
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPlatform::Aix => write!(f, "aix"),
            HostPlatform::Linux => write!(f, "linux"),
        }
    }
}

// =============================================================================
// Recovery
// =============================================================================

/// An immutable point-in-time copy within a consistency group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryPoint {
    pub id: String,
    pub consistency_group_id: String,
    pub created_at: DateTime<Utc>,
}

impl RecoveryPoint {
    pub fn new(
        id: impl Into<String>,
        consistency_group_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            consistency_group_id: consistency_group_id.into(),
            created_at,
        }
    }
}

/// Parse a controller timestamp.
///
/// Accepts RFC 3339, naive ISO-8601 (`2024-09-30T01:02:03` or with a space
/// separator, taken as UTC) and the compact `YYMMDDhhmmss` form.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if raw.len() == 12 && raw.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%y%m%d%H%M%S") {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// A recovered copy mapped to a host as a block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresentedVolume {
    pub recovery_point_id: String,
    pub target_host: String,
    pub volume_id: String,
}

// =============================================================================
// Volume Groups & Filesystems
// =============================================================================

/// A filesystem exposed by an activated volume group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filesystem {
    /// Block device to mount; `None` when the host resolves it from its
    /// own filesystem table (AIX `/etc/filesystems`).
    #[serde(default)]
    pub device: Option<String>,
    pub mount_point: String,
}

impl Filesystem {
    pub fn at(mount_point: impl Into<String>) -> Self {
        Self {
            device: None,
            mount_point: mount_point.into(),
        }
    }
}

/// Ledger record of a volume group touched by activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeGroupState {
    pub name: String,
    pub host: Target,
    pub platform: HostPlatform,
    pub privileged: bool,
    pub imported: bool,
    pub active: bool,
}

// =============================================================================
// Mounts
// =============================================================================

/// One network filesystem to mount on the scan host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host exporting the filesystem (logical name)
    pub source_host: String,
    /// Exported path on the source host
    pub export_path: String,
    /// Where to mount it on the scan host
    pub mount_point: String,
    /// Adapter chosen by round-robin at mount time
    #[serde(default)]
    pub assigned_adapter: Option<String>,
}

impl MountSpec {
    pub fn new(
        source_host: impl Into<String>,
        export_path: impl Into<String>,
        mount_point: impl Into<String>,
    ) -> Self {
        Self {
            source_host: source_host.into(),
            export_path: export_path.into(),
            mount_point: mount_point.into(),
            assigned_adapter: None,
        }
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}",
            self.source_host, self.export_path, self.mount_point
        )?;
        if let Some(adapter) = &self.assigned_adapter {
            write!(f, " via {}", adapter)?;
        }
        Ok(())
    }
}

/// What kind of mount a ledger entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MountKind {
    /// Volume-group filesystem mounted on the source host
    Host,
    /// NFS export mounted on the scan host
    Network,
}

/// A mount that succeeded and must be undone at teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountedFilesystem {
    pub kind: MountKind,
    pub host: Target,
    /// Command flavour of the host holding the mount
    pub platform: HostPlatform,
    pub privileged: bool,
    pub mount_point: String,
    /// Network mounts keep their spec for the report
    pub spec: Option<MountSpec>,
}

/// An NFS export published on the source host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedShare {
    pub host: Target,
    pub platform: HostPlatform,
    pub privileged: bool,
    pub path: String,
}

// =============================================================================
// External Jobs
// =============================================================================

/// Which external job system a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Scan,
    Backup,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Scan => write!(f, "Scan"),
            JobKind::Backup => write!(f, "Backup"),
        }
    }
}

/// Opaque correlation key returned by a job API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub job_id: String,
    pub kind: JobKind,
    pub submitted_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn new(job_id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            submitted_at: Utc::now(),
        }
    }
}

/// Job lifecycle states. Done, Failed and Canceled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Canceled)
    }

    /// Map the state names used by job APIs onto the lifecycle.
    pub fn from_api(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "submitted" => Some(JobState::Pending),
            "running" | "inprogress" | "in_progress" | "active" => Some(JobState::Running),
            "done" | "completed" | "success" | "succeeded" => Some(JobState::Done),
            "failed" | "error" => Some(JobState::Failed),
            "canceled" | "cancelled" => Some(JobState::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "Pending"),
            JobState::Running => write!(f, "Running"),
            JobState::Done => write!(f, "Done"),
            JobState::Failed => write!(f, "Failed"),
            JobState::Canceled => write!(f, "Canceled"),
        }
    }
}

/// One observation of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub kind: JobKind,
    pub state: JobState,
    /// Raw API payload, kept for the report
    pub raw_detail: String,
}

impl JobStatus {
    pub fn new(handle: &JobHandle, state: JobState, raw_detail: impl Into<String>) -> Self {
        Self {
            job_id: handle.job_id.clone(),
            kind: handle.kind,
            state,
            raw_detail: raw_detail.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
