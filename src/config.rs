//! Workflow Plan
//!
//! The YAML document describing one validation run: which copy to recover,
//! where to mount it, which job APIs to drive and who gets the report.
//!
//! ```yaml
//! storage:
//!   controller: { kind: ssh, name: svc01, address: 10.0.0.10, user: superuser }
//!   consistency_group: cg_123
//!   present_to: aix_server
//! source:
//!   target: { kind: ssh, name: aix01, address: 10.0.0.20, user: root }
//!   volume_group: datavg
//!   disk: /dev/hdisk4
//! scan_host:
//!   target: { kind: ssh, name: suse01, address: 10.0.0.30, user: scan }
//!   privileged: true
//! adapters: [10.0.1.1, 10.0.1.2]
//! mounts:
//!   - { export_path: /data1, mount_point: /mnt/data1 }
//! scan:
//!   api: { base_url: "https://scanner/api", token_env: SCAN_TOKEN }
//!   policy: DailyIntegrity
//! backup:
//!   api: { base_url: "https://backup/api", start_path: /backup, token_env: BACKUP_TOKEN }
//! report:
//!   recipient: ops@example.com
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::HttpJobApiConfig;
use crate::domain::model::{Filesystem, HostPlatform, MountSpec, Target};
use crate::domain::ports::ScanExtras;
use crate::error::{Error, Result};
use crate::jobs::PollPolicy;

// =============================================================================
// Sections
// =============================================================================

/// Storage controller holding the safeguarded copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Where the controller CLI runs
    pub controller: Target,
    pub consistency_group: String,
    /// Prefix of the recovered copy's name
    #[serde(default = "default_copy_prefix")]
    pub copy_prefix: String,
    /// Controller host object the copy is mapped to
    pub present_to: String,
}

/// Host that activates the volume group and exports its filesystems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHostConfig {
    pub target: Target,
    #[serde(default)]
    pub platform: HostPlatform,
    #[serde(default)]
    pub privileged: bool,
    pub volume_group: String,
    /// Disk the presented volume appears as
    pub disk: String,
    /// Filesystems to mount; discovered from the volume group when empty
    #[serde(default)]
    pub filesystems: Vec<Filesystem>,
    #[serde(default = "default_nfs_version")]
    pub nfs_version: u8,
}

/// Host that mounts the exports for scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanHostConfig {
    pub target: Target,
    #[serde(default = "default_scan_platform")]
    pub platform: HostPlatform,
    #[serde(default)]
    pub privileged: bool,
}

/// One export to mount on the scan host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub export_path: String,
    pub mount_point: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub api: HttpJobApiConfig,
    pub policy: String,
    /// Path handed to the scan engine; defaults to the first mount point
    #[serde(default)]
    pub nfs_export: Option<String>,
    #[serde(default)]
    pub extras: ScanExtras,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub api: HttpJobApiConfig,
    /// Paths to back up; defaults to every mount point
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: u64,
    pub scan_timeout_secs: u64,
    pub backup_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            scan_timeout_secs: 12 * 60 * 60,
            backup_timeout_secs: 12 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// No recipient: the report is only logged
    pub recipient: Option<String>,
    pub subject: String,
    pub sender: String,
    /// Empty: no relay, the report goes to the log
    pub sendmail: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            recipient: None,
            subject: "Daily Integrity Report".to_string(),
            sender: "safecopy@localhost".to_string(),
            sendmail: "/usr/sbin/sendmail".to_string(),
        }
    }
}

fn default_copy_prefix() -> String {
    "safecopy".to_string()
}

fn default_nfs_version() -> u8 {
    4
}

fn default_scan_platform() -> HostPlatform {
    HostPlatform::Linux
}

fn default_command_timeout() -> u64 {
    600
}

// =============================================================================
// Pipeline Config
// =============================================================================

/// The full workflow plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub source: SourceHostConfig,
    pub scan_host: ScanHostConfig,
    /// NFS server adapter addresses, used round-robin
    pub adapters: Vec<String>,
    pub mounts: Vec<MountConfig>,
    pub scan: ScanConfig,
    pub backup: BackupConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl PipelineConfig {
    /// Read and validate a plan file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read plan {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&text)?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject plans that cannot run. Called before any side effect.
    pub fn validate(&self) -> Result<()> {
        if self.adapters.is_empty() {
            return Err(Error::config("adapter list must not be empty"));
        }
        if self.mounts.is_empty() {
            return Err(Error::config("mount list must not be empty"));
        }
        for field in [
            ("storage.consistency_group", &self.storage.consistency_group),
            ("storage.present_to", &self.storage.present_to),
            ("storage.copy_prefix", &self.storage.copy_prefix),
            ("source.volume_group", &self.source.volume_group),
            ("scan.policy", &self.scan.policy),
            ("scan.api.base_url", &self.scan.api.base_url),
            ("backup.api.base_url", &self.backup.api.base_url),
        ] {
            require_non_empty(field.0, field.1)?;
        }

        require_absolute("source.disk", &self.source.disk)?;
        for fs in &self.source.filesystems {
            require_absolute("source.filesystems.mount_point", &fs.mount_point)?;
            if let Some(device) = &fs.device {
                require_absolute("source.filesystems.device", device)?;
            }
        }
        for (i, mount) in self.mounts.iter().enumerate() {
            require_absolute("mounts.export_path", &mount.export_path)?;
            require_absolute("mounts.mount_point", &mount.mount_point)?;
            if self.mounts[..i]
                .iter()
                .any(|m| m.mount_point == mount.mount_point)
            {
                return Err(Error::config(format!(
                    "mount point {} listed twice",
                    mount.mount_point
                )));
            }
        }
        if let Some(export) = &self.scan.nfs_export {
            require_absolute("scan.nfs_export", export)?;
        }
        for path in &self.backup.paths {
            require_absolute("backup.paths", path)?;
        }
        if self.backup_paths().is_empty() {
            return Err(Error::config("no backup paths"));
        }

        if self.polling.interval_secs == 0 {
            return Err(Error::config("polling interval must be positive"));
        }
        for (name, timeout) in [
            ("scan", self.polling.scan_timeout_secs),
            ("backup", self.polling.backup_timeout_secs),
        ] {
            if timeout < self.polling.interval_secs {
                return Err(Error::config(format!(
                    "{} timeout ({}s) is shorter than the polling interval ({}s)",
                    name, timeout, self.polling.interval_secs
                )));
            }
        }
        if !matches!(self.source.nfs_version, 3 | 4) {
            return Err(Error::config(format!(
                "unsupported NFS version {}",
                self.source.nfs_version
            )));
        }
        if self.command_timeout_secs == 0 {
            return Err(Error::config("command timeout must be positive"));
        }
        Ok(())
    }

    /// Mount specs in submission order, adapters not yet assigned.
    pub fn mount_specs(&self) -> Vec<MountSpec> {
        let source = self.source.target.name();
        self.mounts
            .iter()
            .map(|m| MountSpec::new(source, &m.export_path, &m.mount_point))
            .collect()
    }

    /// Scan export, defaulting to the first mount point.
    pub fn scan_export(&self) -> String {
        self.scan.nfs_export.clone().unwrap_or_else(|| {
            self.mounts
                .first()
                .map(|m| m.mount_point.clone())
                .unwrap_or_default()
        })
    }

    /// Backup paths, defaulting to every mount point.
    pub fn backup_paths(&self) -> Vec<String> {
        if self.backup.paths.is_empty() {
            self.mounts.iter().map(|m| m.mount_point.clone()).collect()
        } else {
            self.backup.paths.clone()
        }
    }

    pub fn scan_poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.polling.interval_secs),
            Duration::from_secs(self.polling.scan_timeout_secs),
        )
    }

    pub fn backup_poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.polling.interval_secs),
            Duration::from_secs(self.polling.backup_timeout_secs),
        )
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::config(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn require_absolute(field: &str, value: &str) -> Result<()> {
    if !value.starts_with('/') {
        return Err(Error::config(format!(
            "{} must be an absolute path: {:?}",
            field, value
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
