//! Typed Host Commands
//!
//! Every command the pipeline runs on a host or on the storage controller is
//! built here from validated arguments. Runners receive an argv, never a
//! shell string, so nothing is interpolated into a command line.

use std::fmt;

use crate::domain::model::HostPlatform;
use crate::error::{Error, Result};

/// Mount options for scan mounts.
///
/// Short attribute-cache timeouts so the scanner sees fresh metadata, no
/// client-side locking, asynchronous writeback. Not user-configurable.
pub const SCAN_MOUNT_OPTIONS: &str =
    "rw,async,proto=tcp,noatime,nodiratime,nolock,acregmin=1,acregmax=3,acdirmin=1,acdirmax=3";

/// A validated command: program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    program: String,
    args: Vec<String>,
    privileged: bool,
}

impl HostCommand {
    fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
            privileged: false,
        }
    }

    /// Run through `sudo` on hosts where the login user is unprivileged.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Full argv including the `sudo` prefix when privileged.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if self.privileged {
            argv.push("sudo".to_string());
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// argv with each element single-quoted for a remote POSIX shell.
    pub fn shell_escaped(&self) -> String {
        self.argv()
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    // =========================================================================
    // Volume Groups
    // =========================================================================

    /// Rescan for newly presented devices.
    pub fn rescan_devices(platform: HostPlatform) -> Self {
        match platform {
            HostPlatform::Aix => Self::new("cfgmgr", vec![]),
            HostPlatform::Linux => Self::new("rescan-scsi-bus.sh", vec!["-a".to_string()]),
        }
    }

    pub fn import_volume_group(platform: HostPlatform, name: &str, disk: &str) -> Result<Self> {
        let name = identifier("volume group", name)?;
        let disk = absolute_path("disk", disk)?;
        Ok(match platform {
            HostPlatform::Aix => Self::new("importvg", vec!["-y".into(), name, disk]),
            HostPlatform::Linux => Self::new("vgimport", vec![name]),
        })
    }

    pub fn activate_volume_group(platform: HostPlatform, name: &str) -> Result<Self> {
        let name = identifier("volume group", name)?;
        Ok(match platform {
            HostPlatform::Aix => Self::new("varyonvg", vec![name]),
            HostPlatform::Linux => Self::new("vgchange", vec!["-ay".into(), name]),
        })
    }

    pub fn deactivate_volume_group(platform: HostPlatform, name: &str) -> Result<Self> {
        let name = identifier("volume group", name)?;
        Ok(match platform {
            HostPlatform::Aix => Self::new("varyoffvg", vec![name]),
            HostPlatform::Linux => Self::new("vgchange", vec!["-an".into(), name]),
        })
    }

    pub fn export_volume_group(platform: HostPlatform, name: &str) -> Result<Self> {
        let name = identifier("volume group", name)?;
        Ok(match platform {
            HostPlatform::Aix => Self::new("exportvg", vec![name]),
            HostPlatform::Linux => Self::new("vgexport", vec![name]),
        })
    }

    /// List what the volume group exposes: mount points on AIX, logical
    /// volume names on Linux.
    pub fn list_volume_group_filesystems(platform: HostPlatform, name: &str) -> Result<Self> {
        let name = identifier("volume group", name)?;
        Ok(match platform {
            HostPlatform::Aix => Self::new("lsvgfs", vec![name]),
            HostPlatform::Linux => Self::new(
                "lvs",
                vec![
                    "--noheadings".into(),
                    "-o".into(),
                    "lv_name".into(),
                    name,
                ],
            ),
        })
    }

    // =========================================================================
    // Mounts
    // =========================================================================

    /// Mount a local filesystem. Without a device the host resolves it from
    /// its filesystem table.
    pub fn mount(device: Option<&str>, mount_point: &str) -> Result<Self> {
        let mount_point = absolute_path("mount point", mount_point)?;
        let mut args = Vec::new();
        if let Some(device) = device {
            args.push(absolute_path("device", device)?);
        }
        args.push(mount_point);
        Ok(Self::new("mount", args))
    }

    /// Mount an NFS export with the fixed scan options.
    pub fn mount_nfs(
        server: &str,
        export_path: &str,
        mount_point: &str,
        nfs_version: u8,
    ) -> Result<Self> {
        let server = host_address(server)?;
        let export_path = absolute_path("export path", export_path)?;
        let mount_point = absolute_path("mount point", mount_point)?;
        Ok(Self::new(
            "mount",
            vec![
                "-t".into(),
                "nfs".into(),
                "-o".into(),
                format!("nfsvers={},{}", nfs_version, SCAN_MOUNT_OPTIONS),
                format!("{}:{}", server, export_path),
                mount_point,
            ],
        ))
    }

    pub fn unmount(mount_point: &str) -> Result<Self> {
        let mount_point = absolute_path("mount point", mount_point)?;
        Ok(Self::new("umount", vec![mount_point]))
    }

    /// Create a mount point and any missing parents.
    pub fn make_directory(path: &str) -> Result<Self> {
        let path = absolute_path("directory", path)?;
        Ok(Self::new("mkdir", vec!["-p".into(), path]))
    }

    /// Kill processes holding files open under a mount.
    pub fn force_close(path: &str) -> Result<Self> {
        let path = absolute_path("path", path)?;
        Ok(Self::new("fuser", vec!["-km".into(), path]))
    }

    // =========================================================================
    // NFS Exports
    // =========================================================================

    pub fn export_share(platform: HostPlatform, path: &str, nfs_version: u8) -> Result<Self> {
        let path = absolute_path("export path", path)?;
        Ok(match platform {
            HostPlatform::Aix => Self::new(
                "mknfsexp",
                vec![
                    "-d".into(),
                    path,
                    "-nfsvers".into(),
                    nfs_version.to_string(),
                ],
            ),
            HostPlatform::Linux => Self::new(
                "exportfs",
                vec!["-o".into(), "ro,no_root_squash".into(), format!("*:{}", path)],
            ),
        })
    }

    pub fn unexport_share(platform: HostPlatform, path: &str) -> Result<Self> {
        let path = absolute_path("export path", path)?;
        Ok(match platform {
            HostPlatform::Aix => Self::new("rmnfsexp", vec!["-d".into(), path]),
            HostPlatform::Linux => Self::new("exportfs", vec!["-u".into(), format!("*:{}", path)]),
        })
    }

    // =========================================================================
    // Storage Controller
    // =========================================================================

    pub fn list_recovery_points(consistency_group: &str) -> Result<Self> {
        let group = identifier("consistency group", consistency_group)?;
        Ok(Self::new(
            "lsrecovrp",
            vec![
                "-delim".into(),
                ",".into(),
                "-filtervalue".into(),
                format!("consistencygroup={}", group),
            ],
        ))
    }

    pub fn recover_copy(recovery_point_id: &str, target_name: &str) -> Result<Self> {
        let point = identifier("recovery point", recovery_point_id)?;
        let name = identifier("target name", target_name)?;
        Ok(Self::new(
            "mkrecovercopy",
            vec!["-recovrp".into(), point, "-targetname".into(), name],
        ))
    }

    pub fn find_volume(name: &str) -> Result<Self> {
        let name = identifier("volume name", name)?;
        Ok(Self::new(
            "lsvdisk",
            vec![
                "-delim".into(),
                ",".into(),
                "-filtervalue".into(),
                format!("name={}", name),
            ],
        ))
    }

    pub fn map_volume_to_host(volume_id: &str, host: &str) -> Result<Self> {
        let volume_id = identifier("volume id", volume_id)?;
        let host = identifier("host", host)?;
        Ok(Self::new(
            "svctask",
            vec![
                "mkvdiskhostmap".into(),
                "-force".into(),
                "-host".into(),
                host,
                volume_id,
            ],
        ))
    }

    pub fn unmap_volume_from_host(volume_id: &str, host: &str) -> Result<Self> {
        let volume_id = identifier("volume id", volume_id)?;
        let host = identifier("host", host)?;
        Ok(Self::new(
            "svctask",
            vec!["rmvdiskhostmap".into(), "-host".into(), host, volume_id],
        ))
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

// =============================================================================
// Argument Validation
// =============================================================================

fn reject_control(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::config(format!("{} must not be empty", kind)));
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(Error::config(format!(
            "{} contains control characters: {:?}",
            kind, value
        )));
    }
    Ok(())
}

/// Names: volume groups, hosts, recovery point ids.
fn identifier(kind: &str, value: &str) -> Result<String> {
    reject_control(kind, value)?;
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid || value.starts_with('-') {
        return Err(Error::config(format!("invalid {}: {:?}", kind, value)));
    }
    Ok(value.to_string())
}

fn absolute_path(kind: &str, value: &str) -> Result<String> {
    reject_control(kind, value)?;
    if !value.starts_with('/') {
        return Err(Error::config(format!(
            "{} must be an absolute path: {:?}",
            kind, value
        )));
    }
    if value.split('/').any(|part| part == "..") {
        return Err(Error::config(format!(
            "{} must not contain '..': {:?}",
            kind, value
        )));
    }
    Ok(value.to_string())
}

/// Host names, IPv4 and IPv6 addresses.
fn host_address(value: &str) -> Result<String> {
    reject_control("address", value)?;
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
    if !valid || value.starts_with('-') {
        return Err(Error::config(format!("invalid address: {:?}", value)));
    }
    Ok(value.to_string())
}

/// Quote one argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_platform_command_sets() {
        let aix = HostCommand::import_volume_group(HostPlatform::Aix, "datavg", "/dev/hdisk4")
            .unwrap();
        assert_eq!(aix.argv(), vec!["importvg", "-y", "datavg", "/dev/hdisk4"]);

        let linux = HostCommand::activate_volume_group(HostPlatform::Linux, "datavg").unwrap();
        assert_eq!(linux.argv(), vec!["vgchange", "-ay", "datavg"]);

        let off = HostCommand::deactivate_volume_group(HostPlatform::Aix, "datavg").unwrap();
        assert_eq!(off.to_string(), "varyoffvg datavg");
    }

    #[test]
    fn test_nfs_mount_uses_fixed_options() {
        let cmd = HostCommand::mount_nfs("10.0.0.1", "/data", "/mnt/data1", 4)
            .unwrap()
            .privileged();
        let argv = cmd.argv();
        assert_eq!(argv[0], "sudo");
        assert_eq!(argv[1], "mount");
        assert!(argv.contains(&"10.0.0.1:/data".to_string()));
        let options = &argv[5];
        assert!(options.starts_with("nfsvers=4,"));
        assert!(options.contains("nolock"));
        assert!(options.contains("async"));
        assert!(options.contains("acregmax=3"));
    }

    #[test]
    fn test_rejects_unsafe_arguments() {
        assert_matches!(
            HostCommand::activate_volume_group(HostPlatform::Aix, "datavg; rm -rf /"),
            Err(Error::Config(_))
        );
        assert_matches!(HostCommand::unmount("mnt/data"), Err(Error::Config(_)));
        assert_matches!(HostCommand::unmount("/mnt/../etc"), Err(Error::Config(_)));
        assert_matches!(HostCommand::unmount(""), Err(Error::Config(_)));
        assert_matches!(HostCommand::make_directory("mnt/datavg"), Err(Error::Config(_)));
        assert_matches!(
            HostCommand::mount_nfs("-oexec", "/data", "/mnt/x", 4),
            Err(Error::Config(_))
        );
        assert_matches!(
            HostCommand::recover_copy("12", "snap\nname"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_make_directory() {
        let cmd = HostCommand::make_directory("/mnt/datavg/lv01").unwrap();
        assert_eq!(cmd.argv(), vec!["mkdir", "-p", "/mnt/datavg/lv01"]);
    }

    #[test]
    fn test_shell_escaping() {
        assert_eq!(shell_quote("/mnt/data1"), "/mnt/data1");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");

        let cmd = HostCommand::force_close("/mnt/data 1").unwrap().privileged();
        assert_eq!(cmd.shell_escaped(), "sudo fuser -km '/mnt/data 1'");
    }

    #[test]
    fn test_storage_controller_commands() {
        let list = HostCommand::list_recovery_points("cg_123").unwrap();
        assert_eq!(
            list.argv(),
            vec!["lsrecovrp", "-delim", ",", "-filtervalue", "consistencygroup=cg_123"]
        );

        let map = HostCommand::map_volume_to_host("57", "aix_server").unwrap();
        assert_eq!(
            map.to_string(),
            "svctask mkvdiskhostmap -force -host aix_server 57"
        );
    }
}
