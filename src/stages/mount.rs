//! Mount Stage
//!
//! Three layers, each in submission order and each entry recorded in the
//! ledger the moment it succeeds:
//!
//! 1. mount the volume group's filesystems on the source host
//! 2. export the mount specs' paths over NFS
//! 3. mount every export on the scan host through its assigned adapter
//!
//! The stage stops at the first failure; whatever already succeeded stays
//! in the ledger for teardown.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::{AdapterAssigner, Events, HostSession};
use crate::domain::command::HostCommand;
use crate::domain::events::PipelineEvent;
use crate::domain::model::{ExportedShare, Filesystem, MountKind, MountSpec, MountedFilesystem};
use crate::domain::ports::CommandRunner;
use crate::domain::run::PipelineRun;
use crate::error::{Error, Result};

pub struct MountStage {
    runner: Arc<dyn CommandRunner>,
    events: Events,
    assigner: AdapterAssigner,
    source: HostSession,
    scan_host: HostSession,
    nfs_version: u8,
}

impl std::fmt::Debug for MountStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountStage")
            .field("adapters", &self.assigner.adapters())
            .field("source", &self.source.target)
            .field("scan_host", &self.scan_host.target)
            .finish()
    }
}

impl MountStage {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        events: Events,
        assigner: AdapterAssigner,
        source: HostSession,
        scan_host: HostSession,
        nfs_version: u8,
    ) -> Self {
        Self {
            runner,
            events,
            assigner,
            source,
            scan_host,
            nfs_version,
        }
    }

    /// Copy of `specs` with `assigned_adapter` set round-robin by position.
    pub fn assign(&self, specs: &[MountSpec]) -> Vec<MountSpec> {
        specs
            .iter()
            .enumerate()
            .map(|(i, spec)| MountSpec {
                assigned_adapter: Some(self.assigner.next(i).to_string()),
                ..spec.clone()
            })
            .collect()
    }

    /// Mount everything; returns the scan-host mounts.
    #[instrument(skip_all, fields(filesystems = filesystems.len(), specs = specs.len()))]
    pub async fn mount_all(
        &self,
        filesystems: &[Filesystem],
        specs: &[MountSpec],
        run: &mut PipelineRun,
    ) -> Result<Vec<MountedFilesystem>> {
        for filesystem in filesystems {
            self.mount_on_source(filesystem, run).await?;
        }

        for spec in specs {
            if run.exports.iter().any(|e| e.path == spec.export_path) {
                continue;
            }
            self.export(spec, run).await?;
        }

        let mut mounted = Vec::with_capacity(specs.len());
        for spec in self.assign(specs) {
            mounted.push(self.mount_on_scan_host(spec, run).await?);
        }

        info!(
            "Mounted {} exports across {} adapters",
            mounted.len(),
            self.assigner.len()
        );
        Ok(mounted)
    }

    async fn mount_on_source(&self, filesystem: &Filesystem, run: &mut PipelineRun) -> Result<()> {
        let device = filesystem.device.as_deref();
        let wrap = |source: Error| Error::Mount {
            spec: Box::new(MountSpec::new(
                self.source.target.name(),
                device.unwrap_or(&filesystem.mount_point),
                &filesystem.mount_point,
            )),
            source: Box::new(source),
        };
        let runner = self.runner.as_ref();

        // device-backed mounts are not in the host's filesystem table
        if device.is_some() {
            let command = HostCommand::make_directory(&filesystem.mount_point).map_err(wrap)?;
            self.source.run(runner, command).await.map_err(wrap)?;
        }

        let command = HostCommand::mount(device, &filesystem.mount_point).map_err(wrap)?;
        self.source.run(runner, command).await.map_err(wrap)?;

        debug!("Mounted {} on {}", filesystem.mount_point, self.source.target);
        run.host_mounts.push(MountedFilesystem {
            kind: MountKind::Host,
            host: self.source.target.clone(),
            platform: self.source.platform,
            privileged: self.source.privileged,
            mount_point: filesystem.mount_point.clone(),
            spec: None,
        });
        self.events
            .emit(PipelineEvent::resource_acquired(
                format!("mount {}", filesystem.mount_point),
                &self.source.target,
            ))
            .await;
        Ok(())
    }

    async fn export(&self, spec: &MountSpec, run: &mut PipelineRun) -> Result<()> {
        let wrap = |source: Error| Error::Mount {
            spec: Box::new(spec.clone()),
            source: Box::new(source),
        };

        let command =
            HostCommand::export_share(self.source.platform, &spec.export_path, self.nfs_version)
                .map_err(wrap)?;
        self.source
            .run(self.runner.as_ref(), command)
            .await
            .map_err(wrap)?;

        debug!("Exported {} from {}", spec.export_path, self.source.target);
        run.exports.push(ExportedShare {
            host: self.source.target.clone(),
            platform: self.source.platform,
            privileged: self.source.privileged,
            path: spec.export_path.clone(),
        });
        self.events
            .emit(PipelineEvent::resource_acquired(
                format!("export {}", spec.export_path),
                &self.source.target,
            ))
            .await;
        Ok(())
    }

    async fn mount_on_scan_host(
        &self,
        spec: MountSpec,
        run: &mut PipelineRun,
    ) -> Result<MountedFilesystem> {
        let adapter = spec.assigned_adapter.clone().unwrap_or_default();
        let attempt = async {
            let command = HostCommand::mount_nfs(
                &adapter,
                &spec.export_path,
                &spec.mount_point,
                self.nfs_version,
            )?;
            self.scan_host.run(self.runner.as_ref(), command).await
        };
        if let Err(source) = attempt.await {
            return Err(Error::Mount {
                spec: Box::new(spec),
                source: Box::new(source),
            });
        }

        info!("Mounted {}", spec);
        let mounted = MountedFilesystem {
            kind: MountKind::Network,
            host: self.scan_host.target.clone(),
            platform: self.scan_host.platform,
            privileged: self.scan_host.privileged,
            mount_point: spec.mount_point.clone(),
            spec: Some(spec),
        };
        run.network_mounts.push(mounted.clone());
        self.events
            .emit(PipelineEvent::resource_acquired(
                format!("mount {}", mounted.mount_point),
                &self.scan_host.target,
            ))
            .await;
        Ok(mounted)
    }
}
