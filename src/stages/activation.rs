//! Volume Activation Stage
//!
//! Imports the volume group on the presented disk, brings it online and
//! lists the filesystems it carries.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::{Events, HostSession};
use crate::domain::command::HostCommand;
use crate::domain::events::PipelineEvent;
use crate::domain::model::{Filesystem, HostPlatform, PresentedVolume, VolumeGroupState};
use crate::domain::ports::CommandRunner;
use crate::domain::run::PipelineRun;
use crate::error::{Error, Result};

pub struct VolumeActivationStage {
    runner: Arc<dyn CommandRunner>,
    events: Events,
    host: HostSession,
    volume_group: String,
    disk: String,
    /// Configured filesystems; discovered from the volume group when empty
    filesystems: Vec<Filesystem>,
}

impl std::fmt::Debug for VolumeActivationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeActivationStage")
            .field("host", &self.host)
            .field("volume_group", &self.volume_group)
            .finish()
    }
}

impl VolumeActivationStage {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        events: Events,
        host: HostSession,
        volume_group: impl Into<String>,
        disk: impl Into<String>,
        filesystems: Vec<Filesystem>,
    ) -> Self {
        Self {
            runner,
            events,
            host,
            volume_group: volume_group.into(),
            disk: disk.into(),
            filesystems,
        }
    }

    /// Import and activate the volume group. Each step is recorded in the
    /// ledger as soon as it succeeds so teardown undoes exactly what was
    /// done.
    #[instrument(
        skip(self, presented, run),
        fields(vg = %self.volume_group, volume = %presented.volume_id)
    )]
    pub async fn activate(
        &self,
        presented: &PresentedVolume,
        run: &mut PipelineRun,
    ) -> Result<Vec<Filesystem>> {
        self.activate_inner(run).await.map_err(|source| Error::Activation {
            volume_group: self.volume_group.clone(),
            source: Box::new(source),
        })
    }

    async fn activate_inner(&self, run: &mut PipelineRun) -> Result<Vec<Filesystem>> {
        let platform = self.host.platform;
        let runner = self.runner.as_ref();

        self.host
            .run(runner, HostCommand::rescan_devices(platform))
            .await?;

        self.host
            .run(
                runner,
                HostCommand::import_volume_group(platform, &self.volume_group, &self.disk)?,
            )
            .await?;
        run.volume_group = Some(VolumeGroupState {
            name: self.volume_group.clone(),
            host: self.host.target.clone(),
            platform,
            privileged: self.host.privileged,
            imported: true,
            active: false,
        });
        self.events
            .emit(PipelineEvent::resource_acquired(
                format!("volume group {} (imported)", self.volume_group),
                &self.host.target,
            ))
            .await;

        self.host
            .run(
                runner,
                HostCommand::activate_volume_group(platform, &self.volume_group)?,
            )
            .await?;
        if let Some(vg) = run.volume_group.as_mut() {
            vg.active = true;
        }
        self.events
            .emit(PipelineEvent::resource_acquired(
                format!("volume group {} (active)", self.volume_group),
                &self.host.target,
            ))
            .await;

        let filesystems = if self.filesystems.is_empty() {
            self.discover_filesystems().await?
        } else {
            self.filesystems.clone()
        };
        if filesystems.is_empty() {
            warn!("Volume group {} exposes no filesystems", self.volume_group);
        }
        info!(
            "Volume group {} active with {} filesystems",
            self.volume_group,
            filesystems.len()
        );
        Ok(filesystems)
    }

    async fn discover_filesystems(&self) -> Result<Vec<Filesystem>> {
        let command =
            HostCommand::list_volume_group_filesystems(self.host.platform, &self.volume_group)?;
        let output = self.host.run(self.runner.as_ref(), command).await?;

        Ok(output
            .lines()
            .map(|line| match self.host.platform {
                HostPlatform::Aix => Filesystem::at(line),
                HostPlatform::Linux => Filesystem {
                    device: Some(format!("/dev/{}/{}", self.volume_group, line)),
                    mount_point: format!("/mnt/{}/{}", self.volume_group, line),
                },
            })
            .collect())
    }
}
