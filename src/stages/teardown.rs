//! Teardown Stage
//!
//! Releases everything in the run's resource ledger, newest first:
//!
//! ```text
//! scan-host NFS mounts ─▶ NFS exports ─▶ source-host mounts
//!        ─▶ deactivate VG ─▶ export VG ─▶ un-present volume
//! ```
//!
//! Best effort: every entry is attempted and drained from the ledger
//! whether or not its release succeeds. Failures become leftover notes for
//! the report. Draining makes a second teardown a no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{Events, HostSession};
use crate::domain::command::HostCommand;
use crate::domain::events::PipelineEvent;
use crate::domain::model::MountedFilesystem;
use crate::domain::ports::{CommandRunner, StorageController};
use crate::domain::run::{PipelineRun, Stage};
use crate::error::Result;

pub struct TeardownStage {
    runner: Arc<dyn CommandRunner>,
    storage: Arc<dyn StorageController>,
    events: Events,
}

impl std::fmt::Debug for TeardownStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownStage").finish_non_exhaustive()
    }
}

impl TeardownStage {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        storage: Arc<dyn StorageController>,
        events: Events,
    ) -> Self {
        Self {
            runner,
            storage,
            events,
        }
    }

    /// Release every held resource. Never fails; records the Teardown
    /// stage result.
    ///
    /// Each entry is released with the command flavour recorded when it
    /// was acquired.
    #[instrument(skip_all, fields(run_id = %run.run_id))]
    pub async fn teardown(&self, run: &mut PipelineRun) {
        if run.holds_no_resources() {
            debug!("Nothing to tear down");
            if run.result_of(Stage::Teardown).is_none() {
                run.succeed(Stage::Teardown, Duration::ZERO);
                self.events
                    .emit(PipelineEvent::stage_completed(Stage::Teardown, Duration::ZERO))
                    .await;
            }
            return;
        }

        let started = Instant::now();
        self.events
            .emit(PipelineEvent::stage_started(Stage::Teardown))
            .await;
        let mut leftovers = Vec::new();

        let network_mounts = std::mem::take(&mut run.network_mounts);
        for mount in network_mounts.into_iter().rev() {
            let resource = format!("mount {}", mount.mount_point);
            self.release(&mount.host, resource, self.unmount(&mount), &mut leftovers).await;
        }

        let exports = std::mem::take(&mut run.exports);
        for export in exports.into_iter().rev() {
            let session = HostSession::new(export.host.clone(), export.platform, export.privileged);
            let attempt = async {
                let command = HostCommand::unexport_share(session.platform, &export.path)?;
                session.run(self.runner.as_ref(), command).await.map(|_| ())
            };
            let resource = format!("export {}", export.path);
            self.release(&export.host, resource, attempt, &mut leftovers).await;
        }

        let host_mounts = std::mem::take(&mut run.host_mounts);
        for mount in host_mounts.into_iter().rev() {
            let resource = format!("mount {}", mount.mount_point);
            self.release(&mount.host, resource, self.unmount(&mount), &mut leftovers).await;
        }

        if let Some(vg) = run.volume_group.take() {
            let session = HostSession::new(vg.host.clone(), vg.platform, vg.privileged);
            if vg.active {
                let attempt = async {
                    let command = HostCommand::deactivate_volume_group(vg.platform, &vg.name)?;
                    session.run(self.runner.as_ref(), command).await.map(|_| ())
                };
                let resource = format!("volume group {} (active)", vg.name);
                self.release(&vg.host, resource, attempt, &mut leftovers).await;
            }
            if vg.imported {
                let attempt = async {
                    let command = HostCommand::export_volume_group(vg.platform, &vg.name)?;
                    session.run(self.runner.as_ref(), command).await.map(|_| ())
                };
                let resource = format!("volume group {} (imported)", vg.name);
                self.release(&vg.host, resource, attempt, &mut leftovers).await;
            }
        }

        if let Some(presented) = run.presented.take() {
            let attempt = self
                .storage
                .unpresent(&presented.volume_id, &presented.target_host);
            let resource = format!("volume {}", presented.volume_id);
            self.release(&presented.target_host, resource, attempt, &mut leftovers).await;
        }

        let elapsed = started.elapsed();
        if leftovers.is_empty() {
            info!("Teardown released every resource");
            run.succeed(Stage::Teardown, elapsed);
            self.events
                .emit(PipelineEvent::stage_completed(Stage::Teardown, elapsed))
                .await;
        } else {
            let reason = format!("{} resource(s) left in place", leftovers.len());
            warn!("Teardown incomplete: {}", reason);
            run.fail(Stage::Teardown, &reason, elapsed);
            self.events
                .emit(PipelineEvent::stage_failed(Stage::Teardown, &reason))
                .await;
        }
        run.leftovers.extend(leftovers);
    }

    /// Kill processes holding the mount, then unmount it.
    async fn unmount(&self, mount: &MountedFilesystem) -> Result<()> {
        let session = HostSession::new(mount.host.clone(), mount.platform, mount.privileged);
        let runner = self.runner.as_ref();

        // fuser exits non-zero when nothing holds the mount
        if let Err(e) = session
            .run(runner, HostCommand::force_close(&mount.mount_point)?)
            .await
        {
            debug!("fuser on {}: {}", mount.mount_point, e);
        }
        session
            .run(runner, HostCommand::unmount(&mount.mount_point)?)
            .await
            .map(|_| ())
    }

    async fn release<F>(
        &self,
        host: &(impl std::fmt::Display + ?Sized),
        resource: String,
        attempt: F,
        leftovers: &mut Vec<String>,
    ) where
        F: std::future::Future<Output = Result<()>>,
    {
        match attempt.await {
            Ok(()) => {
                debug!("Released {} on {}", resource, host);
                self.events
                    .emit(PipelineEvent::resource_released(&resource, host))
                    .await;
            }
            Err(e) => {
                warn!("Could not release {} on {}: {}", resource, host, e);
                leftovers.push(format!("{} on {}: {}", resource, host, e));
                self.events
                    .emit(PipelineEvent::resource_leaked(&resource, host, &e))
                    .await;
            }
        }
    }
}
