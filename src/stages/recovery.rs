//! Storage Recovery Stage
//!
//! Picks the newest recovery point of a consistency group, recovers it
//! into a fresh volume and maps that volume to the source host.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use super::Events;
use crate::domain::events::PipelineEvent;
use crate::domain::model::{PresentedVolume, RecoveryPoint};
use crate::domain::ports::StorageController;
use crate::domain::run::PipelineRun;
use crate::error::{Error, Result};

/// Name of the recovered copy: `<prefix>_<yyyymmddHHMMSS>` in UTC.
pub fn copy_name(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}_{}", prefix, now.format("%Y%m%d%H%M%S"))
}

pub struct StorageRecoveryStage {
    storage: Arc<dyn StorageController>,
    events: Events,
    consistency_group: String,
    copy_prefix: String,
    present_to: String,
}

impl std::fmt::Debug for StorageRecoveryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRecoveryStage")
            .field("consistency_group", &self.consistency_group)
            .field("present_to", &self.present_to)
            .finish()
    }
}

impl StorageRecoveryStage {
    pub fn new(
        storage: Arc<dyn StorageController>,
        events: Events,
        consistency_group: impl Into<String>,
        copy_prefix: impl Into<String>,
        present_to: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            events,
            consistency_group: consistency_group.into(),
            copy_prefix: copy_prefix.into(),
            present_to: present_to.into(),
        }
    }

    /// Newest point of the group. On equal timestamps the first point in
    /// controller order wins.
    #[instrument(skip(self))]
    pub async fn latest_recovery_point(&self, consistency_group: &str) -> Result<RecoveryPoint> {
        let points = self.storage.list_recovery_points(consistency_group).await?;

        let mut latest: Option<RecoveryPoint> = None;
        for point in points {
            match &latest {
                Some(best) if point.created_at <= best.created_at => {}
                _ => latest = Some(point),
            }
        }

        latest.ok_or_else(|| {
            Error::NotFound(format!(
                "no recovery points in consistency group {}",
                consistency_group
            ))
        })
    }

    /// Recover `point` as `target_name` and present it to the source host.
    #[instrument(skip(self, point), fields(point = %point.id))]
    pub async fn recover(
        &self,
        point: &RecoveryPoint,
        target_name: &str,
    ) -> Result<PresentedVolume> {
        let wrap = |source: Error| Error::Recovery {
            point_id: point.id.clone(),
            source: Box::new(source),
        };

        let volume_id = self.storage.recover(point, target_name).await.map_err(wrap)?;
        self.storage
            .present(&volume_id, &self.present_to)
            .await
            .map_err(wrap)?;

        info!(
            "Recovered point {} as volume {} presented to {}",
            point.id, volume_id, self.present_to
        );
        Ok(PresentedVolume {
            recovery_point_id: point.id.clone(),
            target_host: self.present_to.clone(),
            volume_id,
        })
    }

    /// Run the stage, recording the presentation in the ledger.
    pub async fn run(&self, run: &mut PipelineRun) -> Result<PresentedVolume> {
        let point = self.latest_recovery_point(&self.consistency_group).await?;
        info!(
            "Selected recovery point {} created {}",
            point.id, point.created_at
        );

        let name = copy_name(&self.copy_prefix, Utc::now());
        let presented = self.recover(&point, &name).await?;

        run.presented = Some(presented.clone());
        self.events
            .emit(PipelineEvent::resource_acquired(
                format!("volume {}", presented.volume_id),
                &presented.target_host,
            ))
            .await;
        Ok(presented)
    }
}
