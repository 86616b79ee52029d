//! Storage Controller CLI Adapter
//!
//! Implements the `StorageController` port by running the controller's
//! command-line interface (`lsrecovrp`, `mkrecovercopy`, `lsvdisk`,
//! `mkvdiskhostmap`, `rmvdiskhostmap`) on the controller over SSH.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::domain::command::HostCommand;
use crate::domain::model::{parse_timestamp, RecoveryPoint, Target};
use crate::domain::ports::{CommandRunner, StorageController};
use crate::error::{Error, Result};

/// Timestamp column names, in order of preference.
const TIMESTAMP_COLUMNS: [&str; 4] = ["created_at", "creation_time", "timestamp", "time"];

/// Storage controller driven through its CLI.
pub struct SvcCliController {
    runner: Arc<dyn CommandRunner>,
    controller: Target,
}

impl SvcCliController {
    pub fn new(runner: Arc<dyn CommandRunner>, controller: Target) -> Self {
        Self { runner, controller }
    }
}

impl std::fmt::Debug for SvcCliController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvcCliController")
            .field("controller", &self.controller)
            .finish()
    }
}

/// A `-delim ,` listing: header row plus data rows.
struct Listing<'a> {
    columns: Vec<&'a str>,
    rows: Vec<Vec<&'a str>>,
}

impl<'a> Listing<'a> {
    fn parse(stdout: &'a str) -> Self {
        let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
        let columns = lines
            .next()
            .map(|header| header.split(',').map(str::trim).collect())
            .unwrap_or_default();
        let rows = lines
            .map(|line| line.split(',').map(str::trim).collect())
            .collect();
        Self { columns, rows }
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

/// Parse `lsrecovrp` output. Rows whose timestamp cannot be parsed are
/// skipped; vendor order is preserved.
fn parse_recovery_points(stdout: &str, consistency_group: &str) -> Vec<RecoveryPoint> {
    let listing = Listing::parse(stdout);
    let id_col = listing.column("id").unwrap_or(0);
    let ts_col = TIMESTAMP_COLUMNS
        .iter()
        .find_map(|name| listing.column(name))
        .unwrap_or(4);

    listing
        .rows
        .iter()
        .filter_map(|row| {
            let id = row.get(id_col)?;
            let raw_ts = row.get(ts_col)?;
            match parse_timestamp(raw_ts) {
                Some(created_at) => Some(RecoveryPoint::new(*id, consistency_group, created_at)),
                None => {
                    warn!("Skipping recovery point {} with unparseable timestamp {:?}", id, raw_ts);
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl StorageController for SvcCliController {
    #[instrument(skip(self))]
    async fn list_recovery_points(&self, consistency_group: &str) -> Result<Vec<RecoveryPoint>> {
        let command = HostCommand::list_recovery_points(consistency_group)?;
        let output = self.runner.execute(&self.controller, &command).await?;
        let points = parse_recovery_points(&output.stdout, consistency_group);
        debug!("Controller returned {} recovery points", points.len());
        Ok(points)
    }

    #[instrument(skip(self, point), fields(point = %point.id))]
    async fn recover(&self, point: &RecoveryPoint, target_name: &str) -> Result<String> {
        let recover = HostCommand::recover_copy(&point.id, target_name)?;
        self.runner.execute(&self.controller, &recover).await?;
        info!("Recovered point {} as {}", point.id, target_name);

        let lookup = HostCommand::find_volume(target_name)?;
        let output = self.runner.execute(&self.controller, &lookup).await?;
        let listing = Listing::parse(&output.stdout);
        let id_col = listing.column("id").unwrap_or(0);

        listing
            .rows
            .first()
            .and_then(|row| row.get(id_col))
            .map(|id| id.to_string())
            .ok_or_else(|| {
                Error::NotFound(format!("no volume named {} after recovery", target_name))
            })
    }

    #[instrument(skip(self))]
    async fn present(&self, volume_id: &str, host: &str) -> Result<()> {
        let command = HostCommand::map_volume_to_host(volume_id, host)?;
        self.runner.execute(&self.controller, &command).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpresent(&self, volume_id: &str, host: &str) -> Result<()> {
        let command = HostCommand::unmap_volume_from_host(volume_id, host)?;
        self.runner.execute(&self.controller, &command).await?;
        Ok(())
    }
}
