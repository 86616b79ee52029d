//! Run Metrics
//!
//! Prometheus gauges describing the last run, written in text exposition
//! format for a node-exporter textfile collector.

use std::path::Path;

use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tracing::{debug, info};

use crate::domain::run::{PipelineRun, Stage, StageOutcome};
use crate::error::{Error, Result};

const OUTCOMES: [StageOutcome; 3] = [
    StageOutcome::Succeeded,
    StageOutcome::Failed,
    StageOutcome::Skipped,
];

/// Gauges for one run, on a private registry.
#[derive(Debug, Clone)]
pub struct RunMetrics {
    registry: Registry,
    stage_duration: GaugeVec,
    stage_outcome: GaugeVec,
    run_success: Gauge,
    run_end: Gauge,
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

impl RunMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let stage_duration = GaugeVec::new(
            Opts::new(
                "safecopy_stage_duration_seconds",
                "Wall-clock duration of each pipeline stage",
            ),
            &["stage"],
        )
        .map_err(metrics_error)?;
        let stage_outcome = GaugeVec::new(
            Opts::new(
                "safecopy_stage_outcome",
                "1 for the outcome each stage ended with",
            ),
            &["stage", "outcome"],
        )
        .map_err(metrics_error)?;
        let run_success = Gauge::new(
            "safecopy_run_success",
            "1 if every forward stage and teardown succeeded",
        )
        .map_err(metrics_error)?;
        let run_end = Gauge::new(
            "safecopy_run_end_timestamp_seconds",
            "Unix time the last run finished",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(stage_duration.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(stage_outcome.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(run_success.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(run_end.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            stage_duration,
            stage_outcome,
            run_success,
            run_end,
        })
    }

    /// Set every gauge from a finished run.
    pub fn observe(&self, run: &PipelineRun) {
        for stage in Stage::ALL {
            let outcome = run.outcome_of(stage).unwrap_or(StageOutcome::Skipped);
            let duration = run
                .result_of(stage)
                .map(|r| r.duration.as_secs_f64())
                .unwrap_or(0.0);

            self.stage_duration
                .with_label_values(&[stage.name()])
                .set(duration);
            for candidate in OUTCOMES {
                let value = if candidate == outcome { 1.0 } else { 0.0 };
                self.stage_outcome
                    .with_label_values(&[stage.name(), &candidate.to_string()])
                    .set(value);
            }
        }

        self.run_success
            .set(if run.is_success() { 1.0 } else { 0.0 });
        let ended = run.ended_at.unwrap_or_else(chrono::Utc::now);
        self.run_end.set(ended.timestamp() as f64);
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics: {}", e)))
    }

    /// Write the textfile atomically (temp file, then rename).
    pub async fn write_textfile(&self, path: &Path) -> Result<()> {
        let text = self.render()?;
        let tmp = path.with_extension("prom.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!("Wrote run metrics to {}", path.display());
        debug!("Metrics textfile {} bytes", tokio::fs::metadata(path).await?.len());
        Ok(())
    }
}
