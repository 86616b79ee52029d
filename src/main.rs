//! Safecopy
//!
//! Validates a safeguarded copy end to end.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                              safecopy run                             │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌────────────┐   ┌───────┐   ┌──────┐                 │
//! │  │ Recovery │──▶│ Activation │──▶│ Mount │──▶│ Scan │──┐              │
//! │  └──────────┘   └────────────┘   └───────┘   ├──────┤  │  ┌──────────┐│
//! │                                              │Backup│──┴─▶│ Teardown ││
//! │                                              └──────┘     │ + Report ││
//! │                                                           └──────────┘│
//! └───────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use safecopy::adapters::{
    CompositeEventPublisher, HttpJobApi, LoggingEventPublisher, LoggingMailer,
    ProcessCommandRunner, RunLogPublisher, SendmailMailer, SvcCliController,
};
use safecopy::domain::model::{JobHandle, JobKind};
use safecopy::domain::ports::{CommandRunner, EventPublisher, Mailer};
use safecopy::orchestrator::watch_interrupts;
use safecopy::{Collaborators, JobPoller, PipelineConfig, PipelineOrchestrator, Result, RunMetrics};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Safecopy - safeguarded-copy validation pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full validation pipeline once
    Run {
        /// Workflow plan (YAML)
        #[arg(long, env = "SAFECOPY_CONFIG", default_value = "/etc/safecopy/plan.yaml")]
        config: PathBuf,

        /// Append one line per pipeline event to this file
        #[arg(long, env = "SAFECOPY_RUN_LOG")]
        run_log: Option<PathBuf>,

        /// Write Prometheus run metrics to this textfile
        #[arg(long, env = "SAFECOPY_METRICS_TEXTFILE")]
        metrics_textfile: Option<PathBuf>,
    },

    /// Load and validate a workflow plan without touching any host
    Validate {
        /// Workflow plan (YAML)
        #[arg(long, env = "SAFECOPY_CONFIG", default_value = "/etc/safecopy/plan.yaml")]
        config: PathBuf,
    },

    /// Ask a job API to cancel a running job
    CancelJob {
        /// Workflow plan (YAML) holding the job API settings
        #[arg(long, env = "SAFECOPY_CONFIG", default_value = "/etc/safecopy/plan.yaml")]
        config: PathBuf,

        /// Which job system the job belongs to
        #[arg(long, value_enum)]
        kind: JobSystem,

        /// Job id returned by the API
        #[arg(long)]
        job_id: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum JobSystem {
    Scan,
    Backup,
}

impl From<JobSystem> for JobKind {
    fn from(system: JobSystem) -> Self {
        match system {
            JobSystem::Scan => JobKind::Scan,
            JobSystem::Backup => JobKind::Backup,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    match args.command {
        Command::Run {
            config,
            run_log,
            metrics_textfile,
        } => run(config, run_log, metrics_textfile).await,
        Command::Validate { config } => validate(config),
        Command::CancelJob {
            config,
            kind,
            job_id,
        } => cancel_job(config, kind.into(), job_id).await,
    }
}

async fn run(
    config_path: PathBuf,
    run_log: Option<PathBuf>,
    metrics_textfile: Option<PathBuf>,
) -> Result<ExitCode> {
    info!("Starting safecopy");
    info!("  Plan: {}", config_path.display());

    let config = PipelineConfig::load(&config_path)?;
    info!("  Consistency group: {}", config.storage.consistency_group);
    info!("  Mounts: {}", config.mounts.len());
    info!("  Adapters: {}", config.adapters.join(", "));

    let mut publisher = CompositeEventPublisher::new().with_publisher(LoggingEventPublisher::new());
    if let Some(path) = run_log {
        info!("  Run log: {}", path.display());
        publisher = publisher.with_publisher(RunLogPublisher::new(path));
    }
    let events: Arc<dyn EventPublisher> = Arc::new(publisher);

    let runner: Arc<dyn CommandRunner> =
        Arc::new(ProcessCommandRunner::new(config.command_timeout()));
    let mailer: Arc<dyn Mailer> = if config.report.sendmail.is_empty() {
        Arc::new(LoggingMailer)
    } else {
        Arc::new(
            SendmailMailer::new(&config.report.sender).with_program(&config.report.sendmail),
        )
    };

    let collaborators = Collaborators {
        storage: Arc::new(SvcCliController::new(
            runner.clone(),
            config.storage.controller.clone(),
        )),
        scan_api: Arc::new(HttpJobApi::new(config.scan.api.clone())?),
        backup_api: Arc::new(HttpJobApi::new(config.backup.api.clone())?),
        runner,
        mailer,
        events,
    };
    let orchestrator = PipelineOrchestrator::new(config, collaborators)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let interrupts = futures::stream::unfold((), |()| async {
        tokio::signal::ctrl_c().await.ok().map(|()| ((), ()))
    });
    tokio::spawn(async move {
        if watch_interrupts(on_signal, interrupts).await {
            std::process::exit(130);
        }
    });

    let run = orchestrator.run(cancel).await;

    if let Some(path) = metrics_textfile {
        let written = match RunMetrics::new() {
            Ok(metrics) => {
                metrics.observe(&run);
                metrics.write_textfile(&path).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            error!("Failed to write metrics to {}: {}", path.display(), e);
        }
    }

    if run.is_success() {
        info!("Safecopy run {} complete", run.run_id);
        Ok(ExitCode::SUCCESS)
    } else {
        if let Some(failure) = run.first_failure() {
            error!("Run failed at {}", failure.stage);
        }
        Ok(ExitCode::FAILURE)
    }
}

fn validate(config_path: PathBuf) -> Result<ExitCode> {
    match PipelineConfig::load(&config_path) {
        Ok(config) => {
            info!(
                "Plan {} is valid: {} mounts across {} adapters",
                config_path.display(),
                config.mounts.len(),
                config.adapters.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Plan {} is invalid: {}", config_path.display(), e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn cancel_job(config_path: PathBuf, kind: JobKind, job_id: String) -> Result<ExitCode> {
    let config = PipelineConfig::load(&config_path)?;
    let api_config = match kind {
        JobKind::Scan => config.scan.api,
        JobKind::Backup => config.backup.api,
    };

    let poller = JobPoller::new(
        Arc::new(HttpJobApi::new(api_config)?),
        Arc::new(LoggingEventPublisher::new()),
    );
    poller.cancel(&JobHandle::new(job_id, kind)).await?;

    info!("Cancel requested");
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
