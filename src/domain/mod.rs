//! Domain Layer
//!
//! Core types of the validation pipeline, free of any transport concerns.
//!
//! # Architecture
//!
//! - **Model** (`model.rs`) - Value objects: recovery points, volumes, mounts, jobs
//! - **Command** (`command.rs`) - Validated host and storage-controller commands
//! - **Run** (`run.rs`) - The `PipelineRun` ledger of stage results and held resources
//! - **Events** (`events.rs`) - Pipeline events for the run log and audit
//! - **Ports** (`ports.rs`) - Trait abstractions for external collaborators
//!
//! # Usage
//!
//! ```ignore
//! use safecopy::domain::ports::{CommandRunner, StorageController};
//!
//! async fn latest<S: StorageController>(storage: &S) -> Result<()> {
//!     let points = storage.list_recovery_points("cg_123").await?;
//!     // ...
//! }
//! ```

pub mod command;
pub mod events;
pub mod model;
pub mod ports;
pub mod run;

// Re-export commonly used types
pub use command::HostCommand;
pub use events::PipelineEvent;
pub use model::{
    ExportedShare, Filesystem, HostPlatform, JobHandle, JobKind, JobState, JobStatus, MountKind,
    MountSpec, MountedFilesystem, PresentedVolume, RecoveryPoint, RemoteHost, Target,
    VolumeGroupState,
};
pub use ports::{
    CommandOutput, CommandRunner, EventPublisher, JobApi, JobRequest, Mailer, ScanExtras,
    StorageController,
};
pub use run::{PipelineRun, Stage, StageOutcome, StageResult};
