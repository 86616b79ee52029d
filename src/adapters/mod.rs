//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  CommandRunner │ StorageController │ JobApi │ Mailer       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ ProcessCommandRunner │ SvcCliController │ HttpJobApi      │ │
//! │  │ SendmailMailer │ RunLogPublisher │ LoggingEventPublisher  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `in_memory` holds scriptable doubles of every port for tests.
//!
//! # Usage
//!
//! ```ignore
//! use safecopy::adapters::{ProcessCommandRunner, SvcCliController};
//! use safecopy::domain::ports::StorageController;
//!
//! let runner = Arc::new(ProcessCommandRunner::default());
//! let controller = SvcCliController::new(runner, controller_target);
//! let points = controller.list_recovery_points("cg_123").await?;
//! ```

mod command;
mod event_publisher;
mod http_jobs;
pub mod in_memory;
mod mailer;
mod storage_cli;

pub use command::ProcessCommandRunner;
pub use event_publisher::{
    CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher, RunLogPublisher,
};
pub use http_jobs::{HttpJobApi, HttpJobApiConfig};
pub use mailer::{LoggingMailer, SendmailMailer};
pub use storage_cli::SvcCliController;
