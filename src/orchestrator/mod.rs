//! Pipeline Orchestrator
//!
//! Runs one validation pass end to end and always leaves the hosts clean.

mod engine;
mod interrupt;

pub use engine::{Collaborators, PipelineOrchestrator};
pub use interrupt::{escalate, watch_interrupts, InterruptAction};
