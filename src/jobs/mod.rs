//! External Job Monitoring
//!
//! `JobPoller` submits a job through a `JobApi` port and follows it to a
//! terminal state. Scan and backup stages each own one.

mod poller;

pub use poller::{JobPoller, PollPolicy};
