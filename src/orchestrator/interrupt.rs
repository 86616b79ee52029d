//! Operator Interrupts
//!
//! The first interrupt aborts the run: jobs are canceled and teardown still
//! runs. A second interrupt gives up on teardown.

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// What an interrupt asks of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Cancel the run and let teardown finish
    Abort,
    /// Exit immediately
    Exit,
}

/// Escalate one interrupt against the run's cancellation token.
pub fn escalate(cancel: &CancellationToken) -> InterruptAction {
    if cancel.is_cancelled() {
        error!("Second interrupt, exiting before teardown finished; check for leftovers");
        InterruptAction::Exit
    } else {
        warn!("Interrupt received, canceling jobs then tearing down (interrupt again to exit)");
        cancel.cancel();
        InterruptAction::Abort
    }
}

/// Consume interrupts until one asks to exit. Returns false if the
/// interrupt source ends first.
pub async fn watch_interrupts<S>(cancel: CancellationToken, interrupts: S) -> bool
where
    S: Stream<Item = ()>,
{
    tokio::pin!(interrupts);
    while interrupts.next().await.is_some() {
        if escalate(&cancel) == InterruptAction::Exit {
            return true;
        }
    }
    false
}
