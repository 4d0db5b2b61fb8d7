//! Cancellable delayed and periodic actions.
//!
//! Both helpers run on the ambient tokio runtime and stop as soon as their
//! `CancellationToken` is cancelled. Cancelling is idempotent and safe after
//! the action already ran.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A one-shot action scheduled to run after a delay.
///
/// The action runs at most once. Cancelling before the deadline prevents it;
/// a cancel racing the deadline may lose, so actions re-check their own
/// preconditions.
#[derive(Debug)]
pub struct Delayed {
    cancel: CancellationToken,
}

impl Delayed {
    /// Schedule `action` to run after `delay`.
    pub fn schedule<F>(delay: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = time::sleep(delay) => {
                    if !token.is_cancelled() {
                        // Mark as done so later cancels are no-ops.
                        token.cancel();
                        action();
                    }
                }
            }
        });
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the action was cancelled or already ran.
    pub fn is_finished(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Run `tick` every `period` until it breaks or `cancel` fires.
///
/// The first tick happens one full period after the call.
pub(crate) fn spawn_periodic<F>(period: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> ControlFlow<()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if cancel.is_cancelled() || tick().is_break() {
                        break;
                    }
                }
            }
        }
    });
}
