//! Reconnect timeout guard.
//!
//! Armed when a connection starts reconnecting. If recovery does not happen
//! within the window the armed action forcibly disconnects; on recovery the
//! guard is disarmed before it fires.

use std::time::Duration;

use parking_lot::Mutex;

use crate::timer::Delayed;

/// Holds at most one armed delayed action, tagged with the start attempt
/// that armed it.
#[derive(Debug, Default)]
pub(crate) struct ReconnectGuard {
    armed: Mutex<Option<(u64, Delayed)>>,
}

impl ReconnectGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `on_expiry` to run after `window`, cancelling any previous arming.
    pub fn arm<F>(&self, attempt: u64, window: Duration, on_expiry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let next = Delayed::schedule(window, on_expiry);
        let previous = self.armed.lock().replace((attempt, next));
        if let Some((_, previous)) = previous {
            previous.cancel();
        }
    }

    /// Cancel the action armed by `attempt`. An arming from any other
    /// attempt is left alone. Safe to call repeatedly.
    pub fn disarm(&self, attempt: u64) {
        let armed = {
            let mut armed = self.armed.lock();
            match armed.as_ref() {
                Some((owner, _)) if *owner == attempt => armed.take(),
                _ => None,
            }
        };
        if let Some((_, armed)) = armed {
            armed.cancel();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
            .lock()
            .as_ref()
            .is_some_and(|(_, armed)| !armed.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = hits.clone();
        (hits, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_window() {
        let guard = ReconnectGuard::new();
        let (hits, action) = counter();
        guard.arm(1, Duration::from_secs(40), action);
        assert!(guard.is_armed());

        time::sleep(Duration::from_secs(39)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!guard.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_fire() {
        let guard = ReconnectGuard::new();
        let (hits, action) = counter();
        guard.arm(1, Duration::from_secs(40), action);

        time::sleep(Duration::from_secs(20)).await;
        guard.disarm(1);
        guard.disarm(1);
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous() {
        let guard = ReconnectGuard::new();
        let (first, action) = counter();
        guard.arm(1, Duration::from_secs(10), action);
        let (second, action) = counter();
        guard.arm(1, Duration::from_secs(20), action);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_ignores_other_attempts() {
        let guard = ReconnectGuard::new();
        let (hits, action) = counter();
        guard.arm(2, Duration::from_secs(10), action);

        guard.disarm(1);
        assert!(guard.is_armed());
        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
