//! Heartbeat liveness monitoring.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::negotiation::KeepAliveData;
use crate::timer::spawn_periodic;

/// Default tick period when the server offers no keep-alive.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// What a single heartbeat tick observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Beat {
    /// Traffic is recent enough.
    Healthy,
    /// Past the keep-alive warning threshold but not yet timed out.
    Slow,
    /// No traffic within the keep-alive timeout.
    TimedOut,
    /// The monitor itself went quiet for longer than the reconnect window
    /// (e.g. the process was suspended); the server has dropped us.
    WindowExpired,
}

/// Classify the connection's liveness at `now`.
///
/// Without keep-alive data inactivity alone never yields `Slow` or
/// `TimedOut`.
pub(crate) fn assess(
    now: Instant,
    last_message_at: Instant,
    last_active_at: Instant,
    keep_alive: Option<&KeepAliveData>,
    reconnect_window: Duration,
) -> Beat {
    if now.saturating_duration_since(last_active_at) >= reconnect_window {
        return Beat::WindowExpired;
    }

    let Some(keep_alive) = keep_alive else {
        return Beat::Healthy;
    };

    let silent_for = now.saturating_duration_since(last_message_at);
    if silent_for >= keep_alive.timeout {
        Beat::TimedOut
    } else if silent_for >= keep_alive.timeout_warning {
        Beat::Slow
    } else {
        Beat::Healthy
    }
}

/// Periodic timer driving liveness checks for one start attempt.
///
/// Dropping or disposing the monitor stops the timer; neither raises events.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    cancel: CancellationToken,
    period: Duration,
}

impl HeartbeatMonitor {
    /// Start ticking every `period`, calling `beat` until it breaks, the
    /// monitor is disposed, or `scope` is cancelled.
    pub fn start<F>(period: Duration, scope: &CancellationToken, beat: F) -> Self
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let cancel = scope.child_token();
        spawn_periodic(period, cancel.clone(), beat);
        tracing::debug!(?period, "heartbeat monitor started");
        Self { cancel, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop the timer. Safe to call repeatedly from any thread.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn healthy_when_recent() {
        let base = Instant::now();
        let keep_alive = KeepAliveData::new(secs(9));
        let beat = assess(base + secs(2), base, base + secs(2), Some(&keep_alive), secs(39));
        assert_eq!(beat, Beat::Healthy);
    }

    #[test]
    fn slow_past_warning() {
        let base = Instant::now();
        let keep_alive = KeepAliveData::new(secs(9));
        let beat = assess(base + secs(7), base, base + secs(6), Some(&keep_alive), secs(39));
        assert_eq!(beat, Beat::Slow);
    }

    #[test]
    fn timed_out_past_timeout() {
        let base = Instant::now();
        let keep_alive = KeepAliveData::new(secs(9));
        let beat = assess(base + secs(9), base, base + secs(6), Some(&keep_alive), secs(39));
        assert_eq!(beat, Beat::TimedOut);
    }

    #[test]
    fn no_keep_alive_never_times_out() {
        let base = Instant::now();
        let beat = assess(base + secs(600), base, base + secs(599), None, secs(30));
        assert_eq!(beat, Beat::Healthy);
    }

    #[test]
    fn window_expired_after_suspension() {
        let base = Instant::now();
        let beat = assess(base + secs(31), base + secs(1), base, None, secs(30));
        assert_eq!(beat, Beat::WindowExpired);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_ticks_until_disposed() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let scope = CancellationToken::new();
        let monitor = HeartbeatMonitor::start(secs(3), &scope, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });
        assert_eq!(monitor.period(), secs(3));

        tokio::time::sleep(secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        monitor.dispose();
        monitor.dispose();
        assert!(monitor.is_disposed());
        tokio::time::sleep(secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_scope_stops_monitor() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let scope = CancellationToken::new();
        let monitor = HeartbeatMonitor::start(secs(1), &scope, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });

        scope.cancel();
        tokio::time::sleep(secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert!(monitor.is_disposed());
    }
}
