//! [`ConnectionMonitor`]: the health surface read by status reporting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

// ---------------------------------------------------------------------------
// ConnectionMonitor
// ---------------------------------------------------------------------------

/// Disconnection alert plus the time the connection was last seen healthy.
///
/// `activated` is the alert: `true` while the broker connection is known to
/// be down although consuming is enabled.
#[derive(Debug)]
pub struct ConnectionMonitor {
    // ---
    activated: AtomicBool,
    last_mean_time: Mutex<Instant>,
}

// ---

impl ConnectionMonitor {
    // ---
    pub fn new() -> Self {
        Self {
            activated: AtomicBool::new(false),
            last_mean_time: Mutex::new(Instant::now()),
        }
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    pub fn set_activated(&self, activated: bool) {
        self.activated.store(activated, Ordering::Release);
    }

    // ---

    /// Record "healthy now".
    pub fn touch(&self) {
        self.set_last_mean_time(Instant::now());
    }

    pub fn set_last_mean_time(&self, at: Instant) {
        *self.last_mean_time.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }

    /// Time since the connection was last seen healthy.
    pub fn elapsed(&self) -> Duration {
        self.last_mean_time
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }

    // ---

    /// `HH:MM:SS` since last healthy; hours wrap at 24, see
    /// [`spent_days`](Self::spent_days).
    pub fn spent_time(&self) -> String {
        format_spent_time(self.elapsed())
    }

    pub fn spent_days(&self) -> u64 {
        self.elapsed().as_secs() / 86_400
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// ---

fn format_spent_time(spent: Duration) -> String {
    let secs = spent.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn spent_time_wraps_hours_at_a_day() {
        // ---
        assert_eq!(format_spent_time(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_spent_time(Duration::from_secs(3_725)), "01:02:05");
        assert_eq!(
            format_spent_time(Duration::from_secs(2 * 86_400 + 5 * 3600 + 7)),
            "05:00:07"
        );
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn elapsed_follows_the_clock_until_touched() {
        // ---
        let monitor = ConnectionMonitor::new();
        assert!(!monitor.is_activated());

        tokio::time::advance(Duration::from_secs(3 * 86_400 + 90)).await;
        assert_eq!(monitor.spent_days(), 3);
        assert_eq!(monitor.spent_time(), "00:01:30");

        monitor.touch();
        assert_eq!(monitor.spent_days(), 0);
        assert_eq!(monitor.spent_time(), "00:00:00");
    }
}
