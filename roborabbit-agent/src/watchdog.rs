//! [`Watchdog`]: periodic health check that restores the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::ConnectionManager;

/// Delay before the first tick.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

pub struct Watchdog {
    // ---
    manager: Arc<ConnectionManager>,
    stopped: AtomicBool,
    update_requested: AtomicBool,
}

// ---

impl Watchdog {
    // ---
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            stopped: AtomicBool::new(false),
            update_requested: AtomicBool::new(false),
        })
    }

    pub fn start(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    /// Ticks are skipped until [`start`](Self::start) is called again.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Ask the next tick to run a full update even if the connection is
    /// healthy, so channel changes are picked up.
    pub fn request_channel_update(&self) {
        self.update_requested.store(true, Ordering::Release);
    }

    // ---

    /// One health check.
    ///
    /// - Consuming disabled: clear the alert.
    /// - Not connected: raise the alert and reconnect.
    /// - Connected with a pending channel update: update.
    /// - Connected otherwise: clear the alert, record the healthy time.
    pub async fn tick(&self) {
        // ---
        let monitor = self.manager.monitor();

        let enabled = match self.manager.consumer_enabled() {
            Ok(enabled) => enabled,
            Err(e) => {
                tracing::warn!("watchdog: configuration unreadable: {e}");
                return;
            }
        };

        if !enabled {
            monitor.set_activated(false);
            return;
        }

        if !self.manager.is_open() {
            tracing::info!("watchdog: not connected, reconnecting");
            monitor.set_activated(true);
            self.manager.update().await;
            self.update_requested.store(false, Ordering::Release);
            return;
        }

        if self.update_requested.swap(false, Ordering::AcqRel) {
            tracing::info!("watchdog: channel update requested");
            self.manager.update().await;
        }
        monitor.set_activated(false);
        monitor.touch();
    }

    // ---

    /// Run ticks forever: first after `initial_delay`, then every
    /// [`ConnectionManager::watchdog_period`], re-read before each sleep.
    /// The task ends once the watchdog is dropped.
    pub fn spawn(self: &Arc<Self>, initial_delay: Duration) -> JoinHandle<()> {
        // ---
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                tokio::time::sleep(delay).await;

                let Some(watchdog) = weak.upgrade() else {
                    break;
                };
                if !watchdog.is_stopped() {
                    watchdog.tick().await;
                }
                delay = watchdog.manager.watchdog_period();
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::testing::{enabled_config, harness};

    #[tokio::test]
    async fn tick_reconnects_after_a_drop() {
        // ---
        let h = harness(enabled_config(&[("builds", "ci-1")]));
        let watchdog = Watchdog::new(Arc::clone(&h.manager));

        watchdog.tick().await;
        assert!(h.manager.is_open());
        assert!(!h.manager.monitor().is_activated());

        h.broker.drop_connections();
        tokio::time::timeout(Duration::from_secs(1), async {
            while h.manager.connection().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(h.manager.monitor().is_activated());
        assert!(!h.manager.is_open());

        watchdog.tick().await;
        assert!(h.manager.is_open());
        assert!(h.manager.channel_status("builds"));
        assert_eq!(h.broker.connect_count(), 2);

        // The next healthy tick clears the alert.
        watchdog.tick().await;
        assert!(!h.manager.monitor().is_activated());
    }

    // ---

    #[tokio::test]
    async fn disabled_consumer_clears_the_alert_without_connecting() {
        // ---
        let mut config = enabled_config(&[("builds", "ci-1")]);
        config.enable_consumer = false;
        let h = harness(config);
        h.manager.monitor().set_activated(true);

        let watchdog = Watchdog::new(Arc::clone(&h.manager));
        watchdog.tick().await;

        assert!(!h.manager.monitor().is_activated());
        assert_eq!(h.broker.connect_count(), 0);
    }

    // ---

    #[tokio::test]
    async fn requested_update_picks_up_new_queues() {
        // ---
        let h = harness(enabled_config(&[("A", "ci-1")]));
        let watchdog = Watchdog::new(Arc::clone(&h.manager));
        watchdog.tick().await;

        h.source.set(enabled_config(&[("A", "ci-1"), ("B", "ci-2")]));
        watchdog.tick().await;
        assert!(!h.manager.channel_status("B"));

        watchdog.request_channel_update();
        watchdog.tick().await;
        assert!(h.manager.channel_status("B"));
        assert_eq!(h.broker.connect_count(), 1);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_honours_stop_and_start() {
        // ---
        let h = harness(enabled_config(&[("builds", "ci-1")]));
        let watchdog = Watchdog::new(Arc::clone(&h.manager));
        watchdog.stop();
        let task = watchdog.spawn(Duration::from_secs(15));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.broker.connect_count(), 0);

        watchdog.start();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(h.manager.is_open());

        drop(watchdog);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(task.is_finished());
    }
}
