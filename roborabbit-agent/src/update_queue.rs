//! [`UpdateQueue`]: coalescing trigger for [`ConnectionManager::update`].
//!
//! Reload signals can arrive faster than updates complete. The queue holds
//! at most one pending request; further requests while one is pending are
//! absorbed. Configuration is sampled when the update starts, so the single
//! pending update always sees the latest settings.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::ConnectionManager;

// ---------------------------------------------------------------------------
// UpdateQueue
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct UpdateQueue {
    // ---
    tx: mpsc::Sender<()>,
}

// ---

impl UpdateQueue {
    // ---
    /// Spawn the worker that runs queued updates one at a time. It exits
    /// when every queue handle is dropped or the manager is gone.
    pub fn spawn(manager: &Arc<ConnectionManager>) -> Self {
        // ---
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let manager: Weak<ConnectionManager> = Arc::downgrade(manager);

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.update().await;
            }
            tracing::debug!("update queue stopped");
        });

        Self { tx }
    }

    /// Queue an update. Returns `false` only if the worker has stopped.
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
