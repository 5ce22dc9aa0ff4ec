//! Weakly held subscriber lists and shutdown-signal helpers shared by the
//! channel and connection handles.

use std::sync::{Arc, RwLock, Weak};

use roborabbit_domain::{ShutdownRx, ShutdownSignal};

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Subscribers of one handle's lifecycle events.
///
/// Entries are weak: a listener that has been dropped is skipped and pruned
/// on the next mutation. Notification iterates a [`snapshot`](Self::snapshot),
/// so listeners may add or remove themselves while being notified.
pub struct Listeners<L: ?Sized> {
    // ---
    inner: RwLock<Vec<Weak<L>>>,
}

// ---

impl<L: ?Sized> Listeners<L> {
    // ---
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }

    // ---

    pub fn add(&self, listener: &Arc<L>) {
        // ---
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        guard.retain(|w| w.strong_count() > 0);

        let weak = Arc::downgrade(listener);
        if !guard.iter().any(|w| Weak::ptr_eq(w, &weak)) {
            guard.push(weak);
        }
    }

    pub fn remove(&self, listener: &Arc<L>) {
        // ---
        let weak = Arc::downgrade(listener);
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        guard.retain(|w| w.strong_count() > 0 && !Weak::ptr_eq(w, &weak));
    }

    // ---

    /// Live listeners at the time of the call.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Shutdown signals
// ---------------------------------------------------------------------------

/// Wait for the signal carried by `rx`.
///
/// `None` when the broker object was dropped without ever signalling; its
/// owner has already let go of it and there is nothing to react to.
pub async fn next_shutdown(mut rx: ShutdownRx) -> Option<ShutdownSignal> {
    // ---
    let signal = match rx.wait_for(Option::is_some).await {
        Ok(signal) => (*signal).clone(),
        Err(_) => None,
    };
    signal
}

/// The signal already raised on `rx`, if any.
pub fn pending_shutdown(rx: &ShutdownRx) -> Option<ShutdownSignal> {
    rx.borrow().clone()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
