use std::sync::Arc;

use tokio::sync::watch;

use roborabbit_domain::ShutdownSignal;

// ---

/// Shutdown watch shared between a handle and the tasks that may observe
/// its close (error callbacks, consumer pumps).
pub(crate) type SignalTx = Arc<watch::Sender<Option<ShutdownSignal>>>;

pub(crate) fn signal_tx() -> SignalTx {
    let (tx, _) = watch::channel(None);
    Arc::new(tx)
}

// ---

/// Publish `signal` unless a shutdown was already reported. The first
/// observer decides who initiated the close.
pub(crate) fn fire_once(tx: &SignalTx, signal: ShutdownSignal) -> bool {
    // ---
    tx.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(signal);
        true
    })
}

pub(crate) fn is_fired(tx: &SignalTx) -> bool {
    tx.borrow().is_some()
}
