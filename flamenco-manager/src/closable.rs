//! Reusable start/stop lifecycle primitive (base spec §2 "Closable", §9
//! "dedicated lifecycle primitive").
//!
//! Grounded on the shutdown-signaling idiom in `proxmox-daemon`'s process
//! state (`tokio::sync::watch` carrying a boolean, with a future that
//! resolves once the flag flips) but scoped to a single component instance
//! rather than the whole process: every background loop in this crate
//! (scheduler's upstream kicker, pusher, worker remover) owns one.

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handed to a background loop; `wait_for_close()` resolves once `Closable`
/// asks it to shut down.
#[derive(Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    pub fn is_closing(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `close()` has been called. Safe to call from a
    /// `tokio::select!` alongside the loop's own timer/recv arms.
    pub async fn wait_for_close(&mut self) {
        let _ = self.rx.wait_for(|closing| *closing).await;
    }
}

/// Owns a background task's shutdown signal and join handle. Calling
/// `close()` signals the loop and blocks until it (and anything it spawned
/// and is tracked via the returned handle) has finished — "`Close()` to
/// signal shutdown and block until all background work has finished."
pub struct Closable {
    tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Closable {
    /// `spawn` receives a [`CloseSignal`] and returns the future that
    /// becomes this component's background loop.
    pub fn spawn<F, Fut>(spawn: F) -> Self
    where
        F: FnOnce(CloseSignal) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        let signal = CloseSignal { rx };
        let handle = tokio::spawn(spawn(signal));
        Closable {
            tx,
            handle: Some(handle),
        }
    }

    /// Signal shutdown and wait for the loop to finish. Idempotent; a
    /// second call is a no-op.
    pub async fn close(&mut self) {
        let _ = self.tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background loop panicked during shutdown");
            }
        }
    }
}

impl Drop for Closable {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}
