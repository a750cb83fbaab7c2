//! Clock & Timer (base spec §2, 2% of the core): a monotonic periodic-tick
//! source that can be cancelled, plus a pluggable notion of "now" so the
//! pusher/remover interval logic in §4.4/§4.6 is testable without sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::closable::CloseSignal;

/// Wall-clock seconds. Abstracted so tests can advance time deterministically
/// instead of racing real sleeps.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        proxmox_time::epoch_i64()
    }
}

/// A clock tests can advance by hand.
pub struct FakeClock {
    now: AtomicI64,
}

impl FakeClock {
    pub fn new(start: i64) -> Self {
        FakeClock {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A periodic tick source, cancellable by racing against a [`CloseSignal`].
pub struct Ticker {
    interval: tokio::time::Interval,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Ticker { interval }
    }

    /// Waits for the next tick or for `close` to fire, whichever comes
    /// first. Returns `false` once closing, at which point the caller's
    /// loop should exit.
    pub async fn tick_or_close(&mut self, close: &mut CloseSignal) -> bool {
        tokio::select! {
            _ = self.interval.tick() => true,
            _ = close.wait_for_close() => false,
        }
    }
}
