//! Deadline governor: a one-shot watchdog that forcibly terminates a
//! running guest when its time budget elapses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A single cancellable deadline attached to one unit.
///
/// The watchdog thread waits on a cancellation channel for at most the
/// deadline duration. If the deadline elapses first it records that it
/// fired and bumps the engine epoch, trapping the guest at its next epoch
/// check; this is the only forced-termination path in the system. If it is
/// cancelled first (explicitly, or by the timer being dropped) it exits
/// without firing, and can never fire afterwards. The thread terminates in
/// either case, so an abandoned timer holds no resources past the deadline.
///
/// Callers must install the store's epoch deadline before arming; a timer
/// that fires before the deadline is installed would bump the epoch past
/// the value the store later waits for, and the interrupt would be lost.
pub(crate) struct DeadlineTimer {
    cancel: Sender<()>,
    fired: Arc<AtomicBool>,
}

impl DeadlineTimer {
    pub(crate) fn arm(engine: wasmtime::Engine, timeout: Duration) -> std::io::Result<Self> {
        let fired = Arc::new(AtomicBool::new(false));
        let (cancel, watch) = mpsc::channel::<()>();
        let flag = fired.clone();

        thread::Builder::new()
            .name("wasi-worker-deadline".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = watch.recv_timeout(timeout) {
                    log::info!("deadline of {timeout:?} elapsed, terminating guest");
                    flag.store(true, Ordering::SeqCst);
                    engine.increment_epoch();
                }
            })?;

        Ok(Self { cancel, fired })
    }

    /// Cancels the pending deadline. Harmless if the deadline already fired.
    pub(crate) fn cancel(&self) {
        let _ = self.cancel.send(());
    }

    /// Whether the deadline fired before being cancelled.
    pub(crate) fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch_engine() -> wasmtime::Engine {
        let mut config = wasmtime::Config::new();
        config.epoch_interruption(true);
        wasmtime::Engine::new(&config).unwrap()
    }

    #[test]
    fn fires_once_the_deadline_elapses() {
        let timer = DeadlineTimer::arm(epoch_engine(), Duration::from_millis(5)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !timer.fired() {
            assert!(std::time::Instant::now() < deadline, "timer never fired");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn a_zero_deadline_fires_immediately() {
        let timer = DeadlineTimer::arm(epoch_engine(), Duration::ZERO).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !timer.fired() {
            assert!(std::time::Instant::now() < deadline, "timer never fired");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn a_cancelled_timer_never_fires() {
        let timer = DeadlineTimer::arm(epoch_engine(), Duration::from_millis(20)).unwrap();
        timer.cancel();
        thread::sleep(Duration::from_millis(100));
        assert!(!timer.fired());
    }

    #[test]
    fn dropping_the_timer_cancels_it() {
        let fired = {
            let timer = DeadlineTimer::arm(epoch_engine(), Duration::from_millis(20)).unwrap();
            timer.fired.clone()
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
