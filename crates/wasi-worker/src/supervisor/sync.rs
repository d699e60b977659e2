//! One-shot synchronization cell used to publish a unit's outcome.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A cell that can be written at most once and waited on (with or without a
/// timeout) for that single value. The first write wins; later writes are
/// rejected. Readers get clones, so the writer never blocks on consumers.
pub struct OutcomeCell<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    slot: Mutex<Option<T>>,
    cvar: Condvar,
}

impl<T> Default for OutcomeCell<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                cvar: Condvar::new(),
            }),
        }
    }
}

impl<T> Clone for OutcomeCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> OutcomeCell<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a value. Returns the rejected value if the cell was
    /// already written.
    pub fn set(&self, value: T) -> Result<(), T> {
        let mut slot = self.inner.slot.lock().unwrap();
        if slot.is_some() {
            return Err(value);
        }
        *slot = Some(value);
        self.inner.cvar.notify_all();
        Ok(())
    }

    pub fn get(&self) -> Option<T> {
        self.inner.slot.lock().unwrap().clone()
    }

    /// Blocks until the cell is written.
    pub fn wait(&self) -> T {
        let slot = self.inner.slot.lock().unwrap();
        let slot = self
            .inner
            .cvar
            .wait_while(slot, |slot| slot.is_none())
            .unwrap();
        slot.clone().unwrap()
    }

    /// Blocks until the cell is written or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let slot = self.inner.slot.lock().unwrap();
        if timeout.is_zero() {
            return slot.clone();
        }
        let (slot, _) = self
            .inner
            .cvar
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap();
        slot.clone()
    }

    /// Returns a guard that, when dropped, publishes the result of `f` if
    /// the cell is still empty. Used to guarantee a value is delivered even
    /// if the publishing thread unwinds.
    pub fn publish_on_drop<F: FnOnce() -> T>(&self, f: F) -> PublishGuard<T, F> {
        PublishGuard {
            cell: self.clone(),
            f: Some(f),
        }
    }
}

pub struct PublishGuard<T: Clone, F: FnOnce() -> T> {
    cell: OutcomeCell<T>,
    f: Option<F>,
}

impl<T: Clone, F: FnOnce() -> T> Drop for PublishGuard<T, F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            let _ = self.cell.set(f());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::OutcomeCell;

    #[test]
    fn set_then_wait() {
        let cell = OutcomeCell::new();
        cell.set(7).unwrap();
        assert_eq!(cell.wait(), 7);
        assert_eq!(cell.get(), Some(7));
    }

    #[test]
    fn first_write_wins() {
        let cell = OutcomeCell::new();
        assert_eq!(cell.set(1), Ok(()));
        assert_eq!(cell.set(2), Err(2));
        assert_eq!(cell.wait(), 1);
    }

    #[test]
    fn wait_blocks_until_written() {
        let cell = OutcomeCell::new();
        let writer = cell.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let _ = writer.set("done");
        });
        assert_eq!(cell.wait(), "done");
    }

    #[test]
    fn wait_timeout_on_empty_cell() {
        let cell = OutcomeCell::<i32>::new();
        assert_eq!(cell.wait_timeout(Duration::ZERO), None);
        assert_eq!(cell.wait_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn wait_timeout_on_written_cell() {
        let cell = OutcomeCell::new();
        cell.set(3).unwrap();
        assert_eq!(cell.wait_timeout(Duration::ZERO), Some(3));
        assert_eq!(cell.wait_timeout(Duration::from_secs(1)), Some(3));
    }

    #[test]
    fn guard_publishes_when_nothing_else_did() {
        let cell = OutcomeCell::new();
        {
            let _guard = cell.publish_on_drop(|| 9);
        }
        assert_eq!(cell.wait(), 9);
    }

    #[test]
    fn guard_defers_to_an_explicit_publish() {
        let cell = OutcomeCell::new();
        {
            let _guard = cell.publish_on_drop(|| 9);
            cell.set(4).unwrap();
        }
        assert_eq!(cell.wait(), 4);
    }

    #[test]
    fn guard_publishes_on_unwind() {
        let cell = OutcomeCell::new();
        let publisher = cell.clone();
        let handle = thread::spawn(move || {
            let _guard = publisher.publish_on_drop(|| "unwound");
            panic!("runner died");
        });
        assert!(handle.join().is_err());
        assert_eq!(cell.wait(), "unwound");
    }
}
