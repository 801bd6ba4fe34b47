//! One-shot stop signal shared between a component and its background loops.
//!
//! A `StopSignal` is the crossbeam rendering of "close a channel to broadcast":
//! the watch channel never carries a message, it only becomes disconnected when
//! the signal fires, so every `select!` arm waiting on it wakes at once.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct StopSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug)]
struct SignalInner {
    fired: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    watch: Receiver<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(SignalInner {
                fired: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
                watch: rx,
            }),
        }
    }

    /// Fire the signal. Returns true only for the call that actually fired it.
    pub fn trigger(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        drop(lock(&self.inner.trigger).take());
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once the signal fires.
    pub fn watch(&self) -> &Receiver<()> {
        &self.inner.watch
    }

    /// Sleep for up to `timeout`, waking early if the signal fires.
    ///
    /// Returns true when the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.watch.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_triggered(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
///
/// Every mutex in this crate guards plain handles or counters, which stay
/// consistent even when a holder panics.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
