use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Coordination state shared by readers, writers, the growth path, and
/// the background flusher.
#[derive(Debug)]
pub struct MapState {
    // Set for the duration of a mapping growth. Writers that lose the
    // CAS spin-yield until it clears, then retry their attempt.
    resizing: AtomicBool,

    // Serializes publication: one mutation appends and updates the
    // metadata at a time.
    pub publish_lock: Mutex<()>,

    // Cleared by close(); operations check it on entry.
    opened: AtomicBool,

    // Durability signal with capacity 1; overflow is dropped because a
    // later write will signal again.
    flush_tx: mpsc::Sender<()>,
    shutdown_tx: broadcast::Sender<()>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl MapState {
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);

        (
            Self {
                resizing: AtomicBool::new(false),
                publish_lock: Mutex::new(()),
                opened: AtomicBool::new(true),
                flush_tx,
                shutdown_tx,
                flusher: Mutex::new(None),
            },
            flush_rx,
        )
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Transition to closed; true only for the first caller.
    pub fn close_once(&self) -> bool {
        self.opened.swap(false, Ordering::SeqCst)
    }

    pub fn is_resizing(&self) -> bool {
        self.resizing.load(Ordering::Acquire)
    }

    /// Claim the resize slot (returns a guard that releases it), or None
    /// when a growth is already in flight.
    pub fn try_begin_resize(&self) -> Option<ResizeGuard<'_>> {
        if self
            .resizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(ResizeGuard { state: self })
        } else {
            None
        }
    }

    /// Cooperative wait for an in-flight growth to finish.
    pub fn wait_while_resizing(&self) {
        while self.is_resizing() {
            std::thread::yield_now();
        }
    }

    /// Wake the durability worker; dropped when a flush is already queued.
    pub fn signal_flush(&self) {
        let _ = self.flush_tx.try_send(());
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn set_flusher(&self, handle: JoinHandle<()>) {
        *self.flusher.lock() = Some(handle);
    }

    pub fn take_flusher(&self) -> Option<JoinHandle<()>> {
        self.flusher.lock().take()
    }
}

/// RAII guard for the resize slot.
pub struct ResizeGuard<'a> {
    state: &'a MapState,
}

impl Drop for ResizeGuard<'_> {
    fn drop(&mut self) {
        self.state.resizing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_slot_is_exclusive() {
        let (state, _rx) = MapState::new();

        let guard = state.try_begin_resize().expect("Failed to claim resize slot");
        assert!(state.is_resizing());
        assert!(state.try_begin_resize().is_none());

        drop(guard);
        assert!(!state.is_resizing());
        assert!(state.try_begin_resize().is_some());
    }

    #[test]
    fn test_close_once() {
        let (state, _rx) = MapState::new();
        assert!(state.is_open());
        assert!(state.close_once());
        assert!(!state.close_once());
        assert!(!state.is_open());
    }

    #[test]
    fn test_flush_signal_overflow_is_dropped() {
        let (state, mut rx) = MapState::new();

        state.signal_flush();
        state.signal_flush();
        state.signal_flush();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
