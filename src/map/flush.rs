//! Background durability worker.
//!
//! Writers signal the worker after every successful publication; the
//! worker writes the whole mapping back. The signal channel has capacity
//! 1 and senders drop on overflow, which is safe because a subsequent
//! write signals again and `close()` always issues a final flush.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::state::MapState;
use crate::buffer::MmapBuffer;

pub(super) fn spawn(
    handle: &Handle,
    buffer: Arc<MmapBuffer>,
    state: Arc<MapState>,
    mut signal: mpsc::Receiver<()>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    handle.spawn(async move {
        loop {
            tokio::select! {
                received = signal.recv() => match received {
                    Some(()) => {
                        // Let an in-flight growth finish rather than
                        // queueing behind its exclusive lock.
                        while state.is_resizing() {
                            tokio::task::yield_now().await;
                        }

                        if let Err(e) = buffer.map().flush_all() {
                            tracing::error!(error = %e, "background flush failed");
                        }
                    }
                    None => break,
                },

                _ = shutdown.recv() => break,
            }
        }
    })
}
