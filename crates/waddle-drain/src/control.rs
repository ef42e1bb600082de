//! Control-plane side of draining: the only writer of drain flags.
//!
//! A process that is shutting down (or handing its listeners to a new
//! process) marks each of its reuseport sockets draining, waits for the
//! already-queued work to be consumed, and then closes the socket itself.
//! Closing is left to the caller.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, warn};

use crate::identity::SocketId;
use crate::store::{DrainFlag, DrainStore};

#[cfg(unix)]
use std::os::fd::AsFd;
#[cfg(unix)]
use tracing::instrument;

#[cfg(unix)]
use crate::error::DrainError;
#[cfg(unix)]
use crate::socket::{socket_cookie, wait_until_empty, EmptyWaitConfig};

/// Outcome of [`DrainController::drain_socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub socket: SocketId,
    /// Bytes still queued when polling stopped (a lower bound).
    pub remaining_bytes: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.remaining_bytes == 0
    }
}

/// Sets and clears drain flags in a [`DrainStore`].
#[derive(Debug)]
pub struct DrainController<S> {
    store: S,
    marked: AtomicU64,
}

impl<S: DrainStore> DrainController<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            marked: AtomicU64::new(0),
        }
    }

    /// Stop routing new work to `id`. Idempotent.
    pub fn mark_draining(&self, id: SocketId) {
        self.store.set(id, DrainFlag::Draining);
        self.marked.fetch_add(1, Ordering::Relaxed);
        info!(socket = %id, "Marked socket draining");
    }

    /// Make `id` selectable again. A no-op for unknown sockets.
    pub fn unmark_draining(&self, id: SocketId) {
        self.store.clear(id);
        info!(socket = %id, "Cleared socket drain flag");
    }

    pub fn is_draining(&self, id: SocketId) -> bool {
        self.store.lookup(id).is_draining()
    }

    /// Number of `mark_draining` calls made through this controller.
    pub fn marked_count(&self) -> u64 {
        self.marked.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[cfg(unix)]
impl<S: DrainStore> DrainController<S> {
    /// Mark a live kernel socket draining, using its `SO_COOKIE` identity.
    pub fn mark_socket_draining<F: AsFd>(&self, socket: &F) -> Result<SocketId, DrainError> {
        let id = socket_cookie(socket)?;
        self.mark_draining(id);
        Ok(id)
    }

    /// Mark `socket` draining, then wait for its receive queue to empty.
    ///
    /// Leftover bytes are reported, not treated as an error: the caller still
    /// decides when to close the socket.
    #[instrument(skip(self, socket, config), name = "drain.socket")]
    pub async fn drain_socket<F: AsFd>(
        &self,
        socket: &F,
        config: &EmptyWaitConfig,
    ) -> Result<DrainReport, DrainError> {
        let id = self.mark_socket_draining(socket)?;
        let remaining_bytes = wait_until_empty(socket, config).await?;

        if remaining_bytes > 0 {
            warn!(socket = %id, remaining_bytes, "Socket still has queued data after drain wait");
        } else {
            info!(socket = %id, "Socket drained");
        }

        Ok(DrainReport {
            socket: id,
            remaining_bytes,
        })
    }
}
