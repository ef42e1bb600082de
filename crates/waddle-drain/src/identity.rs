//! Socket identities used as drain-store keys.
//!
//! A [`SocketId`] must be unique among live sockets and must not be reused
//! while its socket exists. Kernel sockets get one from `SO_COOKIE`
//! (see [`crate::socket::socket_cookie`]); sockets created by an in-process
//! layer get one from a [`SocketIdAllocator`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque 64-bit handle identifying a live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    /// Wrap a raw identity value (for example a kernel socket cookie).
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 8-byte key as stored in the drain table.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for SocketId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Hands out process-unique identities that are never reused.
///
/// Zero is never returned, matching the kernel which never assigns a zero
/// cookie.
#[derive(Debug)]
pub struct SocketIdAllocator {
    next: AtomicU64,
}

impl SocketIdAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next identity.
    pub fn allocate(&self) -> SocketId {
        SocketId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SocketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
