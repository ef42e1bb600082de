//! Per-candidate selection filter.
//!
//! The network stack calls [`DrainFilter::select`] once for every candidate
//! socket in a reuseport group, for every incoming packet or connection. It is
//! a pure rejection function: a draining candidate is dropped, everything else
//! passes. It does not know whether a candidate is the last one left; that
//! fallback belongs to whoever invokes it (see [`crate::group`]).
//!
//! `select` must stay constant-time and allocation-free, take no locks beyond
//! the store's own lookup, and never log.

use crate::identity::SocketId;
use crate::store::{DrainFlag, DrainStore};

/// Outcome for one candidate socket.
///
/// Discriminants match the kernel's `SK_DROP` / `SK_PASS` return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Verdict {
    /// Skip this candidate and try the next one.
    Drop = 0,
    /// The candidate may receive the new work.
    Pass = 1,
}

impl Verdict {
    pub const fn is_pass(self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// What the invoking network stack knows about the candidate under evaluation.
pub trait ReuseportContext {
    /// Identity of the candidate socket.
    fn socket_id(&self) -> SocketId;
}

impl ReuseportContext for SocketId {
    #[inline]
    fn socket_id(&self) -> SocketId {
        *self
    }
}

/// Rejects candidates whose socket is marked draining.
///
/// Read-only with respect to drain state: the control plane is the only
/// writer.
#[derive(Debug, Clone)]
pub struct DrainFilter<S> {
    store: S,
}

impl<S: DrainStore> DrainFilter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Decide whether the candidate described by `ctx` may be selected.
    #[inline]
    pub fn select<C: ReuseportContext + ?Sized>(&self, ctx: &C) -> Verdict {
        match self.store.lookup(ctx.socket_id()) {
            DrainFlag::Draining => Verdict::Drop,
            DrainFlag::Active => Verdict::Pass,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
