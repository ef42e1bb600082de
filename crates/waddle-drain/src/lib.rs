//! # waddle-drain
//!
//! Drain-aware socket selection for `SO_REUSEPORT` groups, the piece of the
//! graceful-restart flow that stops a listener from receiving *new* work while
//! it finishes what it already has.
//!
//! ## Overview
//!
//! 1. The control plane ([`DrainController`]) marks a socket draining in a
//!    shared [`DrainStore`].
//! 2. For every incoming packet or connection, the [`DrainFilter`] is run
//!    against each candidate in the group and drops the draining ones.
//! 3. The invoking framework (here [`ReuseportGroup`]) picks the first passing
//!    candidate, or applies its [`FallbackPolicy`] when none pass.
//! 4. The draining process waits for its receive queue to empty and then
//!    closes the socket on its own schedule.
//!
//! Drain is best effort: a missing entry means active, and the bounded table
//! evicts its least recently used entry when full, which reactivates that
//! socket.
//!
//! ## Environment Variables
//!
//! See [`DrainConfig::from_env`].

pub mod config;
pub mod control;
pub mod error;
pub mod filter;
pub mod group;
pub mod identity;
pub mod store;

#[cfg(unix)]
pub mod socket;

pub use config::DrainConfig;
pub use control::{DrainController, DrainReport};
pub use error::DrainError;
pub use filter::{DrainFilter, ReuseportContext, Verdict};
pub use group::{FallbackPolicy, ReuseportGroup, Selection};
pub use identity::{SocketId, SocketIdAllocator};
pub use store::{
    DrainFlag, DrainStore, FailOpen, FallibleDrainStore, LruDrainStore, StoreMetrics, TableLayout,
    DEFAULT_CAPACITY,
};

#[cfg(unix)]
pub use socket::{
    bind_reuseport_tcp, bind_reuseport_udp, pending_bytes, socket_cookie, wait_until_empty,
    EmptyWaitConfig,
};
