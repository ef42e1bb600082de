//! In-process reuseport group: runs the drain filter over the members of one
//! group and applies a fallback when every member is rejected.
//!
//! The start index comes from the packet/flow hash the same way the kernel
//! picks a reuseport socket (`reciprocal_scale`), then candidates are tried in
//! ring order. Each member is evaluated at most once per selection.

use std::str::FromStr;

use tracing::debug;

use crate::error::DrainError;
use crate::filter::{DrainFilter, Verdict};
use crate::identity::SocketId;
use crate::store::DrainStore;

/// What to do when every member of the group is draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Fail open to the member the hash pointed at.
    #[default]
    HashedCandidate,
    /// Fail open to the oldest member of the group.
    FirstCandidate,
    /// Select nothing; the unit of work is dropped.
    Reject,
}

impl FromStr for FallbackPolicy {
    type Err = DrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hashed" | "hash" | "hashed-candidate" => Ok(FallbackPolicy::HashedCandidate),
            "first" | "first-candidate" => Ok(FallbackPolicy::FirstCandidate),
            "reject" | "drop" => Ok(FallbackPolicy::Reject),
            _ => Err(DrainError::InvalidConfig {
                key: "fallback policy",
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackPolicy::HashedCandidate => write!(f, "hashed"),
            FallbackPolicy::FirstCandidate => write!(f, "first"),
            FallbackPolicy::Reject => write!(f, "reject"),
        }
    }
}

/// The socket chosen for one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub socket: SocketId,
    /// Position of `socket` in the group.
    pub index: usize,
    /// True when every member was draining and the fallback policy chose.
    pub fallback: bool,
}

/// Map a 32-bit hash onto `[0, n)` without a division, as the kernel does.
#[inline]
pub fn reciprocal_scale(hash: u32, n: usize) -> usize {
    ((u64::from(hash) * n as u64) >> 32) as usize
}

/// Sockets sharing one listening address, in bind order.
#[derive(Debug)]
pub struct ReuseportGroup<S> {
    filter: DrainFilter<S>,
    members: Vec<SocketId>,
    fallback: FallbackPolicy,
}

impl<S: DrainStore> ReuseportGroup<S> {
    pub fn new(filter: DrainFilter<S>, fallback: FallbackPolicy) -> Self {
        Self {
            filter,
            members: Vec::new(),
            fallback,
        }
    }

    /// Add a member. Returns `false` if it was already in the group.
    pub fn add(&mut self, id: SocketId) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        self.members.push(id);
        debug!(socket = %id, members = self.members.len(), "Socket joined reuseport group");
        true
    }

    /// Remove a member (its socket closed). Returns `false` if absent.
    pub fn remove(&mut self, id: SocketId) -> bool {
        match self.members.iter().position(|m| *m == id) {
            Some(pos) => {
                self.members.remove(pos);
                debug!(socket = %id, members = self.members.len(), "Socket left reuseport group");
                true
            }
            None => false,
        }
    }

    pub fn members(&self) -> &[SocketId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn fallback(&self) -> FallbackPolicy {
        self.fallback
    }

    pub fn filter(&self) -> &DrainFilter<S> {
        &self.filter
    }

    /// Pick a member for a unit of work whose flow hash is `hash`.
    ///
    /// Returns `None` for an empty group, or when every member is draining
    /// and the policy is [`FallbackPolicy::Reject`].
    pub fn select(&self, hash: u32) -> Option<Selection> {
        let n = self.members.len();
        if n == 0 {
            return None;
        }

        let start = reciprocal_scale(hash, n);
        for offset in 0..n {
            let index = (start + offset) % n;
            let socket = self.members[index];
            if self.filter.select(&socket) == Verdict::Pass {
                return Some(Selection {
                    socket,
                    index,
                    fallback: false,
                });
            }
        }

        let index = match self.fallback {
            FallbackPolicy::HashedCandidate => start,
            FallbackPolicy::FirstCandidate => 0,
            FallbackPolicy::Reject => return None,
        };
        Some(Selection {
            socket: self.members[index],
            index,
            fallback: true,
        })
    }
}
