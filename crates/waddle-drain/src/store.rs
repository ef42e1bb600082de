//! Drain state store: a bounded, LRU-evicting table of socket drain flags.
//!
//! The control plane writes flags; selection filters read them once per
//! candidate per incoming packet or connection. An absent key reads as
//! [`DrainFlag::Active`], so evicting an entry silently reactivates its
//! socket. Drain is best effort, not a barrier.
//!
//! # Concurrency
//!
//! [`LruDrainStore`] keeps entries in a `DashMap`. Each slot holds its flag in
//! an `AtomicU8` and its recency stamp in an `AtomicU64`, so a lookup only
//! needs the shard read lock: it never waits on the writer lock, and a read
//! racing a write observes either the old or the new flag. Inserting a new key
//! is the only operation that serializes writers, which keeps the capacity
//! bound exact.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::DrainError;
use crate::identity::SocketId;

/// Default number of entries in the drain table.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Drain status of a single socket.
///
/// Stored as one byte. Any raw value other than [`DrainFlag::Draining`]
/// decodes as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DrainFlag {
    /// Eligible for new work. Equivalent to "no entry".
    #[default]
    Active = 0,
    /// Finishing in-flight work; must not be selected for new work.
    Draining = 1,
}

const _: () = assert!(std::mem::size_of::<DrainFlag>() == 1);
const _: () = assert!(std::mem::size_of::<u64>() == 8);

impl DrainFlag {
    /// Decode a raw table value.
    pub const fn from_raw(raw: u8) -> Self {
        if raw == DrainFlag::Draining as u8 {
            DrainFlag::Draining
        } else {
            DrainFlag::Active
        }
    }

    /// The raw byte written to the table.
    pub const fn as_raw(self) -> u8 {
        self as u8
    }

    pub const fn is_draining(self) -> bool {
        matches!(self, DrainFlag::Draining)
    }
}

impl std::fmt::Display for DrainFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrainFlag::Active => write!(f, "active"),
            DrainFlag::Draining => write!(f, "draining"),
        }
    }
}

/// Layout of the drain table when it is shared with other processes.
///
/// Cooperating processes agree on this layout; the transport that actually
/// shares the table lives outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    /// Table name.
    pub name: &'static str,
    /// Maximum number of entries.
    pub capacity: usize,
    /// Key size in bytes (a [`SocketId`]).
    pub key_size: usize,
    /// Value size in bytes (a [`DrainFlag`]).
    pub value_size: usize,
    /// Conventional pin location on a BPF filesystem.
    pub pin_path: &'static str,
}

impl TableLayout {
    pub const DRAINING_SOCKETS: TableLayout = TableLayout {
        name: "draining_sockets",
        capacity: DEFAULT_CAPACITY,
        key_size: std::mem::size_of::<u64>(),
        value_size: std::mem::size_of::<DrainFlag>(),
        pin_path: "/sys/fs/bpf/draining_sockets",
    };
}

/// A concurrent drain-flag table.
///
/// `lookup` is total and must not block on writers. `set` and `clear` are
/// idempotent; `clear` on a missing key is a no-op.
pub trait DrainStore: Send + Sync {
    /// Record `flag` for `id`.
    fn set(&self, id: SocketId, flag: DrainFlag);

    /// Remove any entry for `id`, reverting it to active.
    fn clear(&self, id: SocketId);

    /// Current flag for `id`; absent keys are active.
    fn lookup(&self, id: SocketId) -> DrainFlag;
}

impl<S: DrainStore + ?Sized> DrainStore for Arc<S> {
    fn set(&self, id: SocketId, flag: DrainFlag) {
        (**self).set(id, flag)
    }

    fn clear(&self, id: SocketId) {
        (**self).clear(id)
    }

    fn lookup(&self, id: SocketId) -> DrainFlag {
        (**self).lookup(id)
    }
}

impl<S: DrainStore + ?Sized> DrainStore for &S {
    fn set(&self, id: SocketId, flag: DrainFlag) {
        (**self).set(id, flag)
    }

    fn clear(&self, id: SocketId) {
        (**self).clear(id)
    }

    fn lookup(&self, id: SocketId) -> DrainFlag {
        (**self).lookup(id)
    }
}

/// Write-side counters for a [`LruDrainStore`].
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// New keys inserted.
    pub inserts: AtomicU64,
    /// Writes to keys that already had an entry.
    pub updates: AtomicU64,
    /// Explicit removals that found an entry.
    pub clears: AtomicU64,
    /// Entries removed to make room.
    pub evictions: AtomicU64,
    /// Evicted entries that were still draining.
    pub draining_evictions: AtomicU64,
}

impl StoreMetrics {
    fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    fn record_clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self, flag: DrainFlag) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        if flag.is_draining() {
            self.draining_evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total evictions so far.
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

struct Slot {
    flag: AtomicU8,
    last_access: AtomicU64,
}

impl Slot {
    fn new(flag: DrainFlag, stamp: u64) -> Self {
        Self {
            flag: AtomicU8::new(flag.as_raw()),
            last_access: AtomicU64::new(stamp),
        }
    }

    fn flag(&self) -> DrainFlag {
        DrainFlag::from_raw(self.flag.load(Ordering::Acquire))
    }

    fn touch(&self, stamp: u64) {
        // Concurrent touches may land out of order; keep the newest.
        self.last_access.fetch_max(stamp, Ordering::Relaxed);
    }
}

/// Bounded drain table with least-recently-used eviction.
///
/// Both `lookup` and `set` count as an access. `peek` and `snapshot` do not.
pub struct LruDrainStore {
    entries: DashMap<SocketId, Slot>,
    capacity: usize,
    clock: AtomicU64,
    insert_lock: Mutex<()>,
    metrics: StoreMetrics,
}

impl LruDrainStore {
    /// Create a store with [`DEFAULT_CAPACITY`] entries.
    pub fn new() -> Self {
        Self::build(DEFAULT_CAPACITY)
    }

    /// Create a store holding at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Result<Self, DrainError> {
        if capacity == 0 {
            return Err(DrainError::InvalidCapacity(capacity));
        }
        Ok(Self::build(capacity))
    }

    fn build(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            clock: AtomicU64::new(0),
            insert_lock: Mutex::new(()),
            metrics: StoreMetrics::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Read the flag for `id` without refreshing its recency.
    pub fn peek(&self, id: SocketId) -> Option<DrainFlag> {
        self.entries.get(&id).map(|slot| slot.flag())
    }

    /// All entries currently held, ordered by identity.
    pub fn snapshot(&self) -> Vec<(SocketId, DrainFlag)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().flag()))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn update_existing(&self, id: SocketId, flag: DrainFlag) -> bool {
        match self.entries.get(&id) {
            Some(slot) => {
                slot.flag.store(flag.as_raw(), Ordering::Release);
                slot.touch(self.tick());
                self.metrics.record_update();
                true
            }
            None => false,
        }
    }

    /// The entry with the oldest access stamp, and that stamp.
    fn lru_candidate(&self) -> Option<(SocketId, u64)> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().last_access.load(Ordering::Relaxed)))
            .min_by_key(|(_, stamp)| *stamp)
    }

    /// Remove `id` only if it has not been accessed since it was stamped `seen`.
    fn evict_if_unchanged(&self, id: SocketId, seen: u64) -> Option<DrainFlag> {
        let (id, slot) = self
            .entries
            .remove_if(&id, |_, slot| slot.last_access.load(Ordering::Relaxed) == seen)?;
        let flag = slot.flag();
        self.metrics.record_eviction(flag);
        if flag.is_draining() {
            warn!(
                socket = %id,
                "Evicted draining socket from full drain table; it is selectable again"
            );
        } else {
            debug!(socket = %id, "Evicted least recently used drain entry");
        }
        Some(flag)
    }

    /// Remove the least-recently-used entry. Caller holds `insert_lock`.
    ///
    /// Returns `false` only when the table is empty. A candidate that was
    /// accessed or cleared after the scan is left alone, and the caller
    /// rescans.
    fn evict_lru(&self) -> bool {
        match self.lru_candidate() {
            Some((victim, seen)) => {
                self.evict_if_unchanged(victim, seen);
                true
            }
            None => false,
        }
    }
}

impl Default for LruDrainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LruDrainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruDrainStore")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl DrainStore for LruDrainStore {
    fn set(&self, id: SocketId, flag: DrainFlag) {
        if self.update_existing(id, flag) {
            return;
        }

        let _guard = self
            .insert_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Another writer may have inserted it while we waited.
        if self.update_existing(id, flag) {
            return;
        }

        while self.entries.len() >= self.capacity {
            if !self.evict_lru() {
                break;
            }
        }

        self.entries.insert(id, Slot::new(flag, self.tick()));
        self.metrics.record_insert();
    }

    fn clear(&self, id: SocketId) {
        if self.entries.remove(&id).is_some() {
            self.metrics.record_clear();
        }
    }

    #[inline]
    fn lookup(&self, id: SocketId) -> DrainFlag {
        match self.entries.get(&id) {
            Some(slot) => {
                // The newest entry keeps its stamp; skip the shared clock.
                if slot.last_access.load(Ordering::Relaxed) < self.clock.load(Ordering::Relaxed) {
                    slot.touch(self.tick());
                }
                slot.flag()
            }
            None => DrainFlag::Active,
        }
    }
}

/// A drain table whose operations can fail, such as one reached through a
/// cross-process transport.
pub trait FallibleDrainStore: Send + Sync {
    fn try_set(&self, id: SocketId, flag: DrainFlag) -> Result<(), DrainError>;

    fn try_clear(&self, id: SocketId) -> Result<(), DrainError>;

    fn try_lookup(&self, id: SocketId) -> Result<DrainFlag, DrainError>;
}

/// Adapts a [`FallibleDrainStore`] into a total [`DrainStore`].
///
/// A failed lookup reads as [`DrainFlag::Active`]: an unreachable table must
/// never stop a socket from receiving work. Lookup failures are counted, not
/// logged, since they happen on the selection path.
#[derive(Debug)]
pub struct FailOpen<S> {
    inner: S,
    lookup_failures: AtomicU64,
}

impl<S: FallibleDrainStore> FailOpen<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            lookup_failures: AtomicU64::new(0),
        }
    }

    /// Number of lookups that failed and were treated as active.
    pub fn lookup_failures(&self) -> u64 {
        self.lookup_failures.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: FallibleDrainStore> DrainStore for FailOpen<S> {
    fn set(&self, id: SocketId, flag: DrainFlag) {
        if let Err(e) = self.inner.try_set(id, flag) {
            warn!(socket = %id, %flag, error = %e, "Failed to write drain flag");
        }
    }

    fn clear(&self, id: SocketId) {
        if let Err(e) = self.inner.try_clear(id) {
            warn!(socket = %id, error = %e, "Failed to clear drain flag");
        }
    }

    #[inline]
    fn lookup(&self, id: SocketId) -> DrainFlag {
        match self.inner.try_lookup(id) {
            Ok(flag) => flag,
            Err(_) => {
                self.lookup_failures.fetch_add(1, Ordering::Relaxed);
                DrainFlag::Active
            }
        }
    }
}
