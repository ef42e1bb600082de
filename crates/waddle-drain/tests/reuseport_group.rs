//! End-to-end drain selection over a real reuseport group.
//!
//! Binds several `SO_REUSEPORT` UDP sockets on one port, identifies them by
//! socket cookie, drains some through the controller, and checks which socket
//! the group hands new work to, including the all-draining fallback.
//!
//! Run with: `cargo test -p waddle-drain --test reuseport_group`

#![cfg(target_os = "linux")]

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use waddle_drain::{
    bind_reuseport_udp, socket_cookie, DrainController, DrainFilter, DrainFlag, DrainStore,
    EmptyWaitConfig, FallbackPolicy, LruDrainStore, ReuseportGroup, SocketId,
};

fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

struct Fixture {
    store: Arc<LruDrainStore>,
    controller: DrainController<Arc<LruDrainStore>>,
    group: ReuseportGroup<Arc<LruDrainStore>>,
    sockets: HashMap<SocketId, UdpSocket>,
    order: Vec<SocketId>,
}

fn bind_group(size: usize, fallback: FallbackPolicy) -> Fixture {
    let store = Arc::new(LruDrainStore::new());
    let controller = DrainController::new(Arc::clone(&store));
    let mut group = ReuseportGroup::new(DrainFilter::new(Arc::clone(&store)), fallback);

    let mut addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut sockets = HashMap::new();
    let mut order = Vec::new();
    for _ in 0..size {
        let socket = bind_reuseport_udp(addr).unwrap();
        addr = socket.local_addr().unwrap();
        let id = socket_cookie(&socket).unwrap();
        assert!(group.add(id));
        order.push(id);
        sockets.insert(id, socket);
    }

    Fixture {
        store,
        controller,
        group,
        sockets,
        order,
    }
}

const HASHES: [u32; 6] = [0, 1, 0x4000_0000, 0x8000_0000, 0xc000_0000, u32::MAX];

// =============================================================================
// Test: Draining members are never selected while an active one remains
// =============================================================================

#[test]
fn test_selection_skips_draining_sockets() {
    init_test();
    let fx = bind_group(3, FallbackPolicy::HashedCandidate);
    let (a, b, c) = (fx.order[0], fx.order[1], fx.order[2]);

    fx.controller
        .mark_socket_draining(&fx.sockets[&a])
        .unwrap();
    fx.controller
        .mark_socket_draining(&fx.sockets[&b])
        .unwrap();

    assert_eq!(fx.store.lookup(a), DrainFlag::Draining);
    assert_eq!(fx.store.lookup(b), DrainFlag::Draining);
    assert_eq!(fx.store.lookup(c), DrainFlag::Active);

    for hash in HASHES {
        let selection = fx.group.select(hash).unwrap();
        assert_eq!(selection.socket, c);
        assert!(!selection.fallback);
    }
}

// =============================================================================
// Test: All members draining still yields a usable socket (fail open)
// =============================================================================

#[test]
fn test_all_draining_fails_open_to_live_socket() {
    init_test();
    let fx = bind_group(3, FallbackPolicy::HashedCandidate);
    for id in &fx.order {
        fx.controller.mark_draining(*id);
    }

    for hash in HASHES {
        let selection = fx.group.select(hash).unwrap();
        assert!(selection.fallback);
        let socket = fx
            .sockets
            .get(&selection.socket)
            .expect("fallback picked a socket outside the group");
        assert_eq!(
            socket.local_addr().unwrap(),
            fx.sockets[&fx.order[0]].local_addr().unwrap()
        );
    }
}

#[test]
fn test_all_draining_reject_policy_selects_nothing() {
    init_test();
    let fx = bind_group(2, FallbackPolicy::Reject);
    for id in &fx.order {
        fx.controller.mark_draining(*id);
    }
    for hash in HASHES {
        assert_eq!(fx.group.select(hash), None);
    }
}

// =============================================================================
// Test: Rolling restart, old socket drains while a new one joins
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rolling_restart_hands_over_to_new_socket() {
    init_test();
    let mut fx = bind_group(1, FallbackPolicy::HashedCandidate);
    let old = fx.order[0];
    let addr = fx.sockets[&old].local_addr().unwrap();

    let new_socket = bind_reuseport_udp(addr).unwrap();
    let new = socket_cookie(&new_socket).unwrap();
    assert_ne!(old, new);
    fx.group.add(new);

    let report = fx
        .controller
        .drain_socket(&fx.sockets[&old], &EmptyWaitConfig::default())
        .await
        .unwrap();
    assert_eq!(report.socket, old);
    assert!(report.is_empty());

    for hash in HASHES {
        assert_eq!(fx.group.select(hash).unwrap().socket, new);
    }

    // The old process closes its socket and leaves the group.
    let old_socket = fx.sockets.remove(&old).unwrap();
    drop(old_socket);
    assert!(fx.group.remove(old));
    fx.controller.unmark_draining(old);
    assert!(fx.store.is_empty());
    assert_eq!(fx.group.select(7).unwrap().socket, new);
}

// =============================================================================
// Test: Evicting a draining entry reactivates its socket
// =============================================================================

#[test]
fn test_eviction_reactivates_draining_socket() {
    init_test();
    let store = Arc::new(LruDrainStore::with_capacity(2).unwrap());
    let controller = DrainController::new(Arc::clone(&store));
    let mut group = ReuseportGroup::new(
        DrainFilter::new(Arc::clone(&store)),
        FallbackPolicy::HashedCandidate,
    );

    let draining = SocketId::from_raw(1);
    let active = SocketId::from_raw(2);
    group.add(draining);
    group.add(active);

    controller.mark_draining(draining);
    assert_eq!(group.select(0).unwrap().socket, active);

    // Two unrelated sockets push the draining entry out.
    controller.mark_draining(SocketId::from_raw(100));
    controller.mark_draining(SocketId::from_raw(101));

    assert_eq!(store.lookup(draining), DrainFlag::Active);
    assert_eq!(group.select(0).unwrap().socket, draining);
    assert_eq!(
        store
            .metrics()
            .draining_evictions
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}
