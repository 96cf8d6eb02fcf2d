//! Session lifecycle tests: initialization, teardown, persistence, events

use meshspace_core::{
    ChangeOrigin, LocalIdentity, LoopbackHub, MemorySnapshotStore, RedbSnapshotStore, StoreEvent,
    User, WorkspaceConfig, WorkspaceStore,
};
use tempfile::TempDir;

fn make_store(hub: &LoopbackHub, username: &str) -> WorkspaceStore {
    WorkspaceStore::new(
        WorkspaceConfig::default(),
        Box::new(hub.transport()),
        Box::new(MemorySnapshotStore::new()),
        Box::new(LocalIdentity::with_user(User::new(username, None))),
    )
}

fn pump(a: &mut WorkspaceStore, b: &mut WorkspaceStore) {
    for _ in 0..4 {
        a.process_incoming().unwrap();
        b.process_incoming().unwrap();
    }
}

#[test]
fn test_snapshot_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let snapshots = RedbSnapshotStore::new(temp_dir.path().join("snapshots.redb")).unwrap();
    let hub = LoopbackHub::new();
    let user = User::new("ada", None);

    let channel = {
        let mut store = WorkspaceStore::new(
            WorkspaceConfig::default(),
            Box::new(hub.transport()),
            Box::new(snapshots.clone()),
            Box::new(LocalIdentity::with_user(user.clone())),
        );
        store.initialize().unwrap();
        let channel = store.create_channel("durable", "").unwrap();
        store
            .create_message(&channel.id, "persisted message", None)
            .unwrap();
        store.disconnect();
        channel
    };

    // A fresh session over the same durable store sees the history
    let mut store = WorkspaceStore::new(
        WorkspaceConfig::default(),
        Box::new(hub.transport()),
        Box::new(snapshots),
        Box::new(LocalIdentity::with_user(user)),
    );
    store.initialize().unwrap();

    assert_eq!(store.channels().unwrap().len(), 1);
    let messages = store.messages(&channel.id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "persisted message");
}

#[test]
fn test_offline_first_without_peers() {
    let hub = LoopbackHub::new();
    let mut store = make_store(&hub, "ada");
    store.initialize().unwrap();

    // No peers in the room; everything still works locally
    assert!(store.connected_peers().is_empty());
    let channel = store.create_channel("solo", "").unwrap();
    store.create_message(&channel.id, "talking to myself", None).unwrap();
    assert_eq!(store.messages(&channel.id).unwrap().len(), 1);
    assert_eq!(store.process_incoming().unwrap(), 0);
}

#[test]
fn test_reinitialize_after_disconnect() {
    let hub = LoopbackHub::new();
    let mut store = make_store(&hub, "ada");
    store.initialize().unwrap();
    store.create_channel("kept", "").unwrap();

    store.disconnect();
    assert!(!store.is_initialized());
    assert!(store.online_users().is_empty());

    store.initialize().unwrap();
    assert!(store.is_initialized());
    assert_eq!(store.channels().unwrap().len(), 1);
    assert_eq!(store.online_users().len(), 1);
}

#[test]
fn test_double_disconnect_is_idempotent() {
    let hub = LoopbackHub::new();
    let mut store = make_store(&hub, "ada");
    store.initialize().unwrap();

    store.disconnect();
    let channels_after_first = store.channels().unwrap();
    let initialized_after_first = store.is_initialized();

    store.disconnect();
    assert_eq!(store.channels().unwrap(), channels_after_first);
    assert_eq!(store.is_initialized(), initialized_after_first);
}

#[test]
fn test_local_changes_emit_events() {
    let hub = LoopbackHub::new();
    let mut store = make_store(&hub, "ada");
    store.initialize().unwrap();

    let mut events = store.subscribe();
    store.create_channel("design", "").unwrap();

    let mut saw_local_change = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (StoreEvent::DocumentChanged {
                origin: ChangeOrigin::Local,
            })
        {
            saw_local_change = true;
        }
    }
    assert!(saw_local_change);
}

#[test]
fn test_remote_changes_emit_events() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    let mut b = make_store(&hub, "grace");
    a.initialize().unwrap();
    b.initialize().unwrap();
    pump(&mut a, &mut b);

    let mut events = a.subscribe();
    b.create_channel("from-grace", "").unwrap();
    pump(&mut a, &mut b);

    let mut saw_remote_change = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (StoreEvent::DocumentChanged {
                origin: ChangeOrigin::Remote,
            })
        {
            saw_remote_change = true;
        }
    }
    assert!(saw_remote_change);
}

#[test]
fn test_peer_events_on_join_and_leave() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    a.initialize().unwrap();
    let mut events = a.subscribe();

    let mut b = make_store(&hub, "grace");
    b.initialize().unwrap();
    pump(&mut a, &mut b);
    b.disconnect();
    a.process_incoming().unwrap();

    let mut saw_join = false;
    let mut saw_leave = false;
    while let Ok(event) = events.try_recv() {
        match event {
            StoreEvent::PeerJoined { .. } => saw_join = true,
            StoreEvent::PeerLeft { .. } => saw_leave = true,
            _ => {}
        }
    }
    assert!(saw_join);
    assert!(saw_leave);
}

#[test]
fn test_presence_cleared_before_detach() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    let mut b = make_store(&hub, "grace");
    a.initialize().unwrap();
    b.initialize().unwrap();
    pump(&mut a, &mut b);

    // A third replica joining after b leaves must not see b's presence
    b.disconnect();
    let mut c = make_store(&hub, "joan");
    c.initialize().unwrap();
    pump(&mut a, &mut c);

    let online = c.online_users();
    assert_eq!(online.len(), 2); // ada and joan, no stale grace
}
