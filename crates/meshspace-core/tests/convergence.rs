//! Multi-replica convergence tests over the loopback transport
//!
//! Two independent sessions share a LoopbackHub room and exchange document
//! deltas and presence. After pumping both drive cycles, every projection
//! (channels, messages, threads, presence rosters) must be identical on
//! both replicas regardless of who wrote what.

use meshspace_core::{
    ChannelId, LocalIdentity, LoopbackHub, MemorySnapshotStore, User, WorkspaceConfig,
    WorkspaceStore,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn make_store(hub: &LoopbackHub, username: &str) -> WorkspaceStore {
    init_tracing();
    WorkspaceStore::new(
        WorkspaceConfig::default(),
        Box::new(hub.transport()),
        Box::new(MemorySnapshotStore::new()),
        Box::new(LocalIdentity::with_user(User::new(username, None))),
    )
}

/// Drain both replicas until queued deltas and catch-up broadcasts settle
fn pump(a: &mut WorkspaceStore, b: &mut WorkspaceStore) {
    for _ in 0..4 {
        a.process_incoming().unwrap();
        b.process_incoming().unwrap();
    }
}

#[test]
fn test_channel_and_messages_propagate() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    let mut b = make_store(&hub, "grace");
    a.initialize().unwrap();
    b.initialize().unwrap();
    pump(&mut a, &mut b);

    let channel = a.create_channel("design", "Design talk").unwrap();
    pump(&mut a, &mut b);

    let on_b = b.channel(&channel.id).unwrap().unwrap();
    assert_eq!(on_b.name, "design");

    b.create_message(&channel.id, "hello from grace", None)
        .unwrap();
    pump(&mut a, &mut b);

    let on_a = a.messages(&channel.id).unwrap();
    assert_eq!(on_a.len(), 1);
    assert_eq!(on_a[0].text, "hello from grace");
}

#[test]
fn test_late_joiner_catches_up() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    a.initialize().unwrap();

    let channel = a.create_channel("design", "").unwrap();
    let root = a.create_message(&channel.id, "early message", None).unwrap();
    a.create_message(&channel.id, "a reply", Some(&root.id))
        .unwrap();

    // Joins after the history exists; the catch-up broadcast fills it in
    let mut b = make_store(&hub, "grace");
    b.initialize().unwrap();
    pump(&mut a, &mut b);

    assert_eq!(b.channels().unwrap().len(), 1);
    assert_eq!(b.messages(&channel.id).unwrap().len(), 1);
    assert_eq!(
        b.thread_messages(&root.id, Some(&channel.id)).unwrap().len(),
        1
    );
}

#[test]
fn test_concurrent_writes_converge_identically() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    let mut b = make_store(&hub, "grace");
    a.initialize().unwrap();
    b.initialize().unwrap();
    pump(&mut a, &mut b);

    // Both replicas write before seeing each other's changes
    let ch_a = a.create_channel("from-ada", "").unwrap();
    let ch_b = b.create_channel("from-grace", "").unwrap();
    a.create_message(&ch_a.id, "ada says hi", None).unwrap();
    b.create_message(&ch_b.id, "grace says hi", None).unwrap();

    pump(&mut a, &mut b);

    let channels_a = a.channels().unwrap();
    let channels_b = b.channels().unwrap();
    assert_eq!(channels_a, channels_b);
    assert_eq!(channels_a.len(), 2);

    for channel in &channels_a {
        assert_eq!(
            a.messages(&channel.id).unwrap(),
            b.messages(&channel.id).unwrap()
        );
    }

    let users_a = a.users().unwrap();
    let users_b = b.users().unwrap();
    assert_eq!(users_a, users_b);
    assert_eq!(users_a.len(), 2);
}

#[test]
fn test_soft_delete_cascade_converges() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    let mut b = make_store(&hub, "grace");
    a.initialize().unwrap();
    b.initialize().unwrap();
    pump(&mut a, &mut b);

    let channel = a.create_channel("design", "").unwrap();
    let root = a.create_message(&channel.id, "root", None).unwrap();
    a.create_message(&channel.id, "reply one", Some(&root.id))
        .unwrap();
    a.create_message(&channel.id, "reply two", Some(&root.id))
        .unwrap();
    pump(&mut a, &mut b);

    // The other replica deletes the root it received
    let root_on_b = b.messages(&channel.id).unwrap().remove(0);
    b.delete_message(&root_on_b).unwrap();
    pump(&mut a, &mut b);

    for store in [&a, &b] {
        assert!(store.messages(&channel.id).unwrap().is_empty());
        assert!(store
            .thread_messages(&root.id, Some(&channel.id))
            .unwrap()
            .is_empty());
        // Root and both replies stay addressable, all marked deleted
        let record = store.message(&channel.id, &root.id).unwrap().unwrap();
        assert!(record.deleted);
    }
}

#[test]
fn test_channel_hard_delete_converges() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    let mut b = make_store(&hub, "grace");
    a.initialize().unwrap();
    b.initialize().unwrap();
    pump(&mut a, &mut b);

    let channel = a.create_channel("doomed", "").unwrap();
    a.create_message(&channel.id, "soon gone", None).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(b.channels().unwrap().len(), 1);

    b.set_current_channel(Some(channel.id.clone()));
    b.delete_channel(&channel.id).unwrap();
    assert!(b.current_channel().is_none());
    pump(&mut a, &mut b);

    assert!(a.channels().unwrap().is_empty());
    assert!(a.messages(&channel.id).unwrap().is_empty());
}

#[test]
fn test_archive_flag_propagates() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    let mut b = make_store(&hub, "grace");
    a.initialize().unwrap();
    b.initialize().unwrap();
    pump(&mut a, &mut b);

    let channel = a.create_channel("design", "").unwrap();
    pump(&mut a, &mut b);

    a.archive_channel(&channel.id).unwrap();
    pump(&mut a, &mut b);

    assert!(b.channel(&channel.id).unwrap().unwrap().archived);
    assert!(matches!(
        b.create_message(&channel.id, "rejected", None),
        Err(meshspace_core::StoreError::ChannelArchived(_))
    ));
}

#[test]
fn test_presence_online_and_typing_across_replicas() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    let mut b = make_store(&hub, "grace");
    a.initialize().unwrap();
    b.initialize().unwrap();
    pump(&mut a, &mut b);

    let grace = b
        .users()
        .unwrap()
        .into_iter()
        .find(|u| u.username == "grace")
        .unwrap();
    assert!(a.is_user_online(&grace.id));
    assert_eq!(a.online_users().len(), 2);

    let channel = a.create_channel("design", "").unwrap();
    pump(&mut a, &mut b);

    b.set_typing(&channel.id, true).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(a.typing_users(&channel.id), vec![grace.id.clone()]);

    // Sending the message clears the indicator immediately
    b.create_message(&channel.id, "done typing", None).unwrap();
    pump(&mut a, &mut b);
    assert!(a.typing_users(&channel.id).is_empty());
}

#[test]
fn test_disconnect_removes_peer_presence() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    let mut b = make_store(&hub, "grace");
    a.initialize().unwrap();
    b.initialize().unwrap();
    pump(&mut a, &mut b);
    assert_eq!(a.online_users().len(), 2);

    b.disconnect();
    a.process_incoming().unwrap();

    assert_eq!(a.online_users().len(), 1);
    assert!(a.connected_peers().is_empty());

    // Offline-first: the remaining replica keeps accepting writes
    a.create_channel("still-works", "").unwrap();
    assert_eq!(a.channels().unwrap().len(), 1);
}

#[test]
fn test_duplicate_delivery_is_idempotent() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    let mut b = make_store(&hub, "grace");
    a.initialize().unwrap();
    b.initialize().unwrap();

    let channel = a.create_channel("design", "").unwrap();
    a.create_message(&channel.id, "once", None).unwrap();

    // Joins and catch-up broadcasts redeliver overlapping change sets
    pump(&mut a, &mut b);
    pump(&mut a, &mut b);

    assert_eq!(b.channels().unwrap().len(), 1);
    assert_eq!(b.messages(&channel.id).unwrap().len(), 1);
}

#[test]
fn test_bootstrap_converges_to_single_seed() {
    let hub = LoopbackHub::new();
    let mut a = make_store(&hub, "ada");
    let mut b = make_store(&hub, "grace");
    a.initialize().unwrap();

    assert!(a.bootstrap_default_workspace().unwrap());
    b.initialize().unwrap();
    pump(&mut a, &mut b);

    // The late replica sees a seeded workspace and does not reseed
    assert!(b.is_workspace_initialized().unwrap());
    assert!(!b.bootstrap_default_workspace().unwrap());

    assert_eq!(b.channels().unwrap().len(), 3);
    assert_eq!(b.messages(&ChannelId::general()).unwrap().len(), 1);
    assert_eq!(a.channels().unwrap(), b.channels().unwrap());
}
