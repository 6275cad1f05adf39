//! Integration tests for mapping, committing and syncing objects across
//! nodes.

mod common;

use std::sync::Arc;

use common::{Counter, connected_pair, eventually};
use parking_lot::Mutex;
use weft::{ChangeType, NodeId, Object, Version};

#[tokio::test]
async fn test_map_then_sync_commits() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let master = Object::new(Counter::new(ChangeType::Instance, 1));
    master.write().label = "hits".into();
    assert!(a.register_object(&master));
    assert!(master.is_master());
    assert_eq!(master.version(), Version::FIRST);

    let slave = Object::new(Counter::new(ChangeType::Instance, 0));
    assert!(b.map_object(&slave, master.id(), Version::OLDEST).await);
    assert!(slave.is_attached());
    assert!(!slave.is_master());
    assert_eq!(slave.id(), master.id());
    assert_eq!(slave.version(), Version::FIRST);
    assert_eq!(slave.read().value, 1);
    assert_eq!(slave.read().label, "hits");
    assert_eq!(slave.master_instance_id(), master.instance_id());

    master.write().value = 2;
    let v2 = master.commit().await;
    assert_eq!(v2, Version::from_low(2));
    master.write().value = 3;
    let v3 = master.commit().await;

    assert_eq!(slave.sync(v2).await, v2);
    assert_eq!(slave.read().value, 2);
    assert_eq!(slave.sync(v3).await, v3);
    assert_eq!(slave.read().value, 3);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_delta_slave_receives_packed_changes() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let master = Object::new(Counter::new(ChangeType::Delta, 10));
    master.write().label = "delta".into();
    assert!(a.register_object(&master));

    let slave = Object::new(Counter::new(ChangeType::Delta, 0));
    assert!(b.map_object(&slave, master.id(), Version::OLDEST).await);
    assert_eq!(slave.read().label, "delta");

    master.write().value = 11;
    let version = master.commit().await;
    assert_eq!(slave.sync(version).await, version);
    assert_eq!(slave.read().value, 11);
    // Deltas only carry the value.
    assert_eq!(slave.read().label, "delta");

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_map_historical_version_replays_history() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let master = Object::new(Counter::new(ChangeType::Instance, 1));
    assert!(a.register_object(&master));
    master.set_auto_obsolete(10);
    for value in 2..=4 {
        master.write().value = value;
        master.commit().await;
    }
    assert_eq!(master.version(), Version::from_low(4));

    let slave = Object::new(Counter::new(ChangeType::Instance, 0));
    assert!(b.map_object(&slave, master.id(), Version::from_low(2)).await);
    assert_eq!(slave.version(), Version::from_low(2));
    assert_eq!(slave.read().value, 2);

    assert_eq!(slave.sync(Version::from_low(4)).await, Version::from_low(4));
    assert_eq!(slave.read().value, 4);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_find_master_node_id() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let master = Object::new(Counter::new(ChangeType::Static, 7));
    assert!(a.register_object(&master));

    assert_eq!(a.find_master_node_id(master.id()).await, a.id());
    assert_eq!(b.find_master_node_id(master.id()).await, a.id());
    assert_eq!(b.find_master_node_id(weft::ObjectId::generate()).await, NodeId::ZERO);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_map_unknown_object_fails() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let slave = Object::new(Counter::new(ChangeType::Instance, 0));
    assert!(!b.map_object(&slave, weft::ObjectId::generate(), Version::OLDEST).await);
    assert!(!slave.is_attached());

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_unmap_detaches_slave() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let master = Object::new(Counter::new(ChangeType::Instance, 1));
    assert!(a.register_object(&master));
    let slave = Object::new(Counter::new(ChangeType::Instance, 0));
    assert!(b.map_object(&slave, master.id(), Version::OLDEST).await);

    b.unmap_object(&slave).await;
    assert!(!slave.is_attached());
    assert_eq!(b.object_count(), 0);

    // The master no longer sends to the unsubscribed slave.
    master.write().value = 2;
    master.commit().await;
    assert_eq!(slave.version(), Version::FIRST);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_deregister_unmaps_slaves() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let master = Object::new(Counter::new(ChangeType::Instance, 1));
    assert!(a.register_object(&master));
    let slave = Object::new(Counter::new(ChangeType::Instance, 0));
    assert!(b.map_object(&slave, master.id(), Version::OLDEST).await);

    a.deregister_object(&master);
    assert!(!master.is_attached());
    eventually(|| !slave.is_attached()).await?;

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_slave_commit_reaches_master() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let master = Object::new(Counter::new(ChangeType::Delta, 1));
    assert!(a.register_object(&master));
    let slave = Object::new(Counter::new(ChangeType::Delta, 0));
    assert!(b.map_object(&slave, master.id(), Version::OLDEST).await);

    slave.write().value = 42;
    let version = slave.commit().await;
    assert_ne!(version, Version::NONE);

    master.sync(version).await;
    assert_eq!(master.read().value, 42);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_push_reaches_handler() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let received = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&received);
    b.register_push_handler(
        7,
        Arc::new(move |group, kind, id, mut is| {
            let value: u64 = is.read();
            let label: String = is.read();
            *sink.lock() = Some((group, kind, id, value, label));
        }),
    );

    let object = Object::new(Counter::new(ChangeType::Instance, 99));
    object.write().label = "pushed".into();
    let peer = a.get_node(b.id()).expect("connected");
    assert!(object.push(7, 3, &[peer]));

    eventually(|| received.lock().is_some()).await?;
    let (group, kind, id, value, label) = received.lock().take().expect("push received");
    assert_eq!((group, kind, id), (7, 3, object.id()));
    assert_eq!((value, label.as_str()), (99, "pushed"));

    a.stop().await?;
    b.stop().await?;
    Ok(())
}
