//! Integration tests for the instance data cache fed by received instance
//! data.

mod common;

use common::{Counter, TestNode, connected_pair, eventually};
use weft::{ChangeType, Object, Version};

#[tokio::test]
async fn test_mapping_fills_the_cache() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let master = Object::new(Counter::new(ChangeType::Instance, 1));
    assert!(a.register_object(&master));
    let slave = Object::new(Counter::new(ChangeType::Instance, 0));
    assert!(b.map_object(&slave, master.id(), Version::OLDEST).await);

    let cache = b.instance_cache().expect("cache enabled by default");
    assert!(cache.versions(master.id()).contains(&Version::FIRST));
    // The mapping node is not the master; nothing cached there.
    let master_cache = a.instance_cache().expect("cache enabled by default");
    assert!(master_cache.versions(master.id()).is_empty());

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_remap_is_served_from_cache() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let master = Object::new(Counter::new(ChangeType::Instance, 5));
    master.write().label = "cached".into();
    assert!(a.register_object(&master));

    let first = Object::new(Counter::new(ChangeType::Instance, 0));
    assert!(b.map_object(&first, master.id(), Version::OLDEST).await);
    b.unmap_object(&first).await;
    assert!(!first.is_attached());

    let cache = b.instance_cache().expect("cache enabled by default");
    let hits = cache.hits();

    let second = Object::new(Counter::new(ChangeType::Instance, 0));
    assert!(b.map_object(&second, master.id(), Version::OLDEST).await);
    assert!(cache.hits() > hits);
    assert_eq!(second.version(), Version::FIRST);
    assert_eq!(second.read().value, 5);
    assert_eq!(second.read().label, "cached");

    // Later commits still arrive over the wire.
    master.write().value = 6;
    let v2 = master.commit().await;
    assert_eq!(second.sync(v2).await, v2);
    assert_eq!(second.read().value, 6);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_send_on_register_is_cached_without_slaves() -> anyhow::Result<()> {
    let a = TestNode::start_with(|config| config.cache.send_queue_size = 4)?;
    let b = TestNode::start()?;
    a.connect(&b).await?;
    a.enable_send_on_register();

    let master = Object::new(Counter::new(ChangeType::Instance, 3));
    assert!(a.register_object(&master));

    let cache = b.instance_cache().expect("cache enabled by default");
    eventually(|| cache.versions(master.id()).contains(&Version::FIRST)).await?;
    assert_eq!(b.object_count(), 0);

    // A later map is answered from what was pushed.
    let hits = cache.hits();
    let slave = Object::new(Counter::new(ChangeType::Instance, 0));
    assert!(b.map_object(&slave, master.id(), Version::OLDEST).await);
    assert!(cache.hits() > hits);
    assert_eq!(slave.read().value, 3);

    a.disable_send_on_register().await;
    a.stop().await?;
    b.stop().await?;
    Ok(())
}
