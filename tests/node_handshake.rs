//! Integration tests for the node handshake and the peer table.

mod common;

use common::{TestNode, connected_pair, eventually};
use weft::{NodeError, NodeState};

#[tokio::test]
async fn test_connect_maps_both_sides() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let b_on_a = a.get_node(b.id()).expect("b is known to a");
    assert!(b_on_a.is_connected());
    assert_eq!(b_on_a.node_type(), b.node_type());
    assert_eq!(b_on_a.descriptions(), b.descriptions());

    let a_on_b = b.get_node(a.id()).expect("a is known to b");
    assert_eq!(a_on_b.descriptions(), a.descriptions());

    assert_eq!(a.get_nodes().len(), 1);
    assert_eq!(b.get_nodes().len(), 1);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_connected_node_is_refused_a_second_time() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;

    let result = a.connect_to(&b.address()).await;
    assert!(matches!(result, Err(NodeError::Refused(_))), "got {result:?}");
    // The existing link survives the refused attempt.
    assert!(a.get_node(b.id()).is_some_and(|n| n.is_connected()));

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_connect_by_id_through_a_peer() -> anyhow::Result<()> {
    let a = TestNode::start()?;
    let b = TestNode::start()?;
    let c = TestNode::start()?;
    a.connect(&b).await?;
    c.connect(&b).await?;

    // a only knows b; b tells it where c listens.
    let node = weft::LocalNode::connect(&a, c.id()).await.expect("c reachable through b");
    assert_eq!(node.id(), c.id());
    let a_id = a.id();
    eventually(|| c.get_node(a_id).is_some()).await?;

    // Already connected: no new handshake.
    let again = weft::LocalNode::connect(&a, c.id()).await.expect("still connected");
    assert!(std::sync::Arc::ptr_eq(&node, &again));

    for node in [a, b, c] {
        node.stop().await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_unknown_node_id_is_not_reachable() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;
    assert!(weft::LocalNode::connect(&a, weft::NodeId::generate()).await.is_none());
    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_disconnect_removes_peer_on_both_sides() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;
    let peer = a.get_node(b.id()).expect("connected");

    assert!(a.disconnect(&peer).await);
    assert!(a.get_node(b.id()).is_none());
    assert_eq!(peer.state(), NodeState::Closed);

    let a_id = a.id();
    eventually(|| b.get_node(a_id).is_none()).await?;

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_peer_close_is_noticed() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;
    let b_id = b.id();
    b.stop().await?;

    eventually(|| a.get_node(b_id).is_none()).await?;
    assert!(a.get_nodes().is_empty());
    a.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_ping_reaches_peer() -> anyhow::Result<()> {
    let (a, b) = connected_pair().await?;
    let a_on_b = b.get_node(a.id()).expect("connected");
    let before = a_on_b.last_receive();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let peer = a.get_node(b.id()).expect("connected");
    assert!(a.ping(&peer));
    eventually(|| a_on_b.last_receive() > before).await?;

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_closed_node_cannot_connect() -> anyhow::Result<()> {
    let a = TestNode::start()?;
    let b = TestNode::start()?;
    let address = b.address();
    a.close().await?;

    assert!(matches!(a.connect_to(&address).await, Err(NodeError::NotListening)));
    b.stop().await?;
    Ok(())
}
