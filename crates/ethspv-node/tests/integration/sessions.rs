//! RLPx session tests over loopback TCP.

use std::time::Duration;

use ethspv_node::NodeEvent;
use ethspv_protocol::messages::{DisconnectReason, LesMessage, Status};
use ethspv_protocol::BlockHeader;

use crate::harness::{TestNodeBuilder, GENESIS, NETWORK_ID};

const WAIT: Duration = Duration::from_secs(10);

/// Dial, reach Ready on both ends, then carry an LES message across.
#[tokio::test]
async fn test_two_node_session() {
    let mut a = TestNodeBuilder::new(1).build().await.unwrap();
    let mut b = TestNodeBuilder::new(2).build().await.unwrap();

    b.dial(&a).await.unwrap();

    match b.next_event(WAIT).await.unwrap() {
        NodeEvent::PeerReady { peer, client_id } => {
            assert_eq!(peer, a.id());
            assert_eq!(client_id, "ethspv/test-1");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        a.next_event(WAIT).await.unwrap(),
        NodeEvent::PeerReady { peer, .. } if peer == b.id()
    ));
    a.wait_peers(1, WAIT).await.unwrap();
    b.wait_peers(1, WAIT).await.unwrap();

    let status = Status::light(2, NETWORK_ID, GENESIS, &BlockHeader::default());
    assert!(a.pool.send(&b.id(), LesMessage::Status(status.clone())).await);
    match b.next_event(WAIT).await.unwrap() {
        NodeEvent::PeerMessage { peer, message } => {
            assert_eq!(peer, a.id());
            assert_eq!(message, LesMessage::Status(status));
        }
        other => panic!("unexpected {other:?}"),
    }

    a.shutdown().await;
    b.shutdown().await;
}

/// A local disconnect closes the session on both ends and empties both pools.
#[tokio::test]
async fn test_disconnect_reaches_remote() {
    let mut a = TestNodeBuilder::new(1).build().await.unwrap();
    let mut b = TestNodeBuilder::new(2).build().await.unwrap();

    b.dial(&a).await.unwrap();
    b.next_event(WAIT).await.unwrap();
    a.next_event(WAIT).await.unwrap();
    a.wait_peers(1, WAIT).await.unwrap();

    assert!(a.pool.disconnect(&b.id(), DisconnectReason::UselessPeer).await);
    match b.next_event(WAIT).await.unwrap() {
        NodeEvent::PeerClosed { peer, reason } => {
            assert_eq!(peer, a.id());
            assert_eq!(reason, DisconnectReason::UselessPeer);
        }
        other => panic!("unexpected {other:?}"),
    }
    a.wait_peers(0, WAIT).await.unwrap();
    b.wait_peers(0, WAIT).await.unwrap();

    a.shutdown().await;
    b.shutdown().await;
}

/// Inbound connections beyond max_peers are refused before the handshake.
#[tokio::test]
async fn test_full_node_refuses_inbound() {
    let a = TestNodeBuilder::new(1).max_peers(1).build().await.unwrap();
    let b = TestNodeBuilder::new(2).build().await.unwrap();
    let c = TestNodeBuilder::new(3).build().await.unwrap();

    b.dial(&a).await.unwrap();
    a.wait_peers(1, WAIT).await.unwrap();

    assert!(c.dial(&a).await.is_err());
    assert_eq!(a.pool.len().await, 1);
    assert!(a.pool.contains(&b.id()).await);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

/// Shutdown sends ClientQuitting to connected peers.
#[tokio::test]
async fn test_shutdown_quits_sessions() {
    let a = TestNodeBuilder::new(1).build().await.unwrap();
    let mut b = TestNodeBuilder::new(2).build().await.unwrap();

    b.dial(&a).await.unwrap();
    b.next_event(WAIT).await.unwrap();

    a.shutdown().await;
    match b.next_event(WAIT).await.unwrap() {
        NodeEvent::PeerClosed { reason, .. } => {
            assert_eq!(reason, DisconnectReason::ClientQuitting);
        }
        other => panic!("unexpected {other:?}"),
    }
    b.shutdown().await;
}
