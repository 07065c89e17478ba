//! Header sync against a scripted LES server over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use ethspv_node::peer_pool::PeerPool;
use ethspv_node::sync_task::SyncCommand;
use ethspv_node::NodeEvent;
use ethspv_protocol::messages::{
    BlockHeaders, BlockOrigin, LesMessage, RawTransaction, SignedTransaction, Status,
    TransactionSignature,
};
use ethspv_protocol::{BlockHeader, H256, U256};
use ethspv_storage::{ChainStorage, MemoryStorage, Storage};
use tokio::sync::mpsc;

use crate::harness::{TestNodeBuilder, GENESIS, NETWORK_ID};

const WAIT: Duration = Duration::from_secs(10);

/// `len` linked headers starting at number 0, total difficulty filled in.
fn chain(len: u64) -> Vec<BlockHeader> {
    let mut out: Vec<BlockHeader> = Vec::new();
    let mut total = U256::zero();
    for number in 0..len {
        let parent = out.last().map(|h| h.hash).unwrap_or_default();
        let mut header = BlockHeader {
            parent_hash: parent,
            number,
            difficulty: U256::from(10u64),
            timestamp: 1_600_000_000 + number,
            ..Default::default()
        }
        .with_computed_hash();
        total += header.difficulty;
        header.total_difficulty = total;
        out.push(header);
    }
    out
}

/// Answer Status and GetBlockHeaders from a fixed chain. Everything else
/// is dropped; transactions are recorded.
async fn serve_chain(
    mut events: mpsc::Receiver<NodeEvent>,
    pool: PeerPool,
    chain: Vec<BlockHeader>,
    seen_tx: mpsc::Sender<LesMessage>,
) {
    let Some(head) = chain.last().cloned() else {
        return;
    };
    while let Some(event) = events.recv().await {
        let NodeEvent::PeerMessage { peer, message } = event else {
            continue;
        };
        let reply = match message {
            LesMessage::Status(_) => {
                let mut status = Status::light(2, NETWORK_ID, GENESIS, &head);
                status.serve_headers = true;
                LesMessage::Status(status)
            }
            LesMessage::GetBlockHeaders(req) => {
                let BlockOrigin::Hash(hash) = req.origin else {
                    continue;
                };
                let start = chain.iter().position(|h| h.hash == hash).unwrap_or(chain.len());
                LesMessage::BlockHeaders(BlockHeaders {
                    request_id: req.request_id,
                    buffer_value: 0,
                    headers: chain[start..]
                        .iter()
                        .take(req.max_headers as usize)
                        .cloned()
                        .collect(),
                })
            }
            other => {
                let _ = seen_tx.send(other).await;
                continue;
            }
        };
        pool.send(&peer, reply).await;
    }
}

async fn wait_head(storage: &MemoryStorage, number: u64) -> BlockHeader {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(head) = storage.last_header().unwrap() {
            if head.number == number {
                return head;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timeout waiting for head {number}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Client syncs a five-header chain in windows of three, then sends a
/// transaction to the same server.
#[tokio::test]
async fn test_light_client_syncs_from_server() {
    let headers = chain(5);
    let mut server = TestNodeBuilder::new(10).build().await.unwrap();
    let mut client = TestNodeBuilder::new(11).build().await.unwrap();

    let (seen_tx, mut seen_rx) = mpsc::channel(8);
    let server_events = server.take_events();
    tokio::spawn(serve_chain(
        server_events,
        server.pool.clone(),
        headers.clone(),
        seen_tx,
    ));

    let storage = Arc::new(MemoryStorage::new());
    let shared: Arc<dyn Storage> = storage.clone();
    let commands = client.start_sync(shared, headers[0].clone(), 3);

    client.dial(&server).await.unwrap();

    let head = wait_head(&storage, 4).await;
    assert_eq!(head.hash, headers[4].hash);
    assert_eq!(head.total_difficulty, headers[4].total_difficulty);
    for expected in &headers {
        let stored = storage.header(expected.number).unwrap().unwrap();
        assert_eq!(stored.hash, expected.hash);
    }

    let tx = SignedTransaction {
        raw: RawTransaction {
            nonce: 0,
            gas_price: U256::from(1_000_000_000u64),
            gas_limit: 21_000,
            to: vec![0x22; 20],
            value: U256::from(5u64),
            data: Vec::new(),
        },
        signature: TransactionSignature {
            v: 37,
            r: U256::from(1u64),
            s: U256::from(2u64),
        },
    };
    commands
        .send(SyncCommand::SendTransaction(tx.clone()))
        .await
        .unwrap();
    match tokio::time::timeout(WAIT, seen_rx.recv()).await.unwrap() {
        Some(LesMessage::SendTx(send)) => assert_eq!(send.transactions, vec![tx.clone()]),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(storage.transactions().unwrap(), vec![tx]);

    client.shutdown().await;
    server.shutdown().await;
}

/// A server on another genesis is dropped during the LES handshake.
#[tokio::test]
async fn test_client_drops_wrong_genesis() {
    let mut server = TestNodeBuilder::new(20).build().await.unwrap();
    let mut client = TestNodeBuilder::new(21).build().await.unwrap();

    let mut server_events = server.take_events();
    let server_pool = server.pool.clone();
    let (answered_tx, mut answered_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while let Some(event) = server_events.recv().await {
            if let NodeEvent::PeerMessage {
                peer,
                message: LesMessage::Status(_),
            } = event
            {
                let head = BlockHeader::default().with_computed_hash();
                let status = Status::light(2, NETWORK_ID, H256::repeat_byte(0x01), &head);
                server_pool.send(&peer, LesMessage::Status(status)).await;
                let _ = answered_tx.send(()).await;
            }
        }
    });

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let _commands = client.start_sync(storage, chain(1)[0].clone(), 3);

    client.dial(&server).await.unwrap();
    tokio::time::timeout(WAIT, answered_rx.recv()).await.unwrap();
    client.wait_peers(0, WAIT).await.unwrap();
    server.wait_peers(0, WAIT).await.unwrap();

    client.shutdown().await;
    server.shutdown().await;
}
