//! Integration tests for the session layer: broadcast delivery, dead
//! peer reporting, tree repair and shutdown behavior across real QUIC
//! overlays on loopback.
//!
//! Run with verbose output: LLVL=debug cargo test --test session_stream -- --nocapture

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use trellis::{
    Address, FlatRouter, Handler, Message, Overlay, Router, Rpc, Session, TreeRouter,
};

static INIT: Once = Once::new();

/// Initialize tracing for tests. Use LLVL=debug for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("LLVL")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(43000);

fn next_addr() -> Address {
    let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("http://127.0.0.1:{}", port).parse().unwrap()
}

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

struct RawMessage(Vec<u8>);

impl Message for RawMessage {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

struct FailingMessage;

impl Message for FailingMessage {
    fn encode(&self) -> Result<Vec<u8>> {
        Err(anyhow::anyhow!("broken payload"))
    }
}

/// Handler that forwards every received message to a channel.
struct RecordingHandler {
    tx: mpsc::UnboundedSender<(Address, Vec<u8>)>,
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn stream(&self, session: Session) -> Result<()> {
        while let Ok((from, payload)) = session.recv().await {
            if self.tx.send((from, payload)).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Binds an overlay and registers a recording handler under `uri`.
async fn bind_node(
    addr: &Address,
    router: Arc<dyn Router>,
    uri: &str,
) -> (Overlay, Rpc, mpsc::UnboundedReceiver<(Address, Vec<u8>)>) {
    let overlay = Overlay::bind(addr.clone(), router).await.expect("bind failed");

    let (tx, rx) = mpsc::unbounded_channel();
    let rpc = overlay
        .make_rpc(uri, Arc::new(RecordingHandler { tx }))
        .expect("rpc registration failed");

    (overlay, rpc, rx)
}

fn flat() -> Arc<dyn Router> {
    Arc::new(FlatRouter)
}

fn tree(height: u32) -> Arc<dyn Router> {
    Arc::new(TreeRouter::new(height))
}

// ============================================================================
// S1: flat broadcast
// ============================================================================

#[tokio::test]
async fn flat_broadcast_reaches_all_players() {
    init_tracing();

    let (a_addr, b_addr, c_addr) = (next_addr(), next_addr(), next_addr());

    let (a, rpc, _a_rx) = bind_node(&a_addr, flat(), "bcast").await;
    let (b, _, mut b_rx) = bind_node(&b_addr, flat(), "bcast").await;
    let (c, _, mut c_rx) = bind_node(&c_addr, flat(), "bcast").await;

    let players = vec![b_addr.clone(), c_addr.clone()];
    let stream = timeout(TEST_TIMEOUT, rpc.stream(&players))
        .await
        .expect("stream setup timed out")
        .expect("stream setup failed");

    let mut errs = stream.send(&RawMessage(b"hi".to_vec()), &players).await;
    let first = timeout(TEST_TIMEOUT, errs.recv())
        .await
        .expect("send resolution timed out");
    assert!(first.is_none(), "broadcast must close with zero errors: {:?}", first);

    for (rx, addr) in [(&mut b_rx, &b_addr), (&mut c_rx, &c_addr)] {
        let (from, payload) = timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("delivery timed out")
            .expect("handler channel closed");

        assert_eq!(payload, b"hi", "payload mismatch at {}", addr);
        // The source displays as the caller, not the hop.
        assert_eq!(from.to_string(), a_addr.to_string());
        assert_eq!(from.unwrap(), a_addr);
    }

    timeout(TEST_TIMEOUT, stream.close())
        .await
        .expect("close timed out");

    // Every acquired connection went back to the pool.
    assert_eq!(a.pool().len().await, 0, "refcount imbalance after close");

    a.close().await;
    b.close().await;
    c.close().await;
}

// ============================================================================
// Answers flow back up to the caller
// ============================================================================

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn stream(&self, session: Session) -> Result<()> {
        while let Ok((from, payload)) = session.recv().await {
            let mut echoed = payload;
            echoed.extend_from_slice(b"-echo");
            let mut errs = session.send(&RawMessage(echoed), &[from]).await;
            while errs.recv().await.is_some() {}
        }
        Ok(())
    }
}

#[tokio::test]
async fn players_can_answer_the_caller() {
    init_tracing();

    let (a_addr, b_addr) = (next_addr(), next_addr());

    let (a, rpc, _a_rx) = bind_node(&a_addr, flat(), "echo").await;

    let b = Overlay::bind(b_addr.clone(), flat()).await.unwrap();
    b.make_rpc("echo", Arc::new(EchoHandler)).unwrap();

    let players = vec![b_addr.clone()];
    let stream = timeout(TEST_TIMEOUT, rpc.stream(&players))
        .await
        .unwrap()
        .unwrap();

    let mut errs = stream.send(&RawMessage(b"ping".to_vec()), &players).await;
    assert!(timeout(TEST_TIMEOUT, errs.recv()).await.unwrap().is_none());

    let (from, payload) = timeout(TEST_TIMEOUT, stream.recv())
        .await
        .expect("answer timed out")
        .expect("receive failed");

    assert_eq!(payload, b"ping-echo");
    assert_eq!(from, b_addr);

    stream.close().await;
    a.close().await;
    b.close().await;
}

// ============================================================================
// S2: dead peer
// ============================================================================

#[tokio::test]
async fn dead_peer_yields_exactly_one_error() {
    init_tracing();

    let (a_addr, b_addr, c_addr) = (next_addr(), next_addr(), next_addr());

    let (a, rpc, _a_rx) = bind_node(&a_addr, flat(), "dead").await;
    let (c, _, mut c_rx) = bind_node(&c_addr, flat(), "dead").await;
    // B is never bound: the address is unreachable.

    // The live player carries the root stream.
    let players = vec![c_addr.clone(), b_addr.clone()];
    let stream = timeout(TEST_TIMEOUT, rpc.stream(&players))
        .await
        .unwrap()
        .unwrap();

    let mut errs = stream
        .send(&RawMessage(b"hi".to_vec()), &[b_addr.clone(), c_addr.clone()])
        .await;

    let mut reported = Vec::new();
    while let Some(err) = timeout(TEST_TIMEOUT, errs.recv())
        .await
        .expect("send resolution timed out")
    {
        reported.push(err.to_string());
    }

    assert_eq!(reported.len(), 1, "expected exactly one error: {:?}", reported);
    assert!(
        reported[0].contains(&b_addr.to_string()),
        "error must name the dead peer: {}",
        reported[0]
    );

    let (_, payload) = timeout(TEST_TIMEOUT, c_rx.recv())
        .await
        .expect("delivery timed out")
        .expect("handler channel closed");
    assert_eq!(payload, b"hi");

    stream.close().await;
    a.close().await;
    c.close().await;
}

// ============================================================================
// S3: tree reroute around a dead gateway
// ============================================================================

#[tokio::test]
async fn tree_reroutes_around_dead_gateway() {
    init_tracing();

    let (a_addr, b_addr, c_addr, d_addr, e_addr) =
        (next_addr(), next_addr(), next_addr(), next_addr(), next_addr());

    let (a, rpc, _a_rx) = bind_node(&a_addr, tree(2), "reroute").await;
    let (d, _, _d_rx) = bind_node(&d_addr, tree(2), "reroute").await;
    let (c, _, mut c_rx) = bind_node(&c_addr, tree(2), "reroute").await;
    let (b, _, _b_rx) = bind_node(&b_addr, tree(2), "reroute").await;
    // E is only a name in the player set; it is never contacted.

    // Height-2 tree over four players: branches [D, E] and [B, C],
    // so C is routed through gateway B.
    let players = vec![d_addr.clone(), e_addr.clone(), b_addr.clone(), c_addr.clone()];
    let stream = timeout(TEST_TIMEOUT, rpc.stream(&players))
        .await
        .unwrap()
        .unwrap();

    // Kill the gateway before any data flows.
    b.close().await;

    let mut errs = stream.send(&RawMessage(b"hi".to_vec()), &[c_addr.clone()]).await;
    let first = timeout(TEST_TIMEOUT, errs.recv())
        .await
        .expect("send resolution timed out");
    assert!(
        first.is_none(),
        "reroute must deliver with zero errors: {:?}",
        first
    );

    let (from, payload) = timeout(TEST_TIMEOUT, c_rx.recv())
        .await
        .expect("delivery timed out")
        .expect("handler channel closed");
    assert_eq!(payload, b"hi");
    assert_eq!(from.unwrap(), a_addr);

    stream.close().await;
    a.close().await;
    c.close().await;
    d.close().await;
}

// ============================================================================
// S5: idempotent close
// ============================================================================

#[tokio::test]
async fn concurrent_close_is_idempotent() {
    init_tracing();

    let (a_addr, b_addr) = (next_addr(), next_addr());

    let (a, rpc, _a_rx) = bind_node(&a_addr, flat(), "close").await;
    let (b, _, _b_rx) = bind_node(&b_addr, flat(), "close").await;

    let stream = timeout(TEST_TIMEOUT, rpc.stream(&[b_addr.clone()]))
        .await
        .unwrap()
        .unwrap();

    timeout(TEST_TIMEOUT, async {
        tokio::join!(stream.close(), stream.close());
    })
    .await
    .expect("concurrent close deadlocked");

    assert_eq!(a.pool().len().await, 0);

    a.close().await;
    b.close().await;
}

// ============================================================================
// S6: serialization failure
// ============================================================================

#[tokio::test]
async fn serialization_failure_creates_no_relay() {
    init_tracing();

    let (a_addr, b_addr) = (next_addr(), next_addr());

    let (a, rpc, _a_rx) = bind_node(&a_addr, flat(), "ser").await;
    let (b, _, _b_rx) = bind_node(&b_addr, flat(), "ser").await;

    let stream = timeout(TEST_TIMEOUT, rpc.stream(&[b_addr.clone()]))
        .await
        .unwrap()
        .unwrap();

    // Only the root connection is held at this point.
    let held_before = a.pool().len().await;

    let mut errs = stream.send(&FailingMessage, &[b_addr.clone()]).await;

    let err = timeout(TEST_TIMEOUT, errs.recv())
        .await
        .unwrap()
        .expect("one serialization error expected");
    assert!(err.to_string().contains("serialize"), "got: {}", err);
    assert!(timeout(TEST_TIMEOUT, errs.recv()).await.unwrap().is_none());

    assert_eq!(a.pool().len().await, held_before, "no relay may be created");

    stream.close().await;
    a.close().await;
    b.close().await;
}
