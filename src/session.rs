//! # Sessions
//!
//! A session is one peer's participation in one distributed RPC. It
//! owns the local delivery queue, the parent relays that push work
//! into it, and the child relays it opens on demand when the routing
//! table sends packets further down the tree.
//!
//! The send path serializes a message once, then walks the parents in
//! map order until one accepts the packet: the accepting parent's
//! table slices out the local part, partitions the rest per next hop,
//! and one concurrent task per hop pushes the sub-packets out. Route
//! failures are repaired in place — the table is told about the dead
//! hop and the packet retries along whatever routes remain — while
//! unreachable destinations surface as collected errors on the send's
//! channel, never as a failed call.
//!
//! Every child relay is paired with a drain task that feeds upward
//! packets back through [`Session::recv_packet`] and tears the relay
//! down (releasing its pooled connection) when the stream ends.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use quinn::RecvStream;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::connection::ConnectionPool;
use crate::messages::{self, Ack, Frame, Message, StreamHeader, StreamId};
use crate::packet::Packet;
use crate::queue::{QueuePusher, QueueReceiver, queue};
use crate::relay::{Relay, UnicastRelay};
use crate::routing::RoutingTable;
use crate::traffic::Traffic;

/// How long a relay setup waits for the remote session to accept the
/// stream before the peer counts as unreachable.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// An upstream holder of the session: the relay leading to it and the
/// routing table that came with it.
#[derive(Clone)]
pub struct Parent {
    relay: Arc<dyn Relay>,
    table: Arc<dyn RoutingTable>,
}

impl Parent {
    pub fn new(relay: Arc<dyn Relay>, table: Arc<dyn RoutingTable>) -> Self {
        Self { relay, table }
    }
}

/// Cheap-to-clone handle onto one session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    me: Address,
    uri: String,
    stream_id: StreamId,
    pool: ConnectionPool,
    traffic: Traffic,

    // Read-mostly: every send and inbound packet walks the parents,
    // while registration and teardown are rare.
    parents: RwLock<HashMap<Address, Parent>>,

    // Held only for lookup and insertion; relay creation serializes on
    // the separate setup lock so the map is never held across IO.
    relays: Mutex<HashMap<Address, Arc<dyn Relay>>>,
    setup_lock: Mutex<()>,

    queue_tx: QueuePusher,
    recv_state: Mutex<RecvState>,
    errs_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<anyhow::Error>>>,

    live: WaitGroup,
    shutdown: watch::Sender<bool>,
}

struct RecvState {
    errs_rx: mpsc::UnboundedReceiver<anyhow::Error>,
    queue_rx: QueueReceiver,
}

impl Session {
    pub fn new(me: Address, uri: String, stream_id: StreamId, pool: ConnectionPool) -> Self {
        let (queue_tx, queue_rx) = queue();
        let (errs_tx, errs_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let traffic = Traffic::from_env(me.clone());

        Self {
            inner: Arc::new(SessionInner {
                me,
                uri,
                stream_id,
                pool,
                traffic,
                parents: RwLock::new(HashMap::new()),
                relays: Mutex::new(HashMap::new()),
                setup_lock: Mutex::new(()),
                queue_tx,
                recv_state: Mutex::new(RecvState { errs_rx, queue_rx }),
                errs_tx: std::sync::Mutex::new(Some(errs_tx)),
                live: WaitGroup::new(),
                shutdown,
            }),
        }
    }

    pub fn local_addr(&self) -> &Address {
        &self.inner.me
    }

    pub async fn parent_count(&self) -> usize {
        self.inner.parents.read().await.len()
    }

    fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Registers a parent without a drainer: the relay joins the
    /// parent set but nothing watches its stream. Used to keep a
    /// second upstream alive during handoff.
    pub async fn set_passive(&self, relay: Arc<dyn Relay>, table: Arc<dyn RoutingTable>) {
        let addr = relay.distant_addr().clone();
        trace!(me = %self.inner.me, parent = %addr, "adding parent");

        self.inner
            .parents
            .write()
            .await
            .insert(addr, Parent::new(relay, table));
    }

    /// Registers the parent, signals `ready`, then blocks draining the
    /// parent's inbound stream until it terminates; inbound packets
    /// are fed through [`Session::recv_packet`]. The parent is removed
    /// on return.
    pub async fn listen(
        &self,
        parent: Arc<dyn Relay>,
        table: Arc<dyn RoutingTable>,
        mut stream: RecvStream,
        ready: oneshot::Sender<()>,
    ) {
        let _live = self.inner.live.guard();

        let addr = parent.distant_addr().clone();
        self.set_passive(parent, table).await;
        let _ = ready.send(());

        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                frame = messages::read_frame(&mut stream) => match frame {
                    Ok(Some(Frame::Packet(packet))) => {
                        match self.recv_packet(&addr, packet).await {
                            Ok(ack) if !ack.errors.is_empty() => {
                                debug!(me = %self.inner.me, errors = ack.errors.len(),
                                    "packet from parent partially failed");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                debug!(me = %self.inner.me, error = %err,
                                    "failed to process packet from parent");
                            }
                        }
                    }
                    Ok(Some(other)) => {
                        self.push_err(anyhow!("unexpected frame on parent stream: {:?}", other));
                        break;
                    }
                    Ok(None) => {
                        trace!(me = %self.inner.me, parent = %addr, "session stream closing");
                        break;
                    }
                    Err(err) => {
                        warn!(me = %self.inner.me, parent = %addr, error = %err,
                            "stream closed unexpectedly");
                        self.push_err(anyhow!("stream closed unexpectedly: {}", err));
                        break;
                    }
                }
            }
        }

        trace!(me = %self.inner.me, parent = %addr, "removing parent");
        self.inner.parents.write().await.remove(&addr);
    }

    /// Sends `msg` to the given addresses. The returned channel yields
    /// zero or more per-destination errors and closes once every leg
    /// has either delivered or failed. Dropping the receiver lets the
    /// in-flight legs finish with their results discarded.
    pub async fn send(
        &self,
        msg: &dyn Message,
        addrs: &[Address],
    ) -> mpsc::UnboundedReceiver<anyhow::Error> {
        let (tx, rx) = mpsc::unbounded_channel();

        let data = match msg.encode() {
            Ok(data) => data,
            Err(err) => {
                let _ = tx.send(err.context("failed to serialize message"));
                return rx;
            }
        };

        if self.is_closed() {
            let _ = tx.send(anyhow!("session {} is closing", self.inner.me));
            return rx;
        }

        let sess = self.clone();
        let addrs = addrs.to_vec();
        let guard = self.inner.live.guard();

        tokio::spawn(async move {
            let _guard = guard;
            let parents = sess.inner.parents.read().await;

            for parent in parents.values() {
                let packet =
                    parent
                        .table
                        .make(sess.inner.me.clone(), addrs.clone(), data.clone());

                if sess.send_packet(parent, packet, &tx).await {
                    return;
                }
            }

            let _ = tx.send(anyhow!("packet ignored"));
        });

        rx
    }

    /// Waits for the next locally-delivered message, or fails when the
    /// underlying stream is gone: a closed session reads as
    /// `end of stream`, a broken one as the wrapped transport error.
    pub async fn recv(&self) -> Result<(Address, Vec<u8>)> {
        let mut state = self.inner.recv_state.lock().await;
        let RecvState { errs_rx, queue_rx } = &mut *state;

        tokio::select! {
            err = errs_rx.recv() => match err {
                Some(err) => Err(anyhow!("stream closed unexpectedly: {}", err)),
                None => Err(anyhow!("end of stream")),
            },
            packet = queue_rx.pop() => match packet {
                Some(packet) => {
                    // The source is the high-level origin of the
                    // message, not the hop that delivered it.
                    Ok((packet.source().clone(), packet.payload().to_vec()))
                }
                None => Err(anyhow!("end of stream")),
            },
        }
    }

    /// Inbound path for a packet from the distant peer `from`: the
    /// first parent whose table accepts it routes it onward, and the
    /// errors collected along the way become the ack.
    pub async fn recv_packet(&self, from: &Address, packet: Packet) -> Result<Ack> {
        self.inner.traffic.log_recv(from, &packet);

        let parents = self.inner.parents.read().await;

        for parent in parents.values() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let delivered = self.send_packet(parent, packet.clone(), &tx).await;
            drop(tx);

            if delivered {
                let mut ack = Ack::default();
                while let Some(err) = rx.recv().await {
                    ack.errors.push(err.to_string());
                }
                return Ok(ack);
            }
        }

        Err(anyhow!("packet dropped (tried {} parent-s)", parents.len()))
    }

    /// Shuts the session down: future receives fail, and every relay
    /// drain and in-flight send is waited out before returning.
    /// Idempotent, safe to call concurrently.
    pub async fn close(&self) {
        trace!(me = %self.inner.me, "closing session");

        self.inner.errs_tx.lock().expect("errs lock poisoned").take();
        self.inner.queue_tx.close();
        // send_replace: the value must stick even with no subscriber
        // around to observe it.
        self.inner.shutdown.send_replace(true);

        self.inner.live.wait().await;

        trace!(me = %self.inner.me, "session closed");
    }

    fn push_err(&self, err: anyhow::Error) {
        if let Some(tx) = self.inner.errs_tx.lock().expect("errs lock poisoned").as_ref() {
            let _ = tx.send(err);
        }
    }

    /// Delivers the local slice, reports voids, and runs one
    /// concurrent leg per next hop. Returns whether this parent's
    /// table accepted the packet.
    fn send_packet<'a>(
        &'a self,
        parent: &'a Parent,
        mut packet: Packet,
        errs: &'a mpsc::UnboundedSender<anyhow::Error>,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let mine = packet.slice(&self.inner.me);

            if let Some(mine) = &mine
                && let Err(err) = self.inner.queue_tx.push(mine.clone())
            {
                warn!(me = %self.inner.me, "dropping local packet slice");
                let _ = errs.send(anyhow!("{} dropped the packet: {}", self.inner.me, err));
            }

            let (routes, voids) = parent.table.forward(&packet);

            for (addr, void) in voids.iter() {
                let _ = errs.send(anyhow!("no route to {}: {}", addr, void.reason));
            }

            if routes.is_empty() && voids.is_empty() {
                return mine.is_some();
            }

            let mut legs = JoinSet::new();
            for (hop, sub_packet) in routes {
                let sess = self.clone();
                let parent = parent.clone();
                let errs = errs.clone();

                legs.spawn(async move {
                    sess.send_to(&parent, hop, sub_packet, &errs).await;
                });
            }

            while legs.join_next().await.is_some() {}

            true
        })
    }

    /// One forwarding leg. A `None` hop hands the packet back up
    /// through the parent relay; failure there means the session is on
    /// its way down. A child failure triggers route repair and a
    /// retry along whatever the table computes next.
    async fn send_to(
        &self,
        parent: &Parent,
        hop: Option<Address>,
        packet: Packet,
        errs: &mpsc::UnboundedSender<anyhow::Error>,
    ) {
        let relay = match &hop {
            None => parent.relay.clone(),
            Some(addr) => match self.setup_relay(parent, addr).await {
                Ok(relay) => relay,
                Err(err) => {
                    warn!(to = %addr, error = %err, "failed to setup relay");
                    self.repair(parent, addr, packet, errs).await;
                    return;
                }
            },
        };

        self.inner.traffic.log_send(relay.distant_addr(), &packet);

        match relay.send(&packet).await {
            Ok(ack) => {
                for msg in ack.errors {
                    let _ = errs.send(anyhow!(msg));
                }
            }
            Err(err) if hop.is_none() => {
                // The parent relay is unavailable, so the session will
                // eventually close.
                warn!(me = %self.inner.me, error = %err, "parent is closing");
                let _ = errs.send(anyhow!("session {} is closing: {}", self.inner.me, err));
            }
            Err(err) => {
                warn!(to = %relay.distant_addr(), error = %err, "relay failed to send");
                let addr = relay.distant_addr().clone();
                self.repair(parent, &addr, packet, errs).await;
            }
        }
    }

    /// Announces a dead gateway to the routing table, then retries the
    /// packet along the recomputed routes. The recursion is bounded:
    /// every failure either rewires with strictly fewer failing hops
    /// or voids the destinations outright.
    async fn repair(
        &self,
        parent: &Parent,
        gateway: &Address,
        packet: Packet,
        errs: &mpsc::UnboundedSender<anyhow::Error>,
    ) {
        match parent.table.on_failure(gateway) {
            Err(err) => {
                let _ = errs.send(anyhow!("no route to {}: {}", gateway, err));
            }
            Ok(()) => {
                self.send_packet(parent, packet, errs).await;
            }
        }
    }

    /// Returns the relay for `addr`, creating it if needed. Creation
    /// is serialized on the setup lock: prepare the handshake, acquire
    /// a pooled connection, open the stream, and wait for the remote
    /// session to accept before the relay exists. The paired drain
    /// task owns teardown.
    async fn setup_relay(&self, parent: &Parent, addr: &Address) -> Result<Arc<dyn Relay>> {
        if let Some(relay) = self.inner.relays.lock().await.get(addr) {
            return Ok(relay.clone());
        }

        let _setup = self.inner.setup_lock.lock().await;

        if let Some(relay) = self.inner.relays.lock().await.get(addr) {
            return Ok(relay.clone());
        }

        if self.is_closed() {
            bail!("session {} is closing", self.inner.me);
        }

        let handshake = parent
            .table
            .prepare_handshake_for(addr)
            .context("failed to serialize handshake")?;

        let conn = self
            .inner
            .pool
            .acquire(addr)
            .await
            .context("failed to dial")?;

        let opened = self.open_relay_stream(&conn, handshake).await;
        let (send, recv) = match opened {
            Ok(streams) => streams,
            Err(err) => {
                self.inner.pool.release(addr).await;
                return Err(err);
            }
        };

        let relay: Arc<dyn Relay> = Arc::new(UnicastRelay::new(
            addr.clone(),
            conn,
            self.inner.uri.clone(),
            self.inner.stream_id,
            self.inner.me.clone(),
            send,
        ));

        self.inner
            .relays
            .lock()
            .await
            .insert(addr.clone(), relay.clone());

        let sess = self.clone();
        let table = parent.table.clone();
        let drain_addr = addr.clone();
        let drain_relay = relay.clone();
        let guard = self.inner.live.guard();

        tokio::spawn(async move {
            let _guard = guard;
            sess.drain_relay(table, drain_addr, recv, drain_relay).await;
        });

        self.inner.traffic.log_relay(addr);
        trace!(to = %addr, "relay opened");

        Ok(relay)
    }

    async fn open_relay_stream(
        &self,
        conn: &quinn::Connection,
        handshake: Vec<u8>,
    ) -> Result<(quinn::SendStream, RecvStream)> {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .context("failed to open relay stream")?;

        let header = Frame::Open(StreamHeader {
            uri: self.inner.uri.clone(),
            stream_id: self.inner.stream_id,
            gateway: self.inner.me.clone(),
            handshake,
        });
        messages::write_frame(&mut send, &header).await?;

        // The accept frame is the proof that a session exists at the
        // other end; nothing is forwarded before it arrives.
        let frame = tokio::time::timeout(ACCEPT_TIMEOUT, messages::read_frame(&mut recv))
            .await
            .context("timed out waiting for stream acceptance")??;

        match frame {
            Some(Frame::Accept) => Ok((send, recv)),
            Some(Frame::Error { message }) => bail!("stream rejected: {}", message),
            Some(other) => bail!("unexpected frame during stream setup: {:?}", other),
            None => bail!("stream closed before acceptance"),
        }
    }

    /// Reads the relay stream until it ends, feeding upward packets
    /// back through the session. An unexpected error announces the
    /// peer as unreachable so later sends reroute. Cleanup removes the
    /// relay and returns its connection to the pool.
    async fn drain_relay(
        &self,
        table: Arc<dyn RoutingTable>,
        addr: Address,
        mut recv: RecvStream,
        relay: Arc<dyn Relay>,
    ) {
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                frame = messages::read_frame(&mut recv) => match frame {
                    Ok(Some(Frame::Packet(packet))) => {
                        if let Err(err) = self.recv_packet(&addr, packet).await {
                            debug!(from = %addr, error = %err, "failed to relay upward packet");
                        }
                    }
                    Ok(Some(other)) => {
                        debug!(from = %addr, frame = ?other, "unexpected frame on relay stream");
                        break;
                    }
                    Ok(None) => {
                        trace!(to = %addr, "relay is closing");
                        break;
                    }
                    Err(err) => {
                        debug!(to = %addr, error = %err, "relay closed unexpectedly");
                        let _ = table.on_failure(&addr);
                        break;
                    }
                }
            }
        }

        self.inner.relays.lock().await.remove(&addr);
        let _ = relay.close().await;
        drop(relay);
        self.inner.pool.release(&addr).await;
        self.inner.traffic.log_relay_closed(&addr);

        trace!(gateway = %addr, "relay has closed");
    }
}

/// Counts live tasks so `close` can wait for quiescence. Guards are
/// dropped at task exit, after their cleanup ran.
struct WaitGroup {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

struct WaitGuard {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl WaitGroup {
    fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn guard(&self) -> WaitGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        WaitGuard {
            count: self.count.clone(),
            notify: self.notify.clone(),
        }
    }

    async fn wait(&self) {
        loop {
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    fn test_session(port: u16) -> Session {
        let me: Address = format!("http://127.0.0.1:{}", port).parse().unwrap();

        let (certs, key) = crypto::generate_node_cert().unwrap();
        let client_config = crypto::create_client_config(certs, key).unwrap();
        let endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
        let pool = ConnectionPool::new(endpoint, client_config);

        Session::new(me, "test".into(), [0u8; 16], pool)
    }

    struct FailingMessage;

    impl Message for FailingMessage {
        fn encode(&self) -> Result<Vec<u8>> {
            Err(anyhow!("broken payload"))
        }
    }

    struct RawMessage(Vec<u8>);

    impl Message for RawMessage {
        fn encode(&self) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn serialization_failure_yields_one_error() {
        let sess = test_session(2001);
        let to: Address = "http://127.0.0.1:2002".parse().unwrap();

        let mut errs = sess.send(&FailingMessage, &[to]).await;

        let err = errs.recv().await.expect("one error expected");
        assert!(err.to_string().contains("serialize"));
        assert!(errs.recv().await.is_none(), "channel must close after the error");
    }

    #[tokio::test]
    async fn send_without_parents_is_ignored() {
        let sess = test_session(2003);
        let to: Address = "http://127.0.0.1:2004".parse().unwrap();

        let mut errs = sess.send(&RawMessage(b"hi".to_vec()), &[to]).await;

        let err = errs.recv().await.expect("one error expected");
        assert!(err.to_string().contains("packet ignored"));
        assert!(errs.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_concurrent() {
        let sess = test_session(2005);

        let a = sess.clone();
        let b = sess.clone();
        tokio::join!(a.close(), b.close());

        let err = sess.recv().await.expect_err("closed session must not receive");
        assert!(err.to_string().contains("end of stream"));
    }

    #[tokio::test]
    async fn send_after_close_reports_closing() {
        let sess = test_session(2006);
        sess.close().await;

        let to: Address = "http://127.0.0.1:2007".parse().unwrap();
        let mut errs = sess.send(&RawMessage(vec![1]), &[to]).await;

        let err = errs.recv().await.expect("one error expected");
        assert!(err.to_string().contains("closing"));
    }
}
