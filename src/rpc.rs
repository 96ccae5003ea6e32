//! Client side of an RPC: opening the root stream of a call.
//!
//! The orchestrator of a protocol is not a server. Its session lives
//! under the orchestrator-wrapped form of the node address, and its
//! single parent is the stream relay to the first player: that stream
//! bootstraps a session over there, serves as the liveness signal for
//! the whole call, and is the path answers take to come back. Data
//! still flows through acknowledged unicast relays that the session
//! opens per next hop, exactly as on any interior node.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::address::Address;
use crate::connection::ConnectionPool;
use crate::messages::{self, Frame, Message, StreamHeader, StreamId};
use crate::relay::{Relay, StreamRelay};
use crate::server::{Handler, Overlay};
use crate::session::Session;

/// Bound on the root stream setup: dial plus the accept round trip.
const STREAM_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

impl Overlay {
    /// Registers `handler` under `name` and returns the caller-side
    /// handle for that RPC.
    pub fn make_rpc(&self, name: &str, handler: Arc<dyn Handler>) -> Result<Rpc> {
        self.register_handler(name, handler)?;

        Ok(Rpc {
            overlay: self.clone(),
            uri: name.to_string(),
        })
    }
}

/// Caller-side handle for one registered RPC.
#[derive(Clone)]
pub struct Rpc {
    overlay: Overlay,
    uri: String,
}

impl Rpc {
    /// Opens a stream of this RPC against `players` and returns the
    /// orchestrating session. The first player carries the root
    /// stream; every player is reachable through the routing table the
    /// overlay's router builds for this call.
    pub async fn stream(&self, players: &[Address]) -> Result<StreamSession> {
        if players.is_empty() {
            bail!("stream requires at least one player");
        }

        let me = self.overlay.local_addr().wrap_orchestrator();
        let table = self.overlay.router().new_table(me.clone(), players.to_vec());
        let stream_id: StreamId = rand::random();

        let session = Session::new(
            me.clone(),
            self.uri.clone(),
            stream_id,
            self.overlay.pool().clone(),
        );

        let gateway = players[0].clone();
        let handshake = table
            .prepare_handshake_for(&gateway)
            .context("failed to serialize handshake")?;

        let pool = self.overlay.pool().clone();
        let conn = pool
            .acquire(&gateway)
            .await
            .context("failed to dial the first player")?;

        let opened = tokio::time::timeout(STREAM_SETUP_TIMEOUT, async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .context("failed to open the root stream")?;

            let header = Frame::Open(StreamHeader {
                uri: self.uri.clone(),
                stream_id,
                // The plain endpoint, so the first player keeps this
                // parent distinct from any relay the session opens to
                // it later.
                gateway: me.unwrap(),
                handshake,
            });
            messages::write_frame(&mut send, &header).await?;

            match messages::read_frame(&mut recv).await? {
                Some(Frame::Accept) => Ok((send, recv)),
                Some(Frame::Error { message }) => bail!("stream rejected: {}", message),
                Some(other) => bail!("unexpected frame during stream setup: {:?}", other),
                None => bail!("stream closed before acceptance"),
            }
        })
        .await
        .context("timed out opening the root stream");

        let (send, recv) = match opened.and_then(|r| r) {
            Ok(streams) => streams,
            Err(err) => {
                pool.release(&gateway).await;
                return Err(err);
            }
        };

        let relay = Arc::new(StreamRelay::new(gateway.clone(), send));

        let (ready_tx, ready_rx) = oneshot::channel();
        let listen_session = session.clone();
        let listen_relay: Arc<dyn Relay> = relay.clone();
        let listen_table = table;
        tokio::spawn(async move {
            listen_session
                .listen(listen_relay, listen_table, recv, ready_tx)
                .await;
        });
        let _ = ready_rx.await;

        debug!(uri = %self.uri, gateway = %gateway, "rpc stream opened");

        Ok(StreamSession {
            session,
            gateway,
            pool,
            relay,
            closed: AtomicBool::new(false),
        })
    }
}

/// An open RPC stream held by the orchestrator. Closing it winds the
/// session down and releases the root connection.
pub struct StreamSession {
    session: Session,
    gateway: Address,
    pool: ConnectionPool,
    relay: Arc<StreamRelay>,
    closed: AtomicBool,
}

impl StreamSession {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn send(
        &self,
        msg: &dyn Message,
        addrs: &[Address],
    ) -> mpsc::UnboundedReceiver<anyhow::Error> {
        self.session.send(msg, addrs).await
    }

    pub async fn recv(&self) -> Result<(Address, Vec<u8>)> {
        self.session.recv().await
    }

    /// Ends the call: half-closes the root stream so the first player
    /// winds down, waits for the session to go quiescent, and releases
    /// the root connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            self.session.close().await;
            return;
        }

        let _ = self.relay.close().await;
        self.session.close().await;
        self.pool.release(&self.gateway).await;
    }
}
