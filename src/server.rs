//! # Overlay Server
//!
//! The overlay owns the QUIC endpoint of a node. Inbound bi-streams
//! are dispatched on their first frame:
//!
//! - `Open` binds the stream to the per-call session (creating it, and
//!   spawning the RPC handler, on first contact), installs a
//!   stream-relay parent and answers `Accept` once the parent is
//!   registered — that ack is what unblocks the dialing peer's relay
//!   setup. The stream is then drained for the session's lifetime.
//! - `Forward` is the unary verb: one packet in, one ack out, routed
//!   through the session's inbound path.
//!
//! Anything else as a first frame is protocol misuse and terminal for
//! that stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use quinn::Endpoint;
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::address::Address;
use crate::connection::ConnectionPool;
use crate::crypto;
use crate::messages::{self, ForwardRequest, Frame, StreamHeader, StreamId};
use crate::relay::{Relay, StreamRelay};
use crate::routing::Router;
use crate::session::Session;

/// Bound on how long the first frame of an inbound stream may take.
const OPEN_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-RPC stream handler, spawned with the session when the first
/// stream of a call reaches this node.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn stream(&self, session: Session) -> Result<()>;
}

/// A node's overlay endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Overlay {
    inner: Arc<OverlayInner>,
}

struct OverlayInner {
    me: Address,
    endpoint: Endpoint,
    router: Arc<dyn Router>,
    pool: ConnectionPool,
    handlers: std::sync::RwLock<HashMap<String, Arc<dyn Handler>>>,
    sessions: Mutex<HashMap<StreamId, Session>>,
    shutdown: watch::Sender<bool>,
}

impl Overlay {
    /// Binds the overlay on `addr` with the given routing strategy and
    /// starts accepting streams.
    pub async fn bind(addr: Address, router: Arc<dyn Router>) -> Result<Overlay> {
        let socket_addr = addr.socket_addr()?;

        let (server_certs, server_key) =
            crypto::generate_node_cert().context("failed to generate node certificate")?;
        let server_config = crypto::create_server_config(server_certs, server_key)?;

        let (client_certs, client_key) =
            crypto::generate_node_cert().context("failed to generate client certificate")?;
        let client_config = crypto::create_client_config(client_certs, client_key)?;

        let endpoint = Endpoint::server(server_config, socket_addr)
            .with_context(|| format!("failed to bind overlay on {}", addr))?;

        let pool = ConnectionPool::new(endpoint.clone(), client_config);
        let (shutdown, _) = watch::channel(false);

        let overlay = Overlay {
            inner: Arc::new(OverlayInner {
                me: addr.clone(),
                endpoint,
                router,
                pool,
                handlers: std::sync::RwLock::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                shutdown,
            }),
        };

        let accept = overlay.clone();
        tokio::spawn(async move {
            accept.accept_loop().await;
        });

        info!(addr = %addr, "overlay listening");
        Ok(overlay)
    }

    pub fn local_addr(&self) -> &Address {
        &self.inner.me
    }

    pub(crate) fn router(&self) -> Arc<dyn Router> {
        self.inner.router.clone()
    }

    /// The node's connection pool; exposed so consumers can observe
    /// the held-connection balance.
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub(crate) fn register_handler(&self, uri: &str, handler: Arc<dyn Handler>) -> Result<()> {
        let mut handlers = self.inner.handlers.write().expect("handlers lock poisoned");
        if handlers.contains_key(uri) {
            bail!("rpc {:?} is already registered", uri);
        }
        handlers.insert(uri.to_string(), handler);
        Ok(())
    }

    /// Shuts the overlay down: every live session is closed and the
    /// endpoint drained.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);

        let sessions: Vec<Session> = self.inner.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }

        self.inner.endpoint.close(0u32.into(), b"shutdown");
        self.inner.endpoint.wait_idle().await;
        debug!(addr = %self.inner.me, "overlay closed");
    }

    async fn accept_loop(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                incoming = self.inner.endpoint.accept() => {
                    let Some(incoming) = incoming else { break };
                    let overlay = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = overlay.handle_connection(incoming).await {
                            debug!(error = %err, "connection handler ended");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, incoming: quinn::Incoming) -> Result<()> {
        let connection = incoming.await.context("failed to accept connection")?;
        let remote = connection.remote_address();
        trace!(remote = %remote, "peer connected");

        loop {
            let stream = match connection.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed)
                | Err(quinn::ConnectionError::TimedOut) => {
                    trace!(remote = %remote, "connection closed");
                    break Ok(());
                }
                Err(err) => break Err(err.into()),
            };

            let overlay = self.clone();
            tokio::spawn(async move {
                if let Err(err) = overlay.handle_stream(stream).await {
                    debug!(error = %err, "stream handler ended");
                }
            });
        }
    }

    async fn handle_stream(
        &self,
        (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    ) -> Result<()> {
        let first = tokio::time::timeout(OPEN_READ_TIMEOUT, messages::read_frame(&mut recv))
            .await
            .context("timed out reading the first frame")??;

        match first {
            Some(Frame::Open(header)) => self.serve_stream(header, send, recv).await,
            Some(Frame::Forward(request)) => self.serve_forward(request, send).await,
            Some(other) => {
                let reply = Frame::Error {
                    message: format!("unexpected first frame: {:?}", other),
                };
                let _ = messages::write_frame(&mut send, &reply).await;
                bail!("protocol misuse: unexpected first frame");
            }
            None => Ok(()),
        }
    }

    /// Binds an inbound relay stream to its session and drains it.
    async fn serve_stream(
        &self,
        header: StreamHeader,
        mut send: quinn::SendStream,
        recv: quinn::RecvStream,
    ) -> Result<()> {
        let table = match self
            .inner
            .router
            .table_from(self.inner.me.clone(), &header.handshake)
        {
            Ok(table) => table,
            Err(err) => {
                let reply = Frame::Error {
                    message: format!("malformed handshake: {}", err),
                };
                let _ = messages::write_frame(&mut send, &reply).await;
                return Err(err).context("malformed handshake");
            }
        };

        let (session, created) = self.get_or_create_session(&header).await;

        if created {
            let handler = self
                .inner
                .handlers
                .read()
                .expect("handlers lock poisoned")
                .get(&header.uri)
                .cloned();

            match handler {
                Some(handler) => {
                    let handler_session = session.clone();
                    let uri = header.uri.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handler.stream(handler_session).await {
                            warn!(uri = %uri, error = %err, "rpc handler failed");
                        }
                    });
                }
                None => {
                    self.inner.sessions.lock().await.remove(&header.stream_id);
                    session.close().await;

                    let reply = Frame::Error {
                        message: format!("no handler for rpc {:?}", header.uri),
                    };
                    let _ = messages::write_frame(&mut send, &reply).await;
                    bail!("no handler for rpc {:?}", header.uri);
                }
            }
        }

        let relay = Arc::new(StreamRelay::new(header.gateway.clone(), send));

        // The parent must be registered before the accept frame goes
        // out, otherwise an immediate forward could find no parent.
        let (ready_tx, ready_rx) = oneshot::channel();
        let listen_session = session.clone();
        let listen_relay: Arc<dyn Relay> = relay.clone();
        let listen_table = table;
        let drain = tokio::spawn(async move {
            listen_session
                .listen(listen_relay, listen_table, recv, ready_tx)
                .await;
        });

        if ready_rx.await.is_ok() {
            relay.send_frame(&Frame::Accept).await.ok();
        }

        let _ = drain.await;

        // Last parent gone: the session has no upstream left and winds
        // down.
        if session.parent_count().await == 0 {
            self.inner.sessions.lock().await.remove(&header.stream_id);
            session.close().await;
        }

        Ok(())
    }

    async fn serve_forward(
        &self,
        request: ForwardRequest,
        mut send: quinn::SendStream,
    ) -> Result<()> {
        let session = self
            .inner
            .sessions
            .lock()
            .await
            .get(&request.stream_id)
            .cloned();

        let reply = match session {
            None => Frame::Error {
                message: format!("no session for rpc {:?}", request.uri),
            },
            Some(session) => match session.recv_packet(&request.from, request.packet).await {
                Ok(ack) => Frame::Ack(ack),
                Err(err) => Frame::Error {
                    message: err.to_string(),
                },
            },
        };

        messages::write_frame(&mut send, &reply).await?;
        send.finish().ok();

        Ok(())
    }

    async fn get_or_create_session(&self, header: &StreamHeader) -> (Session, bool) {
        let mut sessions = self.inner.sessions.lock().await;

        if let Some(session) = sessions.get(&header.stream_id) {
            return (session.clone(), false);
        }

        let session = Session::new(
            self.inner.me.clone(),
            header.uri.clone(),
            header.stream_id,
            self.inner.pool.clone(),
        );
        sessions.insert(header.stream_id, session.clone());

        (session, true)
    }
}
