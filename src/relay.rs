//! Point-to-point relays.
//!
//! A relay is a live one-directional channel to exactly one peer. The
//! stream variant frames packets straight onto an open QUIC stream:
//! acceptance by the transport is all the feedback there is. The
//! unicast variant issues one `Forward` request per packet and returns
//! the per-destination error report, so senders can learn about
//! downstream failures and repair routes.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use quinn::{Connection, SendStream};
use tokio::sync::Mutex;
use tracing::trace;

use crate::address::Address;
use crate::messages::{self, Ack, ForwardRequest, Frame, StreamId};
use crate::packet::Packet;

/// Upper bound on one unary forward round trip.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Relay: Send + Sync {
    /// Address of the peer at the other end.
    fn distant_addr(&self) -> &Address;

    /// Sends a packet through the relay.
    async fn send(&self, packet: &Packet) -> Result<Ack>;

    /// Releases the relay's channel. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Best-effort relay writing packet frames onto an open stream.
pub struct StreamRelay {
    gateway: Address,
    stream: Mutex<SendStream>,
}

impl StreamRelay {
    pub fn new(gateway: Address, stream: SendStream) -> Self {
        Self {
            gateway,
            stream: Mutex::new(stream),
        }
    }

    /// Writes a raw protocol frame. Used by the overlay to confirm
    /// stream acceptance before any packet flows.
    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut stream = self.stream.lock().await;
        messages::write_frame(&mut stream, frame).await
    }
}

#[async_trait]
impl Relay for StreamRelay {
    fn distant_addr(&self) -> &Address {
        &self.gateway
    }

    async fn send(&self, packet: &Packet) -> Result<Ack> {
        trace!(to = %self.gateway, "stream relay send");

        self.send_frame(&Frame::Packet(packet.clone()))
            .await
            .context("stream relay failed to send")?;

        // Acceptance by the transport is the only guarantee here.
        Ok(Ack::default())
    }

    async fn close(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        // Half-close; an already-finished stream is fine.
        let _ = stream.finish();
        Ok(())
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        if let Ok(mut stream) = self.stream.try_lock() {
            let _ = stream.finish();
        }
    }
}

/// Acknowledged relay: one `Forward` request/response per packet. The
/// relay also keeps the session stream to its peer alive; that stream
/// is the peer's signal that this end is still interested.
pub struct UnicastRelay {
    gateway: Address,
    conn: Connection,
    uri: String,
    stream_id: StreamId,
    from: Address,
    stream: std::sync::Mutex<Option<SendStream>>,
}

impl UnicastRelay {
    pub fn new(
        gateway: Address,
        conn: Connection,
        uri: String,
        stream_id: StreamId,
        from: Address,
        stream: SendStream,
    ) -> Self {
        Self {
            gateway,
            conn,
            uri,
            stream_id,
            from,
            stream: std::sync::Mutex::new(Some(stream)),
        }
    }
}

#[async_trait]
impl Relay for UnicastRelay {
    fn distant_addr(&self) -> &Address {
        &self.gateway
    }

    async fn send(&self, packet: &Packet) -> Result<Ack> {
        trace!(to = %self.gateway, "unicast relay send");

        let request = Frame::Forward(ForwardRequest {
            uri: self.uri.clone(),
            stream_id: self.stream_id,
            from: self.from.clone(),
            packet: packet.clone(),
        });

        tokio::time::timeout(FORWARD_TIMEOUT, async {
            let (mut send, mut recv) = self
                .conn
                .open_bi()
                .await
                .context("failed to open forward stream")?;

            messages::write_frame(&mut send, &request).await?;
            send.finish().ok();

            match messages::read_frame(&mut recv).await? {
                Some(Frame::Ack(ack)) => Ok(ack),
                Some(Frame::Error { message }) => bail!("forward rejected: {}", message),
                Some(other) => bail!("unexpected response to forward: {:?}", other),
                None => bail!("forward stream closed without an ack"),
            }
        })
        .await
        .context("forward timed out")?
    }

    async fn close(&self) -> Result<()> {
        // The per-packet streams are short-lived and the session
        // stream is torn down with the relay itself.
        Ok(())
    }
}

impl Drop for UnicastRelay {
    fn drop(&mut self) {
        // Finishing the session stream tells the peer this end is done
        // with it, which reads as an orderly end of stream over there.
        if let Ok(mut guard) = self.stream.lock()
            && let Some(mut stream) = guard.take()
        {
            let _ = stream.finish();
        }
    }
}
