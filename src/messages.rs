//! # Wire Protocol
//!
//! Everything that crosses a QUIC stream is a *frame*: a 4-byte
//! big-endian length prefix followed by a bincode body, deserialized
//! with a hard size bound so a peer cannot make us allocate
//! arbitrarily.
//!
//! | Frame | Direction | Purpose |
//! |-----------|--------------------|-------------------------------------------|
//! | `Open`    | client → server    | First frame of a relay stream; carries the handshake |
//! | `Accept`  | server → client    | Stream is bound to a session; relay may proceed |
//! | `Packet`  | either             | Routed packet riding an open stream        |
//! | `Forward` | client → server    | Unary verb: one packet, one ack            |
//! | `Ack`     | server → client    | Per-destination error report for a forward |
//! | `Error`   | server → client    | The forward could not be processed at all  |
//!
//! The handshake travels inside `Open` as opaque bytes under the
//! `handshake` field; only the routing strategy that produced it knows
//! its schema.

use anyhow::{Context, Result, bail};
use bincode::Options;
use quinn::{RecvStream, SendStream};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::address::Address;
use crate::packet::Packet;

/// Maximum size of a frame body (1 MiB plus framing overhead).
/// Bounds both the read buffer and bincode's internal allocations.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024 + 4096;

/// Identifier shared by every stream of one RPC call, so that all of a
/// node's inbound streams for that call bind to the same session.
pub type StreamId = [u8; 16];

/// Returns bincode options with the size limit enforced. Always used
/// for deserialization of peer-supplied bytes.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn decode_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode_options()
        .deserialize(bytes)
        .context("malformed frame body")
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).context("failed to serialize")
}

/// A payload that a session can send. Serialization happens exactly
/// once per send, before any leg leaves the node.
pub trait Message: Send + Sync {
    fn encode(&self) -> Result<Vec<u8>>;
}

/// Metadata opening a relay stream: which RPC it belongs to, which
/// call instance, who is on the other end, and the routing handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamHeader {
    pub uri: String,
    pub stream_id: StreamId,
    pub gateway: Address,
    pub handshake: Vec<u8>,
}

/// Unary forward of a single packet, acknowledged per destination.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub uri: String,
    pub stream_id: StreamId,
    pub from: Address,
    pub packet: Packet,
}

/// Best-effort error report: zero or more failed destinations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Ack {
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    Open(StreamHeader),
    Accept,
    Packet(Packet),
    Forward(ForwardRequest),
    Ack(Ack),
    Error { message: String },
}

/// Writes one length-prefixed frame.
pub(crate) async fn write_frame(stream: &mut SendStream, frame: &Frame) -> Result<()> {
    let body = encode(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        bail!("frame too large: {} bytes (max {})", body.len(), MAX_FRAME_SIZE);
    }

    let len = body.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&body).await?;

    Ok(())
}

/// Reads one frame, returning `None` on an orderly end of stream and
/// an error on transport failure or a bogus frame.
pub(crate) async fn read_frame(stream: &mut RecvStream) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(quinn::ReadExactError::ReadError(err)) if is_orderly(&err) => return Ok(None),
        Err(err) => return Err(err).context("failed to read frame header"),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        bail!("peer sent oversized frame: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .context("failed to read frame body")?;

    Ok(Some(decode_bounded(&body)?))
}

/// Stream endings that count as a deliberate shutdown by either side
/// rather than a failure: a plain reset, or the shared connection
/// being returned to the pool.
fn is_orderly(err: &quinn::ReadError) -> bool {
    use quinn::{ConnectionError, ReadError};

    match err {
        ReadError::Reset(code) => *code == quinn::VarInt::from_u32(0),
        ReadError::ConnectionLost(ConnectionError::ApplicationClosed(close)) => {
            close.error_code == quinn::VarInt::from_u32(0)
        }
        ReadError::ConnectionLost(ConnectionError::LocallyClosed) => true,
        _ => false,
    }
}
