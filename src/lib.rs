//! # Trellis — Streaming Overlay Network
//!
//! Trellis carries routed multicasts to a dynamic set of peers over
//! per-RPC *sessions*. A session opens parent/child relay streams over
//! QUIC, forwards packets along a routing table, repairs around link
//! failures, and terminates cleanly — delivery semantics are
//! session-local along whatever table the caller supplies.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------------|---------|
//! | `address`    | Canonical peer identity (`scheme://host:port`) and orchestrator wrapping |
//! | `connection` | Reference-counted pool of shared QUIC connections |
//! | `packet`     | Source + destinations + opaque payload value type |
//! | `routing`    | Routing tables: flat and height-bounded tree with failure repair |
//! | `relay`      | One-hop channels: best-effort stream and acknowledged unicast |
//! | `session`    | Per-RPC participant: local delivery, forwarding, route repair |
//! | `server`     | Overlay endpoint: stream accept, handshake bootstrap, unary forwards |
//! | `rpc`        | Caller-side entry: root stream and orchestrating session |
//! | `sync`       | Block synchronization, the canonical session consumer |
//! | `messages`   | Length-prefixed bincode frames with bounded decoding |
//! | `crypto`     | Ephemeral Ed25519 TLS plumbing for the endpoint |
//! | `traffic`    | Optional packet trace sink for debugging |
//!
//! ## Environment
//!
//! - `LLVL`: log level (`trace`..`error`); unset disables logging.
//! - `CRY_LVL=warn`: warn when an internal unbounded queue backs up.
//! - `TRELLIS_TRAFFIC`: `log` (in-memory) or `print` (stdout) packet
//!   tracing.

mod address;
mod connection;
mod crypto;
mod messages;
mod packet;
mod queue;
mod relay;
mod routing;
mod rpc;
mod server;
mod session;
mod sync;
mod traffic;

pub use address::{Address, Scheme};
pub use connection::ConnectionPool;
pub use messages::{Ack, Message};
pub use packet::Packet;
pub use relay::{Relay, StreamRelay, UnicastRelay};
pub use routing::{FlatRouter, Router, Routes, RoutingTable, TreeRouter, Void, Voids};
pub use rpc::{Rpc, StreamSession};
pub use server::{Handler, Overlay};
pub use session::{Parent, Session};
pub use sync::{Blocks, Event, Link, MemoryBlocks, StateMachine, SYNC_RPC, Synchronizer};
pub use traffic::{TRAFFIC_ENV, Traffic, TrafficEvent};
