//! Reference-counted connection pool.
//!
//! Sessions do not own transport connections, they borrow them from
//! the pool: `acquire` hands out a shared QUIC connection (dialing on
//! first use) and `release` returns it, closing the connection when
//! the last borrower is gone. This is deliberately a reference
//! counter, not a cache — a briefly-zero count tears the connection
//! down even if a caller re-acquires a moment later.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use quinn::{ClientConfig, Connection, Endpoint};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::address::Address;

struct PoolEntry {
    conn: Connection,
    refs: usize,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    endpoint: Endpoint,
    client_config: ClientConfig,
    conns: Mutex<HashMap<Address, PoolEntry>>,
}

impl ConnectionPool {
    pub fn new(endpoint: Endpoint, client_config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                client_config,
                conns: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns a ready connection to `addr`, dialing if the pool holds
    /// none. Concurrent callers for the same address coalesce on the
    /// pool lock and share one handle.
    pub async fn acquire(&self, addr: &Address) -> Result<Connection> {
        let mut conns = self.inner.conns.lock().await;

        if let Some(entry) = conns.get_mut(addr) {
            if entry.conn.close_reason().is_none() {
                entry.refs += 1;
                trace!(addr = %addr, refs = entry.refs, "reusing pooled connection");
                return Ok(entry.conn.clone());
            }
            // The transport died underneath us; dial a replacement.
            conns.remove(addr);
        }

        let conn = self.dial(addr).await?;
        conns.insert(
            addr.clone(),
            PoolEntry {
                conn: conn.clone(),
                refs: 1,
            },
        );

        debug!(addr = %addr, "connection established");
        Ok(conn)
    }

    /// Drops one reference to `addr`, closing the transport when the
    /// count hits zero. Releasing an unknown address is a no-op.
    pub async fn release(&self, addr: &Address) {
        let mut conns = self.inner.conns.lock().await;

        let Some(entry) = conns.get_mut(addr) else {
            return;
        };

        entry.refs -= 1;
        if entry.refs == 0 {
            let entry = conns.remove(addr).expect("entry present");
            entry.conn.close(0u32.into(), b"released");
            debug!(addr = %addr, "connection released and closed");
        }
    }

    /// Number of distinct peers currently held.
    pub async fn len(&self) -> usize {
        self.inner.conns.lock().await.len()
    }

    async fn dial(&self, addr: &Address) -> Result<Connection> {
        let socket_addr = addr.socket_addr()?;
        let server_name = addr.host().trim_matches(['[', ']']).to_string();

        let conn = self
            .inner
            .endpoint
            .connect_with(self.inner.client_config.clone(), socket_addr, &server_name)
            .with_context(|| format!("failed to initiate connection to {}", addr))?
            .await
            .with_context(|| format!("{} is unreachable", addr))?;

        Ok(conn)
    }
}
