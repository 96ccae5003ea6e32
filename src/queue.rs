//! Unbounded delivery queue feeding a session's receive side.
//!
//! Pushes never block and never drop. The cost of that choice is an
//! unbounded buffer, so the queue tracks its depth and, when the
//! `CRY_LVL=warn` environment toggle is set, logs once it backs up
//! past the high-water mark.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::sync::mpsc;
use tracing::warn;

use crate::packet::Packet;

/// Depth beyond which a backed-up queue is worth complaining about.
const HIGH_WATER: usize = 1024;

/// `CRY_LVL=warn` opts into the high-water warnings.
static CRY_WARN: LazyLock<bool> =
    LazyLock::new(|| std::env::var("CRY_LVL").is_ok_and(|v| v == "warn"));

struct Shared {
    depth: AtomicUsize,
    closed: AtomicBool,
}

pub(crate) struct QueuePusher {
    tx: mpsc::UnboundedSender<Packet>,
    shared: Arc<Shared>,
}

pub(crate) struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Packet>,
    shared: Arc<Shared>,
}

/// Creates a connected pusher/receiver pair.
pub(crate) fn queue() -> (QueuePusher, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        depth: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
    });

    (
        QueuePusher {
            tx,
            shared: shared.clone(),
        },
        QueueReceiver { rx, shared },
    )
}

impl QueuePusher {
    /// Enqueues a packet. Fails only on a closed queue.
    pub fn push(&self, packet: Packet) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            bail!("queue is closed");
        }

        if self.tx.send(packet).is_err() {
            bail!("queue is closed");
        }

        let depth = self.shared.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > HIGH_WATER && *CRY_WARN {
            warn!(depth, high_water = HIGH_WATER, "delivery queue is backing up");
        }

        Ok(())
    }

    /// Marks the queue closed; subsequent pushes fail. Idempotent.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

impl QueueReceiver {
    /// Next queued packet, or `None` once closed and drained.
    pub async fn pop(&mut self) -> Option<Packet> {
        let packet = self.rx.recv().await?;
        self.shared.depth.fetch_sub(1, Ordering::Relaxed);
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn packet(tag: u8) -> Packet {
        let src: Address = "http://127.0.0.1:9".parse().unwrap();
        let dst: Address = "http://127.0.0.1:1".parse().unwrap();
        Packet::new(src, vec![dst], vec![tag])
    }

    #[tokio::test]
    async fn push_pop_preserves_order() {
        let (tx, mut rx) = queue();
        tx.push(packet(1)).unwrap();
        tx.push(packet(2)).unwrap();

        assert_eq!(rx.pop().await.unwrap().payload(), &[1]);
        assert_eq!(rx.pop().await.unwrap().payload(), &[2]);
    }

    #[tokio::test]
    async fn push_fails_after_close() {
        let (tx, mut rx) = queue();
        tx.push(packet(1)).unwrap();
        tx.close();
        tx.close();

        assert!(tx.push(packet(2)).is_err());
        // Already-queued packets still drain.
        assert_eq!(rx.pop().await.unwrap().payload(), &[1]);
    }
}
