//! # Block Synchronization
//!
//! The canonical consumer of the session layer: an orchestrator
//! announces its latest block index to a set of players and walks each
//! of them from *soft* (the player knows the index) to *hard* (the
//! player holds every block up to it), streaming the missing links to
//! whoever asks.
//!
//! Progress is published as coalesced [`Event`] snapshots: observers
//! always see the newest soft/hard counts, and the channel closing
//! marks the end of the round.
//!
//! Block storage and the consensus state machine stay behind the
//! [`Blocks`] and [`StateMachine`] traits; [`MemoryBlocks`] is the
//! in-memory implementation used by the binary and the tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use crate::address::Address;
use crate::messages::{self, Message};
use crate::rpc::{Rpc, StreamSession};
use crate::server::{Handler, Overlay};
use crate::session::Session;

/// RPC name the synchronizer registers on its overlay.
pub const SYNC_RPC: &str = "blocksync";

/// One chain link: the block at `index` plus whatever proof material
/// the consensus layer wants to carry with it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub index: u64,
    pub payload: Vec<u8>,
}

/// Read access to the local chain.
pub trait Blocks: Send + Sync + 'static {
    fn len(&self) -> u64;

    fn get(&self, index: u64) -> Result<Link>;
}

/// The consensus state machine's catch-up entry point: validate and
/// apply one link on a lagging node.
pub trait StateMachine: Send + Sync + 'static {
    fn catch_up(&self, link: Link) -> Result<()>;
}

/// Tagged protocol messages. Every added variant is a compile-time
/// fan-out in the two dispatch loops below.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum SyncMessage {
    Announce { latest: u64 },
    Request { from: u64 },
    Reply { link: Link },
    Ack,
}

impl SyncMessage {
    fn decode(bytes: &[u8]) -> Result<Self> {
        messages::decode_bounded(bytes)
    }
}

impl Message for SyncMessage {
    fn encode(&self) -> Result<Vec<u8>> {
        messages::encode(self)
    }
}

/// Progress snapshot of one synchronization round.
#[derive(Clone, Debug, Default)]
pub struct Event {
    pub soft: usize,
    pub hard: usize,
    pub errors: Vec<String>,
}

/// Soft/hard block synchronizer bound to one overlay.
pub struct Synchronizer {
    rpc: Rpc,
    blocks: Arc<dyn Blocks>,
    latest: Arc<AtomicU64>,
}

impl Synchronizer {
    /// Registers the `blocksync` handler on `overlay` and returns the
    /// synchronizer driving it.
    pub fn new(
        overlay: &Overlay,
        blocks: Arc<dyn Blocks>,
        state: Arc<dyn StateMachine>,
    ) -> Result<Self> {
        let latest = Arc::new(AtomicU64::new(blocks.len()));

        let handler = SyncHandler {
            latest: latest.clone(),
            blocks: blocks.clone(),
            state,
            catch_up: Mutex::new(()),
        };

        let rpc = overlay
            .make_rpc(SYNC_RPC, Arc::new(handler))
            .context("rpc creation failed")?;

        Ok(Self {
            rpc,
            blocks,
            latest,
        })
    }

    /// Latest block index this node knows of. Monotonically
    /// non-decreasing, safe without locks.
    pub fn latest(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    /// Starts a synchronization round against `players` and returns
    /// the progress events. The channel closes when every player is
    /// hard-synchronized or the round failed.
    pub fn sync(&self, players: Vec<Address>) -> watch::Receiver<Event> {
        let (events, rx) = watch::channel(Event::default());

        let rpc = self.rpc.clone();
        let blocks = self.blocks.clone();

        tokio::spawn(async move {
            if let Err(err) = routine(rpc, blocks, players, &events).await {
                warn!(error = %err, "synchronization failed");
            }
        });

        rx
    }
}

async fn routine(
    rpc: Rpc,
    blocks: Arc<dyn Blocks>,
    players: Vec<Address>,
    events: &watch::Sender<Event>,
) -> Result<()> {
    let stream = rpc.stream(&players).await.context("stream failed")?;

    let result = orchestrate(&stream, &blocks, &players, events).await;
    stream.close().await;

    result
}

async fn orchestrate(
    stream: &StreamSession,
    blocks: &Arc<dyn Blocks>,
    players: &[Address],
    events: &watch::Sender<Event>,
) -> Result<()> {
    // 1. Tell everyone about the latest block so they can learn
    // whether they lag behind.
    let latest = blocks.len();
    let mut errs = stream
        .send(&SyncMessage::Announce { latest }, players)
        .await;
    if let Some(err) = errs.recv().await {
        return Err(err).context("announcement failed");
    }

    // 2. Wait for the hard synchronization to complete.
    let mut soft: HashSet<Address> = HashSet::new();
    let mut hard: HashSet<Address> = HashSet::new();
    let mut hard_errs: Vec<String> = Vec::new();

    while hard.len() < players.len() {
        let (from, bytes) = stream.recv().await.context("receiver failed")?;

        let msg = match SyncMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(from = %from, error = %err, "ignoring undecodable message");
                continue;
            }
        };

        match msg {
            SyncMessage::Request { from: index } => {
                if soft.contains(&from) {
                    warn!(from = %from, "found duplicate request");
                    continue;
                }

                soft.insert(from.clone());
                publish(events, &soft, &hard, &hard_errs);

                if let Err(err) = send_chain(stream, blocks, index, &from).await {
                    hard.insert(from.clone());
                    hard_errs.push(err.to_string());
                    publish(events, &soft, &hard, &hard_errs);
                }
            }
            SyncMessage::Ack => {
                soft.insert(from.clone());
                hard.insert(from.clone());
                publish(events, &soft, &hard, &hard_errs);
            }
            SyncMessage::Announce { .. } | SyncMessage::Reply { .. } => {}
        }
    }

    Ok(())
}

/// Streams blocks `[from, len)` to one lagging player.
async fn send_chain(
    stream: &StreamSession,
    blocks: &Arc<dyn Blocks>,
    from: u64,
    to: &Address,
) -> Result<()> {
    for index in from..blocks.len() {
        debug!(index, to = %to, "sending block");

        let link = blocks.get(index).context("couldn't get block")?;

        let mut errs = stream
            .send(&SyncMessage::Reply { link }, std::slice::from_ref(to))
            .await;
        if let Some(err) = errs.recv().await {
            return Err(err).context("failed to send block");
        }
    }

    Ok(())
}

/// A new event always supersedes the previous one, so the watch
/// channel keeps only the newest snapshot for slow observers.
fn publish(
    events: &watch::Sender<Event>,
    soft: &HashSet<Address>,
    hard: &HashSet<Address>,
    errors: &[String],
) {
    events.send_replace(Event {
        soft: soft.len(),
        hard: hard.len(),
        errors: errors.to_vec(),
    });
}

struct SyncHandler {
    latest: Arc<AtomicU64>,
    blocks: Arc<dyn Blocks>,
    state: Arc<dyn StateMachine>,
    // One catch-up loop at a time per participant.
    catch_up: Mutex<()>,
}

impl SyncHandler {
    async fn wait_announce(&self, session: &Session) -> Result<(u64, Address)> {
        loop {
            let (from, bytes) = session.recv().await.context("receiver failed")?;

            // TODO: validate the announced index against a genesis
            // proof instead of trusting the orchestrator's number.
            if let Ok(SyncMessage::Announce { latest }) = SyncMessage::decode(&bytes) {
                return Ok((latest, from));
            }
        }
    }

    async fn ack(&self, session: &Session, orch: &Address) -> Result<()> {
        let mut errs = session
            .send(&SyncMessage::Ack, std::slice::from_ref(orch))
            .await;
        if let Some(err) = errs.recv().await {
            return Err(err).context("sending ack failed");
        }

        Ok(())
    }
}

#[async_trait]
impl Handler for SyncHandler {
    async fn stream(&self, session: Session) -> Result<()> {
        let (announced, orch) = self.wait_announce(&session).await?;

        debug!(index = announced, "received synchronization message");

        if announced <= self.blocks.len() {
            // Everything known so far is already stored; acknowledge
            // the hard synchronization outright.
            return self.ack(&session, &orch).await;
        }

        let _guard = self.catch_up.lock().await;

        // Blocks may have been stored while waiting for the lock; the
        // request below goes out with the current length, so nothing
        // is caught up twice.
        self.latest.fetch_max(announced, Ordering::AcqRel);

        let mut errs = session
            .send(
                &SyncMessage::Request {
                    from: self.blocks.len(),
                },
                std::slice::from_ref(&orch),
            )
            .await;
        if let Some(err) = errs.recv().await {
            return Err(err).context("sending request failed");
        }

        while self.blocks.len() < announced {
            let (_, bytes) = session.recv().await.context("receiver failed")?;

            if let Ok(SyncMessage::Reply { link }) = SyncMessage::decode(&bytes) {
                debug!(index = link.index, "catching up block");

                self.state
                    .catch_up(link)
                    .context("state machine catch up failed")?;
            }
        }

        self.ack(&session, &orch).await
    }
}

/// Append-only in-memory chain implementing both collaborator traits.
#[derive(Default)]
pub struct MemoryBlocks {
    links: std::sync::RwLock<Vec<Link>>,
}

impl MemoryBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain seeded with `count` deterministic blocks.
    pub fn with_count(count: u64) -> Self {
        let links = (0..count)
            .map(|index| Link {
                index,
                payload: format!("block-{}", index).into_bytes(),
            })
            .collect();

        Self {
            links: std::sync::RwLock::new(links),
        }
    }
}

impl Blocks for MemoryBlocks {
    fn len(&self) -> u64 {
        self.links.read().expect("chain lock poisoned").len() as u64
    }

    fn get(&self, index: u64) -> Result<Link> {
        self.links
            .read()
            .expect("chain lock poisoned")
            .get(index as usize)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no block at index {}", index))
    }
}

impl StateMachine for MemoryBlocks {
    fn catch_up(&self, link: Link) -> Result<()> {
        let mut links = self.links.write().expect("chain lock poisoned");

        if link.index != links.len() as u64 {
            bail!(
                "out of order link: got index {}, expected {}",
                link.index,
                links.len()
            );
        }

        links.push(link);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_message_roundtrip() {
        let msg = SyncMessage::Reply {
            link: Link {
                index: 3,
                payload: b"block-3".to_vec(),
            },
        };

        let bytes = msg.encode().unwrap();
        match SyncMessage::decode(&bytes).unwrap() {
            SyncMessage::Reply { link } => {
                assert_eq!(link.index, 3);
                assert_eq!(link.payload, b"block-3");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn memory_blocks_enforce_order() {
        let chain = MemoryBlocks::with_count(2);
        assert_eq!(chain.len(), 2);

        let skipped = Link {
            index: 5,
            payload: vec![],
        };
        assert!(chain.catch_up(skipped).is_err());

        let next = Link {
            index: 2,
            payload: vec![],
        };
        chain.catch_up(next).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.get(2).unwrap().index, 2);
    }

    #[test]
    fn latest_only_grows() {
        let latest = AtomicU64::new(4);

        latest.fetch_max(2, Ordering::AcqRel);
        assert_eq!(latest.load(Ordering::Acquire), 4);

        latest.fetch_max(9, Ordering::AcqRel);
        assert_eq!(latest.load(Ordering::Acquire), 9);
    }
}
