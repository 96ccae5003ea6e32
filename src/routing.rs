//! # Routing Tables
//!
//! A routing table is the per-session brain deciding where each packet
//! destination goes next. `forward` partitions a packet into one
//! sub-packet per next hop — `None` meaning "hand it upward through
//! the parent relay" — plus a void entry per unreachable destination.
//! `on_failure` is the repair hook: it either rewires around a dead
//! next hop or reports that the affected destinations are lost.
//!
//! Two strategies ship with the crate:
//!
//! - **flat**: the caller talks to every player directly, one hop.
//!   Failure of a player cannot be routed around, only voided.
//! - **tree**: players are split into branches of bounded height;
//!   interior nodes serve their subtree and hand anything else upward.
//!   Failure of a branch gateway promotes its members to direct
//!   children, so the spanning tree reshapes instead of dying.
//!
//! When a relay stream is opened, the table prepares a *handshake* for
//! the remote peer: the serialized bundle from which that peer rebuilds
//! its own consistent view — its subtree and its remaining height.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::messages;
use crate::packet::Packet;

/// Why a destination could not be routed.
#[derive(Clone, Debug)]
pub struct Void {
    pub reason: String,
}

/// Sub-packets per next hop. `None` routes through the parent relay.
pub type Routes = HashMap<Option<Address>, Packet>;

/// Unroutable destinations.
pub type Voids = HashMap<Address, Void>;

/// Per-session routing decisions. Implementations use interior
/// mutability: `on_failure` mutates the route set seen by later
/// `forward` calls.
pub trait RoutingTable: Send + Sync {
    /// Builds a canonical packet for this table's topology.
    fn make(&self, source: Address, destinations: Vec<Address>, payload: Vec<u8>) -> Packet {
        Packet::new(source, destinations, payload)
    }

    /// Partitions a packet by next hop. Every input destination lands
    /// in exactly one of: a route's destination set, or the voids.
    fn forward(&self, packet: &Packet) -> (Routes, Voids);

    /// Serialized bundle from which `peer` reconstructs its own table.
    fn prepare_handshake_for(&self, peer: &Address) -> Result<Vec<u8>>;

    /// Records `peer` as unreachable. `Ok` means alternative routes
    /// exist and a retry is worthwhile; `Err` means the destinations
    /// behind the peer are lost.
    fn on_failure(&self, peer: &Address) -> Result<()>;
}

/// Factory for routing tables: builds the root table on the caller and
/// rebuilds member tables from handshakes on joining peers.
pub trait Router: Send + Sync {
    fn new_table(&self, me: Address, players: Vec<Address>) -> Arc<dyn RoutingTable>;

    fn table_from(&self, me: Address, handshake: &[u8]) -> Result<Arc<dyn RoutingTable>>;
}

/// Wire form of the handshake shared by both strategies: the remaining
/// tree height and the subtree the receiving peer is responsible for.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Handshake {
    height: u32,
    peers: Vec<Address>,
}

// ============================================================================
// Flat strategy
// ============================================================================

/// One hop from the caller to each participant.
pub struct FlatRouter;

impl Router for FlatRouter {
    fn new_table(&self, me: Address, players: Vec<Address>) -> Arc<dyn RoutingTable> {
        let _ = players;
        Arc::new(FlatTable {
            me,
            root: true,
            failed: Mutex::new(HashSet::new()),
        })
    }

    fn table_from(&self, me: Address, handshake: &[u8]) -> Result<Arc<dyn RoutingTable>> {
        let _: Handshake = messages::decode_bounded(handshake)?;
        Ok(Arc::new(FlatTable {
            me,
            root: false,
            failed: Mutex::new(HashSet::new()),
        }))
    }
}

struct FlatTable {
    me: Address,
    root: bool,
    failed: Mutex<HashSet<Address>>,
}

impl RoutingTable for FlatTable {
    fn forward(&self, packet: &Packet) -> (Routes, Voids) {
        let mut routes: HashMap<Option<Address>, Vec<Address>> = HashMap::new();
        let mut voids = Voids::new();

        let failed = self.failed.lock().expect("flat table poisoned");

        for dest in packet.destinations() {
            if !self.root {
                // Participants are leaves: everything goes upward.
                routes.entry(None).or_default().push(dest.clone());
            } else if failed.contains(dest) {
                voids.insert(
                    dest.clone(),
                    Void {
                        reason: "link failed".into(),
                    },
                );
            } else if dest.is_orchestrator() && *dest != self.me {
                voids.insert(
                    dest.clone(),
                    Void {
                        reason: "orchestrator is not a routable destination".into(),
                    },
                );
            } else {
                routes.entry(Some(dest.clone())).or_default().push(dest.clone());
            }
        }

        let routes = routes
            .into_iter()
            .map(|(hop, dests)| (hop, packet.with_destinations(dests)))
            .collect();

        (routes, voids)
    }

    fn prepare_handshake_for(&self, _peer: &Address) -> Result<Vec<u8>> {
        messages::encode(&Handshake {
            height: 0,
            peers: Vec::new(),
        })
    }

    fn on_failure(&self, peer: &Address) -> Result<()> {
        self.failed
            .lock()
            .expect("flat table poisoned")
            .insert(peer.clone());

        Err(anyhow!("no alternative route to {}", peer))
    }
}

// ============================================================================
// Tree strategy
// ============================================================================

/// Spanning tree of bounded height with sibling promotion on failure.
pub struct TreeRouter {
    height: u32,
}

impl TreeRouter {
    pub fn new(height: u32) -> Self {
        Self {
            height: height.max(1),
        }
    }
}

impl Router for TreeRouter {
    fn new_table(&self, me: Address, players: Vec<Address>) -> Arc<dyn RoutingTable> {
        Arc::new(TreeTable {
            me,
            root: true,
            state: Mutex::new(TreeState::build(self.height, players)),
        })
    }

    fn table_from(&self, me: Address, handshake: &[u8]) -> Result<Arc<dyn RoutingTable>> {
        let hs: Handshake = messages::decode_bounded(handshake)?;
        let peers: Vec<Address> = hs.peers.into_iter().filter(|p| *p != me).collect();

        Ok(Arc::new(TreeTable {
            me,
            root: false,
            state: Mutex::new(TreeState::build(hs.height.max(1), peers)),
        }))
    }
}

struct TreeTable {
    me: Address,
    root: bool,
    state: Mutex<TreeState>,
}

struct TreeState {
    height: u32,
    /// destination -> branch gateway, for every address in the subtree.
    routes: HashMap<Address, Address>,
    /// branch gateway -> members behind it (gateway excluded).
    children: HashMap<Address, Vec<Address>>,
    failed: HashSet<Address>,
}

impl TreeState {
    /// Splits `players` into branches whose count keeps the tree depth
    /// within `height`. Branch order follows the player order, so a
    /// given player list always yields the same tree.
    fn build(height: u32, players: Vec<Address>) -> Self {
        let mut routes = HashMap::new();
        let mut children = HashMap::new();

        let count = players.len();
        if count > 0 {
            let branches = if height <= 1 {
                count
            } else {
                ((count as f64).powf(1.0 / f64::from(height)).ceil() as usize).max(1)
            };

            let chunk = count.div_ceil(branches);

            for branch in players.chunks(chunk) {
                let gateway = branch[0].clone();
                let members: Vec<Address> = branch[1..].to_vec();

                for member in branch {
                    routes.insert(member.clone(), gateway.clone());
                }
                children.insert(gateway, members);
            }
        }

        Self {
            height,
            routes,
            children,
            failed: HashSet::new(),
        }
    }
}

impl RoutingTable for TreeTable {
    fn forward(&self, packet: &Packet) -> (Routes, Voids) {
        let mut routes: HashMap<Option<Address>, Vec<Address>> = HashMap::new();
        let mut voids = Voids::new();

        let state = self.state.lock().expect("tree table poisoned");

        for dest in packet.destinations() {
            if state.failed.contains(dest) {
                voids.insert(
                    dest.clone(),
                    Void {
                        reason: "link failed".into(),
                    },
                );
            } else if let Some(gateway) = state.routes.get(dest) {
                routes
                    .entry(Some(gateway.clone()))
                    .or_default()
                    .push(dest.clone());
            } else if self.root {
                // The root knows the whole player set; anything else
                // has nowhere to go.
                voids.insert(
                    dest.clone(),
                    Void {
                        reason: "no route".into(),
                    },
                );
            } else {
                routes.entry(None).or_default().push(dest.clone());
            }
        }

        let routes = routes
            .into_iter()
            .map(|(hop, dests)| (hop, packet.with_destinations(dests)))
            .collect();

        (routes, voids)
    }

    fn prepare_handshake_for(&self, peer: &Address) -> Result<Vec<u8>> {
        let state = self.state.lock().expect("tree table poisoned");

        let peers = state.children.get(peer).cloned().unwrap_or_default();

        messages::encode(&Handshake {
            height: state.height.saturating_sub(1).max(1),
            peers,
        })
    }

    fn on_failure(&self, peer: &Address) -> Result<()> {
        let mut state = self.state.lock().expect("tree table poisoned");

        state.failed.insert(peer.clone());
        state.routes.remove(peer);

        let members = state.children.remove(peer).unwrap_or_default();
        if members.is_empty() {
            return Err(anyhow!("no alternative route to {}", peer));
        }

        // Promote the orphaned members to direct children: the tree
        // loses height for that branch but every reachable destination
        // keeps a route.
        for member in members {
            state.routes.insert(member.clone(), member.clone());
            state.children.insert(member, Vec::new());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        format!("http://127.0.0.1:{}", port).parse().unwrap()
    }

    fn addrs(ports: &[u16]) -> Vec<Address> {
        ports.iter().map(|p| addr(*p)).collect()
    }

    /// Every destination of the input must appear exactly once across
    /// the routes' destination sets and the void keys.
    fn assert_partition(packet: &Packet, routes: &Routes, voids: &Voids) {
        let mut seen: Vec<&Address> = Vec::new();
        for sub in routes.values() {
            seen.extend(sub.destinations());
        }
        seen.extend(voids.keys());

        let mut expected: Vec<&Address> = packet.destinations().iter().collect();
        let sort = |v: &mut Vec<&Address>| v.sort_by_key(|a| a.to_string());
        sort(&mut seen);
        sort(&mut expected);
        assert_eq!(seen, expected, "forward must partition destinations exactly");
    }

    #[test]
    fn flat_root_routes_each_player_directly() {
        let me = addr(1).wrap_orchestrator();
        let table = FlatRouter.new_table(me.clone(), addrs(&[2, 3, 4]));

        let pkt = table.make(me, addrs(&[2, 3, 4]), b"x".to_vec());
        let (routes, voids) = table.forward(&pkt);

        assert_eq!(routes.len(), 3);
        assert!(voids.is_empty());
        assert!(routes.contains_key(&Some(addr(2))));
        assert_partition(&pkt, &routes, &voids);
    }

    #[test]
    fn flat_leaf_routes_upward() {
        let hs = FlatRouter
            .new_table(addr(1), addrs(&[2, 3]))
            .prepare_handshake_for(&addr(2))
            .unwrap();
        let table = FlatRouter.table_from(addr(2), &hs).unwrap();

        let pkt = table.make(addr(2), vec![addr(1).wrap_orchestrator(), addr(3)], vec![]);
        let (routes, voids) = table.forward(&pkt);

        assert_eq!(routes.len(), 1);
        assert!(routes.contains_key(&None));
        assert!(voids.is_empty());
        assert_partition(&pkt, &routes, &voids);
    }

    #[test]
    fn flat_failure_voids_subsequent_forwards() {
        let table = FlatRouter.new_table(addr(1), addrs(&[2, 3]));

        assert!(table.on_failure(&addr(2)).is_err());

        let pkt = table.make(addr(1), addrs(&[2, 3]), vec![]);
        let (routes, voids) = table.forward(&pkt);

        assert_eq!(routes.len(), 1);
        assert_eq!(voids.len(), 1);
        assert!(voids.contains_key(&addr(2)));
        assert_partition(&pkt, &routes, &voids);
    }

    #[test]
    fn tree_groups_players_into_branches() {
        // Height 2 over three players: two branches, the first with an
        // interior gateway.
        let table = TreeRouter::new(2).new_table(addr(1), addrs(&[2, 3, 4]));

        let pkt = table.make(addr(1), addrs(&[2, 3, 4]), vec![]);
        let (routes, voids) = table.forward(&pkt);

        assert!(voids.is_empty());
        assert_eq!(routes.len(), 2);

        let via_first = routes.get(&Some(addr(2))).expect("first branch");
        assert_eq!(via_first.destinations().len(), 2);
        assert_partition(&pkt, &routes, &voids);
    }

    #[test]
    fn tree_handshake_rebuilds_subtree() {
        let root = TreeRouter::new(2).new_table(addr(1), addrs(&[2, 3, 4]));
        let hs = root.prepare_handshake_for(&addr(2)).unwrap();

        let child = TreeRouter::new(2).table_from(addr(2), &hs).unwrap();

        // The gateway owns player 3 and hands everything else upward.
        let pkt = child.make(addr(2), vec![addr(3), addr(1).wrap_orchestrator()], vec![]);
        let (routes, voids) = child.forward(&pkt);

        assert!(voids.is_empty());
        assert!(routes.contains_key(&Some(addr(3))));
        assert!(routes.contains_key(&None));
        assert_partition(&pkt, &routes, &voids);
    }

    #[test]
    fn tree_failure_promotes_members() {
        let table = TreeRouter::new(2).new_table(addr(1), addrs(&[2, 3, 4]));

        // Gateway 2 dies; its member 3 must be promoted.
        assert!(table.on_failure(&addr(2)).is_ok());

        let pkt = table.make(addr(1), addrs(&[2, 3, 4]), vec![]);
        let (routes, voids) = table.forward(&pkt);

        assert!(voids.contains_key(&addr(2)));
        assert!(routes.contains_key(&Some(addr(3))));
        assert!(routes.contains_key(&Some(addr(4))));
        assert_partition(&pkt, &routes, &voids);
    }

    #[test]
    fn tree_failure_of_leaf_reports_loss() {
        let table = TreeRouter::new(1).new_table(addr(1), addrs(&[2, 3]));

        assert!(table.on_failure(&addr(3)).is_err());

        let pkt = table.make(addr(1), addrs(&[3]), vec![]);
        let (routes, voids) = table.forward(&pkt);
        assert!(routes.is_empty());
        assert!(voids.contains_key(&addr(3)));
    }

    #[test]
    fn forward_never_duplicates_destinations() {
        let table = TreeRouter::new(3).new_table(addr(1), addrs(&[2, 3, 4, 5, 6, 7, 8]));

        let pkt = table.make(addr(1), addrs(&[2, 3, 4, 5, 6, 7, 8]), vec![]);
        let (routes, voids) = table.forward(&pkt);
        assert_partition(&pkt, &routes, &voids);

        // Repair a branch and re-check the partition.
        let first_gateway = routes
            .keys()
            .filter_map(|k| k.clone())
            .min_by_key(|a| a.to_string())
            .unwrap();
        let _ = table.on_failure(&first_gateway);

        let (routes, voids) = table.forward(&pkt);
        assert_partition(&pkt, &routes, &voids);
    }
}
