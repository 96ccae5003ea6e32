//! Packet value type carried by sessions.
//!
//! A packet is a source, a set of destinations and an opaque payload.
//! The payload schema belongs to the protocol built on top of the
//! overlay; the session layer never inspects it.

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// One unit of routed traffic. Immutable once built, except for
/// [`Packet::slice`] which carves out the locally-delivered part.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    source: Address,
    destinations: Vec<Address>,
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(source: Address, destinations: Vec<Address>, payload: Vec<u8>) -> Self {
        Self {
            source,
            destinations,
            payload,
        }
    }

    pub fn source(&self) -> &Address {
        &self.source
    }

    pub fn destinations(&self) -> &[Address] {
        &self.destinations
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Replaces the destination set, keeping source and payload. Used
    /// by routing tables when partitioning a packet per next hop.
    pub fn with_destinations(&self, destinations: Vec<Address>) -> Self {
        Self {
            source: self.source.clone(),
            destinations,
            payload: self.payload.clone(),
        }
    }

    /// Removes every destination matching `me` and returns them as a
    /// sub-packet, or `None` when the packet holds nothing local.
    pub fn slice(&mut self, me: &Address) -> Option<Packet> {
        let mine = self.destinations.iter().filter(|d| *d == me).count();
        if mine == 0 {
            return None;
        }

        self.destinations.retain(|d| d != me);

        Some(Packet {
            source: self.source.clone(),
            destinations: vec![me.clone(); mine],
            payload: self.payload.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        format!("http://127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn slice_removes_local_destinations() {
        let me = addr(1);
        let other = addr(2);

        let mut pkt = Packet::new(
            addr(9),
            vec![me.clone(), other.clone(), me.clone()],
            b"payload".to_vec(),
        );

        let mine = pkt.slice(&me).expect("local slice expected");
        assert_eq!(mine.destinations(), &[me.clone(), me.clone()]);
        assert_eq!(mine.payload(), b"payload");
        assert_eq!(pkt.destinations(), &[other]);

        assert!(pkt.slice(&me).is_none());
    }

    #[test]
    fn slice_of_foreign_packet_is_none() {
        let mut pkt = Packet::new(addr(9), vec![addr(2)], vec![]);
        assert!(pkt.slice(&addr(1)).is_none());
        assert_eq!(pkt.destinations().len(), 1);
    }
}
