//! Topology lattice: the layered DAG of discovered hops.
//!
//! Layer k holds the interfaces observed at TTL k; edges only cross from
//! layer k to layer k+1, so the graph is acyclic by construction. Two
//! replies fuse into one interface iff their (address, TTL) match. A node
//! with no address is the `*` sentinel: no reply at that TTL.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::probe::ProbeId;

/// Handle of an interface node within its lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub(crate) usize);

/// An observed hop: an address at a TTL, with its witnesses.
#[derive(Debug, Clone, Serialize)]
pub struct Interface {
    /// The router address, or `None` for the `*` sentinel.
    pub addr: Option<IpAddr>,
    /// The TTL this interface answered at.
    pub ttl: u8,
    /// Probes that elicited this interface.
    #[serde(skip)]
    pub probes: Vec<ProbeId>,
    /// Round-trip samples, one per witnessing reply.
    pub rtts: Vec<Duration>,
}

/// A directed edge between adjacent layers, with its witness count.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Link {
    pub from: NodeId,
    pub to: NodeId,
    /// Number of probes that successively reached both endpoints.
    pub witnesses: usize,
}

/// The layered DAG of discovered topology.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Lattice {
    nodes: Vec<Interface>,
    links: Vec<Link>,
    /// Layer index: TTL -> nodes in insertion order.
    layers: BTreeMap<u8, Vec<NodeId>>,
}

impl Lattice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an interface observation, fusing on (address, TTL).
    ///
    /// Returns the node handle, newly created or pre-existing.
    pub fn add_interface(&mut self, ttl: u8, addr: Option<IpAddr>) -> NodeId {
        let layer = self.layers.entry(ttl).or_default();
        if let Some(id) = layer
            .iter()
            .copied()
            .find(|id| self.nodes[id.0].addr == addr)
        {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Interface {
            addr,
            ttl,
            probes: Vec::new(),
            rtts: Vec::new(),
        });
        layer.push(id);
        id
    }

    /// Attach a witnessing probe (and optionally its RTT) to a node.
    pub fn witness(&mut self, node: NodeId, probe: ProbeId, rtt: Option<Duration>) {
        let iface = &mut self.nodes[node.0];
        iface.probes.push(probe);
        if let Some(rtt) = rtt {
            iface.rtts.push(rtt);
        }
    }

    /// Record a link between adjacent layers.
    ///
    /// Fails with [`Error::NonMonotonic`] unless `to.ttl == from.ttl + 1`.
    /// Returns `true` when the edge is new, `false` when an existing edge
    /// gained a witness.
    pub fn add_link(&mut self, from: NodeId, to: NodeId) -> Result<bool> {
        let (from_ttl, to_ttl) = (self.nodes[from.0].ttl, self.nodes[to.0].ttl);
        if to_ttl != from_ttl.wrapping_add(1) {
            return Err(Error::NonMonotonic {
                from: from_ttl,
                to: to_ttl,
            });
        }
        if let Some(link) = self
            .links
            .iter_mut()
            .find(|l| l.from == from && l.to == to)
        {
            link.witnesses += 1;
            return Ok(false);
        }
        self.links.push(Link {
            from,
            to,
            witnesses: 1,
        });
        Ok(true)
    }

    pub fn node(&self, id: NodeId) -> &Interface {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Interface)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Nodes at a TTL, in insertion order.
    pub fn layer(&self, ttl: u8) -> &[NodeId] {
        self.layers.get(&ttl).map_or(&[], Vec::as_slice)
    }

    /// Successors of a node, in link insertion order.
    pub fn successors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.links
            .iter()
            .filter(move |l| l.from == id)
            .map(|l| l.to)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Visit every node in BFS order: by TTL, ties broken by insertion
    /// order of interfaces within the layer.
    pub fn dump<F>(&self, mut visitor: F)
    where
        F: FnMut(&Interface, &[NodeId]),
    {
        for ids in self.layers.values() {
            for id in ids {
                let next: Vec<NodeId> = self.successors(*id).collect();
                visitor(&self.nodes[id.0], &next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
    }

    #[test]
    fn interfaces_fuse_on_addr_and_ttl() {
        let mut lattice = Lattice::new();
        let a = lattice.add_interface(3, ip(1));
        let b = lattice.add_interface(3, ip(1));
        let c = lattice.add_interface(4, ip(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sentinel_is_distinct_from_addresses() {
        let mut lattice = Lattice::new();
        let star = lattice.add_interface(2, None);
        let addr = lattice.add_interface(2, ip(9));
        assert_ne!(star, addr);
        assert_eq!(lattice.layer(2).len(), 2);
    }

    #[test]
    fn non_monotonic_link_is_rejected() {
        let mut lattice = Lattice::new();
        let a = lattice.add_interface(1, ip(1));
        let b = lattice.add_interface(3, ip(2));
        assert!(matches!(
            lattice.add_link(a, b),
            Err(Error::NonMonotonic { from: 1, to: 3 })
        ));
        let c = lattice.add_interface(2, ip(3));
        assert!(matches!(lattice.add_link(c, a), Err(Error::NonMonotonic { .. })));
    }

    #[test]
    fn duplicate_link_gains_a_witness() {
        let mut lattice = Lattice::new();
        let a = lattice.add_interface(1, ip(1));
        let b = lattice.add_interface(2, ip(2));
        assert!(lattice.add_link(a, b).unwrap());
        assert!(!lattice.add_link(a, b).unwrap());
        assert_eq!(lattice.links()[0].witnesses, 2);
    }

    #[test]
    fn dump_visits_by_ttl_then_insertion_order() {
        let mut lattice = Lattice::new();
        let b2 = lattice.add_interface(2, ip(21));
        let a1 = lattice.add_interface(1, ip(11));
        let b1 = lattice.add_interface(2, ip(22));
        lattice.add_link(a1, b2).unwrap();
        lattice.add_link(a1, b1).unwrap();

        let mut order = Vec::new();
        lattice.dump(|iface, _| order.push(iface.addr));
        assert_eq!(order, vec![ip(11), ip(21), ip(22)]);
    }

    #[test]
    fn summary_serializes() {
        let mut lattice = Lattice::new();
        let a = lattice.add_interface(1, ip(1));
        let b = lattice.add_interface(2, ip(2));
        lattice.add_link(a, b).unwrap();
        let json = serde_json::to_string(&lattice).unwrap();
        assert!(json.contains("10.0.0.1"));
    }
}
