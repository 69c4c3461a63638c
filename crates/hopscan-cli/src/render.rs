//! Output rendering: link lines, lattice dumps, optional reverse DNS.

use std::collections::HashMap;
use std::net::IpAddr;

use hopscan_engine::{Lattice, LinkDiscovered};

/// Reverse resolver with a per-run cache; disabled by `-n`.
pub struct Resolver {
    enabled: bool,
    cache: HashMap<IpAddr, String>,
}

impl Resolver {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            cache: HashMap::new(),
        }
    }

    /// The display name of an address: `host (addr)` when resolution is
    /// on and succeeds, the bare address otherwise.
    pub fn name(&mut self, addr: IpAddr) -> String {
        if !self.enabled {
            return addr.to_string();
        }
        if let Some(cached) = self.cache.get(&addr) {
            return cached.clone();
        }
        let name = match dns_lookup::lookup_addr(&addr) {
            Ok(host) if host != addr.to_string() => format!("{host} ({addr})"),
            _ => addr.to_string(),
        };
        self.cache.insert(addr, name.clone());
        name
    }

    fn label(&mut self, addr: Option<IpAddr>) -> String {
        match addr {
            Some(addr) => self.name(addr),
            None => "*".to_string(),
        }
    }
}

/// One streamed MDA link line.
pub fn link_line(resolver: &mut Resolver, link: &LinkDiscovered) -> String {
    let from = resolver.label(link.from.addr);
    let to = resolver.label(link.to.as_ref().and_then(|t| t.addr));
    format!("{from} → {to}")
}

/// The full lattice, one line per edge, BFS order by TTL.
pub fn dump_lattice(resolver: &mut Resolver, lattice: &Lattice) -> Vec<String> {
    let mut lines = Vec::new();
    lattice.dump(|iface, next| {
        for id in next {
            let to = lattice.node(*id);
            lines.push(format!(
                "{} → {}",
                resolver.label(iface.addr),
                resolver.label(to.addr)
            ));
        }
    });
    lines
}
