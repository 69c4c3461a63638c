//! Flow identifiers: the header tuple that per-flow ECMP load balancers
//! hash on.
//!
//! Holding a [`FlowId`] constant while varying only the TTL keeps a probe
//! sequence on a single path. Varying the tweak field (source port for
//! UDP/TCP, identifier for ICMP echo) is how MDA enumerates sibling paths.

use std::net::IpAddr;

/// The transport protocol of a flow, as seen by a load balancer's hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlowProto {
    Udp,
    Tcp,
    Icmp,
}

/// The tuple of header fields hashed by per-flow ECMP.
///
/// `src_ip` is `None` while the kernel has not yet picked a source address;
/// matching treats an unset side as a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlowId {
    /// UDP/TCP: `{src_ip, dst_ip, src_port, dst_port, protocol}`.
    Datagram {
        src_ip: Option<IpAddr>,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        proto: FlowProto,
        /// IPv6 only: a pinned flow label participates in the hash.
        flow_label: Option<u16>,
    },
    /// ICMP echo: `{src_ip, dst_ip, icmp_id, protocol}`.
    Echo {
        src_ip: Option<IpAddr>,
        dst_ip: IpAddr,
        icmp_id: u16,
        flow_label: Option<u16>,
    },
}

impl FlowId {
    /// The destination address of the flow.
    pub fn dst_ip(&self) -> IpAddr {
        match self {
            Self::Datagram { dst_ip, .. } | Self::Echo { dst_ip, .. } => *dst_ip,
        }
    }

    /// The field MDA varies to mint sibling flows: the source port for
    /// UDP/TCP, the identifier for ICMP echo.
    pub fn tweak(&self) -> u16 {
        match self {
            Self::Datagram { src_port, .. } => *src_port,
            Self::Echo { icmp_id, .. } => *icmp_id,
        }
    }

    /// Whether a quoted flow from a reply belongs to this flow.
    ///
    /// Exact equality, except that a side with no source address yet acts
    /// as a wildcard: the kernel picks the source after the probe has been
    /// registered outstanding.
    pub fn matches(&self, quoted: &FlowId) -> bool {
        match (self, quoted) {
            (
                Self::Datagram {
                    src_ip: a_src,
                    dst_ip: a_dst,
                    src_port: a_sp,
                    dst_port: a_dp,
                    proto: a_proto,
                    ..
                },
                Self::Datagram {
                    src_ip: b_src,
                    dst_ip: b_dst,
                    src_port: b_sp,
                    dst_port: b_dp,
                    proto: b_proto,
                    ..
                },
            ) => {
                a_dst == b_dst
                    && a_sp == b_sp
                    && a_dp == b_dp
                    && a_proto == b_proto
                    && src_compatible(*a_src, *b_src)
            }
            (
                Self::Echo {
                    src_ip: a_src,
                    dst_ip: a_dst,
                    icmp_id: a_id,
                    ..
                },
                Self::Echo {
                    src_ip: b_src,
                    dst_ip: b_dst,
                    icmp_id: b_id,
                    ..
                },
            ) => a_dst == b_dst && a_id == b_id && src_compatible(*a_src, *b_src),
            _ => false,
        }
    }
}

fn src_compatible(a: Option<IpAddr>, b: Option<IpAddr>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn dst() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))
    }

    fn udp_flow(src_port: u16) -> FlowId {
        FlowId::Datagram {
            src_ip: None,
            dst_ip: dst(),
            src_port,
            dst_port: 30000,
            proto: FlowProto::Udp,
            flow_label: None,
        }
    }

    #[test]
    fn matches_ignores_unset_src_ip() {
        let ours = udp_flow(3083);
        let quoted = FlowId::Datagram {
            src_ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))),
            dst_ip: dst(),
            src_port: 3083,
            dst_port: 30000,
            proto: FlowProto::Udp,
            flow_label: None,
        };
        assert!(ours.matches(&quoted));
    }

    #[test]
    fn different_src_port_does_not_match() {
        assert!(!udp_flow(3083).matches(&udp_flow(3084)));
    }

    #[test]
    fn udp_never_matches_echo() {
        let echo = FlowId::Echo {
            src_ip: None,
            dst_ip: dst(),
            icmp_id: 3083,
            flow_label: None,
        };
        assert!(!udp_flow(3083).matches(&echo));
    }

    #[test]
    fn tweak_is_src_port_or_icmp_id() {
        assert_eq!(udp_flow(41000).tweak(), 41000);
        let echo = FlowId::Echo {
            src_ip: None,
            dst_ip: dst(),
            icmp_id: 7,
            flow_label: None,
        };
        assert_eq!(echo.tweak(), 7);
    }
}
