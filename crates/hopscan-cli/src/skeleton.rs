//! Target resolution and probe-skeleton building, shared by both
//! front-ends.

use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use rand::RngExt;

use hopscan_engine::{Family, FieldValue, Probe, Protocol};

/// Default ping ports for non-ICMP probing.
const PING_SRC_PORT: u16 = 33456;
const PING_DST_PORT: u16 = 33457;

/// Probe payload size of the traceroute front-end.
const TRACE_PAYLOAD_SIZE: usize = 32;

/// Resolve a literal address or FQDN, honoring a forced family.
pub fn resolve_target(host: &str, family: Option<Family>) -> Result<IpAddr> {
    let wanted = |addr: &IpAddr| match family {
        Some(Family::V4) => addr.is_ipv4(),
        Some(Family::V6) => addr.is_ipv6(),
        None => true,
    };
    if let Ok(addr) = host.parse::<IpAddr>() {
        if !wanted(&addr) {
            bail!("address {addr} does not match the requested ip version");
        }
        return Ok(addr);
    }
    let addrs =
        dns_lookup::lookup_host(host).with_context(|| format!("cannot resolve `{host}`"))?;
    addrs
        .into_iter()
        .find(wanted)
        .with_context(|| format!("`{host}` has no address in the requested family"))
}

/// Guess the family of a resolved destination.
pub fn family_of(addr: IpAddr) -> Family {
    if addr.is_ipv4() {
        Family::V4
    } else {
        Family::V6
    }
}

/// IPv4/UDP skeleton for the traceroute front-end.
pub fn trace_skeleton(dst: IpAddr, src_port: u16, dst_port: u16) -> Result<Probe> {
    let mut probe = Probe::new();
    probe.set_protocols(&[Protocol::Ipv4, Protocol::Udp])?;
    probe.set_payload_size(TRACE_PAYLOAD_SIZE);
    probe.set_fields([
        ("dst_ip", FieldValue::Address(dst)),
        ("dst_port", FieldValue::I16(dst_port)),
        ("src_port", FieldValue::I16(src_port)),
    ])?;
    Ok(probe)
}

/// Probe protocol choices of the ping front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingProto {
    Icmp,
    Tcp,
    Udp,
}

/// Skeleton for the ping front-end: echo by default, TCP/UDP on request.
pub fn ping_skeleton(
    family: Family,
    proto: PingProto,
    dst: IpAddr,
    src: Option<IpAddr>,
    flow_label: bool,
) -> Result<Probe> {
    let mut probe = Probe::new();
    let ip_layer = match family {
        Family::V4 => Protocol::Ipv4,
        Family::V6 => Protocol::Ipv6,
    };
    match proto {
        PingProto::Icmp => {
            let icmp = match family {
                Family::V4 => Protocol::IcmpV4,
                Family::V6 => Protocol::IcmpV6,
            };
            probe.set_protocols(&[ip_layer, icmp])?;
            let mut rng = rand::rng();
            probe.set_field("icmp_id", FieldValue::I16(rng.random::<u16>()))?;
        }
        PingProto::Tcp | PingProto::Udp => {
            let transport = if proto == PingProto::Tcp {
                Protocol::Tcp
            } else {
                Protocol::Udp
            };
            probe.set_protocols(&[ip_layer, transport])?;
            probe.set_fields([
                ("src_port", FieldValue::I16(PING_SRC_PORT)),
                ("dst_port", FieldValue::I16(PING_DST_PORT)),
            ])?;
        }
    }
    probe.set_field("dst_ip", FieldValue::Address(dst))?;
    if let Some(src) = src {
        probe.set_field("src_ip", FieldValue::Address(src))?;
    }
    if flow_label {
        // Allocate a label; only the low 16 of the 20 bits are used.
        let mut rng = rand::rng();
        probe.set_field("flow_label", FieldValue::I16(rng.random::<u16>()))?;
    }
    Ok(probe)
}
