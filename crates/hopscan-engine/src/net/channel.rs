//! The raw-socket seam.
//!
//! [`PacketIo`] is the boundary between the engine and the per-layer
//! packet encoder/decoder. The production implementation, [`RawChannel`],
//! builds and parses packets with `pnet` transport channels; the simulator
//! crate substitutes deterministic in-memory topologies.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use pnet::packet::icmp::destination_unreachable::DestinationUnreachablePacket;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{self, EchoRequestPacket, MutableEchoRequestPacket};
use pnet::packet::icmp::time_exceeded::TimeExceededPacket;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{Icmpv6Packet, Icmpv6Types};
use pnet::packet::icmpv6::echo_request::{
    EchoRequestPacket as EchoRequestV6Packet, MutableEchoRequestPacket as MutableEchoRequestV6Packet,
};
use pnet::packet::icmpv6::echo_reply::EchoReplyPacket as EchoReplyV6Packet;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};
use pnet::packet::Packet;
use pnet::transport::{
    icmp_packet_iter, icmpv6_packet_iter, transport_channel, TransportChannelType,
    TransportProtocol, TransportReceiver, TransportSender,
};
use pnet::util;
use tracing::debug;

use crate::flow::{FlowId, FlowProto};
use crate::probe::{Probe, Protocol, ReplyKind};

/// A decoded inbound message, before probe matching.
#[derive(Debug, Clone)]
pub struct RawReply {
    /// Source address of the ICMP/UDP/TCP message.
    pub from: IpAddr,
    pub kind: ReplyKind,
    /// The flow identifier quoted in the message.
    pub quoted_flow: FlowId,
    /// The original probe TTL recovered from the quoted header, when the
    /// message quotes one. Echo replies and TCP reflections do not.
    pub quoted_ttl: Option<u8>,
    /// Receive timestamp.
    pub recv: quanta::Instant,
}

/// Raw packet send/receive, with the per-layer encoding delegated to the
/// implementation.
pub trait PacketIo {
    /// Encode and emit one probe. Errors here are fatal for the instance.
    fn send_probe(&mut self, probe: &Probe) -> io::Result<()>;

    /// Wait up to `budget` for one inbound message.
    ///
    /// Returns `Ok(None)` when the budget elapses quietly or an unrelated
    /// packet was discarded.
    fn poll(&mut self, budget: Duration) -> io::Result<Option<RawReply>>;
}

// ─── pnet-backed production channel ──────────────────────────────────────────

const MAX_PACKET_SIZE: usize = 1024;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Address family a [`RawChannel`] serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Production raw channel: UDP and ICMP echo probes over IPv4, ICMP echo
/// over IPv6.
///
/// Opening the channel requires the `CAP_NET_RAW` capability. IPv4 UDP
/// probes are built at layer 3 so the original TTL can be tagged into the
/// IPv4 identification field and recovered from ICMP-quoted headers.
/// A pinned IPv6 flow label is accepted in the probe model but not yet
/// plumbed to the socket; the kernel picks the label.
pub struct RawChannel {
    family: Family,
    /// Layer-3 IPv4/UDP sender; absent for IPv6 channels.
    ip_tx: Option<TransportSender>,
    icmp_tx: TransportSender,
    icmp_rx: TransportReceiver,
}

impl RawChannel {
    pub fn new(family: Family) -> io::Result<Self> {
        match family {
            Family::V4 => {
                let (ip_tx, _) = transport_channel(
                    4096,
                    TransportChannelType::Layer3(IpNextHeaderProtocols::Udp),
                )?;
                let (icmp_tx, icmp_rx) = transport_channel(
                    4096,
                    TransportChannelType::Layer4(TransportProtocol::Ipv4(
                        IpNextHeaderProtocols::Icmp,
                    )),
                )?;
                Ok(Self {
                    family,
                    ip_tx: Some(ip_tx),
                    icmp_tx,
                    icmp_rx,
                })
            }
            Family::V6 => {
                let (icmp_tx, icmp_rx) = transport_channel(
                    4096,
                    TransportChannelType::Layer4(TransportProtocol::Ipv6(
                        IpNextHeaderProtocols::Icmpv6,
                    )),
                )?;
                Ok(Self {
                    family,
                    ip_tx: None,
                    icmp_tx,
                    icmp_rx,
                })
            }
        }
    }

    fn send_udp(&mut self, probe: &Probe, flow: &FlowId, ttl: u8, dst: IpAddr) -> io::Result<()> {
        let (src_port, dst_port) = match flow {
            FlowId::Datagram {
                src_port, dst_port, ..
            } => (*src_port, *dst_port),
            FlowId::Echo { .. } => unreachable!("udp probe with echo flow"),
        };
        let IpAddr::V4(dst_v4) = dst else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "ipv6 udp probes are not supported by the raw channel",
            ));
        };

        let payload = probe.payload();
        let total_len = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
        if total_len > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "probe exceeds maximum packet size",
            ));
        }
        let mut buf = vec![0_u8; total_len];

        {
            let mut udp = MutableUdpPacket::new(&mut buf[IPV4_HEADER_LEN..])
                .expect("udp buffer sized above");
            udp.set_source(src_port);
            udp.set_destination(dst_port);
            udp.set_length((UDP_HEADER_LEN + payload.len()) as u16);
            udp.set_payload(payload);
            // Source address unknown until the kernel routes the packet; a
            // zero UDP checksum is valid for IPv4.
            udp.set_checksum(0);
        }
        {
            let mut ip = MutableIpv4Packet::new(&mut buf).expect("ipv4 buffer sized above");
            ip.set_version(4);
            ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
            ip.set_total_length(total_len as u16);
            ip.set_ttl(ttl);
            // The original TTL travels in the identification field and is
            // recovered from ICMP-quoted headers for probe matching.
            ip.set_identification(u16::from(ttl));
            ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
            if let Some(IpAddr::V4(src)) = probe.src_ip() {
                ip.set_source(src);
            }
            ip.set_destination(dst_v4);
            let checksum = ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(checksum);
        }

        let packet = Ipv4Packet::new(&buf).expect("built above");
        let ip_tx = self.ip_tx.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "ipv4 udp probes require a v4 channel",
            )
        })?;
        ip_tx.send_to(packet, dst)?;
        Ok(())
    }

    fn send_echo(&mut self, probe: &Probe, flow: &FlowId, ttl: u8, dst: IpAddr) -> io::Result<()> {
        let icmp_id = match flow {
            FlowId::Echo { icmp_id, .. } => *icmp_id,
            FlowId::Datagram { .. } => unreachable!("echo probe with datagram flow"),
        };
        let seq = match probe.field("icmp_seq") {
            Some(crate::probe::FieldValue::I16(v)) => *v,
            _ => 0,
        };
        let payload = probe.payload();

        match self.family {
            Family::V4 => {
                let buf_len = EchoRequestPacket::minimum_packet_size() + payload.len();
                let mut buf = vec![0_u8; buf_len];
                let mut req =
                    MutableEchoRequestPacket::new(&mut buf).expect("buffer sized above");
                req.set_icmp_type(IcmpTypes::EchoRequest);
                req.set_icmp_code(echo_request::IcmpCodes::NoCode);
                req.set_identifier(icmp_id);
                req.set_sequence_number(seq);
                req.set_payload(payload);
                req.set_checksum(util::checksum(req.packet(), 1));

                self.icmp_tx.set_ttl(ttl)?;
                self.icmp_tx.send_to(req.to_immutable(), dst)?;
            }
            Family::V6 => {
                let buf_len = MutableEchoRequestV6Packet::minimum_packet_size() + payload.len();
                let mut buf = vec![0_u8; buf_len];
                let mut req =
                    MutableEchoRequestV6Packet::new(&mut buf).expect("buffer sized above");
                req.set_icmpv6_type(Icmpv6Types::EchoRequest);
                req.set_identifier(icmp_id);
                req.set_sequence_number(seq);
                req.set_payload(payload);
                // The kernel computes the ICMPv6 checksum on raw sockets.
                req.set_checksum(0);

                self.icmp_tx.set_ttl(ttl)?;
                self.icmp_tx.send_to(req.to_immutable(), dst)?;
            }
        }
        Ok(())
    }
}

impl PacketIo for RawChannel {
    fn send_probe(&mut self, probe: &Probe) -> io::Result<()> {
        let flow = probe.flow_id().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "probe has no transport layer")
        })?;
        let ttl = probe
            .ttl()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "probe has no ttl"))?;
        let dst = flow.dst_ip();

        match &flow {
            FlowId::Datagram {
                proto: FlowProto::Udp,
                ..
            } => self.send_udp(probe, &flow, ttl, dst),
            FlowId::Echo { .. } => self.send_echo(probe, &flow, ttl, dst),
            FlowId::Datagram { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "tcp probes are not supported by the raw channel",
            )),
        }
    }

    fn poll(&mut self, budget: Duration) -> io::Result<Option<RawReply>> {
        match self.family {
            Family::V4 => {
                match icmp_packet_iter(&mut self.icmp_rx).next_with_timeout(budget)? {
                    Some((icmp, from)) => {
                        let recv = quanta::Instant::now();
                        Ok(decode_icmp(&icmp, from, recv))
                    }
                    None => Ok(None),
                }
            }
            Family::V6 => {
                match icmpv6_packet_iter(&mut self.icmp_rx).next_with_timeout(budget)? {
                    Some((icmp, from)) => {
                        let recv = quanta::Instant::now();
                        Ok(decode_icmpv6(&icmp, from, recv))
                    }
                    None => Ok(None),
                }
            }
        }
    }
}

/// Decode an inbound ICMPv4 message into a [`RawReply`], or `None` when it
/// is not one of the types the engine consumes.
fn decode_icmp(icmp: &IcmpPacket<'_>, from: IpAddr, recv: quanta::Instant) -> Option<RawReply> {
    match icmp.get_icmp_type() {
        IcmpTypes::TimeExceeded => {
            let packet = TimeExceededPacket::new(icmp.packet())?;
            let (quoted_flow, quoted_ttl) = parse_quoted(packet.payload())?;
            Some(RawReply {
                from,
                kind: ReplyKind::TimeExceeded,
                quoted_flow,
                quoted_ttl: Some(quoted_ttl),
                recv,
            })
        }
        IcmpTypes::DestinationUnreachable => {
            let packet = DestinationUnreachablePacket::new(icmp.packet())?;
            let code = packet.get_icmp_code().0;
            let (quoted_flow, quoted_ttl) = parse_quoted(packet.payload())?;
            Some(RawReply {
                from,
                kind: ReplyKind::Unreachable(code),
                quoted_flow,
                quoted_ttl: Some(quoted_ttl),
                recv,
            })
        }
        IcmpTypes::EchoReply => {
            let packet = EchoReplyPacket::new(icmp.packet())?;
            Some(RawReply {
                from,
                kind: ReplyKind::EchoReply,
                quoted_flow: FlowId::Echo {
                    src_ip: None,
                    dst_ip: from,
                    icmp_id: packet.get_identifier(),
                    flow_label: None,
                },
                quoted_ttl: None,
                recv,
            })
        }
        other => {
            debug!(icmp_type = other.0, "discarding unhandled icmp type");
            None
        }
    }
}

/// Recover the flow identifier and original TTL from an ICMP-quoted IPv4
/// header plus the first eight bytes of its transport header.
fn parse_quoted(payload: &[u8]) -> Option<(FlowId, u8)> {
    let ip = Ipv4Packet::new(payload)?;
    let header_len = usize::from(ip.get_header_length()) * 4;
    let inner = payload.get(header_len..)?;
    let src_ip = IpAddr::V4(ip.get_source());
    let dst_ip = IpAddr::V4(ip.get_destination());
    let quoted_ttl = ip.get_identification() as u8;

    match ip.get_next_level_protocol() {
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(inner)?;
            Some((
                FlowId::Datagram {
                    src_ip: Some(src_ip),
                    dst_ip,
                    src_port: udp.get_source(),
                    dst_port: udp.get_destination(),
                    proto: FlowProto::Udp,
                    flow_label: None,
                },
                quoted_ttl,
            ))
        }
        IpNextHeaderProtocols::Icmp => {
            let echo = EchoRequestPacket::new(inner)?;
            Some((
                FlowId::Echo {
                    src_ip: Some(src_ip),
                    dst_ip,
                    icmp_id: echo.get_identifier(),
                    flow_label: None,
                },
                // Echo probes tag the original TTL in the sequence number's
                // low byte.
                echo.get_sequence_number() as u8,
            ))
        }
        _ => None,
    }
}

/// Decode an inbound ICMPv6 message into a [`RawReply`].
fn decode_icmpv6(icmp: &Icmpv6Packet<'_>, from: IpAddr, recv: quanta::Instant) -> Option<RawReply> {
    match icmp.get_icmpv6_type() {
        Icmpv6Types::EchoReply => {
            let packet = EchoReplyV6Packet::new(icmp.packet())?;
            Some(RawReply {
                from,
                kind: ReplyKind::EchoReply,
                quoted_flow: FlowId::Echo {
                    src_ip: None,
                    dst_ip: from,
                    icmp_id: packet.get_identifier(),
                    flow_label: None,
                },
                quoted_ttl: None,
                recv,
            })
        }
        Icmpv6Types::TimeExceeded | Icmpv6Types::DestinationUnreachable => {
            let kind = if icmp.get_icmpv6_type() == Icmpv6Types::TimeExceeded {
                ReplyKind::TimeExceeded
            } else {
                ReplyKind::Unreachable(icmp.get_icmpv6_code().0)
            };
            // The message body carries four unused bytes, then the quoted
            // IPv6 header and leading transport bytes.
            let quoted = icmp.payload().get(4..)?;
            let ip = Ipv6Packet::new(quoted)?;
            if ip.get_next_header() != IpNextHeaderProtocols::Icmpv6 {
                return None;
            }
            let inner = quoted.get(40..)?;
            let echo = EchoRequestV6Packet::new(inner)?;
            Some(RawReply {
                from,
                kind,
                quoted_flow: FlowId::Echo {
                    src_ip: Some(IpAddr::V6(ip.get_source())),
                    dst_ip: IpAddr::V6(ip.get_destination()),
                    icmp_id: echo.get_identifier(),
                    flow_label: None,
                },
                quoted_ttl: Some(echo.get_sequence_number() as u8),
                recv,
            })
        }
        other => {
            debug!(icmpv6_type = other.0, "discarding unhandled icmpv6 type");
            None
        }
    }
}

/// Protocol stacks the raw channel can emit.
pub fn supported_stack(protocols: &[Protocol]) -> bool {
    matches!(
        protocols,
        [Protocol::Ipv4, Protocol::Udp]
            | [Protocol::Ipv4, Protocol::IcmpV4]
            | [Protocol::Ipv6, Protocol::IcmpV6]
    )
}
