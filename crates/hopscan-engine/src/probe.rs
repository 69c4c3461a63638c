//! Probe and reply model.
//!
//! A [`Probe`] is an ordered stack of protocol layers plus a payload.
//! Layers expose named fields whose writes are type-checked against the
//! declared width. The stack may be re-declared freely until the first
//! field write; after that the schema is frozen.
//!
//! A [`Reply`] is delivered with the event that resolved a probe. It
//! references its probe by [`ProbeId`] (arena index plus generation), never
//! by pointer, so dropping the probe invalidates future dispatch for that
//! id without touching the reply.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::flow::{FlowId, FlowProto};

// ─── Field model ─────────────────────────────────────────────────────────────

/// Declared width of a probe field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    I8,
    I16,
    Str,
    Address,
}

impl FieldKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::Str => "str",
            Self::Address => "address",
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    I8(u8),
    I16(u16),
    Str(String),
    Address(IpAddr),
}

impl FieldValue {
    pub const fn kind(&self) -> FieldKind {
        match self {
            Self::I8(_) => FieldKind::I8,
            Self::I16(_) => FieldKind::I16,
            Self::Str(_) => FieldKind::Str,
            Self::Address(_) => FieldKind::Address,
        }
    }
}

/// A field a protocol layer declares: name plus width.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

// ─── Protocol layers ─────────────────────────────────────────────────────────

/// The protocol layers a probe can stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ipv4,
    Ipv6,
    Udp,
    Tcp,
    IcmpV4,
    IcmpV6,
}

impl Protocol {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::IcmpV4 => "icmpv4",
            Self::IcmpV6 => "icmpv6",
        }
    }

    /// The fields this layer declares.
    pub const fn fields(self) -> &'static [FieldSpec] {
        const IPV4_FIELDS: &[FieldSpec] = &[
            field("src_ip", FieldKind::Address),
            field("dst_ip", FieldKind::Address),
            field("ttl", FieldKind::I8),
        ];
        // The flow label is declared i16: only the low 16 of the 20
        // label bits are ever set or varied.
        const IPV6_FIELDS: &[FieldSpec] = &[
            field("src_ip", FieldKind::Address),
            field("dst_ip", FieldKind::Address),
            field("ttl", FieldKind::I8),
            field("flow_label", FieldKind::I16),
        ];
        const PORT_FIELDS: &[FieldSpec] = &[
            field("src_port", FieldKind::I16),
            field("dst_port", FieldKind::I16),
        ];
        const ICMP_FIELDS: &[FieldSpec] = &[
            field("icmp_id", FieldKind::I16),
            field("icmp_seq", FieldKind::I16),
        ];
        match self {
            Self::Ipv4 => IPV4_FIELDS,
            Self::Ipv6 => IPV6_FIELDS,
            Self::Udp | Self::Tcp => PORT_FIELDS,
            Self::IcmpV4 | Self::IcmpV6 => ICMP_FIELDS,
        }
    }

    fn spec(self, name: &str) -> Option<FieldSpec> {
        self.fields().iter().copied().find(|f| f.name == name)
    }
}

/// One layer of a probe: a protocol plus its written fields.
#[derive(Debug, Clone)]
pub struct Layer {
    protocol: Protocol,
    fields: Vec<(&'static str, FieldValue)>,
}

impl Layer {
    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            fields: Vec::new(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    fn set(&mut self, spec: FieldSpec, value: FieldValue) -> Result<()> {
        if value.kind() != spec.kind {
            return Err(Error::FieldType {
                field: spec.name.to_string(),
                expected: spec.kind.name(),
                got: value.kind().name(),
            });
        }
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == spec.name) {
            slot.1 = value;
        } else {
            self.fields.push((spec.name, value));
        }
        Ok(())
    }
}

// ─── Probe ───────────────────────────────────────────────────────────────────

/// Default payload size of a probe skeleton, in bytes.
pub const DEFAULT_PAYLOAD_SIZE: usize = 32;

/// An outbound probe: layer stack plus payload.
///
/// A probe skeleton is owned by its algorithm instance and cloned per
/// emission; the network layer owns each emitted clone until it resolves.
#[derive(Debug, Clone)]
pub struct Probe {
    layers: Vec<Layer>,
    payload: Bytes,
    frozen: bool,
}

impl Default for Probe {
    fn default() -> Self {
        Self::new()
    }
}

/// Filler byte for generated payloads.
const PAYLOAD_FILL: u8 = 0x40;

impl Probe {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            payload: Bytes::from(vec![PAYLOAD_FILL; DEFAULT_PAYLOAD_SIZE]),
            frozen: false,
        }
    }

    /// Declare the layer stack, outermost first.
    ///
    /// Idempotent until the first field write; afterwards fails with
    /// [`Error::SchemaFrozen`].
    pub fn set_protocols(&mut self, protocols: &[Protocol]) -> Result<()> {
        if self.frozen {
            return Err(Error::SchemaFrozen);
        }
        self.layers = protocols.iter().map(|p| Layer::new(*p)).collect();
        Ok(())
    }

    pub fn protocols(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.layers.iter().map(Layer::protocol)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Write a field, resolving the owning layer by field name.
    ///
    /// The first layer declaring the name wins; use [`Probe::set_field_in`]
    /// to disambiguate. Freezes the schema.
    pub fn set_field(&mut self, name: &str, value: FieldValue) -> Result<()> {
        let layer = self
            .layers
            .iter_mut()
            .find(|l| l.protocol().spec(name).is_some())
            .ok_or_else(|| Error::UnknownField(name.to_string()))?;
        let spec = layer.protocol().spec(name).expect("spec checked above");
        layer.set(spec, value)?;
        self.frozen = true;
        Ok(())
    }

    /// Write a field in an explicitly named layer.
    pub fn set_field_in(&mut self, protocol: Protocol, name: &str, value: FieldValue) -> Result<()> {
        let layer = self
            .layers
            .iter_mut()
            .find(|l| l.protocol() == protocol)
            .ok_or_else(|| Error::UnknownLayer(protocol.name().to_string()))?;
        let spec = layer
            .protocol()
            .spec(name)
            .ok_or_else(|| Error::UnknownField(name.to_string()))?;
        layer.set(spec, value)?;
        self.frozen = true;
        Ok(())
    }

    /// Write several fields at once; stops at the first failure.
    pub fn set_fields<'a, I>(&mut self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, FieldValue)>,
    {
        for (name, value) in fields {
            self.set_field(name, value)?;
        }
        Ok(())
    }

    /// Read a field by name; reads never block and never freeze the schema.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.layers.iter().find_map(|l| l.field(name))
    }

    /// Resize the payload, refilling it with the filler pattern.
    pub fn set_payload_size(&mut self, size: usize) {
        self.payload = Bytes::from(vec![PAYLOAD_FILL; size]);
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    // ── Typed accessors used throughout the engine ──

    pub fn ttl(&self) -> Option<u8> {
        match self.field("ttl") {
            Some(FieldValue::I8(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn dst_ip(&self) -> Option<IpAddr> {
        match self.field("dst_ip") {
            Some(FieldValue::Address(a)) => Some(*a),
            _ => None,
        }
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        match self.field("src_ip") {
            Some(FieldValue::Address(a)) => Some(*a),
            _ => None,
        }
    }

    fn port(&self, name: &str) -> Option<u16> {
        match self.field(name) {
            Some(FieldValue::I16(v)) => Some(*v),
            _ => None,
        }
    }

    /// The flow identifier of this probe, per the transport layer present.
    ///
    /// Returns `None` when the stack has no transport layer yet.
    pub fn flow_id(&self) -> Option<FlowId> {
        let dst_ip = self.dst_ip()?;
        let src_ip = self.src_ip();
        let flow_label = self.port("flow_label");
        for layer in &self.layers {
            match layer.protocol() {
                Protocol::Udp | Protocol::Tcp => {
                    return Some(FlowId::Datagram {
                        src_ip,
                        dst_ip,
                        src_port: self.port("src_port").unwrap_or(0),
                        dst_port: self.port("dst_port").unwrap_or(0),
                        proto: if layer.protocol() == Protocol::Udp {
                            FlowProto::Udp
                        } else {
                            FlowProto::Tcp
                        },
                        flow_label,
                    });
                }
                Protocol::IcmpV4 | Protocol::IcmpV6 => {
                    return Some(FlowId::Echo {
                        src_ip,
                        dst_ip,
                        icmp_id: self.port("icmp_id").unwrap_or(0),
                        flow_label,
                    });
                }
                _ => {}
            }
        }
        None
    }
}

// ─── Probe handles and replies ───────────────────────────────────────────────

/// Arena handle of an outstanding probe: slot index plus generation.
///
/// Stale generations are ignored on dispatch, so a dropped probe silently
/// invalidates any reply still in flight for its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "probe#{}.{}", self.slot, self.generation)
    }
}

/// What kind of message terminated a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// ICMP time exceeded from an intermediate router.
    TimeExceeded,
    /// ICMP echo reply from the destination.
    EchoReply,
    /// ICMP destination unreachable, with its code.
    Unreachable(u8),
    /// TCP RST or SYN/ACK reflecting our 5-tuple.
    TcpReply,
}

/// A resolved reply, delivered with its event.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Back-reference to the probe, by id.
    pub probe: ProbeId,
    /// Source address of the message that terminated the probe.
    pub from: IpAddr,
    pub kind: ReplyKind,
    /// The TTL the probe was emitted with.
    pub probe_ttl: u8,
    /// The probe's flow identifier.
    pub flow: FlowId,
    /// Receive timestamp.
    pub recv: quanta::Instant,
    /// Round-trip time, send to receive.
    pub rtt: Duration,
}
