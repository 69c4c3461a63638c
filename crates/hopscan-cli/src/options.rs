//! Command-line options for both front-ends, with the conflict checks
//! that must fail before any packet is emitted.

use anyhow::{bail, Result};
use clap::Parser;

use hopscan_engine::algorithms::mda::MdaOptions;
use hopscan_engine::algorithms::ping::PingOptions;
use hopscan_engine::algorithms::traceroute::TracerouteOptions;
use hopscan_engine::AlgorithmOptions;

/// The `-M bound,max_branch` pair.
#[derive(Debug, Clone, Copy)]
pub struct MdaParams {
    pub bound: f64,
    pub max_branch: usize,
}

fn parse_mda_params(s: &str) -> std::result::Result<MdaParams, String> {
    let (bound, max_branch) = s
        .split_once(',')
        .ok_or_else(|| format!("expected bound,max_branch, got `{s}`"))?;
    let bound: f64 = bound
        .trim()
        .parse()
        .map_err(|_| format!("invalid bound `{bound}`"))?;
    if !(0.0..1.0).contains(&bound) {
        return Err(format!("bound {bound} must be within [0, 1)"));
    }
    let max_branch: usize = max_branch
        .trim()
        .parse()
        .map_err(|_| format!("invalid max_branch `{max_branch}`"))?;
    Ok(MdaParams { bound, max_branch })
}

/// Options of the paris-traceroute front-end.
#[derive(Parser, Debug)]
#[command(
    name = "hopscan",
    about = "Multipath-aware traceroute",
    arg_required_else_help = true
)]
pub struct TraceArgs {
    /// Use IPv4 (the default and only family of this front-end).
    #[arg(short = '4')]
    pub ipv4: bool,

    /// Probe protocol.
    #[arg(
        short = 'P',
        long = "protocol",
        value_name = "protocol",
        value_parser = ["udp"],
        default_value = "udp"
    )]
    pub protocol: String,

    /// UDP to destination port 53 instead of per-run ports.
    #[arg(short = 'U', long = "UDP")]
    pub udp_dns: bool,

    /// Start from this hop instead of 1.
    #[arg(
        short = 'f',
        long = "first",
        value_name = "first_ttl",
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(1..)
    )]
    pub first_ttl: u8,

    /// Maximum number of hops.
    #[arg(
        short = 'm',
        long = "max-hops",
        value_name = "max_ttl",
        default_value_t = 30,
        value_parser = clap::value_parser!(u8).range(1..)
    )]
    pub max_ttl: u8,

    /// Do not resolve addresses to domain names.
    #[arg(short = 'n')]
    pub no_resolve: bool,

    /// Seconds to wait for the response to a probe.
    #[arg(short = 'w', long = "wait", value_name = "seconds", default_value_t = 5.0)]
    pub wait: f64,

    /// Multipath tracing parameters: failure bound and the maximum number
    /// of branching points (default 0.05,5). Implies `-a mda`.
    #[arg(
        short = 'M',
        long = "mda",
        value_name = "bound,max_branch",
        value_parser = parse_mda_params
    )]
    pub mda: Option<MdaParams>,

    /// Traceroute algorithm: mda, traceroute, or paris-traceroute.
    #[arg(short = 'a', long = "algo", value_name = "algorithm")]
    pub algorithm: Option<String>,

    /// Source port (default 3083).
    #[arg(short = 's', long = "source_port", value_name = "PORT")]
    pub src_port: Option<u16>,

    /// Destination port (default 30000).
    #[arg(short = 'd', long = "dest_port", value_name = "PORT")]
    pub dst_port: Option<u16>,

    /// Target host. The last argument is the destination.
    #[arg(required = true, value_name = "host")]
    pub target: Vec<String>,
}

/// Default source port of UDP probes.
pub const DEFAULT_SRC_PORT: u16 = 3083;
/// Default destination port of UDP probes.
pub const DEFAULT_DST_PORT: u16 = 30000;
/// Destination port used by `-U`.
pub const DNS_DST_PORT: u16 = 53;

impl TraceArgs {
    /// The destination is always the last free argument.
    pub fn target(&self) -> &str {
        self.target.last().expect("clap requires at least one")
    }

    pub fn src_port(&self) -> u16 {
        self.src_port.unwrap_or(DEFAULT_SRC_PORT)
    }

    /// An explicit `-d` wins over the `-U` default of 53.
    pub fn dst_port(&self) -> u16 {
        self.dst_port.unwrap_or(if self.udp_dns {
            DNS_DST_PORT
        } else {
            DEFAULT_DST_PORT
        })
    }

    /// Resolve the algorithm name and its options record.
    ///
    /// `-M` implies `-a mda`; combining `-M` with an explicit non-MDA
    /// algorithm fails here, before any socket is opened.
    pub fn resolve_algorithm(&self) -> Result<(String, AlgorithmOptions)> {
        if let (Some(name), Some(_)) = (self.algorithm.as_deref(), &self.mda) {
            if name != "mda" {
                bail!("InvalidAlgorithm: cannot pass mda options (-M) when using algorithm `{name}`");
            }
        }

        let sweep = TracerouteOptions {
            min_ttl: self.first_ttl,
            max_ttl: self.max_ttl,
            ..TracerouteOptions::default()
        };
        let name = match self.algorithm.as_deref() {
            Some(name) => name,
            None => "mda",
        };
        let options = match name {
            "mda" => {
                let params = self.mda.unwrap_or(MdaParams {
                    bound: 0.05,
                    max_branch: 5,
                });
                AlgorithmOptions::Mda(MdaOptions {
                    bound: params.bound,
                    max_branch: params.max_branch,
                    traceroute: sweep,
                })
            }
            "traceroute" | "paris-traceroute" => AlgorithmOptions::Traceroute(sweep),
            other => bail!("UnknownAlgorithm: `{other}`"),
        };
        Ok((name.to_string(), options))
    }
}

/// Options of the ping front-end.
#[derive(Parser, Debug)]
#[command(
    name = "hopscan-ping",
    about = "Verify the connection between two hosts",
    arg_required_else_help = true
)]
pub struct PingArgs {
    /// Use IPv4.
    #[arg(short = '4')]
    pub ipv4: bool,

    /// Use IPv6.
    #[arg(short = '6')]
    pub ipv6: bool,

    /// Allocate and set a flow label on echo request packets (IPv6 only).
    #[arg(short = 'f')]
    pub flow_label: bool,

    /// Set the source address to this interface address.
    #[arg(short = 'I', value_name = "interface_address")]
    pub interface: Option<String>,

    /// Seconds between packets.
    #[arg(short = 'i', value_name = "interval", default_value_t = 1.0)]
    pub interval: f64,

    /// Number of data bytes to send.
    #[arg(short = 's', value_name = "packet_size")]
    pub packet_size: Option<usize>,

    /// Time to live.
    #[arg(short = 't', value_name = "ttl")]
    pub ttl: Option<u8>,

    /// Stop after this many echo requests; run until interrupted when
    /// omitted.
    #[arg(short = 'c', value_name = "count")]
    pub count: Option<u64>,

    /// Use ICMP echo probes (the default).
    #[arg(long)]
    pub icmp: bool,

    /// Use TCP probes.
    #[arg(long)]
    pub tcp: bool,

    /// Use UDP probes.
    #[arg(long)]
    pub udp: bool,

    /// Target host. The last argument is the destination.
    #[arg(required = true, value_name = "host")]
    pub target: Vec<String>,
}

impl PingArgs {
    pub fn target(&self) -> &str {
        self.target.last().expect("clap requires at least one")
    }

    /// All conflict checks; nothing may hit the network before these
    /// pass.
    pub fn validate(&self) -> Result<()> {
        if self.ipv4 && self.ipv6 {
            bail!("Cannot set both ip versions");
        }
        let protocols = [self.icmp, self.tcp, self.udp]
            .iter()
            .filter(|set| **set)
            .count();
        if protocols > 1 {
            bail!("Cannot use simultaneously icmp tcp and udp tracerouting");
        }
        if self.flow_label && !self.ipv6 {
            bail!("InvalidFlowOption: a flow label requires -6");
        }
        Ok(())
    }

    pub fn ping_options(&self) -> PingOptions {
        PingOptions {
            interval: std::time::Duration::from_secs_f64(self.interval),
            count: self.count,
            ttl: self.ttl,
            packet_size: self.packet_size,
        }
    }
}
