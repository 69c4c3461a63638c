//! Ping front-end: paced echo measurement over the same engine.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{bail, Context};
use clap::Parser;

use hopscan_cli::options::PingArgs;
use hopscan_cli::render::Resolver;
use hopscan_cli::skeleton::{family_of, ping_skeleton, resolve_target, PingProto};
use hopscan_engine::{
    AlgorithmEvent, AlgorithmOptions, Event, EventLoop, Family, Handler, NetworkConfig,
    PingEvent, RawChannel,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .compact()
        .init();

    let args = PingArgs::parse();
    args.validate()?;

    let family = if args.ipv6 {
        Some(Family::V6)
    } else if args.ipv4 {
        Some(Family::V4)
    } else {
        None
    };
    let dst = resolve_target(args.target(), family)?;
    let family = family.unwrap_or_else(|| family_of(dst));

    let proto = if args.tcp {
        PingProto::Tcp
    } else if args.udp {
        PingProto::Udp
    } else {
        PingProto::Icmp
    };
    let src = match &args.interface {
        Some(raw) => Some(
            raw.parse()
                .with_context(|| format!("invalid interface address `{raw}`"))?,
        ),
        None => None,
    };
    let skeleton = ping_skeleton(family, proto, dst, src, args.flow_label)?;
    let stack: Vec<_> = skeleton.protocols().collect();
    if !hopscan_engine::net::channel::supported_stack(&stack) {
        bail!("probe stack not supported by the raw channel yet");
    }

    tracing::debug!(%dst, ?proto, interval = args.interval, "starting ping");
    println!("ping to {} ({dst})", args.target());

    let resolver = Rc::new(RefCell::new(Resolver::new(true)));
    let failure: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));

    let handler: Handler = {
        let resolver = resolver.clone();
        let failure = failure.clone();
        Box::new(move |actions, _id, event| match event {
            Event::Algorithm(AlgorithmEvent::Ping(ping)) => match ping {
                PingEvent::Reply { seq, from, rtt } => {
                    println!(
                        "reply from {}: seq={seq} time={:.3} ms",
                        resolver.borrow_mut().name(*from),
                        rtt.as_secs_f64() * 1000.0
                    );
                }
                PingEvent::Timeout { seq } => {
                    println!("request timeout: seq={seq}");
                }
                PingEvent::Summary(stats) => {
                    let loss = if stats.sent > 0 {
                        100.0 * (stats.sent - stats.received) as f64 / stats.sent as f64
                    } else {
                        0.0
                    };
                    println!(
                        "\n{} packets transmitted, {} received, {loss:.1}% loss",
                        stats.sent, stats.received
                    );
                    if let (Some(min), Some(max)) = (stats.min, stats.max) {
                        println!(
                            "rtt min/avg/max/stddev = {:.3}/{:.3}/{:.3}/{:.3} ms",
                            min.as_secs_f64() * 1000.0,
                            stats.mean_ms,
                            max.as_secs_f64() * 1000.0,
                            stats.stddev_ms
                        );
                    }
                }
            },
            Event::AlgorithmTerminated(result) => {
                if let Err(error) = result {
                    *failure.borrow_mut() = Some(error.to_string());
                }
                actions.terminate();
            }
            _ => {}
        })
    };

    let channel =
        RawChannel::new(family).context("cannot open raw channel (CAP_NET_RAW required)")?;
    let mut event_loop = EventLoop::new(channel, NetworkConfig::default(), handler);

    let stop = event_loop.terminate_handle();
    ctrlc::set_handler(move || stop.request()).context("cannot install signal handler")?;

    event_loop.add_algorithm(
        "ping",
        AlgorithmOptions::Ping(args.ping_options()),
        skeleton,
    )?;
    event_loop.run(None)?;

    if let Some(message) = failure.borrow_mut().take() {
        bail!("{message}");
    }
    Ok(())
}
