//! Paris-traceroute style front-end.
//!
//! Defaults to MDA multipath discovery, streaming each confirmed link as
//! it appears; `-a traceroute` / `-a paris-traceroute` run the classical
//! single-path sweeps and dump the lattice at termination.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use hopscan_cli::options::TraceArgs;
use hopscan_cli::render::{dump_lattice, link_line, Resolver};
use hopscan_cli::skeleton::{resolve_target, trace_skeleton};
use hopscan_engine::{
    AlgorithmEvent, Event, EventLoop, Family, Handler, NetworkConfig, RawChannel,
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

    let args = TraceArgs::parse();

    // Everything that can fail by configuration fails here, before any
    // socket is opened or packet emitted.
    let (algorithm, options) = args.resolve_algorithm()?;
    let dst = resolve_target(args.target(), Some(Family::V4))?;
    let skeleton = trace_skeleton(dst, args.src_port(), args.dst_port())?;
    tracing::debug!(%dst, algorithm, wait = args.wait, "starting trace");

    println!("Traceroute to {dst} using algorithm {algorithm}\n");

    let resolver = Rc::new(RefCell::new(Resolver::new(!args.no_resolve)));
    let failure: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
    let streaming = algorithm == "mda";

    let handler: Handler = {
        let resolver = resolver.clone();
        let failure = failure.clone();
        Box::new(move |actions, _id, event| match event {
            Event::Algorithm(AlgorithmEvent::MdaNewLink(link)) if streaming => {
                println!("{}", link_line(&mut resolver.borrow_mut(), link));
            }
            Event::Algorithm(AlgorithmEvent::BranchCapReached { ttl }) => {
                eprintln!("warning: branching cap reached at ttl {ttl}, discovery truncated");
            }
            Event::AlgorithmTerminated(result) => {
                match result {
                    Ok(lattice) if !streaming => {
                        for line in dump_lattice(&mut resolver.borrow_mut(), lattice) {
                            println!("{line}");
                        }
                    }
                    Ok(_) => {}
                    Err(error) => {
                        *failure.borrow_mut() = Some(error.to_string());
                    }
                }
                actions.terminate();
            }
            _ => {}
        })
    };

    let channel = RawChannel::new(Family::V4)
        .context("cannot open raw channel (CAP_NET_RAW required)")?;
    let mut event_loop = EventLoop::new(
        channel,
        NetworkConfig {
            timeout: Duration::from_secs_f64(args.wait),
            verbose: false,
        },
        handler,
    );

    let stop = event_loop.terminate_handle();
    ctrlc::set_handler(move || stop.request()).context("cannot install signal handler")?;

    event_loop.add_algorithm(&algorithm, options, skeleton)?;
    event_loop.run(None)?;

    if let Some(message) = failure.borrow_mut().take() {
        bail!("{message}");
    }
    Ok(())
}
