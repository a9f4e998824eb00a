use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Result, bail};
use burstio::api::{BURST_SIZE, RxBurst};
use burstio::config::Capabilities;
use burstio::cycles;
use burstio::ethdev::{EthConf, QueueId, RxQueue};
use burstio::launch;
use burstio::spinlock::SpinMutex;

use crate::{CommonArgs, generate, pick_lcores, print_addrs, report, ring_pair, shutdown, udp_frame};

#[derive(clap::Args, Debug, Clone)]
pub(crate) struct Args {
    #[clap(flatten)]
    common: CommonArgs,

    /// Number of receiving queues, each polled by its own lcore.
    #[clap(short, long, default_value_t = 1)]
    queues: u16,

    /// Enable debug printing (e.g. parsed IP addresses).
    #[clap(short, long)]
    debug: bool,
}

/// Latency samples shared by the receivers.
#[derive(Default)]
struct Latency {
    bursts: u64,
    cycles: u64,
}

fn receive(
    mut rx: RxQueue,
    total: Arc<AtomicU64>,
    latency: Arc<SpinMutex<Latency>>,
    debug: bool,
    term: Arc<AtomicBool>,
) -> Result<()> {
    let mut burst = Vec::with_capacity(BURST_SIZE);
    while !term.load(Ordering::Relaxed) {
        let start = cycles::rdtsc();
        let n = rx.rx_burst(&mut burst, BURST_SIZE);
        if n == 0 {
            continue;
        }
        let spent = cycles::rdtsc().saturating_sub(start);
        {
            let mut l = latency.lock();
            l.bursts += 1;
            l.cycles += spent;
        }
        total.fetch_add(n as u64, Ordering::Relaxed);
        if debug {
            for m in &burst {
                match print_addrs(m.data()) {
                    Ok(s) => println!("{}: {s}", rx.queue()),
                    Err(e) => println!("{}: {e}", rx.queue()),
                }
            }
        }
        burst.clear();
    }
    Ok(())
}

/// The metering demo: one generator per queue sends frames out of port 0,
/// one receiver per queue counts them on port 1.
pub(crate) fn run(args: &Args, term: Arc<AtomicBool>) -> Result<()> {
    println!("Test ring0 -> ring1 started with parameters:");
    args.common.print();
    println!("* queues: {}", args.queues);
    println!("* debug: {}", if args.debug { "ON" } else { "OFF" });
    if args.queues == 0 {
        bail!("at least one queue is needed");
    }

    let pool = args.common.pool()?;
    let (mut ports, a, b) = ring_pair(
        &args.common,
        &EthConf {
            promiscuous: true,
            ..EthConf::default()
        },
    )?;
    if args.queues > 1 {
        for id in [a, b] {
            let dev = ports.get_mut(id)?;
            dev.stop()?;
            dev.configure(args.queues, args.queues, &EthConf::default())?;
            dev.promiscuous_enable();
            for q in 0..args.queues {
                dev.rx_queue_setup(QueueId(q), args.common.nb_desc)?;
                dev.tx_queue_setup(QueueId(q), args.common.nb_desc)?;
            }
            dev.start()?;
        }
    }
    let (dev_a, dev_b) = (ports.get(a)?, ports.get(b)?);
    let frame = udp_frame(dev_a.mac_addr(), dev_b.mac_addr(), args.common.payload)?;

    let total_gen = Arc::new(AtomicU64::new(0));
    let total_rcv = Arc::new(AtomicU64::new(0));
    let latency = Arc::new(SpinMutex::with_capabilities(
        Latency::default(),
        &Capabilities::detect(),
    ));

    let lcores = pick_lcores(2 * args.queues as usize);
    let mut workers = Vec::with_capacity(lcores.len());
    for q in 0..args.queues {
        let tx = dev_a.take_tx_queue(QueueId(q))?;
        let rx = dev_b.take_rx_queue(QueueId(q))?;
        let (pool, frame) = (pool.clone(), frame.clone());
        let (sent, rcv, latency) = (total_gen.clone(), total_rcv.clone(), latency.clone());
        let (term_gen, term_rcv) = (term.clone(), term.clone());
        let debug = args.debug;
        workers.push(launch::remote_launch(lcores[2 * q as usize], move || {
            generate(tx, pool, frame, sent, term_gen)
        })?);
        workers.push(launch::remote_launch(lcores[2 * q as usize + 1], move || {
            receive(rx, rcv, latency, debug, term_rcv)
        })?);
    }

    report(
        &term,
        args.common.duration,
        &[("gen", &*total_gen), ("pkt", &*total_rcv)],
    );

    for r in launch::wait_all(workers)? {
        r?;
    }
    {
        let l = latency.lock();
        if l.bursts > 0 {
            let avg = l.cycles / l.bursts;
            println!(
                "average rx burst: {avg} cycles ({:?})",
                cycles::cycles_to_duration(avg)
            );
        }
    }
    shutdown(ports)
}
