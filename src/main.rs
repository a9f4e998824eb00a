mod forward;
mod meter;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use burstio::api::{BURST_SIZE, TxBurst};
use burstio::ethdev::{DEFAULT_RX_DESC, EthConf, PortId, Ports, QueueId, TxQueue};
use burstio::lcore::{self, LcoreId};
use burstio::mempool::{Pool, PoolConfig};
use clap::{Parser, Subcommand};
use eui48::MacAddress;
use etherparse::{NetHeaders, PacketBuilder, PacketHeaders};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate traffic on one ring port and forward it back from the other.
    Forward(forward::Args),
    /// Generate traffic on one ring port and count it on the other.
    Meter(meter::Args),
}

/// Options shared by every demo.
#[derive(clap::Args, Debug, Clone)]
pub(crate) struct CommonArgs {
    /// Buffers in the pool.
    #[clap(long, default_value_t = 8191)]
    nb_bufs: usize,

    /// Buffers cached by each worker.
    #[clap(long, default_value_t = 250)]
    cache_size: usize,

    /// Descriptors of each RX ring.
    #[clap(long, default_value_t = DEFAULT_RX_DESC)]
    nb_desc: u16,

    /// UDP payload bytes of generated frames.
    #[clap(long, default_value_t = 18)]
    payload: usize,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[clap(long)]
    duration: Option<u64>,
}

impl CommonArgs {
    pub(crate) fn pool(&self) -> Result<Pool> {
        let config = PoolConfig {
            nb_bufs: self.nb_bufs,
            cache_size: self.cache_size,
            socket_id: lcore::current_socket_id(),
            ..PoolConfig::default()
        };
        Ok(Pool::new("demo", &config)?)
    }

    pub(crate) fn print(&self) {
        println!("* pool: {} buffers, cache {}", self.nb_bufs, self.cache_size);
        println!("* ring: {} descriptors", self.nb_desc);
        println!("* payload: {} bytes", self.payload);
        match self.duration {
            Some(d) => println!("* duration: {d}s"),
            None => println!("* duration: until Ctrl-C"),
        }
    }
}

/// Creates a started ring port pair with one queue per direction.
pub(crate) fn ring_pair(args: &CommonArgs, conf: &EthConf) -> Result<(Ports, PortId, PortId)> {
    let mut ports = Ports::new();
    let (a, b) = ports.create_pair("ring0", "ring1")?;
    for id in [a, b] {
        let dev = ports.get_mut(id)?;
        dev.configure(1, 1, conf)?;
        dev.rx_queue_setup(QueueId(0), args.nb_desc)?;
        dev.tx_queue_setup(QueueId(0), args.nb_desc)?;
        dev.start()?;
        info!(port = %id, mac = %dev.mac_addr().to_hex_string(), "port ready");
    }
    Ok((ports, a, b))
}

/// Stops and closes every port, printing its counters.
pub(crate) fn shutdown(mut ports: Ports) -> Result<()> {
    let ids: Vec<PortId> = ports.ids().collect();
    for id in ids {
        let dev = ports.get_mut(id)?;
        let s = dev.stats();
        println!(
            "{}: rx {} pkts {} bytes ({} errors), tx {} pkts {} bytes ({} errors)",
            dev.name(),
            s.ipackets,
            s.ibytes,
            s.ierrors,
            s.opackets,
            s.obytes,
            s.oerrors
        );
        dev.stop()?;
        dev.close()?;
    }
    Ok(())
}

/// The locally administered address l2fwd rewrites frames to.
pub(crate) fn l2fwd_mac(port: PortId) -> MacAddress {
    MacAddress::new([0x02, 0, 0, 0, 0, port.get() as u8])
}

/// `n` worker lcores. Workers share the main lcore when there are not
/// enough CPUs.
pub(crate) fn pick_lcores(n: usize) -> Vec<LcoreId> {
    let mut picked: Vec<LcoreId> = lcore::workers().take(n).collect();
    if picked.len() < n {
        warn!(wanted = n, available = picked.len(), "not enough lcores, sharing the main one");
        picked.resize(n, lcore::MAIN_LCORE);
    }
    picked
}

/// A UDP/IPv4 frame with a zeroed payload.
pub(crate) fn udp_frame(src: MacAddress, dst: MacAddress, payload: usize) -> Result<Vec<u8>> {
    let builder = PacketBuilder::ethernet2(src.to_array(), dst.to_array())
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(4000, 4001);
    let payload = vec![0u8; payload];
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut frame, &payload)
        .map_err(|e| anyhow!("building frame: {e}"))?;
    Ok(frame)
}

/// Sends copies of `frame` through `tx` in bursts until `term` is set.
pub(crate) fn generate(
    mut tx: TxQueue,
    pool: Pool,
    frame: Vec<u8>,
    sent: Arc<AtomicU64>,
    term: Arc<AtomicBool>,
) -> Result<()> {
    let mut cache = pool.cache();
    let mut burst = Vec::with_capacity(BURST_SIZE);
    while !term.load(Ordering::Relaxed) {
        while burst.len() < BURST_SIZE {
            let Ok(mut m) = cache.alloc() else {
                break;
            };
            m.extend_from_slice(&frame)?;
            burst.push(m);
        }
        let n = tx.tx_burst(&mut burst);
        sent.fetch_add(n as u64, Ordering::Relaxed);
    }
    Ok(())
}

/// Prints per-second deltas of `counters` until `term` is set, setting it
/// once `duration` seconds have passed.
pub(crate) fn report(term: &AtomicBool, duration: Option<u64>, counters: &[(&str, &AtomicU64)]) {
    let mut prev = vec![0u64; counters.len()];
    let mut elapsed = 0;
    while !term.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        elapsed += 1;
        let line: Vec<String> = counters
            .iter()
            .zip(prev.iter_mut())
            .map(|((name, counter), prev)| {
                let curr = counter.load(Ordering::Relaxed);
                let rate = curr.saturating_sub(*prev);
                *prev = curr;
                format!("{name}/sec: {rate}")
            })
            .collect();
        println!("{}", line.join(" "));
        if duration.is_some_and(|d| elapsed >= d) {
            term.store(true, Ordering::SeqCst);
        }
    }
}

/// Try to parse Ethernet/IP headers using etherparse and return a formatted string.
pub(crate) fn print_addrs(frame: &[u8]) -> Result<String> {
    let packet_header = PacketHeaders::from_ethernet_slice(frame)?;
    let ip_header = &packet_header
        .net
        .ok_or(anyhow!("Error: IP header not found"))?;
    match ip_header {
        NetHeaders::Ipv4(hdr, _) => Ok(format!(
            "IP: {} > {}",
            Ipv4Addr::from(hdr.source),
            Ipv4Addr::from(hdr.destination)
        )),
        NetHeaders::Ipv6(hdr, _) => Ok(format!(
            "IP: {} > {}",
            Ipv6Addr::from(hdr.source),
            Ipv6Addr::from(hdr.destination)
        )),
        _ => bail!("Error: IP header not found"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    lcore::init_main();
    let cli = Cli::parse();

    // Setup a termination flag (triggered on Ctrl+C).
    let term = Arc::new(AtomicBool::new(false));
    {
        let term = term.clone();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
        })
        .context("setting Ctrl-C handler")?;
    }

    info!(version = burstio::config::version(), lcores = lcore::count(), "starting");
    match cli.command {
        Command::Forward(args) => forward::run(&args, term),
        Command::Meter(args) => meter::run(&args, term),
    }
}
