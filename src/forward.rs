use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Result;
use burstio::api::{BURST_SIZE, RxBurst, TxBurst};
use burstio::ethdev::{EthConf, QueueId, RxQueue, TxQueue};
use burstio::launch;
use eui48::MacAddress;

use crate::{CommonArgs, generate, l2fwd_mac, pick_lcores, report, ring_pair, shutdown, udp_frame};

/// Command-line arguments.
#[derive(clap::Args, Debug, Clone)]
pub(crate) struct Args {
    #[clap(flatten)]
    common: CommonArgs,

    /// Leave source and destination addresses untouched.
    #[clap(long)]
    no_mac_updating: bool,
}

/// Rewrites the Ethernet addresses of `frame` as l2fwd does.
fn update_mac(frame: &mut [u8], src: MacAddress, dst: MacAddress) {
    if frame.len() >= 12 {
        frame[..6].copy_from_slice(dst.as_bytes());
        frame[6..12].copy_from_slice(src.as_bytes());
    }
}

/// Receives bursts on `rx` and sends them back out of `tx`.
fn forward(
    mut rx: RxQueue,
    mut tx: TxQueue,
    rewrite: Option<(MacAddress, MacAddress)>,
    total_fwd: Arc<AtomicU64>,
    term: Arc<AtomicBool>,
) -> Result<()> {
    let mut burst = Vec::with_capacity(BURST_SIZE);
    while !term.load(Ordering::Relaxed) {
        if rx.rx_burst(&mut burst, BURST_SIZE) == 0 {
            continue;
        }
        if let Some((src, dst)) = rewrite {
            for m in burst.iter_mut() {
                update_mac(m.make_mut()?, src, dst);
            }
        }
        let sent = tx.tx_burst(&mut burst);
        total_fwd.fetch_add(sent as u64, Ordering::Relaxed);
        // Drop what did not fit.
        burst.clear();
    }
    Ok(())
}

/// Drains `rx`, counting what comes back.
fn sink(mut rx: RxQueue, total_rcv: Arc<AtomicU64>, term: Arc<AtomicBool>) -> Result<()> {
    let mut burst = Vec::with_capacity(BURST_SIZE);
    while !term.load(Ordering::Relaxed) {
        let n = rx.rx_burst(&mut burst, BURST_SIZE);
        total_rcv.fetch_add(n as u64, Ordering::Relaxed);
        burst.clear();
    }
    Ok(())
}

/// The packet-forwarding demo.
///
/// A generator sends frames out of port 0, a forwarder receives them on
/// port 1 and sends them back with rewritten addresses, and a sink counts
/// them on port 0. With addresses rewritten, port 0 only accepts frames
/// addressed to it.
pub(crate) fn run(args: &Args, term: Arc<AtomicBool>) -> Result<()> {
    println!("Starting packet forwarder:");
    args.common.print();
    println!(
        "* mac updating: {}",
        if args.no_mac_updating { "OFF" } else { "ON" }
    );

    let pool = args.common.pool()?;
    let (ports, a, b) = ring_pair(
        &args.common,
        &EthConf {
            promiscuous: true,
            ..EthConf::default()
        },
    )?;
    let (dev_a, dev_b) = (ports.get(a)?, ports.get(b)?);
    let rewrite = if args.no_mac_updating {
        None
    } else {
        dev_a.promiscuous_disable();
        dev_a.set_mac_addr(l2fwd_mac(a))?;
        Some((dev_b.mac_addr(), l2fwd_mac(a)))
    };
    let frame = udp_frame(dev_a.mac_addr(), dev_b.mac_addr(), args.common.payload)?;

    let gen_tx = dev_a.take_tx_queue(QueueId(0))?;
    let sink_rx = dev_a.take_rx_queue(QueueId(0))?;
    let fwd_rx = dev_b.take_rx_queue(QueueId(0))?;
    let fwd_tx = dev_b.take_tx_queue(QueueId(0))?;

    let total_gen = Arc::new(AtomicU64::new(0));
    let total_fwd = Arc::new(AtomicU64::new(0));
    let total_rcv = Arc::new(AtomicU64::new(0));

    let lcores = pick_lcores(3);
    let workers = vec![
        launch::remote_launch(lcores[0], {
            let (sent, term) = (total_gen.clone(), term.clone());
            move || generate(gen_tx, pool, frame, sent, term)
        })?,
        launch::remote_launch(lcores[1], {
            let (fwd, term) = (total_fwd.clone(), term.clone());
            move || forward(fwd_rx, fwd_tx, rewrite, fwd, term)
        })?,
        launch::remote_launch(lcores[2], {
            let (rcv, term) = (total_rcv.clone(), term.clone());
            move || sink(sink_rx, rcv, term)
        })?,
    ];

    report(
        &term,
        args.common.duration,
        &[("gen", &*total_gen), ("fwd", &*total_fwd), ("rcv", &*total_rcv)],
    );

    for r in launch::wait_all(workers)? {
        r?;
    }
    shutdown(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_mac_rewrites_both_addresses() {
        let src = MacAddress::new([0x02, 0, 0, 0, 0, 0x0a]);
        let dst = MacAddress::new([0x02, 0, 0, 0, 0, 0x0b]);
        let mut frame = crate::udp_frame(dst, src, 4).unwrap();
        update_mac(&mut frame, src, dst);
        assert_eq!(&frame[..6], dst.as_bytes());
        assert_eq!(&frame[6..12], src.as_bytes());
    }
}
