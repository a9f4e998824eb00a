//! Ethernet ports.
//!
//! A port goes through `configure`, one `*_queue_setup` per queue and
//! `start`; only then can its queue handles be taken by workers:
//!
//! ```text
//! Unconfigured -> Configured -> Started <-> Stopped -> Closed
//! ```
//!
//! Ports are created in pairs by [`Ports::create_pair`]: TX queue `i` of one
//! port feeds RX queue `i` of the other through a ring sized by the RX
//! descriptor count.

pub mod ring;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use eui48::MacAddress;
use rand::RngCore;
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::lcore::SocketId;
pub use ring::{RxQueue, TxQueue};
use ring::{PortShared, Slot, pack_mac, queue_bit, unpack_mac};

pub const ETHER_HDR_LEN: usize = 14;
pub const DEFAULT_MTU: u16 = 1500;
pub const MIN_MTU: u16 = 68;
pub const MAX_MTU: u16 = 9600;
pub const MAX_QUEUES: u16 = 64;
pub const MAX_DESC: u16 = 16384;
pub const DEFAULT_RX_DESC: u16 = 1024;
pub const DEFAULT_TX_DESC: u16 = 1024;
/// Reported speed of a ring link.
pub const RING_LINK_SPEED_MBPS: u32 = 10_000;
pub const RING_DRIVER_NAME: &str = "net_ring";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u16);

impl PortId {
    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u16);

impl QueueId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for QueueId {
    fn from(q: u16) -> Self {
        Self(q)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue{}", self.0)
    }
}

/// Port configuration applied by [`EthDev::configure`].
#[derive(Debug, Clone)]
pub struct EthConf {
    pub mtu: u16,
    pub promiscuous: bool,
}

impl Default for EthConf {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            promiscuous: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EthStats {
    pub ipackets: u64,
    pub opackets: u64,
    pub ibytes: u64,
    pub obytes: u64,
    /// Frames dropped on receive for exceeding the MTU.
    pub ierrors: u64,
    /// Frames lost on transmit because the link was down.
    pub oerrors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub up: bool,
    pub speed_mbps: u32,
}

/// Limits and current queue counts of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevInfo {
    pub driver_name: &'static str,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub max_desc: u16,
    pub min_mtu: u16,
    pub max_mtu: u16,
    /// Longest frame accepted at the current MTU.
    pub max_rx_pktlen: u32,
    pub nb_rx_queues: u16,
    pub nb_tx_queues: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevState {
    Unconfigured,
    Configured,
    Started,
    Stopped,
    Closed,
}

pub struct EthDev {
    name: String,
    state: DevState,
    nb_rx: u16,
    nb_tx: u16,
    socket_id: SocketId,
    shared: Arc<PortShared>,
    peer: Arc<PortShared>,
}

/// A random locally administered unicast address.
fn random_mac() -> MacAddress {
    let mut b = [0u8; 6];
    rand::rng().fill_bytes(&mut b);
    b[0] = (b[0] | 0x02) & !0x01;
    MacAddress::new(b)
}

fn check_desc(nb_desc: u16) -> Result<()> {
    if nb_desc == 0 || nb_desc > MAX_DESC {
        return Err(Error::Config(format!(
            "descriptor count {nb_desc} not in 1..={MAX_DESC}"
        )));
    }
    Ok(())
}

impl EthDev {
    fn new(name: &str, shared: Arc<PortShared>, peer: Arc<PortShared>) -> Self {
        Self {
            name: name.to_owned(),
            state: DevState::Unconfigured,
            nb_rx: 0,
            nb_tx: 0,
            socket_id: SocketId::default(),
            shared,
            peer,
        }
    }

    pub fn id(&self) -> PortId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DevState {
        self.state
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    /// The port this one's TX queues feed.
    pub fn peer(&self) -> PortId {
        self.peer.id
    }

    pub fn nb_rx_queues(&self) -> u16 {
        self.nb_rx
    }

    pub fn nb_tx_queues(&self) -> u16 {
        self.nb_tx
    }

    fn expect_state(&self, allowed: &[DevState], what: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState(what))
        }
    }

    /// Sets the number of queues and the port settings. Any previously set
    /// up queue is discarded.
    pub fn configure(&mut self, nb_rx: u16, nb_tx: u16, conf: &EthConf) -> Result<()> {
        use DevState::*;
        self.expect_state(
            &[Unconfigured, Configured, Stopped],
            "configure needs a stopped port",
        )?;
        if nb_rx == 0 || nb_tx == 0 || nb_rx > MAX_QUEUES || nb_tx > MAX_QUEUES {
            return Err(Error::Config(format!(
                "queue counts {nb_rx}/{nb_tx} not in 1..={MAX_QUEUES}"
            )));
        }
        check_mtu(conf.mtu)?;

        self.shared.slots.lock().reset(nb_rx as usize, nb_tx as usize);
        self.shared.rx_stopped.store(0, Ordering::Relaxed);
        self.shared.tx_stopped.store(0, Ordering::Relaxed);
        self.shared.mtu.store(conf.mtu, Ordering::Relaxed);
        self.shared
            .promiscuous
            .store(conf.promiscuous, Ordering::Relaxed);
        self.nb_rx = nb_rx;
        self.nb_tx = nb_tx;
        self.state = Configured;
        info!(port = %self.id(), name = %self.name, nb_rx, nb_tx, mtu = conf.mtu, "port configured");
        Ok(())
    }

    fn check_queue(&self, q: QueueId, count: u16) -> Result<()> {
        if q.0 >= count {
            return Err(Error::InvalidHandle(format!("{} {q}", self.id())));
        }
        Ok(())
    }

    /// Creates the ring of RX queue `q`, holding up to `nb_desc` buffers.
    pub fn rx_queue_setup(&mut self, q: QueueId, nb_desc: u16) -> Result<()> {
        use DevState::*;
        self.expect_state(&[Configured, Stopped], "queue setup needs a configured, stopped port")?;
        self.check_queue(q, self.nb_rx)?;
        check_desc(nb_desc)?;
        self.shared.slots.lock().install_rx(q.index(), nb_desc);
        debug!(port = %self.id(), queue = q.0, nb_desc, "rx queue set up");
        Ok(())
    }

    /// Sets up TX queue `q`. Its capacity is the one of the peer's RX
    /// queue with the same index.
    pub fn tx_queue_setup(&mut self, q: QueueId, nb_desc: u16) -> Result<()> {
        use DevState::*;
        self.expect_state(&[Configured, Stopped], "queue setup needs a configured, stopped port")?;
        self.check_queue(q, self.nb_tx)?;
        check_desc(nb_desc)?;
        self.shared.slots.lock().tx[q.index()] = Slot::Ready(());
        debug!(port = %self.id(), queue = q.0, nb_desc, "tx queue set up");
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        use DevState::*;
        self.expect_state(&[Configured, Stopped], "port is not configured or already started")?;
        {
            let slots = self.shared.slots.lock();
            if !slots.rx.iter().all(Slot::is_ready) || !slots.tx.iter().all(Slot::is_ready) {
                return Err(Error::InvalidState("all queues must be set up before start"));
            }
        }
        // Starting the port starts every queue.
        self.shared.rx_stopped.store(0, Ordering::Relaxed);
        self.shared.tx_stopped.store(0, Ordering::Relaxed);
        self.shared.link_up.store(true, Ordering::Release);
        self.state = Started;
        info!(port = %self.id(), name = %self.name, "port started");
        Ok(())
    }

    /// Stops the port. Every queue handle must have been returned.
    pub fn stop(&mut self) -> Result<()> {
        self.expect_state(&[DevState::Started], "port is not started")?;
        if self.shared.slots.lock().any_taken() {
            return Err(Error::InvalidState("queue handles still in use"));
        }
        self.shared.link_up.store(false, Ordering::Release);
        self.state = DevState::Stopped;
        info!(port = %self.id(), name = %self.name, "port stopped");
        Ok(())
    }

    /// Releases the port's queues and every buffer left in its rings.
    pub fn close(&mut self) -> Result<()> {
        use DevState::*;
        self.expect_state(&[Unconfigured, Configured, Stopped], "stop the port before closing it")?;
        self.shared.slots.lock().clear();
        self.nb_rx = 0;
        self.nb_tx = 0;
        self.state = Closed;
        info!(port = %self.id(), name = %self.name, "port closed");
        Ok(())
    }

    /// Brings the link of a started port back up.
    pub fn set_link_up(&self) -> Result<()> {
        self.expect_state(&[DevState::Started], "link control needs a started port")?;
        self.shared.link_up.store(true, Ordering::Release);
        info!(port = %self.id(), "link up");
        Ok(())
    }

    /// Takes the link down without stopping the port. Frames sent from or
    /// to it are lost and counted in `oerrors` by the sender.
    pub fn set_link_down(&self) -> Result<()> {
        self.expect_state(&[DevState::Started], "link control needs a started port")?;
        self.shared.link_up.store(false, Ordering::Release);
        info!(port = %self.id(), "link down");
        Ok(())
    }

    fn set_queue_stopped(&self, rx: bool, q: QueueId, stopped: bool) -> Result<()> {
        self.expect_state(&[DevState::Started], "queue control needs a started port")?;
        let (mask, count) = if rx {
            (&self.shared.rx_stopped, self.nb_rx)
        } else {
            (&self.shared.tx_stopped, self.nb_tx)
        };
        self.check_queue(q, count)?;
        if stopped {
            mask.fetch_or(queue_bit(q), Ordering::Relaxed);
        } else {
            mask.fetch_and(!queue_bit(q), Ordering::Relaxed);
        }
        debug!(port = %self.id(), queue = q.0, rx, stopped, "queue state changed");
        Ok(())
    }

    /// Resumes RX queue `q`.
    pub fn rx_queue_start(&self, q: QueueId) -> Result<()> {
        self.set_queue_stopped(true, q, false)
    }

    /// Pauses RX queue `q`: bursts return nothing and frames wait in the
    /// ring until the queue is started again.
    pub fn rx_queue_stop(&self, q: QueueId) -> Result<()> {
        self.set_queue_stopped(true, q, true)
    }

    pub fn tx_queue_start(&self, q: QueueId) -> Result<()> {
        self.set_queue_stopped(false, q, false)
    }

    /// Pauses TX queue `q`: bursts send nothing and leave every buffer with
    /// the caller.
    pub fn tx_queue_stop(&self, q: QueueId) -> Result<()> {
        self.set_queue_stopped(false, q, true)
    }

    pub fn info(&self) -> DevInfo {
        DevInfo {
            driver_name: RING_DRIVER_NAME,
            max_rx_queues: MAX_QUEUES,
            max_tx_queues: MAX_QUEUES,
            max_desc: MAX_DESC,
            min_mtu: MIN_MTU,
            max_mtu: MAX_MTU,
            max_rx_pktlen: (self.mtu() as usize + ETHER_HDR_LEN) as u32,
            nb_rx_queues: self.nb_rx,
            nb_tx_queues: self.nb_tx,
        }
    }

    /// Hands out the receive handle of queue `q`. Only one handle per queue
    /// exists at a time; dropping it gives the queue back.
    pub fn take_rx_queue(&self, q: QueueId) -> Result<RxQueue> {
        self.expect_state(&[DevState::Started], "queues are available only while started")?;
        self.check_queue(q, self.nb_rx)?;
        let cons = self.shared.slots.lock().rx[q.index()]
            .take()
            .ok_or(Error::InvalidState("rx queue already taken"))?;
        Ok(RxQueue::new(q, cons, self.shared.clone()))
    }

    /// Hands out the transmit handle of queue `q`. The peer's RX queue `q`
    /// must be set up.
    pub fn take_tx_queue(&self, q: QueueId) -> Result<TxQueue> {
        self.expect_state(&[DevState::Started], "queues are available only while started")?;
        self.check_queue(q, self.nb_tx)?;
        {
            let mut slots = self.shared.slots.lock();
            let slot = &mut slots.tx[q.index()];
            if !slot.is_ready() {
                return Err(Error::InvalidState("tx queue already taken"));
            }
            *slot = Slot::Taken;
        }
        // The peer may be this very port, so the two locks are never nested.
        let taken = self
            .peer
            .slots
            .lock()
            .inbox
            .get_mut(q.index())
            .and_then(|inbox| Some((inbox.prod.take()?, inbox.epoch)));
        match taken {
            Some((prod, epoch)) => Ok(TxQueue::new(
                q,
                prod,
                epoch,
                self.shared.clone(),
                self.peer.clone(),
            )),
            None => {
                self.shared.slots.lock().tx[q.index()] = Slot::Ready(());
                Err(Error::InvalidState("peer rx queue not set up or in use"))
            }
        }
    }

    /// Gives back a receive handle. Same as dropping it.
    pub fn put_rx_queue(&self, queue: RxQueue) {
        drop(queue);
    }

    /// Gives back a transmit handle. Same as dropping it.
    pub fn put_tx_queue(&self, queue: TxQueue) {
        drop(queue);
    }

    pub fn mac_addr(&self) -> MacAddress {
        MacAddress::new(unpack_mac(self.shared.mac.load(Ordering::Relaxed)))
    }

    pub fn set_mac_addr(&self, mac: MacAddress) -> Result<()> {
        if mac.is_multicast() {
            return Err(Error::Config(format!(
                "{} is not a unicast address",
                mac.to_hex_string()
            )));
        }
        self.shared.mac.store(pack_mac(mac.to_array()), Ordering::Relaxed);
        Ok(())
    }

    pub fn mtu(&self) -> u16 {
        self.shared.mtu.load(Ordering::Relaxed)
    }

    /// Receive queues drop and count frames longer than `mtu` plus the
    /// Ethernet header.
    pub fn set_mtu(&self, mtu: u16) -> Result<()> {
        check_mtu(mtu)?;
        self.shared.mtu.store(mtu, Ordering::Relaxed);
        Ok(())
    }

    pub fn promiscuous_enable(&self) {
        self.shared.promiscuous.store(true, Ordering::Relaxed);
    }

    pub fn promiscuous_disable(&self) {
        self.shared.promiscuous.store(false, Ordering::Relaxed);
    }

    pub fn promiscuous(&self) -> bool {
        self.shared.promiscuous.load(Ordering::Relaxed)
    }

    pub fn link(&self) -> LinkStatus {
        let up = self.shared.link_up.load(Ordering::Acquire);
        LinkStatus {
            up,
            speed_mbps: if up { RING_LINK_SPEED_MBPS } else { 0 },
        }
    }

    pub fn stats(&self) -> EthStats {
        self.shared.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }
}

fn check_mtu(mtu: u16) -> Result<()> {
    if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
        return Err(Error::Config(format!("mtu {mtu} not in {MIN_MTU}..={MAX_MTU}")));
    }
    Ok(())
}

impl fmt::Debug for EthDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EthDev")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("state", &self.state)
            .field("peer", &self.peer())
            .finish()
    }
}

/// Registry of the ports of a process. Raw port numbers coming from outside
/// are turned into [`PortId`]s only through [`Ports::port_id`].
#[derive(Debug, Default)]
pub struct Ports {
    devs: Vec<EthDev>,
}

impl Ports {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> Result<PortId> {
        u16::try_from(self.devs.len())
            .map(PortId)
            .map_err(|_| Error::Config("too many ports".into()))
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.find(name).is_some() {
            return Err(Error::Config(format!("port name {name} already in use")));
        }
        Ok(())
    }

    /// Creates two ports wired back to back.
    pub fn create_pair(&mut self, a: &str, b: &str) -> Result<(PortId, PortId)> {
        self.check_name(a)?;
        self.check_name(b)?;
        if a == b {
            return Err(Error::Config(format!("port name {a} used twice")));
        }
        let ida = self.next_id()?;
        let idb = PortId(
            ida.0
                .checked_add(1)
                .ok_or_else(|| Error::Config("too many ports".into()))?,
        );
        let sa = Arc::new(PortShared::new(ida, DEFAULT_MTU, random_mac().to_array()));
        let sb = Arc::new(PortShared::new(idb, DEFAULT_MTU, random_mac().to_array()));
        self.devs.push(EthDev::new(a, sa.clone(), sb.clone()));
        self.devs.push(EthDev::new(b, sb, sa));
        info!(%ida, %idb, a, b, "created ring port pair");
        Ok((ida, idb))
    }

    /// Creates a port whose TX queues feed its own RX queues.
    pub fn create_loopback(&mut self, name: &str) -> Result<PortId> {
        self.check_name(name)?;
        let id = self.next_id()?;
        let shared = Arc::new(PortShared::new(id, DEFAULT_MTU, random_mac().to_array()));
        self.devs.push(EthDev::new(name, shared.clone(), shared));
        info!(%id, name, "created loopback port");
        Ok(id)
    }

    /// Validates a raw port number.
    pub fn port_id(&self, raw: u16) -> Result<PortId> {
        if (raw as usize) < self.devs.len() {
            Ok(PortId(raw))
        } else {
            Err(Error::InvalidHandle(format!("port{raw}")))
        }
    }

    pub fn get(&self, id: PortId) -> Result<&EthDev> {
        self.devs
            .get(id.0 as usize)
            .ok_or_else(|| Error::InvalidHandle(id.to_string()))
    }

    pub fn get_mut(&mut self, id: PortId) -> Result<&mut EthDev> {
        self.devs
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::InvalidHandle(id.to_string()))
    }

    pub fn find(&self, name: &str) -> Option<PortId> {
        self.devs.iter().find(|d| d.name == name).map(EthDev::id)
    }

    /// Number of ports not closed.
    pub fn count_avail(&self) -> usize {
        self.devs
            .iter()
            .filter(|d| d.state != DevState::Closed)
            .count()
    }

    pub fn ids(&self) -> impl Iterator<Item = PortId> + '_ {
        self.devs.iter().map(EthDev::id)
    }
}
