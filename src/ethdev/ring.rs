//! Software queues backed by single-producer single-consumer rings.
//!
//! Every RX queue of a port owns a ring. The consumer half stays with the
//! port's RX queue handle; the producer half is parked in the port's inbox
//! until the peer port hands out its TX queue with the same index.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};

use parking_lot::Mutex;
use ringbuf::storage::Heap;
use ringbuf::traits::{Consumer as _, Observer as _, Producer as _, Split as _};
use ringbuf::{CachingCons, CachingProd, HeapRb, SharedRb};

use super::{ETHER_HDR_LEN, EthStats, PortId, QueueId};
use crate::api::{RxBurst, TxBurst};
use crate::mbuf::Mbuf;

pub(crate) type RingProd = CachingProd<Arc<SharedRb<Heap<Mbuf>>>>;
pub(crate) type RingCons = CachingCons<Arc<SharedRb<Heap<Mbuf>>>>;

pub(crate) fn ring(nb_desc: u16) -> (RingProd, RingCons) {
    HeapRb::<Mbuf>::new(nb_desc as usize).split()
}

pub(crate) enum Slot<T> {
    Empty,
    Ready(T),
    Taken,
}

impl<T> Slot<T> {
    pub(crate) fn is_ready(&self) -> bool {
        matches!(self, Slot::Ready(_))
    }

    pub(crate) fn is_taken(&self) -> bool {
        matches!(self, Slot::Taken)
    }

    pub(crate) fn take(&mut self) -> Option<T> {
        match std::mem::replace(self, Slot::Taken) {
            Slot::Ready(v) => Some(v),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Producer half of one of this port's RX rings. `epoch` changes whenever
/// the ring is replaced, so a stale producer is not put back.
pub(crate) struct Inbox {
    pub(crate) epoch: u64,
    pub(crate) prod: Option<RingProd>,
}

#[derive(Default)]
pub(crate) struct Slots {
    next_epoch: u64,
    pub(crate) rx: Vec<Slot<RingCons>>,
    pub(crate) tx: Vec<Slot<()>>,
    pub(crate) inbox: Vec<Inbox>,
}

impl Slots {
    pub(crate) fn reset(&mut self, nb_rx: usize, nb_tx: usize) {
        self.rx = (0..nb_rx).map(|_| Slot::Empty).collect();
        self.tx = (0..nb_tx).map(|_| Slot::Empty).collect();
        self.inbox = (0..nb_rx)
            .map(|_| Inbox {
                epoch: 0,
                prod: None,
            })
            .collect();
    }

    pub(crate) fn install_rx(&mut self, q: usize, nb_desc: u16) {
        let (prod, cons) = ring(nb_desc);
        self.next_epoch += 1;
        self.rx[q] = Slot::Ready(cons);
        self.inbox[q] = Inbox {
            epoch: self.next_epoch,
            prod: Some(prod),
        };
    }

    pub(crate) fn any_taken(&self) -> bool {
        self.rx.iter().any(Slot::is_taken) || self.tx.iter().any(Slot::is_taken)
    }

    pub(crate) fn clear(&mut self) {
        self.next_epoch += 1;
        self.reset(0, 0);
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    ipackets: AtomicU64,
    opackets: AtomicU64,
    ibytes: AtomicU64,
    obytes: AtomicU64,
    ierrors: AtomicU64,
    oerrors: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: u64) {
        if n != 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> EthStats {
        EthStats {
            ipackets: self.ipackets.load(Ordering::Relaxed),
            opackets: self.opackets.load(Ordering::Relaxed),
            ibytes: self.ibytes.load(Ordering::Relaxed),
            obytes: self.obytes.load(Ordering::Relaxed),
            ierrors: self.ierrors.load(Ordering::Relaxed),
            oerrors: self.oerrors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        for c in [
            &self.ipackets,
            &self.opackets,
            &self.ibytes,
            &self.obytes,
            &self.ierrors,
            &self.oerrors,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Port state reachable from queue handles.
pub(crate) struct PortShared {
    pub(crate) id: PortId,
    pub(crate) stats: Counters,
    pub(crate) mtu: AtomicU16,
    pub(crate) promiscuous: AtomicBool,
    pub(crate) link_up: AtomicBool,
    /// One bit per queue stopped with `*_queue_stop`.
    pub(crate) rx_stopped: AtomicU64,
    pub(crate) tx_stopped: AtomicU64,
    /// The MAC address packed into the low 48 bits.
    pub(crate) mac: AtomicU64,
    pub(crate) slots: Mutex<Slots>,
}

impl PortShared {
    pub(crate) fn new(id: PortId, mtu: u16, mac: [u8; 6]) -> Self {
        Self {
            id,
            stats: Counters::default(),
            mtu: AtomicU16::new(mtu),
            promiscuous: AtomicBool::new(false),
            link_up: AtomicBool::new(false),
            rx_stopped: AtomicU64::new(0),
            tx_stopped: AtomicU64::new(0),
            mac: AtomicU64::new(pack_mac(mac)),
            slots: Mutex::new(Slots::default()),
        }
    }
}

pub(crate) fn queue_bit(q: QueueId) -> u64 {
    1u64 << q.0
}

fn is_stopped(mask: &AtomicU64, q: QueueId) -> bool {
    mask.load(Ordering::Relaxed) & queue_bit(q) != 0
}

pub(crate) fn pack_mac(mac: [u8; 6]) -> u64 {
    let mut b = [0u8; 8];
    b[2..].copy_from_slice(&mac);
    u64::from_be_bytes(b)
}

pub(crate) fn unpack_mac(v: u64) -> [u8; 6] {
    let b = v.to_be_bytes();
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&b[2..]);
    mac
}

/// Whether a non-promiscuous port with address `mac` takes `frame`.
fn accepts(mac: [u8; 6], frame: &[u8]) -> bool {
    match frame.get(..6) {
        // Group bit: broadcast and multicast.
        Some(dst) => dst[0] & 0x01 != 0 || dst == mac,
        None => true,
    }
}

/// Receive handle of one queue. Returns itself to the port when dropped.
pub struct RxQueue {
    queue: QueueId,
    cons: Option<RingCons>,
    shared: Arc<PortShared>,
}

impl RxQueue {
    pub(crate) fn new(queue: QueueId, cons: RingCons, shared: Arc<PortShared>) -> Self {
        Self {
            queue,
            cons: Some(cons),
            shared,
        }
    }

    /// Buffers waiting in the ring.
    pub fn pending(&self) -> usize {
        self.cons.as_ref().map_or(0, |c| c.occupied_len())
    }
}

impl RxBurst for RxQueue {
    fn rx_burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let Some(cons) = self.cons.as_mut() else {
            return 0;
        };
        if is_stopped(&self.shared.rx_stopped, self.queue) {
            return 0;
        }
        let limit = self.shared.mtu.load(Ordering::Relaxed) as usize + ETHER_HDR_LEN;
        let promiscuous = self.shared.promiscuous.load(Ordering::Relaxed);
        let mac = unpack_mac(self.shared.mac.load(Ordering::Relaxed));

        let (mut got, mut bytes, mut errors) = (0, 0, 0);
        while got < max {
            let Some(m) = cons.try_pop() else {
                break;
            };
            if m.len() > limit {
                errors += 1;
                continue;
            }
            if !promiscuous && !accepts(mac, m.data()) {
                continue;
            }
            bytes += m.len() as u64;
            out.push(m);
            got += 1;
        }
        let stats = &self.shared.stats;
        Counters::add(&stats.ipackets, got as u64);
        Counters::add(&stats.ibytes, bytes);
        Counters::add(&stats.ierrors, errors);
        got
    }

    fn port(&self) -> PortId {
        self.shared.id
    }

    fn queue(&self) -> QueueId {
        self.queue
    }
}

impl Drop for RxQueue {
    fn drop(&mut self) {
        if let Some(cons) = self.cons.take() {
            let mut slots = self.shared.slots.lock();
            if let Some(slot) = slots.rx.get_mut(self.queue.index()) {
                if slot.is_taken() {
                    *slot = Slot::Ready(cons);
                }
            }
        }
    }
}

/// Transmit handle of one queue. Returns itself to the port when dropped.
pub struct TxQueue {
    queue: QueueId,
    prod: Option<RingProd>,
    epoch: u64,
    shared: Arc<PortShared>,
    peer: Arc<PortShared>,
}

impl TxQueue {
    pub(crate) fn new(
        queue: QueueId,
        prod: RingProd,
        epoch: u64,
        shared: Arc<PortShared>,
        peer: Arc<PortShared>,
    ) -> Self {
        Self {
            queue,
            prod: Some(prod),
            epoch,
            shared,
            peer,
        }
    }

    /// Buffers that fit in the ring right now.
    pub fn free_slots(&self) -> usize {
        self.prod.as_ref().map_or(0, |p| p.vacant_len())
    }
}

impl TxBurst for TxQueue {
    fn tx_burst(&mut self, bufs: &mut Vec<Mbuf>) -> usize {
        let Some(prod) = self.prod.as_mut() else {
            return 0;
        };
        if is_stopped(&self.shared.tx_stopped, self.queue) {
            return 0;
        }
        let stats = &self.shared.stats;
        let wire_up = self.shared.link_up.load(Ordering::Relaxed)
            && self.peer.link_up.load(Ordering::Relaxed);
        if !wire_up {
            // Nobody on the wire: the frames leave and are lost.
            let n = bufs.len();
            bufs.clear();
            Counters::add(&stats.oerrors, n as u64);
            return n;
        }

        // Only our side pushes, so the vacant space cannot shrink.
        let n = bufs.len().min(prod.vacant_len());
        let bytes: u64 = bufs[..n].iter().map(|m| m.len() as u64).sum();
        let pushed = prod.push_iter(bufs.drain(..n));
        debug_assert_eq!(pushed, n);
        Counters::add(&stats.opackets, n as u64);
        Counters::add(&stats.obytes, bytes);
        n
    }

    fn port(&self) -> PortId {
        self.shared.id
    }

    fn queue(&self) -> QueueId {
        self.queue
    }
}

impl Drop for TxQueue {
    fn drop(&mut self) {
        let q = self.queue.index();
        if let Some(prod) = self.prod.take() {
            let mut slots = self.peer.slots.lock();
            if let Some(inbox) = slots.inbox.get_mut(q) {
                if inbox.epoch == self.epoch && inbox.prod.is_none() {
                    inbox.prod = Some(prod);
                }
            }
        }
        let mut slots = self.shared.slots.lock();
        if let Some(slot) = slots.tx.get_mut(q) {
            if slot.is_taken() {
                *slot = Slot::Ready(());
            }
        }
    }
}
