//! Burst interfaces implemented by queue drivers.
//!
//! Both directions are non-blocking polls: a call moves whatever fits right
//! now and returns. Short bursts, including empty ones, are the normal case
//! for a polling worker and never an error.

use crate::errors::{Error, Resource, Result};
use crate::ethdev::{PortId, QueueId};
use crate::mbuf::Mbuf;

/// Default number of buffers moved per burst.
pub const BURST_SIZE: usize = 32;

/// The receive side of a queue.
pub trait RxBurst: Send {
    /// Appends up to `max` received buffers to `out`, in arrival order, and
    /// returns how many were appended.
    fn rx_burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize;

    fn port(&self) -> PortId;

    fn queue(&self) -> QueueId;
}

/// The transmit side of a queue.
pub trait TxBurst: Send {
    /// Enqueues a prefix of `bufs` in order and removes it from the vector.
    /// Returns the length of that prefix.
    ///
    /// Buffers left in `bufs` were not sent and still belong to the caller,
    /// who may retry them or drop them.
    ///
    /// The count covers every buffer the queue took, delivered or not. A
    /// queue whose link is down takes the whole burst and drops it, counting
    /// the frames in `oerrors`; check the port's link status or stats to
    /// tell that apart from delivery.
    fn tx_burst(&mut self, bufs: &mut Vec<Mbuf>) -> usize;

    fn port(&self) -> PortId;

    fn queue(&self) -> QueueId;

    /// Sends all of `bufs`, retrying short bursts up to `attempts` times.
    /// Fails with [`Error::ResourceExhausted`] if some buffers are left in
    /// `bufs` after the last attempt.
    fn tx_burst_retry(&mut self, bufs: &mut Vec<Mbuf>, attempts: usize) -> Result<()> {
        for _ in 0..attempts {
            if bufs.is_empty() {
                return Ok(());
            }
            self.tx_burst(bufs);
        }
        if bufs.is_empty() {
            Ok(())
        } else {
            Err(Error::ResourceExhausted(Resource::Queue))
        }
    }
}
