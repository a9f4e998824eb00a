//! User-space packet I/O.
//!
//! Packet buffers come from fixed [`mempool::Pool`]s and move through
//! Ethernet port queues in bursts ([`api::RxBurst`], [`api::TxBurst`]),
//! polled by workers pinned to logical cores ([`lcore`], [`launch`]).
//! [`spinlock`] has the busy-waiting locks those workers share, with
//! optional hardware lock elision. The same services are exported to C
//! by [`ffi`].

pub mod api;
pub mod config;
pub mod cycles;
pub mod errors;
pub mod ethdev;
pub mod ffi;
pub mod launch;
pub mod lcore;
pub mod mbuf;
pub mod mempool;
pub mod spinlock;

pub use errors::{Error, Result};
pub use mbuf::Mbuf;
pub use mempool::{Pool, PoolConfig};
