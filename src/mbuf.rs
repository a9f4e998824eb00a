//! Packet buffers.
//!
//! An [`Mbuf`] owns a slot of a [`Pool`] and a data window inside it:
//!
//! ```text
//!  slot start      data_off            data_off + data_len        buf_len
//!  |--- headroom ---|====== packet data ======|------ tailroom ------|
//! ```
//!
//! Window operations only move the window, they never copy. Clones made
//! with [`Mbuf::clone_ref`] share the slot's bytes and keep their own
//! window; the slot goes back to the pool when the last handle is dropped.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;
use std::slice;
use std::sync::atomic::{self, Ordering};

use triomphe::Arc;

use crate::errors::{Error, Result};
use crate::mempool::{Pool, PoolInner};

pub struct Mbuf {
    pool: Arc<PoolInner>,
    idx: u32,
    data_off: u16,
    data_len: u16,
}

impl Mbuf {
    /// Wraps a slot just taken from the free list.
    pub(crate) fn from_slot(pool: Arc<PoolInner>, idx: u32) -> Self {
        pool.refcnt(idx).store(1, Ordering::Relaxed);
        let data_off = pool.headroom;
        Self {
            pool,
            idx,
            data_off,
            data_len: 0,
        }
    }

    /// Gives up this handle's reference to the slot without returning the
    /// slot to the pool. Returns the slot index if this was the last handle.
    pub(crate) fn into_slot(self) -> Option<u32> {
        let me = ManuallyDrop::new(self);
        // SAFETY: `me` is never used or dropped again.
        let pool = unsafe { ptr::read(&me.pool) };
        if pool.refcnt(me.idx).fetch_sub(1, Ordering::Release) == 1 {
            atomic::fence(Ordering::Acquire);
            Some(me.idx)
        } else {
            None
        }
    }

    pub(crate) fn pool_inner(&self) -> &Arc<PoolInner> {
        &self.pool
    }

    /// The pool this buffer was allocated from.
    pub fn pool(&self) -> Pool {
        Pool::from_inner(self.pool.clone())
    }

    /// Slot index inside the pool.
    pub fn index(&self) -> u32 {
        self.idx
    }

    /// Size of the backing region, headroom included.
    pub fn buf_len(&self) -> usize {
        self.pool.buf_len()
    }

    pub fn len(&self) -> usize {
        self.data_len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    pub fn headroom(&self) -> usize {
        self.data_off as usize
    }

    pub fn tailroom(&self) -> usize {
        self.buf_len() - self.headroom() - self.len()
    }

    /// Number of handles sharing the slot.
    pub fn refcnt(&self) -> u32 {
        self.pool.refcnt(self.idx).load(Ordering::Acquire)
    }

    pub fn is_shared(&self) -> bool {
        self.refcnt() > 1
    }

    /// Grows the window `n` bytes to the front, into the headroom.
    pub fn prepend(&mut self, n: usize) -> Result<()> {
        if n > self.headroom() {
            return Err(Error::window(n, self.headroom()));
        }
        self.data_off -= n as u16;
        self.data_len += n as u16;
        Ok(())
    }

    /// Grows the window `n` bytes to the back, into the tailroom.
    pub fn append(&mut self, n: usize) -> Result<()> {
        if n > self.tailroom() {
            return Err(Error::window(n, self.tailroom()));
        }
        self.data_len += n as u16;
        Ok(())
    }

    /// Drops `n` bytes from the front of the window.
    pub fn adj(&mut self, n: usize) -> Result<()> {
        if n > self.len() {
            return Err(Error::window(n, self.len()));
        }
        self.data_off += n as u16;
        self.data_len -= n as u16;
        Ok(())
    }

    /// Drops `n` bytes from the back of the window.
    pub fn trim(&mut self, n: usize) -> Result<()> {
        if n > self.len() {
            return Err(Error::window(n, self.len()));
        }
        self.data_len -= n as u16;
        Ok(())
    }

    /// Empties the window and restores the default headroom.
    pub fn reset(&mut self) {
        self.data_off = self.pool.headroom;
        self.data_len = 0;
    }

    /// Restores the default headroom of an empty buffer. Does nothing when
    /// the window holds data.
    pub fn reset_headroom(&mut self) {
        if self.is_empty() {
            self.data_off = self.pool.headroom;
        }
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: the window lies inside the slot, and while it is reachable
        // through a shared handle nobody writes to the slot.
        unsafe {
            slice::from_raw_parts(
                self.pool.slot_ptr(self.idx).add(self.headroom()),
                self.len(),
            )
        }
    }

    /// Mutable view of the window. Fails with [`Error::SharedBuffer`] while
    /// other handles share the slot.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        if self.is_shared() {
            return Err(Error::SharedBuffer);
        }
        // SAFETY: this is the only handle to the slot and we hold it mutably.
        Ok(unsafe {
            slice::from_raw_parts_mut(
                self.pool.slot_ptr(self.idx).add(self.headroom()),
                self.len(),
            )
        })
    }

    /// Mutable view of the window, first copying the data into a private
    /// buffer from the same pool if the slot is shared.
    pub fn make_mut(&mut self) -> Result<&mut [u8]> {
        if self.is_shared() {
            *self = self.duplicate()?;
        }
        self.data_mut()
    }

    /// `len` bytes of the window starting at `off`, if in bounds.
    pub fn read(&self, off: usize, len: usize) -> Option<&[u8]> {
        let end = off.checked_add(len)?;
        self.data().get(off..end)
    }

    /// Appends `bytes` at the end of the window.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        if self.is_shared() {
            return Err(Error::SharedBuffer);
        }
        let start = self.len();
        self.append(bytes.len())?;
        self.data_mut()?[start..].copy_from_slice(bytes);
        Ok(())
    }

    /// Writes `bytes` in front of the window.
    pub fn prepend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        if self.is_shared() {
            return Err(Error::SharedBuffer);
        }
        self.prepend(bytes.len())?;
        self.data_mut()?[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// A new handle to the same bytes, with its own copy of the window.
    pub fn clone_ref(&self) -> Mbuf {
        self.pool.refcnt(self.idx).fetch_add(1, Ordering::Relaxed);
        Mbuf {
            pool: self.pool.clone(),
            idx: self.idx,
            data_off: self.data_off,
            data_len: self.data_len,
        }
    }

    /// A deep copy in a buffer from the same pool, with the same window.
    pub fn duplicate(&self) -> Result<Mbuf> {
        let mut copy = Pool::from_inner(self.pool.clone()).alloc()?;
        copy.data_off = self.data_off;
        copy.data_len = self.data_len;
        copy.data_mut()?.copy_from_slice(self.data());
        Ok(copy)
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        if self.pool.refcnt(self.idx).fetch_sub(1, Ordering::Release) == 1 {
            atomic::fence(Ordering::Acquire);
            self.pool.release(self.idx);
        }
    }
}

impl AsRef<[u8]> for Mbuf {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("pool", &self.pool.name)
            .field("idx", &self.idx)
            .field("data_off", &self.data_off)
            .field("data_len", &self.data_len)
            .field("refcnt", &self.refcnt())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::PoolConfig;
    use proptest::prelude::*;

    fn pool(n: usize) -> Pool {
        Pool::new(
            "mbuf-test",
            &PoolConfig {
                nb_bufs: n,
                cache_size: 0,
                ..PoolConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn fresh_buffer_has_default_window() {
        let pool = pool(2);
        let m = pool.alloc().unwrap();
        assert_eq!(m.headroom(), pool.headroom());
        assert_eq!(m.len(), 0);
        assert_eq!(m.tailroom(), pool.data_room());
        assert_eq!(m.refcnt(), 1);
    }

    #[test]
    fn realloc_does_not_leak_previous_window() {
        let pool = pool(1);
        let mut m = pool.alloc().unwrap();
        m.extend_from_slice(b"previous tenant").unwrap();
        m.prepend(8).unwrap();
        drop(m);
        let m = pool.alloc().unwrap();
        assert_eq!(m.headroom(), pool.headroom());
        assert!(m.is_empty());
    }

    #[test]
    fn window_errors_do_not_move_window() {
        let pool = pool(1);
        let mut m = pool.alloc().unwrap();
        m.append(10).unwrap();
        let before = (m.headroom(), m.len());
        assert!(matches!(m.trim(11), Err(Error::InvalidWindow { requested: 11, available: 10 })));
        assert!(m.adj(11).is_err());
        assert!(m.prepend(m.headroom() + 1).is_err());
        assert!(m.append(m.tailroom() + 1).is_err());
        assert_eq!((m.headroom(), m.len()), before);
    }

    #[test]
    fn prepend_and_adj_cancel() {
        let pool = pool(1);
        let mut m = pool.alloc().unwrap();
        m.extend_from_slice(b"payload").unwrap();
        m.prepend_from_slice(b"hdr:").unwrap();
        assert_eq!(m.data(), b"hdr:payload");
        m.adj(4).unwrap();
        assert_eq!(m.data(), b"payload");
        assert_eq!(m.headroom(), pool.headroom());
    }

    #[test]
    fn clone_shares_bytes_and_counts_references() {
        let pool = pool(2);
        let mut m = pool.alloc().unwrap();
        m.extend_from_slice(b"shared").unwrap();
        let mut c = m.clone_ref();
        assert_eq!(m.refcnt(), 2);
        assert_eq!(c.data(), b"shared");
        assert_eq!(pool.available(), 1);

        c.adj(2).unwrap();
        assert_eq!(c.data(), b"ared");
        assert_eq!(m.data(), b"shared");
        assert!(matches!(m.data_mut(), Err(Error::SharedBuffer)));

        drop(c);
        assert_eq!(m.refcnt(), 1);
        assert!(m.data_mut().is_ok());
        drop(m);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn make_mut_copies_on_write() {
        let pool = pool(2);
        let mut m = pool.alloc().unwrap();
        m.extend_from_slice(b"abc").unwrap();
        let c = m.clone_ref();
        m.make_mut().unwrap()[0] = b'x';
        assert_eq!(m.data(), b"xbc");
        assert_eq!(c.data(), b"abc");
        assert_eq!(m.refcnt(), 1);
        assert_eq!(c.refcnt(), 1);
        assert_ne!(m.index(), c.index());
    }

    #[test]
    fn make_mut_fails_when_pool_is_empty() {
        let pool = pool(1);
        let mut m = pool.alloc().unwrap();
        let _c = m.clone_ref();
        assert!(matches!(m.make_mut(), Err(Error::ResourceExhausted(_))));
    }

    #[test]
    fn read_is_bounds_checked() {
        let pool = pool(1);
        let mut m = pool.alloc().unwrap();
        m.extend_from_slice(b"0123456789").unwrap();
        assert_eq!(m.read(2, 3), Some(&b"234"[..]));
        assert_eq!(m.read(8, 3), None);
        assert_eq!(m.read(usize::MAX, 2), None);
    }

    #[test]
    fn clone_outlives_pool_handle() {
        let m = {
            let pool = pool(1);
            let mut m = pool.alloc().unwrap();
            m.extend_from_slice(b"alive").unwrap();
            m
        };
        assert_eq!(m.data(), b"alive");
        assert_eq!(m.pool().available(), 0);
    }

    proptest! {
        #[test]
        fn append_then_trim_restores_window(start in 0usize..512, n in 0usize..1500) {
            let pool = pool(1);
            let mut m = pool.alloc().unwrap();
            m.append(start).unwrap();
            let before = (m.headroom(), m.len(), m.tailroom());
            m.append(n).unwrap();
            m.trim(n).unwrap();
            prop_assert_eq!((m.headroom(), m.len(), m.tailroom()), before);
        }

        #[test]
        fn prepend_then_adj_restores_window(n in 0usize..=128) {
            let pool = pool(1);
            let mut m = pool.alloc().unwrap();
            m.append(64).unwrap();
            let before = (m.headroom(), m.len());
            m.prepend(n).unwrap();
            m.adj(n).unwrap();
            prop_assert_eq!((m.headroom(), m.len()), before);
        }
    }
}
