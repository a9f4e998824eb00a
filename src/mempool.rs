//! Fixed-size pools of packet buffers.
//!
//! All slots are carved at creation out of one cache-line aligned arena and
//! tracked by a lock-free free list, so a pool can be shared by every
//! worker. Workers that allocate and free at high rates keep a
//! [`PoolCache`] to touch the shared free list only in bulk.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayVec;
use crossbeam::queue::ArrayQueue;
use tracing::{debug, info};
use triomphe::Arc;

use crate::config::{CACHE_LINE_SIZE, cache_line_roundup};
use crate::errors::{Error, Resource, Result};
use crate::lcore::SocketId;
use crate::mbuf::Mbuf;

/// Headroom reserved in front of the data of a fresh buffer.
pub const DEFAULT_HEADROOM: u16 = 128;
/// Data room of a buffer, excluding headroom.
pub const DEFAULT_DATA_ROOM: u16 = 2048;
/// Largest per-lcore cache.
pub const CACHE_MAX_SIZE: usize = 512;

const CACHE_CAPACITY: usize = CACHE_MAX_SIZE * 3 / 2;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of buffers.
    pub nb_bufs: usize,
    /// Buffers kept by each [`PoolCache`]; zero disables caching.
    pub cache_size: usize,
    pub data_room: u16,
    pub headroom: u16,
    /// NUMA node the pool is meant for.
    pub socket_id: SocketId,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            nb_bufs: 8191,
            cache_size: 250,
            data_room: DEFAULT_DATA_ROOM,
            headroom: DEFAULT_HEADROOM,
            socket_id: SocketId::default(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nb_bufs == 0 || self.nb_bufs > u32::MAX as usize {
            return Err(Error::Config(format!("invalid buffer count {}", self.nb_bufs)));
        }
        if self.data_room == 0 {
            return Err(Error::Config("data room must not be empty".into()));
        }
        if self.headroom as usize + self.data_room as usize > u16::MAX as usize {
            return Err(Error::Config(format!(
                "headroom {} + data room {} exceeds {}",
                self.headroom,
                self.data_room,
                u16::MAX
            )));
        }
        if self.cache_size > CACHE_MAX_SIZE || self.cache_size > self.nb_bufs {
            return Err(Error::Config(format!("invalid cache size {}", self.cache_size)));
        }
        Ok(())
    }
}

pub(crate) struct PoolInner {
    id: u32,
    pub(crate) name: String,
    arena: NonNull<u8>,
    layout: Layout,
    slot_size: usize,
    pub(crate) headroom: u16,
    data_room: u16,
    cache_size: usize,
    socket_id: SocketId,
    refcnt: Box<[AtomicU32]>,
    free: ArrayQueue<u32>,
}

// SAFETY: the arena is only reached through slot indices, and a slot's bytes
// are written only by the unique handle owning it.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl PoolInner {
    pub(crate) fn buf_len(&self) -> usize {
        self.headroom as usize + self.data_room as usize
    }

    pub(crate) fn refcnt(&self, idx: u32) -> &AtomicU32 {
        &self.refcnt[idx as usize]
    }

    /// Start of slot `idx`.
    pub(crate) fn slot_ptr(&self, idx: u32) -> *mut u8 {
        debug_assert!((idx as usize) < self.refcnt.len());
        // SAFETY: idx is a slot index, so the offset stays inside the arena.
        unsafe { self.arena.as_ptr().add(idx as usize * self.slot_size) }
    }

    /// Puts a slot whose last handle is gone back on the free list.
    pub(crate) fn release(&self, idx: u32) {
        // The free list has room for every slot, so this cannot fail.
        let _ = self.free.push(idx);
    }

    fn take(&self) -> Option<u32> {
        self.free.pop()
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        debug!(pool = %self.name, "freeing buffer pool");
        // SAFETY: allocated in `Pool::new` with this layout.
        unsafe { alloc::dealloc(self.arena.as_ptr(), self.layout) };
    }
}

/// A shared handle to a buffer pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(name: &str, config: &PoolConfig) -> Result<Self> {
        static NEXT_ID: AtomicU32 = AtomicU32::new(0);

        config.validate()?;
        let buf_len = config.headroom as usize + config.data_room as usize;
        let slot_size = cache_line_roundup(buf_len);
        let size = slot_size
            .checked_mul(config.nb_bufs)
            .ok_or_else(|| Error::Config("pool size overflows".into()))?;
        let layout = Layout::from_size_align(size, CACHE_LINE_SIZE)
            .map_err(|e| Error::Config(e.to_string()))?;
        // SAFETY: size is non-zero, validated above.
        let arena = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(Error::ResourceExhausted(Resource::Pool))?;

        let free = ArrayQueue::new(config.nb_bufs);
        for i in 0..config.nb_bufs as u32 {
            let _ = free.push(i);
        }
        let refcnt = (0..config.nb_bufs).map(|_| AtomicU32::new(0)).collect();

        let inner = PoolInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            arena,
            layout,
            slot_size,
            headroom: config.headroom,
            data_room: config.data_room,
            cache_size: config.cache_size,
            socket_id: config.socket_id,
            refcnt,
            free,
        };
        info!(
            pool = name,
            nb_bufs = config.nb_bufs,
            slot_size,
            socket = config.socket_id.0,
            "created buffer pool"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    /// Takes one buffer. Fails at once when the pool is empty.
    pub fn alloc(&self) -> Result<Mbuf> {
        match self.inner.take() {
            Some(idx) => Ok(Mbuf::from_slot(self.inner.clone(), idx)),
            None => Err(Error::ResourceExhausted(Resource::Pool)),
        }
    }

    /// Takes up to `n` buffers; fewer when the pool runs out.
    pub fn alloc_bulk(&self, n: usize) -> Vec<Mbuf> {
        let mut out = Vec::with_capacity(n);
        self.alloc_bulk_into(&mut out, n);
        out
    }

    /// Appends up to `n` buffers to `out`, returning how many were added.
    pub fn alloc_bulk_into(&self, out: &mut Vec<Mbuf>, n: usize) -> usize {
        let mut got = 0;
        while got < n {
            let Some(idx) = self.inner.take() else {
                break;
            };
            out.push(Mbuf::from_slot(self.inner.clone(), idx));
            got += 1;
        }
        got
    }

    /// Takes exactly `n` buffers or none at all.
    pub fn alloc_bulk_exact(&self, n: usize) -> Result<Vec<Mbuf>> {
        let bufs = self.alloc_bulk(n);
        if bufs.len() < n {
            // Dropping the partial set returns it.
            return Err(Error::ResourceExhausted(Resource::Pool));
        }
        Ok(bufs)
    }

    /// Returns buffers to their pools.
    pub fn free_bulk(bufs: impl IntoIterator<Item = Mbuf>) {
        bufs.into_iter().for_each(drop);
    }

    /// A per-worker cache of `cache_size` buffers.
    pub fn cache(&self) -> PoolCache {
        PoolCache::new(self.clone(), self.inner.cache_size)
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.refcnt.len()
    }

    /// Buffers on the shared free list. Buffers parked in a [`PoolCache`]
    /// count as in use.
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.free.is_empty()
    }

    pub fn headroom(&self) -> usize {
        self.inner.headroom as usize
    }

    pub fn data_room(&self) -> usize {
        self.inner.data_room as usize
    }

    pub fn socket_id(&self) -> SocketId {
        self.inner.socket_id
    }

    pub fn cache_size(&self) -> usize {
        self.inner.cache_size
    }

    pub(crate) fn same_pool(&self, buf: &Mbuf) -> bool {
        Arc::ptr_eq(&self.inner, buf.pool_inner())
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name())
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// Buffers kept aside for one worker.
///
/// `alloc` and `free` work on a local stack and reach the shared free list
/// only to refill an empty cache or to drain one that grew past one and a
/// half times its size. Dropping the cache returns everything it holds.
pub struct PoolCache {
    pool: Pool,
    size: usize,
    objs: ArrayVec<u32, CACHE_CAPACITY>,
}

impl PoolCache {
    fn new(pool: Pool, size: usize) -> Self {
        Self {
            pool,
            size: size.min(CACHE_MAX_SIZE),
            objs: ArrayVec::new(),
        }
    }

    fn flush_threshold(&self) -> usize {
        self.size + self.size / 2
    }

    pub fn alloc(&mut self) -> Result<Mbuf> {
        if self.objs.is_empty() {
            while self.objs.len() < self.size {
                let Some(idx) = self.pool.inner.take() else {
                    break;
                };
                self.objs.push(idx);
            }
        }
        match self.objs.pop() {
            Some(idx) => Ok(Mbuf::from_slot(self.pool.inner.clone(), idx)),
            None => self.pool.alloc(),
        }
    }

    pub fn alloc_bulk_into(&mut self, out: &mut Vec<Mbuf>, n: usize) -> usize {
        let mut got = 0;
        while got < n {
            let Ok(m) = self.alloc() else {
                break;
            };
            out.push(m);
            got += 1;
        }
        got
    }

    /// Returns `buf` to the cache. Buffers of other pools go straight home.
    pub fn free(&mut self, buf: Mbuf) {
        if self.size == 0 || !self.pool.same_pool(&buf) {
            drop(buf);
            return;
        }
        let Some(idx) = buf.into_slot() else {
            return;
        };
        self.objs.push(idx);
        if self.objs.len() >= self.flush_threshold() {
            while self.objs.len() > self.size {
                if let Some(idx) = self.objs.pop() {
                    self.pool.inner.release(idx);
                }
            }
        }
    }

    /// Returns every cached buffer to the shared free list.
    pub fn flush(&mut self) {
        for idx in self.objs.drain(..) {
            self.pool.inner.release(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.objs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl Drop for PoolCache {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pool(n: usize, cache_size: usize) -> Pool {
        Pool::new(
            "pool-test",
            &PoolConfig {
                nb_bufs: n,
                cache_size,
                ..PoolConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn exhaustion_and_recovery() {
        let pool = pool(4, 0);
        let mut held: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
        assert!(matches!(
            pool.alloc(),
            Err(Error::ResourceExhausted(Resource::Pool))
        ));
        held.pop();
        assert!(pool.alloc().is_ok());
    }

    #[test]
    fn bulk_alloc_is_short_not_blocking() {
        let pool = pool(8, 0);
        let _first = pool.alloc_bulk(5);
        let rest = pool.alloc_bulk(10);
        assert_eq!(rest.len(), 3);
        assert_eq!(pool.available(), 0);
        assert!(pool.alloc_bulk(4).is_empty());
    }

    #[test]
    fn exact_bulk_is_all_or_nothing() {
        let pool = pool(4, 0);
        let _one = pool.alloc().unwrap();
        assert!(pool.alloc_bulk_exact(4).is_err());
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.alloc_bulk_exact(3).unwrap().len(), 3);
    }

    #[test]
    fn free_bulk_returns_everything() {
        let pool = pool(16, 0);
        let bufs = pool.alloc_bulk(16);
        assert_eq!(pool.in_use(), 16);
        Pool::free_bulk(bufs);
        assert_eq!(pool.available(), 16);
    }

    #[test]
    fn slots_are_cache_line_aligned() {
        let pool = Pool::new(
            "aligned",
            &PoolConfig {
                nb_bufs: 4,
                cache_size: 0,
                headroom: 0,
                data_room: 100,
                ..PoolConfig::default()
            },
        )
        .unwrap();
        for m in pool.alloc_bulk(4) {
            assert_eq!(pool.inner.slot_ptr(m.index()) as usize % CACHE_LINE_SIZE, 0);
        }
    }

    #[test]
    fn rejects_bad_config() {
        let bad = [
            PoolConfig {
                nb_bufs: 0,
                ..PoolConfig::default()
            },
            PoolConfig {
                data_room: 0,
                ..PoolConfig::default()
            },
            PoolConfig {
                headroom: u16::MAX,
                ..PoolConfig::default()
            },
            PoolConfig {
                nb_bufs: 16,
                cache_size: 32,
                ..PoolConfig::default()
            },
        ];
        for config in &bad {
            assert!(matches!(Pool::new("bad", config), Err(Error::Config(_))));
        }
    }

    #[test]
    fn cache_refills_and_flushes_in_bulk() {
        let pool = pool(64, 8);
        let mut cache = pool.cache();
        let m = cache.alloc().unwrap();
        assert_eq!(cache.len(), 7);
        assert_eq!(pool.available(), 56);

        cache.free(m);
        assert_eq!(cache.len(), 8);

        let mut bufs = Vec::new();
        assert_eq!(cache.alloc_bulk_into(&mut bufs, 20), 20);
        for m in bufs {
            cache.free(m);
        }
        assert!(cache.len() <= 12);
        cache.flush();
        assert!(cache.is_empty());
        assert_eq!(pool.available(), 64);
    }

    #[test]
    fn dropping_cache_returns_buffers() {
        let pool = pool(32, 16);
        {
            let mut cache = pool.cache();
            let _m = cache.alloc().unwrap();
        }
        assert_eq!(pool.available(), 32);
    }

    #[test]
    fn cache_ignores_foreign_and_shared_buffers() {
        let home = pool(8, 4);
        let other = pool(8, 4);
        let mut cache = home.cache();
        cache.free(other.alloc().unwrap());
        assert!(cache.is_empty());
        assert_eq!(other.available(), 8);

        let m = home.alloc().unwrap();
        let c = m.clone_ref();
        cache.free(m);
        assert!(cache.is_empty());
        cache.free(c);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_falls_back_when_disabled() {
        let pool = pool(2, 0);
        let mut cache = pool.cache();
        let a = cache.alloc().unwrap();
        let _b = cache.alloc().unwrap();
        assert!(cache.alloc().is_err());
        cache.free(a);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn shared_across_threads() {
        let pool = pool(256, 32);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let mut cache = pool.cache();
                    for _ in 0..1_000 {
                        let mut bufs = Vec::new();
                        cache.alloc_bulk_into(&mut bufs, 16);
                        for m in bufs {
                            cache.free(m);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.available(), 256);
    }
}
