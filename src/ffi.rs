//! C interface.
//!
//! Functions are prefixed `burstio_` and work on opaque handles that this
//! library creates and destroys. A failing call returns a negative errno
//! value or a null pointer and records the errno, readable from the same
//! thread with [`burstio_errno`]. Null handles are rejected with `-EINVAL`.
//!
//! Ethernet ports live in a process-wide registry set up by
//! [`burstio_init`], or on first use.

use std::cell::Cell;
use std::ffi::{CStr, c_char, c_int, c_uint};
use std::mem::MaybeUninit;
use std::ptr;
use std::slice;
use std::sync::OnceLock;

use eui48::MacAddress;
use parking_lot::Mutex;
use tracing::info;

use crate::api::{RxBurst, TxBurst};
use crate::config::{CACHE_LINE_SIZE, Capabilities};
use crate::cycles;
use crate::errors::{Error, Result};
use crate::ethdev::{EthConf, EthDev, Ports, QueueId, RxQueue, TxQueue};
use crate::lcore::{self, LCORE_ID_ANY, LcoreId, SocketId};
use crate::mbuf::Mbuf;
use crate::mempool::{Pool, PoolConfig};
use crate::spinlock::{RecursiveSpinLock, SpinLock};

static VERSION: &str = concat!("burstio ", env!("CARGO_PKG_VERSION"), "\0");
static RING_DRIVER: &CStr = c"net_ring";

struct Runtime {
    caps: Capabilities,
    ports: Mutex<Ports>,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        let caps = Capabilities::detect();
        info!(rtm = caps.rtm, "runtime initialized");
        Runtime {
            caps,
            ports: Mutex::new(Ports::new()),
        }
    })
}

thread_local! {
    static ERRNO: Cell<c_int> = const { Cell::new(0) };
}

fn set_errno(code: c_int) {
    ERRNO.with(|e| e.set(code));
}

fn fail(e: Error) -> c_int {
    let code = e.errno();
    set_errno(code);
    code
}

fn status(r: Result<()>) -> c_int {
    match r {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

fn boxed<T>(r: Result<T>) -> *mut T {
    match r {
        Ok(v) => Box::into_raw(Box::new(v)),
        Err(e) => {
            fail(e);
            ptr::null_mut()
        }
    }
}

fn einval() -> c_int {
    set_errno(-libc::EINVAL);
    -libc::EINVAL
}

/// Borrows the handle behind `$p`, or records `-EINVAL` and returns `$ret`.
macro_rules! handle {
    ($p:expr, $ret:expr) => {
        // SAFETY: non-null handles were created by this library.
        match unsafe { $p.as_ref() } {
            Some(h) => h,
            None => {
                einval();
                return $ret;
            }
        }
    };
}

macro_rules! handle_mut {
    ($p:expr, $ret:expr) => {
        // SAFETY: as in `handle!`, and the caller does not share the handle.
        match unsafe { $p.as_mut() } {
            Some(h) => h,
            None => {
                einval();
                return $ret;
            }
        }
    };
}

/// # Safety
/// `s` must be null or a NUL-terminated string.
unsafe fn str_arg<'a>(s: *const c_char) -> Option<std::borrow::Cow<'a, str>> {
    if s.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(s) }.to_string_lossy())
}

fn with_port<T>(port: u16, f: impl FnOnce(&mut EthDev) -> Result<T>) -> Result<T> {
    let mut ports = runtime().ports.lock();
    let id = ports.port_id(port)?;
    f(ports.get_mut(id)?)
}

fn port_status(port: u16, f: impl FnOnce(&mut EthDev) -> Result<()>) -> c_int {
    status(with_port(port, f))
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_init() -> c_int {
    runtime();
    0
}

/// Last error recorded on the calling thread, zero if none.
#[unsafe(no_mangle)]
pub extern "C" fn burstio_errno() -> c_int {
    ERRNO.with(Cell::get)
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_version() -> *const c_char {
    VERSION.as_ptr().cast()
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_cache_line_size() -> usize {
    CACHE_LINE_SIZE
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_tm_supported() -> c_int {
    runtime().caps.rtm as c_int
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_lcore_id() -> c_uint {
    lcore::id().map_or(LCORE_ID_ANY, LcoreId::get)
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_lcore_count() -> c_uint {
    lcore::count() as c_uint
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_lcore_to_socket_id(lcore_id: c_uint) -> c_int {
    match LcoreId::new(lcore_id) {
        Some(l) => lcore::socket_id(l).0 as c_int,
        None => einval(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_rdtsc() -> u64 {
    cycles::rdtsc()
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_rdtsc_precise() -> u64 {
    cycles::rdtsc_precise()
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_get_tsc_hz() -> u64 {
    cycles::tsc_hz()
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_get_timer_cycles() -> u64 {
    cycles::timer_cycles()
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_get_timer_hz() -> u64 {
    cycles::timer_hz()
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_delay_us(us: c_uint) {
    cycles::delay_us(us as u64);
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_delay_ms(ms: c_uint) {
    cycles::delay_ms(ms as u64);
}

// Spinlocks.

/// A new unlocked spinlock, eliding with RTM when the CPU has it.
#[unsafe(no_mangle)]
pub extern "C" fn burstio_spinlock_create() -> *mut SpinLock {
    boxed(Ok(SpinLock::with_capabilities(&runtime().caps)))
}

/// # Safety
/// `sl` must be null or come from [`burstio_spinlock_create`], unlocked and
/// no longer used.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_free(sl: *mut SpinLock) {
    if !sl.is_null() {
        drop(unsafe { Box::from_raw(sl) });
    }
}

/// # Safety
/// `sl` must be null or a live spinlock handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_lock(sl: *const SpinLock) {
    handle!(sl, ()).lock();
}

/// # Safety
/// `sl` must be null or a live spinlock handle held by the caller.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_unlock(sl: *const SpinLock) {
    let sl = handle!(sl, ());
    unsafe { sl.unlock() };
}

/// Returns 1 if the lock was taken, 0 otherwise.
///
/// # Safety
/// `sl` must be null or a live spinlock handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_trylock(sl: *const SpinLock) -> c_int {
    handle!(sl, -libc::EINVAL).try_lock() as c_int
}

/// # Safety
/// `sl` must be null or a live spinlock handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_is_locked(sl: *const SpinLock) -> c_int {
    handle!(sl, -libc::EINVAL).is_locked() as c_int
}

/// # Safety
/// `sl` must be null or a live spinlock handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_lock_tm(sl: *const SpinLock) {
    handle!(sl, ()).lock_tm();
}

/// # Safety
/// `sl` must be null or a live spinlock handle taken with the `_tm` calls
/// on this thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_unlock_tm(sl: *const SpinLock) {
    let sl = handle!(sl, ());
    unsafe { sl.unlock_tm() };
}

/// # Safety
/// `sl` must be null or a live spinlock handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_trylock_tm(sl: *const SpinLock) -> c_int {
    handle!(sl, -libc::EINVAL).try_lock_tm() as c_int
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_spinlock_recursive_create() -> *mut RecursiveSpinLock {
    boxed(Ok(RecursiveSpinLock::with_capabilities(&runtime().caps)))
}

/// # Safety
/// `sl` must be null or come from [`burstio_spinlock_recursive_create`],
/// unlocked and no longer used.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_recursive_free(sl: *mut RecursiveSpinLock) {
    if !sl.is_null() {
        drop(unsafe { Box::from_raw(sl) });
    }
}

/// # Safety
/// `sl` must be null or a live recursive spinlock handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_recursive_lock(sl: *const RecursiveSpinLock) {
    handle!(sl, ()).lock();
}

/// # Safety
/// `sl` must be null or a live recursive spinlock handle owned by the
/// calling thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_recursive_unlock(sl: *const RecursiveSpinLock) {
    let sl = handle!(sl, ());
    unsafe { sl.unlock() };
}

/// # Safety
/// `sl` must be null or a live recursive spinlock handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_recursive_trylock(sl: *const RecursiveSpinLock) -> c_int {
    handle!(sl, -libc::EINVAL).try_lock() as c_int
}

/// # Safety
/// `sl` must be null or a live recursive spinlock handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_recursive_lock_tm(sl: *const RecursiveSpinLock) {
    handle!(sl, ()).lock_tm();
}

/// # Safety
/// `sl` must be null or a live recursive spinlock handle taken with the
/// `_tm` calls on this thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_recursive_unlock_tm(sl: *const RecursiveSpinLock) {
    let sl = handle!(sl, ());
    unsafe { sl.unlock_tm() };
}

/// # Safety
/// `sl` must be null or a live recursive spinlock handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_spinlock_recursive_trylock_tm(
    sl: *const RecursiveSpinLock,
) -> c_int {
    handle!(sl, -libc::EINVAL).try_lock_tm() as c_int
}

// Pools and buffers.

/// Creates a pool of `n` buffers with `data_room` bytes each after the
/// default headroom. A negative `socket_id` means the caller's socket.
///
/// # Safety
/// `name` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_pool_create(
    name: *const c_char,
    n: c_uint,
    cache_size: c_uint,
    data_room: u16,
    socket_id: c_int,
) -> *mut Pool {
    let Some(name) = (unsafe { str_arg(name) }) else {
        einval();
        return ptr::null_mut();
    };
    let config = PoolConfig {
        nb_bufs: n as usize,
        cache_size: cache_size as usize,
        data_room,
        socket_id: if socket_id < 0 {
            lcore::current_socket_id()
        } else {
            SocketId(socket_id as u32)
        },
        ..PoolConfig::default()
    };
    boxed(Pool::new(&name, &config))
}

/// Drops the pool handle. Buffers still out keep the pool memory alive.
///
/// # Safety
/// `pool` must be null or come from [`burstio_pktmbuf_pool_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_mempool_free(pool: *mut Pool) {
    if !pool.is_null() {
        drop(unsafe { Box::from_raw(pool) });
    }
}

/// # Safety
/// `pool` must be null or a live pool handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_mempool_avail_count(pool: *const Pool) -> c_uint {
    handle!(pool, 0).available() as c_uint
}

/// # Safety
/// `pool` must be null or a live pool handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_mempool_in_use_count(pool: *const Pool) -> c_uint {
    handle!(pool, 0).in_use() as c_uint
}

/// # Safety
/// `pool` must be null or a live pool handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_alloc(pool: *const Pool) -> *mut Mbuf {
    boxed(handle!(pool, ptr::null_mut()).alloc())
}

/// Fills `mbufs[..count]`, or allocates nothing and returns `-ENOBUFS`.
///
/// # Safety
/// `pool` must be null or a live pool handle, `mbufs` must have room for
/// `count` pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_alloc_bulk(
    pool: *const Pool,
    mbufs: *mut *mut Mbuf,
    count: c_uint,
) -> c_int {
    let pool = handle!(pool, -libc::EINVAL);
    if mbufs.is_null() {
        return einval();
    }
    match pool.alloc_bulk_exact(count as usize) {
        Ok(bufs) => {
            for (i, m) in bufs.into_iter().enumerate() {
                unsafe { *mbufs.add(i) = Box::into_raw(Box::new(m)) };
            }
            0
        }
        Err(e) => fail(e),
    }
}

/// Fills a prefix of `mbufs[..count]` with as many buffers as the pool can
/// give and returns its length. A short count is not an error.
///
/// # Safety
/// `pool` must be null or a live pool handle, `mbufs` must have room for
/// `count` pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_alloc_bulk_partial(
    pool: *const Pool,
    mbufs: *mut *mut Mbuf,
    count: c_uint,
) -> c_int {
    let pool = handle!(pool, -libc::EINVAL);
    if mbufs.is_null() {
        return einval();
    }
    let mut bufs = Vec::with_capacity(count as usize);
    let got = pool.alloc_bulk_into(&mut bufs, count as usize);
    for (i, m) in bufs.into_iter().enumerate() {
        unsafe { *mbufs.add(i) = Box::into_raw(Box::new(m)) };
    }
    got as c_int
}

/// Releases the handle; the buffer returns to its pool with its last
/// handle. Null is ignored.
///
/// # Safety
/// `m` must be null or a live buffer handle, not used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_free(m: *mut Mbuf) {
    if !m.is_null() {
        drop(unsafe { Box::from_raw(m) });
    }
}

/// A second handle sharing the bytes of `m`.
///
/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_clone(m: *const Mbuf) -> *mut Mbuf {
    boxed(Ok(handle!(m, ptr::null_mut()).clone_ref()))
}

/// A private copy of `m` from the same pool.
///
/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_copy(m: *const Mbuf) -> *mut Mbuf {
    boxed(handle!(m, ptr::null_mut()).duplicate())
}

fn writable(m: &mut Mbuf) -> Result<*mut u8> {
    Ok(m.make_mut()?.as_mut_ptr())
}

fn prepend(m: &mut Mbuf, len: usize) -> Result<*mut u8> {
    m.make_mut()?;
    m.prepend(len)?;
    writable(m)
}

fn append(m: &mut Mbuf, len: usize) -> Result<*mut u8> {
    m.make_mut()?;
    let old = m.len();
    m.append(len)?;
    // SAFETY: the window now extends `len` bytes past `old`.
    Ok(unsafe { writable(m)?.add(old) })
}

fn adj(m: &mut Mbuf, len: usize) -> Result<*mut u8> {
    m.make_mut()?;
    m.adj(len)?;
    writable(m)
}

fn data_ptr(r: Result<*mut u8>) -> *mut u8 {
    r.unwrap_or_else(|e| {
        fail(e);
        ptr::null_mut()
    })
}

/// Pointer to the start of the data, for reading. Clones keep sharing the
/// bytes.
///
/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_mtod(m: *const Mbuf) -> *const u8 {
    handle!(m, ptr::null()).data().as_ptr()
}

/// Pointer to the start of the data, for writing. A shared buffer is first
/// copied into a private one from the same pool.
///
/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_mtod_mut(m: *mut Mbuf) -> *mut u8 {
    data_ptr(writable(handle_mut!(m, ptr::null_mut())))
}

/// Grows the data `len` bytes to the front and returns its new start.
///
/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_prepend(m: *mut Mbuf, len: u16) -> *mut u8 {
    let m = handle_mut!(m, ptr::null_mut());
    data_ptr(prepend(m, len as usize))
}

/// Grows the data `len` bytes to the back and returns the first new byte.
///
/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_append(m: *mut Mbuf, len: u16) -> *mut u8 {
    let m = handle_mut!(m, ptr::null_mut());
    data_ptr(append(m, len as usize))
}

/// Drops `len` bytes from the front and returns the new start.
///
/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_adj(m: *mut Mbuf, len: u16) -> *mut u8 {
    let m = handle_mut!(m, ptr::null_mut());
    data_ptr(adj(m, len as usize))
}

/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_trim(m: *mut Mbuf, len: u16) -> c_int {
    status(handle_mut!(m, -libc::EINVAL).trim(len as usize))
}

/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_reset(m: *mut Mbuf) {
    handle_mut!(m, ()).reset();
}

/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_data_len(m: *const Mbuf) -> u16 {
    handle!(m, 0).len() as u16
}

/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_headroom(m: *const Mbuf) -> u16 {
    handle!(m, 0).headroom() as u16
}

/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_tailroom(m: *const Mbuf) -> u16 {
    handle!(m, 0).tailroom() as u16
}

/// # Safety
/// `m` must be null or a live buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_pktmbuf_refcnt(m: *const Mbuf) -> u16 {
    handle!(m, 0).refcnt() as u16
}

// Ethernet ports.

#[repr(C)]
#[derive(Debug, Default)]
pub struct BurstioEthStats {
    pub ipackets: u64,
    pub opackets: u64,
    pub ibytes: u64,
    pub obytes: u64,
    pub ierrors: u64,
    pub oerrors: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct BurstioEthLink {
    pub link_status: u16,
    pub link_speed: u32,
}

#[repr(C)]
#[derive(Debug)]
pub struct BurstioEthDevInfo {
    /// Static NUL-terminated string.
    pub driver_name: *const c_char,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub max_desc: u16,
    pub min_mtu: u16,
    pub max_mtu: u16,
    pub max_rx_pktlen: u32,
    pub nb_rx_queues: u16,
    pub nb_tx_queues: u16,
}

impl Default for BurstioEthDevInfo {
    fn default() -> Self {
        Self {
            driver_name: ptr::null(),
            max_rx_queues: 0,
            max_tx_queues: 0,
            max_desc: 0,
            min_mtu: 0,
            max_mtu: 0,
            max_rx_pktlen: 0,
            nb_rx_queues: 0,
            nb_tx_queues: 0,
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_count_avail() -> u16 {
    runtime().ports.lock().count_avail() as u16
}

/// Creates two ports wired back to back and stores their ids.
///
/// # Safety
/// The names must be NUL-terminated strings, the id pointers writable or
/// null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_dev_create_pair(
    name_a: *const c_char,
    name_b: *const c_char,
    port_a: *mut u16,
    port_b: *mut u16,
) -> c_int {
    let (Some(a), Some(b)) = (unsafe { str_arg(name_a) }, unsafe { str_arg(name_b) }) else {
        return einval();
    };
    match runtime().ports.lock().create_pair(&a, &b) {
        Ok((ida, idb)) => {
            unsafe {
                if !port_a.is_null() {
                    *port_a = ida.get();
                }
                if !port_b.is_null() {
                    *port_b = idb.get();
                }
            }
            0
        }
        Err(e) => fail(e),
    }
}

/// Creates a loopback port and returns its id.
///
/// # Safety
/// `name` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_dev_create_loopback(name: *const c_char) -> c_int {
    let Some(name) = (unsafe { str_arg(name) }) else {
        return einval();
    };
    match runtime().ports.lock().create_loopback(&name) {
        Ok(id) => id.get() as c_int,
        Err(e) => fail(e),
    }
}

/// # Safety
/// `name` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_dev_get_port_by_name(name: *const c_char) -> c_int {
    let Some(name) = (unsafe { str_arg(name) }) else {
        return einval();
    };
    match runtime().ports.lock().find(&name) {
        Some(id) => id.get() as c_int,
        None => fail(Error::InvalidHandle(name.into_owned())),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_configure(port: u16, nb_rx: u16, nb_tx: u16) -> c_int {
    port_status(port, |dev| dev.configure(nb_rx, nb_tx, &EthConf::default()))
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_rx_queue_setup(port: u16, queue: u16, nb_desc: u16) -> c_int {
    port_status(port, |dev| dev.rx_queue_setup(QueueId(queue), nb_desc))
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_tx_queue_setup(port: u16, queue: u16, nb_desc: u16) -> c_int {
    port_status(port, |dev| dev.tx_queue_setup(QueueId(queue), nb_desc))
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_start(port: u16) -> c_int {
    port_status(port, EthDev::start)
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_stop(port: u16) -> c_int {
    port_status(port, EthDev::stop)
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_close(port: u16) -> c_int {
    port_status(port, EthDev::close)
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_set_link_up(port: u16) -> c_int {
    port_status(port, |dev| dev.set_link_up())
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_set_link_down(port: u16) -> c_int {
    port_status(port, |dev| dev.set_link_down())
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_rx_queue_start(port: u16, queue: u16) -> c_int {
    port_status(port, |dev| dev.rx_queue_start(QueueId(queue)))
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_rx_queue_stop(port: u16, queue: u16) -> c_int {
    port_status(port, |dev| dev.rx_queue_stop(QueueId(queue)))
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_tx_queue_start(port: u16, queue: u16) -> c_int {
    port_status(port, |dev| dev.tx_queue_start(QueueId(queue)))
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_tx_queue_stop(port: u16, queue: u16) -> c_int {
    port_status(port, |dev| dev.tx_queue_stop(QueueId(queue)))
}

/// # Safety
/// `info` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_dev_info_get(port: u16, info: *mut BurstioEthDevInfo) -> c_int {
    let out = handle_mut!(info, -libc::EINVAL);
    port_status(port, |dev| {
        let i = dev.info();
        *out = BurstioEthDevInfo {
            driver_name: RING_DRIVER.as_ptr(),
            max_rx_queues: i.max_rx_queues,
            max_tx_queues: i.max_tx_queues,
            max_desc: i.max_desc,
            min_mtu: i.min_mtu,
            max_mtu: i.max_mtu,
            max_rx_pktlen: i.max_rx_pktlen,
            nb_rx_queues: i.nb_rx_queues,
            nb_tx_queues: i.nb_tx_queues,
        };
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_socket_id(port: u16) -> c_int {
    match with_port(port, |dev| Ok(dev.socket_id())) {
        Ok(s) => s.0 as c_int,
        Err(e) => fail(e),
    }
}

/// Writes the six bytes of the port's MAC address to `mac`.
///
/// # Safety
/// `mac` must be null or point to six writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_macaddr_get(port: u16, mac: *mut u8) -> c_int {
    if mac.is_null() {
        return einval();
    }
    match with_port(port, |dev| Ok(dev.mac_addr())) {
        Ok(addr) => {
            unsafe { ptr::copy_nonoverlapping(addr.as_bytes().as_ptr(), mac, 6) };
            0
        }
        Err(e) => fail(e),
    }
}

/// # Safety
/// `mac` must be null or point to six readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_dev_default_mac_addr_set(port: u16, mac: *const u8) -> c_int {
    if mac.is_null() {
        return einval();
    }
    let mut bytes = [0u8; 6];
    unsafe { ptr::copy_nonoverlapping(mac, bytes.as_mut_ptr(), 6) };
    port_status(port, |dev| dev.set_mac_addr(MacAddress::new(bytes)))
}

/// # Safety
/// `mtu` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_dev_get_mtu(port: u16, mtu: *mut u16) -> c_int {
    let mtu = handle_mut!(mtu, -libc::EINVAL);
    port_status(port, |dev| {
        *mtu = dev.mtu();
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_dev_set_mtu(port: u16, mtu: u16) -> c_int {
    port_status(port, |dev| dev.set_mtu(mtu))
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_promiscuous_enable(port: u16) -> c_int {
    port_status(port, |dev| {
        dev.promiscuous_enable();
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_promiscuous_disable(port: u16) -> c_int {
    port_status(port, |dev| {
        dev.promiscuous_disable();
        Ok(())
    })
}

/// 1 if promiscuous, 0 if not, negative on error.
#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_promiscuous_get(port: u16) -> c_int {
    match with_port(port, |dev| Ok(dev.promiscuous())) {
        Ok(on) => on as c_int,
        Err(e) => fail(e),
    }
}

/// # Safety
/// `link` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_link_get(port: u16, link: *mut BurstioEthLink) -> c_int {
    let link = handle_mut!(link, -libc::EINVAL);
    port_status(port, |dev| {
        let status = dev.link();
        link.link_status = status.up as u16;
        link.link_speed = status.speed_mbps;
        Ok(())
    })
}

/// # Safety
/// `stats` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_stats_get(port: u16, stats: *mut BurstioEthStats) -> c_int {
    let out = handle_mut!(stats, -libc::EINVAL);
    port_status(port, |dev| {
        let s = dev.stats();
        *out = BurstioEthStats {
            ipackets: s.ipackets,
            opackets: s.opackets,
            ibytes: s.ibytes,
            obytes: s.obytes,
            ierrors: s.ierrors,
            oerrors: s.oerrors,
        };
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_stats_reset(port: u16) -> c_int {
    port_status(port, |dev| {
        dev.reset_stats();
        Ok(())
    })
}

/// Takes the receive handle of a queue of a started port.
#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_rx_queue_take(port: u16, queue: u16) -> *mut RxQueue {
    boxed(with_port(port, |dev| dev.take_rx_queue(QueueId(queue))))
}

/// # Safety
/// `rxq` must be null or come from [`burstio_eth_rx_queue_take`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_rx_queue_put(rxq: *mut RxQueue) {
    if !rxq.is_null() {
        drop(unsafe { Box::from_raw(rxq) });
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn burstio_eth_tx_queue_take(port: u16, queue: u16) -> *mut TxQueue {
    boxed(with_port(port, |dev| dev.take_tx_queue(QueueId(queue))))
}

/// # Safety
/// `txq` must be null or come from [`burstio_eth_tx_queue_take`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_tx_queue_put(txq: *mut TxQueue) {
    if !txq.is_null() {
        drop(unsafe { Box::from_raw(txq) });
    }
}

/// Receives up to `nb_pkts` buffers into `pkts` and returns how many.
///
/// # Safety
/// `rxq` must be null or a live receive handle used by one thread, `pkts`
/// must have room for `nb_pkts` pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_rx_burst(
    rxq: *mut RxQueue,
    pkts: *mut *mut Mbuf,
    nb_pkts: u16,
) -> u16 {
    let rxq = handle_mut!(rxq, 0);
    if pkts.is_null() {
        einval();
        return 0;
    }
    let mut bufs = Vec::with_capacity(nb_pkts as usize);
    let n = rxq.rx_burst(&mut bufs, nb_pkts as usize);
    for (i, m) in bufs.into_iter().enumerate() {
        unsafe { *pkts.add(i) = Box::into_raw(Box::new(m)) };
    }
    n as u16
}

/// Sends a prefix of `pkts[..nb_pkts]` and returns its length. The
/// handles of sent buffers become invalid; the rest still belong to the
/// caller, unchanged.
///
/// # Safety
/// `txq` must be null or a live transmit handle used by one thread, `pkts`
/// must hold `nb_pkts` distinct live buffer handles.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn burstio_eth_tx_burst(
    txq: *mut TxQueue,
    pkts: *mut *mut Mbuf,
    nb_pkts: u16,
) -> u16 {
    let txq = handle_mut!(txq, 0);
    if nb_pkts == 0 {
        return 0;
    }
    if pkts.is_null() {
        einval();
        return 0;
    }
    let handles = unsafe { slice::from_raw_parts(pkts, nb_pkts as usize) };
    if handles.iter().any(|p| p.is_null()) {
        einval();
        return 0;
    }
    // Move the buffers out of their boxes, leaving the boxes allocated.
    let mut bufs: Vec<Mbuf> = handles.iter().map(|&p| unsafe { ptr::read(p) }).collect();
    let sent = txq.tx_burst(&mut bufs);
    for &p in &handles[..sent] {
        drop(unsafe { Box::from_raw(p.cast::<MaybeUninit<Mbuf>>()) });
    }
    for (&p, m) in handles[sent..].iter().zip(bufs) {
        unsafe { ptr::write(p, m) };
    }
    sent as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &CStr, n: c_uint) -> *mut Pool {
        let pool = unsafe { burstio_pktmbuf_pool_create(name.as_ptr(), n, 0, 2048, 0) };
        assert!(!pool.is_null());
        pool
    }

    #[test]
    fn version_is_nul_terminated() {
        let v = unsafe { CStr::from_ptr(burstio_version()) };
        assert_eq!(v.to_str().unwrap(), crate::config::version());
    }

    #[test]
    fn null_handles_are_rejected() {
        assert_eq!(burstio_init(), 0);
        unsafe {
            assert!(burstio_pktmbuf_alloc(ptr::null()).is_null());
            assert_eq!(burstio_errno(), -libc::EINVAL);
            assert_eq!(burstio_pktmbuf_trim(ptr::null_mut(), 1), -libc::EINVAL);
            assert_eq!(burstio_spinlock_trylock(ptr::null()), -libc::EINVAL);
            assert!(burstio_pktmbuf_pool_create(ptr::null(), 4, 0, 2048, 0).is_null());
            burstio_pktmbuf_free(ptr::null_mut());
        }
        assert_eq!(burstio_eth_dev_start(u16::MAX), -libc::ENODEV);
    }

    #[test]
    fn mbuf_window_through_ffi() {
        unsafe {
            let pool = pool(c"ffi-window", 4);
            let m = burstio_pktmbuf_alloc(pool);
            assert_eq!(burstio_pktmbuf_headroom(m), 128);

            let p = burstio_pktmbuf_append(m, 10);
            assert!(!p.is_null());
            ptr::write_bytes(p, 0xab, 10);
            assert_eq!(burstio_pktmbuf_data_len(m), 10);
            assert!(!burstio_pktmbuf_prepend(m, 4).is_null());
            assert_eq!(burstio_pktmbuf_data_len(m), 14);
            assert!(burstio_pktmbuf_adj(m, 20).is_null());
            assert_eq!(burstio_errno(), -libc::EINVAL);
            assert_eq!(burstio_pktmbuf_trim(m, 4), 0);
            assert_eq!(burstio_pktmbuf_data_len(m), 10);

            let c = burstio_pktmbuf_clone(m);
            assert_eq!(burstio_pktmbuf_refcnt(m), 2);
            // Reading keeps the bytes shared.
            assert_eq!(burstio_pktmbuf_mtod(c), burstio_pktmbuf_mtod(m));
            assert_eq!(*burstio_pktmbuf_mtod(c).add(4), 0xab);
            assert_eq!(burstio_pktmbuf_refcnt(m), 2);
            // Writing through the clone copies it out first.
            assert!(!burstio_pktmbuf_mtod_mut(c).is_null());
            assert_eq!(burstio_pktmbuf_refcnt(m), 1);
            assert_eq!(burstio_mempool_in_use_count(pool), 2);

            burstio_pktmbuf_free(c);
            burstio_pktmbuf_free(m);
            assert_eq!(burstio_mempool_avail_count(pool), 4);
            burstio_mempool_free(pool);
        }
    }

    #[test]
    fn bulk_alloc_is_all_or_nothing() {
        unsafe {
            let pool = pool(c"ffi-bulk", 4);
            let mut bufs = [ptr::null_mut(); 5];
            assert_eq!(
                burstio_pktmbuf_alloc_bulk(pool, bufs.as_mut_ptr(), 5),
                -libc::ENOBUFS
            );
            assert_eq!(burstio_mempool_avail_count(pool), 4);
            assert_eq!(burstio_pktmbuf_alloc_bulk(pool, bufs.as_mut_ptr(), 4), 0);
            assert!(burstio_pktmbuf_alloc(pool).is_null());
            assert_eq!(burstio_errno(), -libc::ENOBUFS);
            for m in &bufs[..4] {
                burstio_pktmbuf_free(*m);
            }
            burstio_mempool_free(pool);
        }
    }

    #[test]
    fn partial_bulk_alloc_takes_what_is_left() {
        unsafe {
            let pool = pool(c"ffi-bulk-partial", 4);
            let mut bufs = [ptr::null_mut(); 5];
            assert_eq!(burstio_pktmbuf_alloc_bulk_partial(pool, bufs.as_mut_ptr(), 5), 4);
            assert!(bufs[..4].iter().all(|m| !m.is_null()));
            assert!(bufs[4].is_null());
            assert_eq!(burstio_mempool_avail_count(pool), 0);
            assert_eq!(burstio_pktmbuf_alloc_bulk_partial(pool, bufs.as_mut_ptr(), 5), 0);
            assert_eq!(
                burstio_pktmbuf_alloc_bulk_partial(pool, ptr::null_mut(), 5),
                -libc::EINVAL
            );
            for m in &bufs[..4] {
                burstio_pktmbuf_free(*m);
            }
            assert_eq!(burstio_mempool_avail_count(pool), 4);
            burstio_mempool_free(pool);
        }
    }

    #[test]
    fn shared_buffer_survives_failed_writes() {
        unsafe {
            let pool = pool(c"ffi-shared-full", 2);
            let m = burstio_pktmbuf_alloc(pool);
            assert!(!burstio_pktmbuf_append(m, 10).is_null());
            let c = burstio_pktmbuf_clone(m);
            let other = burstio_pktmbuf_alloc(pool);
            assert_eq!(burstio_mempool_avail_count(pool), 0);

            // No buffer left to copy into: the window must not move.
            assert!(burstio_pktmbuf_adj(m, 4).is_null());
            assert_eq!(burstio_errno(), -libc::ENOBUFS);
            assert_eq!(burstio_pktmbuf_headroom(m), 128);
            assert_eq!(burstio_pktmbuf_data_len(m), 10);
            assert!(burstio_pktmbuf_mtod_mut(m).is_null());

            // Reading needs no copy.
            assert!(!burstio_pktmbuf_mtod(c).is_null());
            assert_eq!(burstio_pktmbuf_refcnt(c), 2);

            burstio_pktmbuf_free(other);
            burstio_pktmbuf_free(c);
            burstio_pktmbuf_free(m);
            assert_eq!(burstio_mempool_avail_count(pool), 2);
            burstio_mempool_free(pool);
        }
    }

    #[test]
    fn spinlocks_through_ffi() {
        unsafe {
            let sl = burstio_spinlock_create();
            assert_eq!(burstio_spinlock_trylock(sl), 1);
            assert_eq!(burstio_spinlock_trylock(sl), 0);
            burstio_spinlock_unlock(sl);
            burstio_spinlock_lock_tm(sl);
            burstio_spinlock_unlock_tm(sl);
            assert_eq!(burstio_spinlock_is_locked(sl), 0);
            burstio_spinlock_free(sl);

            let rl = burstio_spinlock_recursive_create();
            burstio_spinlock_recursive_lock(rl);
            assert_eq!(burstio_spinlock_recursive_trylock(rl), 1);
            burstio_spinlock_recursive_unlock(rl);
            burstio_spinlock_recursive_unlock(rl);
            burstio_spinlock_recursive_free(rl);
        }
    }

    #[test]
    fn loopback_bursts_through_ffi() {
        unsafe {
            let port = burstio_eth_dev_create_loopback(c"ffi-lo".as_ptr());
            assert!(port >= 0);
            let port = port as u16;
            assert_eq!(burstio_eth_dev_configure(port, 1, 1), 0);
            assert_eq!(burstio_eth_rx_queue_setup(port, 0, 2), 0);
            assert_eq!(burstio_eth_tx_queue_setup(port, 0, 2), 0);
            assert!(burstio_eth_rx_queue_take(port, 0).is_null());
            assert_eq!(burstio_errno(), -libc::EBUSY);
            assert_eq!(burstio_eth_dev_start(port), 0);
            assert_eq!(burstio_eth_promiscuous_enable(port), 0);

            let pool = pool(c"ffi-lo-pool", 8);
            let mut pkts = [ptr::null_mut(); 3];
            assert_eq!(burstio_pktmbuf_alloc_bulk(pool, pkts.as_mut_ptr(), 3), 0);
            for &m in &pkts {
                assert!(!burstio_pktmbuf_append(m, 64).is_null());
            }
            let unsent = pkts[2];

            let txq = burstio_eth_tx_queue_take(port, 0);
            let rxq = burstio_eth_rx_queue_take(port, 0);
            assert!(!txq.is_null() && !rxq.is_null());
            assert_eq!(burstio_eth_tx_burst(txq, pkts.as_mut_ptr(), 3), 2);
            // The unsent handle is untouched and still usable.
            assert_eq!(pkts[2], unsent);
            assert_eq!(burstio_pktmbuf_data_len(unsent), 64);

            let mut got = [ptr::null_mut(); 4];
            assert_eq!(burstio_eth_rx_burst(rxq, got.as_mut_ptr(), 4), 2);
            let mut stats = BurstioEthStats::default();
            assert_eq!(burstio_eth_stats_get(port, &mut stats), 0);
            assert_eq!((stats.opackets, stats.ipackets, stats.obytes), (2, 2, 128));

            for m in &got[..2] {
                burstio_pktmbuf_free(*m);
            }
            burstio_pktmbuf_free(unsent);
            assert_eq!(burstio_mempool_avail_count(pool), 8);

            assert_eq!(burstio_eth_dev_stop(port), -libc::EBUSY);
            burstio_eth_tx_queue_put(txq);
            burstio_eth_rx_queue_put(rxq);
            assert_eq!(burstio_eth_dev_stop(port), 0);
            assert_eq!(burstio_eth_dev_close(port), 0);
            burstio_mempool_free(pool);
        }
    }

    #[test]
    fn port_controls_through_ffi() {
        unsafe {
            let (mut a, mut b) = (0u16, 0u16);
            assert_eq!(
                burstio_eth_dev_create_pair(c"ffi-a".as_ptr(), c"ffi-b".as_ptr(), &mut a, &mut b),
                0
            );
            assert_eq!(burstio_eth_dev_get_port_by_name(c"ffi-b".as_ptr()), b as c_int);

            let mac = [0x02, 1, 2, 3, 4, 5];
            assert_eq!(burstio_eth_dev_default_mac_addr_set(a, mac.as_ptr()), 0);
            let mut out = [0u8; 6];
            assert_eq!(burstio_eth_macaddr_get(a, out.as_mut_ptr()), 0);
            assert_eq!(out, mac);

            assert_eq!(burstio_eth_dev_set_mtu(a, 9000), 0);
            let mut mtu = 0;
            assert_eq!(burstio_eth_dev_get_mtu(a, &mut mtu), 0);
            assert_eq!(mtu, 9000);
            assert_eq!(burstio_eth_dev_set_mtu(a, 1), -libc::EINVAL);

            assert_eq!(burstio_eth_promiscuous_get(a), 0);
            let mut link = BurstioEthLink::default();
            assert_eq!(burstio_eth_link_get(a, &mut link), 0);
            assert_eq!(link.link_status, 0);
            assert_eq!(burstio_eth_dev_set_link_up(a), -libc::EBUSY);

            let mut info = BurstioEthDevInfo::default();
            assert_eq!(burstio_eth_dev_info_get(a, &mut info), 0);
            assert_eq!(
                CStr::from_ptr(info.driver_name).to_str().unwrap(),
                crate::ethdev::RING_DRIVER_NAME
            );
            assert_eq!(info.max_rx_pktlen, 9014);
            assert_eq!(info.min_mtu, crate::ethdev::MIN_MTU);
            assert_eq!(burstio_eth_dev_info_get(a, ptr::null_mut()), -libc::EINVAL);
        }
    }

    #[test]
    fn link_and_queue_controls_through_ffi() {
        unsafe {
            let port = burstio_eth_dev_create_loopback(c"ffi-lo-ctl".as_ptr());
            assert!(port >= 0);
            let port = port as u16;
            assert_eq!(burstio_eth_dev_configure(port, 1, 1), 0);
            assert_eq!(burstio_eth_rx_queue_setup(port, 0, 4), 0);
            assert_eq!(burstio_eth_tx_queue_setup(port, 0, 4), 0);
            assert_eq!(burstio_eth_dev_start(port), 0);
            assert_eq!(burstio_eth_promiscuous_enable(port), 0);

            let pool = pool(c"ffi-lo-ctl-pool", 4);
            let txq = burstio_eth_tx_queue_take(port, 0);
            let rxq = burstio_eth_rx_queue_take(port, 0);
            let mut pkts = [burstio_pktmbuf_alloc(pool)];
            assert!(!burstio_pktmbuf_append(pkts[0], 60).is_null());

            assert_eq!(burstio_eth_dev_tx_queue_stop(port, 0), 0);
            assert_eq!(burstio_eth_tx_burst(txq, pkts.as_mut_ptr(), 1), 0);
            assert_eq!(burstio_eth_dev_tx_queue_start(port, 0), 0);
            assert_eq!(burstio_eth_dev_rx_queue_stop(port, 0), 0);
            assert_eq!(burstio_eth_tx_burst(txq, pkts.as_mut_ptr(), 1), 1);
            let mut got = [ptr::null_mut(); 2];
            assert_eq!(burstio_eth_rx_burst(rxq, got.as_mut_ptr(), 2), 0);
            assert_eq!(burstio_eth_dev_rx_queue_start(port, 0), 0);
            assert_eq!(burstio_eth_rx_burst(rxq, got.as_mut_ptr(), 2), 1);
            burstio_pktmbuf_free(got[0]);
            assert_eq!(burstio_eth_dev_rx_queue_stop(port, 9), -libc::ENODEV);

            assert_eq!(burstio_eth_dev_set_link_down(port), 0);
            let mut link = BurstioEthLink::default();
            assert_eq!(burstio_eth_link_get(port, &mut link), 0);
            assert_eq!(link.link_status, 0);
            assert_eq!(burstio_eth_dev_set_link_up(port), 0);
            assert_eq!(burstio_eth_link_get(port, &mut link), 0);
            assert_eq!(link.link_status, 1);

            burstio_eth_tx_queue_put(txq);
            burstio_eth_rx_queue_put(rxq);
            assert_eq!(burstio_eth_dev_stop(port), 0);
            assert_eq!(burstio_eth_dev_close(port), 0);
            assert_eq!(burstio_mempool_avail_count(pool), 4);
            burstio_mempool_free(pool);
        }
    }
}
