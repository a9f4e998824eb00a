//! Logical cores.
//!
//! An lcore is a polling worker thread bound to one CPU. The current
//! thread's lcore id lives in a thread local set by [`crate::launch`]
//! (workers) or [`init_main`] (the thread driving the application).

use std::cell::Cell;
use std::fmt;
use std::fs;

/// Value returned at the FFI boundary for threads that are not lcores.
pub const LCORE_ID_ANY: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LcoreId(u32);

impl LcoreId {
    /// Validates `id` against the number of CPUs.
    pub fn new(id: u32) -> Option<Self> {
        ((id as usize) < count()).then_some(Self(id))
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<LcoreId> for u32 {
    fn from(val: LcoreId) -> u32 {
        val.0
    }
}

impl fmt::Display for LcoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lcore{}", self.0)
    }
}

/// NUMA node a core or a memory region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SocketId(pub u32);

thread_local! {
    static CURRENT: Cell<Option<LcoreId>> = const { Cell::new(None) };
    static MAIN: Cell<bool> = const { Cell::new(false) };
}

/// The main lcore, which drives the application and launches workers.
pub const MAIN_LCORE: LcoreId = LcoreId(0);

/// Lcore of the calling thread, `None` for threads that are not lcores.
pub fn id() -> Option<LcoreId> {
    CURRENT.with(|c| c.get())
}

/// Marks the calling thread as the main lcore.
pub fn init_main() {
    CURRENT.with(|c| c.set(Some(MAIN_LCORE)));
    MAIN.with(|m| m.set(true));
}

pub fn is_main() -> bool {
    MAIN.with(|m| m.get())
}

pub(crate) fn set_current(lcore: LcoreId) {
    CURRENT.with(|c| c.set(Some(lcore)));
}

/// Number of lcores, one per online CPU.
pub fn count() -> usize {
    num_cpus::get()
}

/// Every lcore except the main one.
pub fn workers() -> impl Iterator<Item = LcoreId> {
    (1..count() as u32).map(LcoreId)
}

/// NUMA node of `lcore`, read from sysfs. Falls back to node 0.
pub fn socket_id(lcore: LcoreId) -> SocketId {
    let path = format!("/sys/devices/system/cpu/cpu{}", lcore.0);
    let Ok(entries) = fs::read_dir(path) else {
        return SocketId::default();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name();
            name.to_str()?.strip_prefix("node")?.parse().ok()
        })
        .next()
        .map(SocketId)
        .unwrap_or_default()
}

/// NUMA node of the calling lcore, node 0 for non-lcore threads.
pub fn current_socket_id() -> SocketId {
    id().map(socket_id).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_thread_has_no_lcore() {
        std::thread::spawn(|| {
            assert_eq!(id(), None);
            assert!(!is_main());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn main_lcore_is_zero() {
        std::thread::spawn(|| {
            init_main();
            assert_eq!(id(), Some(MAIN_LCORE));
            assert!(is_main());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn ids_are_validated() {
        assert!(LcoreId::new(0).is_some());
        assert!(LcoreId::new(count() as u32).is_none());
        assert_eq!(workers().count(), count() - 1);
    }
}
