use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::{SpinLock, rtm};
use crate::config::Capabilities;
use crate::errors::{Error, Result};

const NO_OWNER: u64 = 0;

/// Per-thread token identifying lock owners; never `NO_OWNER`.
fn thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: Cell<u64> = const { Cell::new(NO_OWNER) };
    }
    TOKEN.with(|t| {
        if t.get() == NO_OWNER {
            t.set(NEXT.fetch_add(1, Ordering::Relaxed));
        }
        t.get()
    })
}

/// A spin lock the owning thread may take repeatedly.
///
/// Every `lock` must be matched by an `unlock`; other threads see the lock
/// released only when the depth drops back to zero.
pub struct RecursiveSpinLock {
    sl: SpinLock,
    owner: AtomicU64,
    depth: AtomicU32,
}

impl RecursiveSpinLock {
    pub const fn new() -> Self {
        Self {
            sl: SpinLock::new(),
            owner: AtomicU64::new(NO_OWNER),
            depth: AtomicU32::new(0),
        }
    }

    pub const fn with_capabilities(caps: &Capabilities) -> Self {
        Self {
            sl: SpinLock::with_capabilities(caps),
            owner: AtomicU64::new(NO_OWNER),
            depth: AtomicU32::new(0),
        }
    }

    fn owned_by(&self, me: u64) -> bool {
        self.owner.load(Ordering::Relaxed) == me
    }

    pub fn lock(&self) {
        let me = thread_token();
        if !self.owned_by(me) {
            self.sl.lock();
            self.owner.store(me, Ordering::Relaxed);
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn try_lock(&self) -> bool {
        let me = thread_token();
        if !self.owned_by(me) {
            if !self.sl.try_lock() {
                return false;
            }
            self.owner.store(me, Ordering::Relaxed);
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// # Safety
    /// The calling thread must own the lock.
    pub unsafe fn unlock(&self) {
        debug_assert!(self.owned_by(thread_token()), "unlock by non-owner");
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(NO_OWNER, Ordering::Relaxed);
            // SAFETY: this thread took `sl` when its depth went from zero.
            unsafe { self.sl.unlock() };
        }
    }

    /// Takes the lock, eliding the first acquisition if possible.
    pub fn lock_tm(&self) {
        // An elided attempt on a lock this thread already holds would only
        // ever see it busy.
        if self.sl.elide
            && !self.owned_by(thread_token())
            // SAFETY: `elide` implies RTM.
            && unsafe { rtm::try_elide(&self.sl.locked, true) }
        {
            return;
        }
        self.lock();
    }

    pub fn try_lock_tm(&self) -> bool {
        if self.sl.elide
            && !self.owned_by(thread_token())
            // SAFETY: `elide` implies RTM.
            && unsafe { rtm::try_elide(&self.sl.locked, false) }
        {
            return true;
        }
        self.try_lock()
    }

    /// # Safety
    /// The calling thread must hold the lock through `lock_tm` or a
    /// successful `try_lock_tm`.
    pub unsafe fn unlock_tm(&self) {
        unsafe {
            if self.owned_by(thread_token()) {
                self.unlock();
            } else {
                // SAFETY: not owning it means the acquisition was elided.
                rtm::commit();
            }
        }
    }

    /// Nesting depth, zero when free.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_locked(&self) -> bool {
        self.sl.is_locked()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owned_by(thread_token())
    }

    pub fn lock_guard(&self) -> RecursiveGuard<'_> {
        self.lock_tm();
        RecursiveGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock_guard(&self) -> Result<RecursiveGuard<'_>> {
        if self.try_lock_tm() {
            Ok(RecursiveGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            Err(Error::LockContended)
        }
    }
}

impl Default for RecursiveSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecursiveSpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveSpinLock")
            .field("locked", &self.is_locked())
            .field("depth", &self.depth())
            .finish()
    }
}

pub struct RecursiveGuard<'a> {
    lock: &'a RecursiveSpinLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RecursiveGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard was created by a successful acquisition on this thread.
        unsafe { self.lock.unlock_tm() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn nested_unlock_keeps_lock_held() {
        let lock = RecursiveSpinLock::new();
        lock.lock();
        lock.lock();
        unsafe { lock.unlock() };
        assert!(lock.is_locked());
        assert_eq!(lock.depth(), 1);
        assert!(lock.is_held_by_current_thread());
        unsafe { lock.unlock() };
        assert!(!lock.is_locked());
        assert_eq!(lock.depth(), 0);
        assert!(!lock.is_held_by_current_thread());
    }

    #[test]
    fn other_threads_wait_for_depth_zero() {
        let lock = Arc::new(RecursiveSpinLock::new());
        lock.lock();
        lock.lock();
        unsafe { lock.unlock() };

        let other = lock.clone();
        let blocked = thread::spawn(move || other.try_lock()).join().unwrap();
        assert!(!blocked);

        unsafe { lock.unlock() };
        let other = lock.clone();
        let taken = thread::spawn(move || {
            let ok = other.try_lock();
            if ok {
                unsafe { other.unlock() };
            }
            ok
        })
        .join()
        .unwrap();
        assert!(taken);
    }

    #[test]
    fn owner_try_lock_nests() {
        let lock = RecursiveSpinLock::new();
        assert!(lock.try_lock());
        assert!(lock.try_lock());
        assert_eq!(lock.depth(), 2);
        unsafe {
            lock.unlock();
            lock.unlock();
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn guards_nest_with_elision_capabilities() {
        let lock = RecursiveSpinLock::with_capabilities(&Capabilities::detect());
        {
            let _outer = lock.lock_guard();
            let _inner = lock.lock_guard();
        }
        assert!(!lock.is_locked());
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn guard_contention_across_threads() {
        let lock = Arc::new(RecursiveSpinLock::new());
        let guard = lock.lock_guard();
        let other = lock.clone();
        let contended = thread::spawn(move || matches!(other.try_lock_guard(), Err(Error::LockContended)))
            .join()
            .unwrap();
        assert!(contended);
        drop(guard);
    }
}
