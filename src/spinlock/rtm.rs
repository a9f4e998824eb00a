//! Restricted Transactional Memory helpers for lock elision.
//!
//! A lock is elided by starting a hardware transaction and reading the lock
//! word inside it: the word enters the transaction's read set, so any thread
//! that really takes the lock aborts every transaction eliding it.

use std::sync::atomic::AtomicU32;
#[cfg(target_arch = "x86_64")]
use std::sync::atomic::Ordering;

#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
const MAX_RETRIES: u32 = 20;

#[cfg(target_arch = "x86_64")]
mod arch {
    use core::arch::asm;

    pub(super) const XBEGIN_STARTED: u32 = !0;
    pub(super) const XABORT_EXPLICIT: u32 = 1 << 0;
    pub(super) const XABORT_RETRY: u32 = 1 << 1;
    pub(super) const XABORT_CONFLICT: u32 = 1 << 2;
    pub(super) const XABORT_LOCK_BUSY: u32 = 0xff;

    #[inline(always)]
    pub(super) fn xabort_code(status: u32) -> u32 {
        (status >> 24) & 0xff
    }

    /// Starts a transaction. Returns [`XBEGIN_STARTED`] inside it, or the
    /// abort status once the transaction rolled back to this point.
    ///
    /// # Safety
    /// The CPU must support RTM.
    #[inline(always)]
    pub(super) unsafe fn xbegin() -> u32 {
        let mut status = XBEGIN_STARTED;
        unsafe {
            asm!("xbegin 2f", "2:", inout("eax") status, options(nostack));
        }
        status
    }

    /// # Safety
    /// Must run inside a transaction.
    #[inline(always)]
    pub(super) unsafe fn xend() {
        unsafe { asm!("xend", options(nostack)) };
    }

    /// # Safety
    /// The CPU must support RTM. Outside a transaction this is a no-op.
    #[inline(always)]
    pub(super) unsafe fn xabort_lock_busy() {
        unsafe { asm!("xabort 0xff", options(nostack)) };
    }

    /// # Safety
    /// The CPU must support RTM.
    #[inline(always)]
    pub(super) unsafe fn xtest() -> bool {
        let inside: u8;
        unsafe {
            asm!("xtest", "setnz {0}", out(reg_byte) inside, options(nostack, nomem));
        }
        inside != 0
    }
}

/// Tries to elide the lock guarded by `word`.
///
/// Returns `true` with a transaction open and the lock word untouched;
/// the caller then commits with [`commit`]. Returns `false` when the
/// transaction kept aborting and the caller must take the lock for real.
/// With `wait` unset a lock found held returns `false` at once instead of
/// spinning until it is released.
///
/// # Safety
/// The CPU must support RTM (see [`crate::config::Capabilities`]).
#[cfg(target_arch = "x86_64")]
pub(super) unsafe fn try_elide(word: &AtomicU32, wait: bool) -> bool {
    use arch::*;

    let mut retries = MAX_RETRIES;
    while retries > 0 {
        retries -= 1;
        let status = unsafe { xbegin() };
        if status == XBEGIN_STARTED {
            if word.load(Ordering::Relaxed) == 0 {
                return true;
            }
            unsafe { xabort_lock_busy() };
        }
        while word.load(Ordering::Relaxed) != 0 {
            if !wait {
                return false;
            }
            std::hint::spin_loop();
        }
        let busy = status & XABORT_EXPLICIT != 0 && xabort_code(status) == XABORT_LOCK_BUSY;
        if status & XABORT_CONFLICT != 0 || busy {
            // Randomized exponential back-off before the next attempt.
            let tries = MAX_RETRIES - retries;
            let pauses = (rand::random::<u32>() % (1 << tries.min(10))) + 1;
            for _ in 0..pauses {
                std::hint::spin_loop();
            }
            continue;
        }
        if status & XABORT_RETRY == 0 {
            break;
        }
    }
    false
}

#[cfg(not(target_arch = "x86_64"))]
pub(super) unsafe fn try_elide(_word: &AtomicU32, _wait: bool) -> bool {
    false
}

/// Whether the calling thread is inside a transaction.
///
/// # Safety
/// The CPU must support RTM.
#[cfg(target_arch = "x86_64")]
pub(super) unsafe fn in_transaction() -> bool {
    unsafe { arch::xtest() }
}

#[cfg(not(target_arch = "x86_64"))]
pub(super) unsafe fn in_transaction() -> bool {
    false
}

/// Commits the transaction opened by a successful [`try_elide`].
///
/// # Safety
/// Must run inside that transaction.
#[cfg(target_arch = "x86_64")]
pub(super) unsafe fn commit() {
    unsafe { arch::xend() }
}

#[cfg(not(target_arch = "x86_64"))]
pub(super) unsafe fn commit() {
    unreachable!("no transaction can be open without rtm")
}
