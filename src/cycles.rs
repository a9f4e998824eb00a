//! Cycle counters and busy-wait delays.
//!
//! On x86_64 the counter is the TSC, on aarch64 the generic timer virtual
//! count. Anything else falls back to a monotonic nanosecond clock, so the
//! counter frequency there is exactly 1 GHz.

use std::hint;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tracing::debug;

const CALIBRATION_PERIOD: Duration = Duration::from_millis(50);

/// Reads the cycle counter without serialization.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    // SAFETY: rdtsc is available on every x86_64 CPU.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    let cnt: u64;
    unsafe {
        core::arch::asm!(
            "mrs {cnt}, CNTVCT_EL0",
            cnt = out(reg) cnt,
            options(nostack, nomem, preserves_flags)
        );
    }
    cnt
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    monotonic_ns()
}

/// Reads the cycle counter after all previous instructions completed.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc_precise() -> u64 {
    // SAFETY: lfence and rdtsc are baseline x86_64 instructions.
    unsafe {
        core::arch::x86_64::_mm_lfence();
        core::arch::x86_64::_rdtsc()
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn rdtsc_precise() -> u64 {
    unsafe { core::arch::asm!("isb", options(nostack, nomem, preserves_flags)) };
    rdtsc()
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn rdtsc_precise() -> u64 {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    rdtsc()
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Frequency of [`rdtsc`] in Hz.
///
/// Calibrated on first use against the monotonic clock and cached.
pub fn tsc_hz() -> u64 {
    static HZ: OnceLock<u64> = OnceLock::new();
    *HZ.get_or_init(|| {
        let hz = calibrate();
        debug!(hz, "calibrated cycle counter");
        hz
    })
}

#[cfg(target_arch = "aarch64")]
fn calibrate() -> u64 {
    let freq: u64;
    unsafe {
        core::arch::asm!(
            "mrs {freq}, CNTFRQ_EL0",
            freq = out(reg) freq,
            options(nostack, nomem, preserves_flags)
        );
    }
    if freq != 0 { freq } else { measure() }
}

#[cfg(target_arch = "x86_64")]
fn calibrate() -> u64 {
    measure()
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn calibrate() -> u64 {
    1_000_000_000
}

#[allow(dead_code)]
fn measure() -> u64 {
    let start = Instant::now();
    let c0 = rdtsc_precise();
    std::thread::sleep(CALIBRATION_PERIOD);
    let c1 = rdtsc_precise();
    let elapsed = start.elapsed().as_nanos().max(1);
    let hz = (c1.wrapping_sub(c0) as u128 * 1_000_000_000) / elapsed;
    // Round to the nearest 10 kHz; the measurement is not better than that.
    let hz = ((hz + 5_000) / 10_000) * 10_000;
    hz.max(1) as u64
}

/// Timer cycles, the same source as [`rdtsc`].
#[inline]
pub fn timer_cycles() -> u64 {
    rdtsc()
}

/// Frequency of [`timer_cycles`] in Hz.
#[inline]
pub fn timer_hz() -> u64 {
    tsc_hz()
}

/// Converts a cycle delta into a duration.
pub fn cycles_to_duration(cycles: u64) -> Duration {
    let nanos = (cycles as u128 * 1_000_000_000) / tsc_hz() as u128;
    Duration::from_nanos(nanos as u64)
}

/// Busy-waits for at least `us` microseconds.
pub fn delay_us(us: u64) {
    let deadline = rdtsc().wrapping_add(us.saturating_mul(tsc_hz()) / 1_000_000);
    while (deadline.wrapping_sub(rdtsc()) as i64) > 0 {
        hint::spin_loop();
    }
}

/// Busy-waits for at least `ms` milliseconds.
pub fn delay_ms(ms: u64) {
    delay_us(ms.saturating_mul(1_000));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_advances() {
        let a = rdtsc();
        let b = rdtsc_precise();
        assert!(b >= a);
    }

    #[test]
    fn hz_is_stable() {
        let hz = tsc_hz();
        assert!(hz > 0);
        assert_eq!(hz, tsc_hz());
        assert_eq!(timer_hz(), hz);
    }

    #[test]
    fn delay_waits_at_least_requested() {
        let start = Instant::now();
        delay_ms(5);
        // Calibration error is far below one millisecond over 5 ms.
        assert!(start.elapsed() >= Duration::from_millis(4));
    }

    #[test]
    fn one_second_of_cycles() {
        let d = cycles_to_duration(tsc_hz());
        assert_eq!(d.as_secs(), 1);
    }
}
