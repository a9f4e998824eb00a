//! Build and platform facts: version string, cache-line size, and the
//! hardware capabilities that change how locks behave.

use tracing::debug;

use crate::errors::{Error, Result};

/// Cache-line size assumed for buffer and per-lcore data layout.
#[cfg(target_arch = "aarch64")]
pub const CACHE_LINE_SIZE: usize = 128;
#[cfg(not(target_arch = "aarch64"))]
pub const CACHE_LINE_SIZE: usize = 64;

/// Library version as a human readable string.
pub fn version() -> &'static str {
    concat!("burstio ", env!("CARGO_PKG_VERSION"))
}

/// Rounds `size` up to the next multiple of [`CACHE_LINE_SIZE`].
#[inline]
pub const fn cache_line_roundup(size: usize) -> usize {
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Hardware features detected once at startup.
///
/// Locks that can use transactional memory take a `Capabilities` at
/// construction time instead of querying the CPU on every acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Restricted Transactional Memory (Intel TSX) is usable.
    pub rtm: bool,
}

impl Capabilities {
    /// Detects what the running CPU supports.
    pub fn detect() -> Self {
        let caps = Self { rtm: rtm_supported() };
        debug!(rtm = caps.rtm, "detected cpu capabilities");
        caps
    }

    /// A capability set with every optional feature turned off.
    pub const fn none() -> Self {
        Self { rtm: false }
    }

    /// Fails with [`Error::UnsupportedFeature`] unless RTM is available.
    pub fn require_rtm(&self) -> Result<()> {
        if self.rtm {
            Ok(())
        } else {
            Err(Error::UnsupportedFeature("hardware lock elision (rtm)"))
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn rtm_supported() -> bool {
    std::arch::is_x86_feature_detected!("rtm")
}

#[cfg(not(target_arch = "x86_64"))]
fn rtm_supported() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundup_to_cache_line() {
        assert_eq!(cache_line_roundup(0), 0);
        assert_eq!(cache_line_roundup(1), CACHE_LINE_SIZE);
        assert_eq!(cache_line_roundup(CACHE_LINE_SIZE), CACHE_LINE_SIZE);
        assert_eq!(cache_line_roundup(CACHE_LINE_SIZE + 1), 2 * CACHE_LINE_SIZE);
    }

    #[test]
    fn none_rejects_rtm() {
        let err = Capabilities::none().require_rtm().unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature(_)));
        assert!(Capabilities { rtm: true }.require_rtm().is_ok());
    }

    #[test]
    fn version_names_the_crate() {
        assert!(version().starts_with("burstio "));
    }
}
