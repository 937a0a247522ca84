//! Global rule version clock
//!
//! Rule owners stamp every rule creation or modification with `bump()`;
//! merge requests capture `bump()` at enqueue time. A constituent whose
//! version moved past the captured value was changed after the packet
//! traversed it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Single monotonic version counter
#[derive(Debug, Default)]
pub struct VersionClock {
    value: AtomicU64,
}

impl VersionClock {
    /// Create a clock starting at zero
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Advance and return the new version
    #[inline]
    pub fn bump(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current version, plain read
    #[inline]
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}
