//! # Change Versions
//!
//! A single monotonically increasing counter stamps every mutable component
//! access. Systems remember the version they last ran at and ask whether a
//! chunk's stamp is newer.
//!
//! ```text
//! version:  1, 2, 3, ..., u32::MAX, 1, 2, ...   (0 = "never")
//! ```
//!
//! Comparison is wrap-aware: `change` is newer than `required` if the signed
//! distance between them is positive.

/// The global system version counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalVersion(u32);

impl GlobalVersion {
    /// First version handed out by a new store.
    pub const INITIAL: u32 = 1;

    /// Creates a counter at [`GlobalVersion::INITIAL`].
    #[must_use]
    pub const fn new() -> Self {
        Self(Self::INITIAL)
    }

    /// Current version. Never `0`.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Advances the counter, skipping `0` on wrap. Returns the new version.
    #[inline]
    pub fn increment(&mut self) -> u32 {
        self.0 = match self.0.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.0
    }
}

impl Default for GlobalVersion {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns `true` if data stamped `change` may have changed since `required`.
///
/// A `required` of `0` means the observer never ran, so everything counts.
#[inline]
#[must_use]
pub const fn did_change(change: u32, required: u32) -> bool {
    required == 0 || (change.wrapping_sub(required) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_starts_at_one() {
        let mut version = GlobalVersion::new();
        assert_eq!(version.get(), 1);
        assert_eq!(version.increment(), 2);
    }

    #[test]
    fn test_version_skips_zero() {
        let mut version = GlobalVersion(u32::MAX);
        assert_eq!(version.increment(), 1);
    }

    #[test]
    fn test_did_change() {
        assert!(did_change(5, 0));
        assert!(did_change(5, 4));
        assert!(!did_change(5, 5));
        assert!(!did_change(4, 5));
        // Across the wrap.
        assert!(did_change(2, u32::MAX - 1));
        assert!(!did_change(u32::MAX - 1, 2));
    }
}
