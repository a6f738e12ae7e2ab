//! # Enabled Bits
//!
//! Every column of a chunk has one enabled bit per slot and a count of
//! disabled live entities:
//!
//! ```text
//! column 0: [word 0][word 1]...   disabled: 2
//! column 1: [word 0][word 1]...   disabled: 0
//! ```
//!
//! Toggling goes through `&self` and is lock-free: a CAS loop on the 64-bit
//! word, then a count adjustment only if this call actually flipped the bit.
//! Slot occupancy changes (create, move, compaction) go through `&mut self`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Number of 64-bit words needed for `capacity` slots.
#[inline]
#[must_use]
pub const fn words_for(capacity: usize) -> usize {
    capacity.div_ceil(64)
}

/// Enabled bits and disabled counts of all columns of one chunk.
pub struct EnabledMask {
    words: Box<[AtomicU64]>,
    disabled: Box<[AtomicU32]>,
    words_per_column: usize,
}

impl EnabledMask {
    /// Creates a mask for `columns` columns of `capacity` empty slots.
    #[must_use]
    pub fn new(columns: usize, capacity: usize) -> Self {
        let words_per_column = words_for(capacity);
        Self {
            words: (0..columns * words_per_column)
                .map(|_| AtomicU64::new(0))
                .collect(),
            disabled: (0..columns).map(|_| AtomicU32::new(0)).collect(),
            words_per_column,
        }
    }

    #[inline]
    fn locate(&self, column: usize, index: usize) -> (usize, u64) {
        (column * self.words_per_column + index / 64, 1u64 << (index % 64))
    }

    /// Returns the bit of slot `index` in `column`.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self, column: usize, index: usize) -> bool {
        let (word, mask) = self.locate(column, index);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Sets the bit of a live slot. Returns `true` if the bit flipped.
    ///
    /// Safe to call concurrently from many threads on the same word.
    pub fn set_enabled(&self, column: usize, index: usize, enabled: bool) -> bool {
        let (word, mask) = self.locate(column, index);
        let word = &self.words[word];
        let mut current = word.load(Ordering::Relaxed);
        loop {
            let next = if enabled {
                current | mask
            } else {
                current & !mask
            };
            if next == current {
                return false;
            }
            match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if enabled {
            self.disabled[column].fetch_sub(1, Ordering::AcqRel);
        } else {
            self.disabled[column].fetch_add(1, Ordering::AcqRel);
        }
        true
    }

    /// Number of disabled live entities in `column`.
    #[inline]
    #[must_use]
    pub fn disabled_count(&self, column: usize) -> u32 {
        self.disabled[column].load(Ordering::Acquire)
    }

    /// Copy of the bit words of `column`, for bulk jobs.
    ///
    /// Bits only change through [`EnabledMask::set_enabled`], which keeps the
    /// disabled count in step.
    #[must_use]
    pub fn word_snapshot(&self, column: usize) -> Vec<u64> {
        let start = column * self.words_per_column;
        self.words[start..start + self.words_per_column]
            .iter()
            .map(|word| word.load(Ordering::Acquire))
            .collect()
    }

    /// Marks an empty slot as occupied with the given state.
    pub fn occupy(&mut self, column: usize, index: usize, enabled: bool) {
        let (word, mask) = self.locate(column, index);
        let bits = self.words[word].get_mut();
        debug_assert_eq!(*bits & mask, 0, "occupying a slot with a set bit");
        if enabled {
            *bits |= mask;
        } else {
            *bits &= !mask;
            *self.disabled[column].get_mut() += 1;
        }
    }

    /// Marks an occupied slot as empty, dropping it from the disabled count.
    pub fn vacate(&mut self, column: usize, index: usize) {
        let (word, mask) = self.locate(column, index);
        let bits = self.words[word].get_mut();
        if *bits & mask == 0 {
            *self.disabled[column].get_mut() -= 1;
        }
        *bits &= !mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn filled(columns: usize, count: usize) -> EnabledMask {
        let mut mask = EnabledMask::new(columns, 128);
        for column in 0..columns {
            for index in 0..count {
                mask.occupy(column, index, true);
            }
        }
        mask
    }

    #[test]
    fn test_words_for() {
        assert_eq!(words_for(0), 0);
        assert_eq!(words_for(64), 1);
        assert_eq!(words_for(677), 11);
    }

    #[test]
    fn test_toggle_adjusts_count_once() {
        let mask = filled(1, 10);
        assert!(mask.set_enabled(0, 3, false));
        assert!(!mask.set_enabled(0, 3, false));
        assert_eq!(mask.disabled_count(0), 1);
        assert!(mask.set_enabled(0, 3, true));
        assert_eq!(mask.disabled_count(0), 0);
    }

    #[test]
    fn test_vacate_forgets_disabled_slot() {
        let mut mask = filled(2, 10);
        mask.set_enabled(1, 9, false);
        mask.vacate(1, 9);
        assert_eq!(mask.disabled_count(1), 0);
        assert!(!mask.is_enabled(1, 9));
        mask.occupy(1, 9, false);
        assert_eq!(mask.disabled_count(1), 1);
    }

    #[test]
    fn test_concurrent_toggles_in_one_word() {
        let mask = filled(1, 128);
        thread::scope(|scope| {
            for bit in [5usize, 6, 7, 8] {
                let mask = &mask;
                scope.spawn(move || {
                    for _ in 0..1000 {
                        mask.set_enabled(0, bit, false);
                        mask.set_enabled(0, bit, true);
                    }
                    mask.set_enabled(0, bit, false);
                });
            }
        });
        assert_eq!(mask.disabled_count(0), 4);
        assert_eq!(
            mask.word_snapshot(0),
            vec![
                !((1u64 << 5) | (1 << 6) | (1 << 7) | (1 << 8)),
                u64::MAX
            ]
        );
    }
}
