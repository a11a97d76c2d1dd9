//! Power-of-two size classes ("levels").

use core::ops::RangeInclusive;

use crate::config::Config;

/// Byte size of objects at `level`.
#[inline(always)]
pub const fn class_size(level: usize) -> usize {
  1 << level
}

/// The class range of one allocator: `2^min_level ..= 2^max_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClasses {
  min_level: usize,
  max_level: usize,
}

impl SizeClasses {
  pub const fn new(min_level: usize, max_level: usize) -> Self {
    Self {
      min_level,
      max_level,
    }
  }

  pub const fn from_config(config: &Config) -> Self {
    Self::new(config.min_level, config.max_level)
  }

  #[inline]
  pub const fn min_level(&self) -> usize {
    self.min_level
  }

  #[inline]
  pub const fn max_level(&self) -> usize {
    self.max_level
  }

  pub fn levels(&self) -> RangeInclusive<usize> {
    self.min_level..=self.max_level
  }

  /// Smallest level whose class holds `size` bytes, i.e. `2^(L-1) < size <= 2^L`.
  /// Zero and anything above the largest class have no level.
  #[inline]
  pub fn level_of(&self, size: usize) -> Option<usize> {
    if size == 0 || size > class_size(self.max_level) {
      return None;
    }
    if size <= class_size(self.min_level) {
      return Some(self.min_level);
    }
    Some((usize::BITS - (size - 1).leading_zeros()) as usize)
  }

  /// Objects per bulk move between central and thread tiers. Every move carries the
  /// same byte volume: one largest-class object, i.e. one page.
  #[inline]
  pub const fn move_count(&self, level: usize) -> usize {
    1 << (self.max_level - level)
  }
}
