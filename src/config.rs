use crate::error::ConfigError;
use crate::{
  CENTRAL_SPAN_RESERVE, LOCAL_FLUSH_MULTIPLIER, MAX_LEVEL, MAX_PAGES, MAX_THREADS, MIN_LEVEL,
};

/// Geometry and thresholds of one allocator instance.
///
/// Defaults are the reference deployment (8B..16MB classes, 16MB pages). The page size is
/// always `2^max_level`, so one page holds exactly one largest-class object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  pub min_level: usize,
  pub max_level: usize,
  pub max_threads: usize,
  pub max_pages: usize,
  pub central_reserve: usize,
  pub flush_multiplier: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      min_level: MIN_LEVEL,
      max_level: MAX_LEVEL,
      max_threads: MAX_THREADS,
      max_pages: MAX_PAGES,
      central_reserve: CENTRAL_SPAN_RESERVE,
      flush_multiplier: LOCAL_FLUSH_MULTIPLIER,
    }
  }
}

impl Config {
  pub fn with_min_level(mut self, level: usize) -> Self {
    self.min_level = level;
    self
  }

  /// Sets the largest class, which also sets the page size.
  pub fn with_max_level(mut self, level: usize) -> Self {
    self.max_level = level;
    self
  }

  pub fn with_max_threads(mut self, n: usize) -> Self {
    self.max_threads = n;
    self
  }

  pub fn with_max_pages(mut self, n: usize) -> Self {
    self.max_pages = n;
    self
  }

  pub fn with_central_reserve(mut self, n: usize) -> Self {
    self.central_reserve = n;
    self
  }

  pub fn with_flush_multiplier(mut self, n: usize) -> Self {
    self.flush_multiplier = n;
    self
  }

  #[inline]
  pub const fn page_size(&self) -> usize {
    1 << self.max_level
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let limit = usize::BITS as usize - 1;
    if self.min_level < MIN_LEVEL || self.min_level > self.max_level || self.max_level >= limit {
      return Err(ConfigError::InvalidLevels {
        min: self.min_level,
        max: self.max_level,
        limit,
      });
    }
    if self.max_threads == 0 {
      return Err(ConfigError::Zero { field: "max_threads" });
    }
    if self.max_pages == 0 {
      return Err(ConfigError::Zero { field: "max_pages" });
    }
    if self.flush_multiplier == 0 {
      return Err(ConfigError::Zero { field: "flush_multiplier" });
    }
    Ok(())
  }
}
