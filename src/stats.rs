use crate::size_class::class_size;

/// Free-list population of every tier at one quiescent moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
  pub min_level: usize,
  pub max_level: usize,
  /// `thread[slot][level]`: objects in each thread cache.
  pub thread: Vec<Vec<usize>>,
  /// `central[level]`: objects in the central cache.
  pub central: Vec<usize>,
  pub free_pages: usize,
  pub page_size: usize,
  /// Bytes marked allocated in shadow memory.
  pub live_bytes: usize,
  pub heap_bytes: usize,
}

impl Snapshot {
  pub fn thread_count(&self, slot: usize, level: usize) -> usize {
    self.thread[slot][level]
  }

  /// Objects of `level` across all thread caches.
  pub fn thread_total(&self, level: usize) -> usize {
    self.thread.iter().map(|levels| levels[level]).sum()
  }

  pub fn central_count(&self, level: usize) -> usize {
    self.central[level]
  }

  pub fn thread_free_bytes(&self) -> usize {
    (self.min_level..=self.max_level)
      .map(|level| self.thread_total(level) * class_size(level))
      .sum()
  }

  pub fn central_free_bytes(&self) -> usize {
    (self.min_level..=self.max_level)
      .map(|level| self.central[level] * class_size(level))
      .sum()
  }

  /// Every byte of the heap is in exactly one place: a thread cache, the central
  /// cache, a free page, or a live allocation. Equals `heap_bytes` when consistent.
  pub fn accounted_bytes(&self) -> usize {
    self.thread_free_bytes()
      + self.central_free_bytes()
      + self.free_pages * self.page_size
      + self.live_bytes
  }
}
