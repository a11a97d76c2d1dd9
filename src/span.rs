use core::sync::atomic::{AtomicIsize, AtomicU8, Ordering};

use crate::error::Violation;

/// Whether a page sits in the heap free list or has been split into one class.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpanStatus {
  OnHeap = 0,
  InUse = 1,
}

impl SpanStatus {
  fn from_u8(v: u8) -> Self {
    if v == SpanStatus::InUse as u8 {
      SpanStatus::InUse
    } else {
      SpanStatus::OnHeap
    }
  }

  pub const fn as_str(self) -> &'static str {
    match self {
      SpanStatus::OnHeap => "OnHeap",
      SpanStatus::InUse => "InUse",
    }
  }
}

/// Metadata for one page.
///
/// `status` and `level` change only under the heap lock. `central_residual` changes only
/// under the central lock of the span's level, which is fixed while the span is in use.
struct Span {
  status: AtomicU8,
  level: AtomicU8,
  /// Bytes of this page's objects parked in the central free list.
  central_residual: AtomicIsize,
}

impl Span {
  const fn new() -> Self {
    Self {
      status: AtomicU8::new(SpanStatus::OnHeap as u8),
      level: AtomicU8::new(0),
      central_residual: AtomicIsize::new(0),
    }
  }
}

/// One `Span` per page of the managed heap, fixed at construction.
pub(crate) struct SpanTable {
  spans: Box<[Span]>,
  heap_start: usize,
  page_level: usize,
}

impl SpanTable {
  pub(crate) fn new(heap_start: usize, pages: usize, page_level: usize) -> Self {
    Self {
      spans: (0..pages).map(|_| Span::new()).collect(),
      heap_start,
      page_level,
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.spans.len()
  }

  #[inline]
  fn page_size(&self) -> usize {
    1 << self.page_level
  }

  /// Span owning `addr`. The caller has bounds-checked the address.
  #[inline]
  pub(crate) fn index_of(&self, addr: usize) -> usize {
    (addr - self.heap_start) >> self.page_level
  }

  #[inline]
  pub(crate) fn base_of(&self, idx: usize) -> usize {
    self.heap_start + (idx << self.page_level)
  }

  #[inline]
  pub(crate) fn status(&self, idx: usize) -> SpanStatus {
    SpanStatus::from_u8(self.spans[idx].status.load(Ordering::Acquire))
  }

  #[inline]
  pub(crate) fn level(&self, idx: usize) -> usize {
    self.spans[idx].level.load(Ordering::Acquire) as usize
  }

  #[inline]
  pub(crate) fn residual(&self, idx: usize) -> usize {
    self.spans[idx].central_residual.load(Ordering::Relaxed).max(0) as usize
  }

  /// True when every object of the page is parked in the central list.
  #[inline]
  pub(crate) fn is_idle(&self, idx: usize, level: usize) -> bool {
    self.status(idx) == SpanStatus::InUse
      && self.level(idx) == level
      && self.spans[idx].central_residual.load(Ordering::Relaxed) == self.page_size() as isize
  }

  /// `OnHeap -> InUse`, with the whole page parked in the central list.
  pub(crate) fn mark_in_use(&self, idx: usize, level: usize) {
    self.expect_status(idx, SpanStatus::OnHeap);
    self.check(idx);
    let span = &self.spans[idx];
    span.level.store(level as u8, Ordering::Relaxed);
    span
      .central_residual
      .store(self.page_size() as isize, Ordering::Relaxed);
    span.status.store(SpanStatus::InUse as u8, Ordering::Release);
    tracing::debug!(span = idx, level, "span status: InUse");
  }

  /// `InUse -> OnHeap`. Only a fully reclaimed page goes back.
  pub(crate) fn mark_on_heap(&self, idx: usize) {
    self.expect_status(idx, SpanStatus::InUse);
    let residual = self.spans[idx].central_residual.load(Ordering::Relaxed);
    if residual != self.page_size() as isize {
      Violation::Accounting {
        what: "returning a page that is not fully reclaimed",
        expected: self.page_size(),
        found: residual.max(0) as usize,
      }
      .raise();
    }
    let span = &self.spans[idx];
    span.status.store(SpanStatus::OnHeap as u8, Ordering::Release);
    span.central_residual.store(0, Ordering::Relaxed);
    span.level.store(0, Ordering::Relaxed);
    tracing::debug!(span = idx, "span status: OnHeap");
  }

  /// An object of `bytes` left the central list for a thread cache.
  #[inline]
  pub(crate) fn take_from_central(&self, idx: usize, bytes: usize) {
    self.spans[idx]
      .central_residual
      .fetch_sub(bytes as isize, Ordering::Relaxed);
    self.check(idx);
  }

  /// An object of `bytes` came back to the central list.
  #[inline]
  pub(crate) fn give_to_central(&self, idx: usize, bytes: usize) {
    self.spans[idx]
      .central_residual
      .fetch_add(bytes as isize, Ordering::Relaxed);
    self.check(idx);
  }

  pub(crate) fn expect_status(&self, idx: usize, expected: SpanStatus) {
    let found = self.status(idx);
    if found != expected {
      Violation::SpanStatus {
        span: idx,
        expected: expected.as_str(),
        found: found.as_str(),
      }
      .raise();
    }
  }

  /// `OnHeap` spans hold no residual; `InUse` spans hold between nothing and a page.
  pub(crate) fn check(&self, idx: usize) {
    let residual = self.spans[idx].central_residual.load(Ordering::Relaxed);
    let page_size = self.page_size();
    let ok = match self.status(idx) {
      SpanStatus::OnHeap => residual == 0,
      SpanStatus::InUse => (0..=page_size as isize).contains(&residual),
    };
    if !ok {
      Violation::ResidualOutOfRange {
        span: idx,
        residual,
        page_size,
      }
      .raise();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const PAGE_LEVEL: usize = 16;

  #[test]
  fn addresses_map_to_pages() {
    let table = SpanTable::new(0x10_0000, 4, PAGE_LEVEL);
    assert_eq!(table.index_of(0x10_0000), 0);
    assert_eq!(table.index_of(0x10_ffff), 0);
    assert_eq!(table.index_of(0x11_0000), 1);
    assert_eq!(table.base_of(3), 0x13_0000);
  }

  #[test]
  fn lifecycle_tracks_residual() {
    let table = SpanTable::new(0x10_0000, 2, PAGE_LEVEL);
    table.mark_in_use(1, 6);
    assert_eq!(table.status(1), SpanStatus::InUse);
    assert_eq!(table.level(1), 6);
    assert!(table.is_idle(1, 6));
    assert!(!table.is_idle(1, 7));

    table.take_from_central(1, 64);
    assert_eq!(table.residual(1), (1 << PAGE_LEVEL) - 64);
    assert!(!table.is_idle(1, 6));

    table.give_to_central(1, 64);
    table.mark_on_heap(1);
    assert_eq!(table.status(1), SpanStatus::OnHeap);
    assert_eq!(table.residual(1), 0);
  }

  #[test]
  #[should_panic(expected = "expected status InUse, found OnHeap")]
  fn returning_a_free_page_is_fatal() {
    let table = SpanTable::new(0x10_0000, 1, PAGE_LEVEL);
    table.mark_on_heap(0);
  }

  #[test]
  #[should_panic(expected = "central residual")]
  fn residual_overflow_is_fatal() {
    let table = SpanTable::new(0x10_0000, 1, PAGE_LEVEL);
    table.mark_in_use(0, 6);
    table.give_to_central(0, 64);
  }
}
