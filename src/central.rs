use parking_lot::Mutex;

use crate::error::{AllocError, Violation};
use crate::free_list::{FreeList, Tier};
use crate::heap::PageHeap;
use crate::raw::RawMemory;
use crate::size_class::{SizeClasses, class_size};
use crate::span::SpanTable;

/// The lower tiers every central operation reaches into.
#[derive(Clone, Copy)]
pub(crate) struct Backing<'a> {
  pub heap: &'a PageHeap,
  pub spans: &'a SpanTable,
  pub mem: &'a RawMemory,
}

/// Middle tier: one shared free list per level, each behind its own lock.
///
/// Lock order: a central lock may take the heap lock inside it, never the reverse.
pub(crate) struct CentralCache {
  lists: Box<[Mutex<FreeList>]>,
  classes: SizeClasses,
  reserve: usize,
  flush_multiplier: usize,
}

impl CentralCache {
  pub(crate) fn new(classes: SizeClasses, reserve: usize, flush_multiplier: usize) -> Self {
    Self {
      lists: (0..=classes.max_level())
        .map(|_| Mutex::new(FreeList::new()))
        .collect(),
      classes,
      reserve,
      flush_multiplier,
    }
  }

  /// Moves one bulk batch of `level` objects into `local`, refilling from the heap when
  /// the central list is short.
  pub(crate) fn acquire(
    &self,
    level: usize,
    local: &mut FreeList,
    tiers: Backing<'_>,
  ) -> Result<(), AllocError> {
    let n = self.classes.move_count(level);
    let size = class_size(level);
    let spans = tiers.spans;

    let mut central = self.lists[level].lock();
    if central.len() < n {
      tiers
        .heap
        .refill_one_page(level, &mut central, spans, tiers.mem)?;
    }

    central.splice_into(local, n, tiers.mem, (Tier::Central, level), |addr| {
      spans.take_from_central(spans.index_of(addr), size)
    });
    Ok(())
  }

  /// Flushes one batch from `local` once it reaches the local threshold, then tries to
  /// hand idle pages back to the heap. Returns whether a flush happened.
  pub(crate) fn release(&self, level: usize, local: &mut FreeList, tiers: Backing<'_>) -> bool {
    let n = self.classes.move_count(level);
    if local.len() < self.flush_multiplier * n {
      return false;
    }
    let size = class_size(level);
    let spans = tiers.spans;

    let mut central = self.lists[level].lock();
    local.splice_into(&mut central, n, tiers.mem, (Tier::Thread, level), |addr| {
      spans.give_to_central(spans.index_of(addr), size)
    });
    let returned = self.compact_to_heap(level, &mut central, tiers);
    if returned > 0 {
      tracing::debug!(level, returned, "idle pages returned to heap");
    }
    true
  }

  /// Returns idle pages of `level` beyond the first `reserve` to the heap. A page is idle
  /// when all of its objects sit in the central list.
  fn compact_to_heap(&self, level: usize, central: &mut FreeList, tiers: Backing<'_>) -> usize {
    let n = self.classes.move_count(level);
    // Fewer nodes than reserve + 1 pages: no idle page can be in excess.
    if central.len() <= self.reserve * n {
      return 0;
    }

    let spans = tiers.spans;
    let mut idle = 0;
    let mut returned = 0;
    for idx in 0..spans.len() {
      if !spans.is_idle(idx, level) {
        continue;
      }
      if idle < self.reserve {
        idle += 1;
        continue;
      }

      let removed = central.remove_where(tiers.mem, |addr| spans.index_of(addr) == idx);
      if removed != n {
        Violation::CompactionCount {
          span: idx,
          level,
          expected: n,
          found: removed,
        }
        .raise();
      }
      tiers.heap.return_page(idx, spans, tiers.mem);
      returned += 1;
    }
    returned
  }

  pub(crate) fn len(&self, level: usize) -> usize {
    self.lists[level].lock().len()
  }

  pub(crate) fn validate(&self, level: usize, mem: &RawMemory) {
    self.lists[level].lock().validate(mem, Tier::Central, level);
  }

  pub(crate) fn for_each(&self, level: usize, mem: &RawMemory, f: impl FnMut(usize)) {
    self.lists[level].lock().for_each(mem, f);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::raw::HeapRegion;
  use crate::span::SpanStatus;

  const PAGE_LEVEL: usize = 12;
  const LEVEL: usize = 8;
  // 2^(12 - 8)
  const MOVE: usize = 16;

  struct Fixture {
    _region: HeapRegion,
    mem: RawMemory,
    spans: SpanTable,
    heap: PageHeap,
    central: CentralCache,
  }

  impl Fixture {
    fn new(pages: usize, reserve: usize) -> Self {
      let region = HeapRegion::map(pages << PAGE_LEVEL, 1 << PAGE_LEVEL).unwrap();
      let mem = RawMemory::new(region.start(), region.end());
      let spans = SpanTable::new(region.start(), pages, PAGE_LEVEL);
      let heap = PageHeap::new(&mem, &spans, PAGE_LEVEL);
      let central = CentralCache::new(SizeClasses::new(3, PAGE_LEVEL), reserve, 2);
      Self {
        _region: region,
        mem,
        spans,
        heap,
        central,
      }
    }

    fn tiers(&self) -> Backing<'_> {
      Backing {
        heap: &self.heap,
        spans: &self.spans,
        mem: &self.mem,
      }
    }
  }

  #[test]
  fn acquire_pulls_one_page_in_one_move() {
    let fx = Fixture::new(2, 4);
    let mut local = FreeList::new();

    fx.central.acquire(LEVEL, &mut local, fx.tiers()).unwrap();

    assert_eq!(local.len(), MOVE);
    assert_eq!(fx.central.len(LEVEL), 0);
    assert_eq!(fx.heap.free_pages(), 1);
    assert_eq!(fx.spans.residual(0), 0);
  }

  #[test]
  fn acquire_fails_when_heap_is_dry() {
    let fx = Fixture::new(1, 4);
    let mut local = FreeList::new();
    fx.central.acquire(LEVEL, &mut local, fx.tiers()).unwrap();
    assert_eq!(
      fx.central.acquire(LEVEL, &mut local, fx.tiers()),
      Err(AllocError::OutOfMemory { level: LEVEL })
    );
    assert_eq!(local.len(), MOVE);
  }

  #[test]
  fn release_waits_for_threshold() {
    let fx = Fixture::new(2, 4);
    let mut local = FreeList::new();
    fx.central.acquire(LEVEL, &mut local, fx.tiers()).unwrap();
    assert!(!fx.central.release(LEVEL, &mut local, fx.tiers()));

    fx.central.acquire(LEVEL, &mut local, fx.tiers()).unwrap();
    assert_eq!(local.len(), 2 * MOVE);
    assert!(fx.central.release(LEVEL, &mut local, fx.tiers()));
    assert_eq!(local.len(), MOVE);
    assert_eq!(fx.central.len(LEVEL), MOVE);
  }

  #[test]
  fn idle_pages_beyond_reserve_go_back_to_heap() {
    let fx = Fixture::new(3, 1);
    let mut local = FreeList::new();
    for _ in 0..3 {
      fx.central.acquire(LEVEL, &mut local, fx.tiers()).unwrap();
    }
    assert_eq!(fx.heap.free_pages(), 0);

    // Flushes stop at one batch left behind; the two flushed pages are both idle.
    while fx.central.release(LEVEL, &mut local, fx.tiers()) {}

    assert_eq!(local.len(), MOVE);
    assert_eq!(fx.heap.free_pages(), 1);
    assert_eq!(fx.central.len(LEVEL), MOVE);
    let on_heap = (0..3)
      .filter(|&i| fx.spans.status(i) == SpanStatus::OnHeap)
      .count();
    assert_eq!(on_heap, 1);
    fx.central.validate(LEVEL, &fx.mem);
    fx.heap.validate(&fx.mem);
  }

  #[test]
  fn reserve_keeps_idle_pages_central() {
    let fx = Fixture::new(3, 4);
    let mut local = FreeList::new();
    for _ in 0..3 {
      fx.central.acquire(LEVEL, &mut local, fx.tiers()).unwrap();
    }
    while fx.central.release(LEVEL, &mut local, fx.tiers()) {}
    assert_eq!(fx.heap.free_pages(), 0);
    assert_eq!(fx.central.len(LEVEL), 2 * MOVE);
  }
}
