//! The allocator façade: `alloc` and `free` over the three tiers.

use core::ptr::NonNull;

use crate::central::{Backing, CentralCache};
use crate::config::Config;
use crate::error::{AllocError, ConfigError, Violation};
use crate::free_list::Tier;
use crate::heap::PageHeap;
use crate::raw::{HeapRegion, RawMemory, align_down, align_up};
use crate::shadow::ShadowMemory;
use crate::size_class::{SizeClasses, class_size};
use crate::span::{SpanStatus, SpanTable};
use crate::stats::Snapshot;
use crate::thread_cache::{ThreadCaches, ThreadIdentity, ThreadRegistry};

/// Allocate/free interface shared by the tiered and bump allocators.
pub trait RawAlloc: Sync {
  /// Returns the start of a fresh object of at least `size` bytes.
  fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

  /// # Safety
  /// `ptr` must come from `alloc` on this allocator and must not be used afterwards.
  unsafe fn free(&self, ptr: NonNull<u8>);
}

/// Thread cache -> central cache -> page heap, with shadow-memory validation.
pub struct Allocator<I: ThreadIdentity = ThreadRegistry> {
  config: Config,
  classes: SizeClasses,
  mem: RawMemory,
  spans: SpanTable,
  heap: PageHeap,
  central: CentralCache,
  threads: ThreadCaches,
  shadow: ShadowMemory,
  identity: I,
  _region: HeapRegion,
}

impl Allocator<ThreadRegistry> {
  /// Builds an allocator over `region`, identifying threads with a fresh registry.
  pub fn new(region: HeapRegion, config: Config) -> Result<Self, ConfigError> {
    Self::with_identity(region, config, ThreadRegistry::new())
  }
}

impl<I: ThreadIdentity> Allocator<I> {
  /// Takes ownership of `region`, trims it to whole pages, and puts every page on the
  /// heap. Pages beyond `config.max_pages` are left unused.
  pub fn with_identity(region: HeapRegion, config: Config, identity: I) -> Result<Self, ConfigError> {
    config.validate()?;
    let page_size = config.page_size();

    let start = align_up(region.start(), page_size);
    let mut end = align_down(region.end(), page_size);
    if start == 0 || start >= end {
      return Err(ConfigError::RegionTooSmall {
        start: region.start(),
        end: region.end(),
        page_size,
      });
    }

    let mut pages = (end - start) / page_size;
    if pages > config.max_pages {
      tracing::warn!(pages, max_pages = config.max_pages, "heap clamped to page ceiling");
      pages = config.max_pages;
      end = start + pages * page_size;
    }

    tracing::info!(
      mib = (end - start) >> 20,
      pages,
      start = format_args!("{start:#x}"),
      end = format_args!("{end:#x}"),
      "heap ready"
    );

    let classes = SizeClasses::from_config(&config);
    let mem = RawMemory::new(start, end);
    let spans = SpanTable::new(start, pages, config.max_level);
    let heap = PageHeap::new(&mem, &spans, config.max_level);

    Ok(Self {
      classes,
      mem,
      heap,
      spans,
      central: CentralCache::new(classes, config.central_reserve, config.flush_multiplier),
      threads: ThreadCaches::new(config.max_threads, config.max_level),
      shadow: ShadowMemory::new(start, end),
      identity,
      config,
      _region: region,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn classes(&self) -> SizeClasses {
    self.classes
  }

  /// First byte of the managed, page-aligned heap.
  pub fn heap_start(&self) -> usize {
    self.mem.start()
  }

  pub fn heap_end(&self) -> usize {
    self.mem.end()
  }

  pub fn page_count(&self) -> usize {
    self.spans.len()
  }

  /// Whether the granule holding `addr` belongs to a live allocation.
  pub fn is_allocated(&self, addr: usize) -> bool {
    self.shadow.is_allocated(addr)
  }

  #[inline]
  fn backing(&self) -> Backing<'_> {
    Backing {
      heap: &self.heap,
      spans: &self.spans,
      mem: &self.mem,
    }
  }

  #[inline]
  fn current_slot(&self) -> usize {
    match self.identity.current_thread_id() {
      Some(id) => id,
      None => Violation::UnidentifiedCaller.raise(),
    }
  }

  pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let Some(level) = self.classes.level_of(size) else {
      tracing::trace!(size, "allocated memory at NULL: no size class");
      return Err(AllocError::NoSizeClass { size });
    };
    let slot = self.current_slot();

    let addr = self.threads.with(slot, |cache| -> Result<usize, AllocError> {
      let local = cache.list(level);
      if local.is_empty() {
        self.central.acquire(level, local, self.backing())?;
      }
      match local.pop(&self.mem) {
        Some(addr) => Ok(addr),
        None => Violation::FreeListLength {
          tier: Tier::Thread.as_str(),
          level,
          expected: local.len(),
          found: 0,
        }
        .raise(),
      }
    });
    let addr = match addr {
      Ok(addr) => addr,
      Err(err) => {
        tracing::trace!(size, level, %err, "allocated memory at NULL");
        return Err(err);
      }
    };

    self.shadow.mark_allocated(addr, class_size(level));
    tracing::trace!(
      addr = format_args!("{addr:#x}"),
      size,
      span = self.spans.index_of(addr),
      "allocated"
    );
    // SAFETY: `addr` passed the heap bounds check in `pop`, and the heap never starts at 0.
    Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
  }

  /// Returns an object to the calling thread's cache, flushing to the central cache
  /// when the local list grows past its threshold.
  ///
  /// Addresses that are outside the heap, not the start of an object, or not currently
  /// allocated (double free) halt with a [`Violation`].
  ///
  /// # Safety
  /// `ptr` must come from [`Allocator::alloc`] on this allocator and must not be used
  /// afterwards.
  pub unsafe fn free(&self, ptr: NonNull<u8>) {
    let addr = ptr.as_ptr() as usize;
    self.mem.check(addr);

    let idx = self.spans.index_of(addr);
    self.spans.expect_status(idx, SpanStatus::InUse);
    let level = self.spans.level(idx);
    let size = class_size(level);
    if (addr - self.spans.base_of(idx)) % size != 0 {
      Violation::Misaligned {
        addr,
        class_size: size,
      }
      .raise();
    }
    tracing::trace!(addr = format_args!("{addr:#x}"), size, span = idx, "free");

    self.shadow.mark_free(addr, size);

    let slot = self.current_slot();
    self.threads.with(slot, |cache| {
      let local = cache.list(level);
      local.push(&self.mem, addr);
      self.central.release(level, local, self.backing());
    });
  }

  /// Free-list counts of every tier. `&mut self` guarantees no allocation is in flight.
  pub fn snapshot(&mut self) -> Snapshot {
    let levels = self.config.max_level + 1;
    let thread: Vec<Vec<usize>> = self
      .threads
      .iter_mut()
      .map(|cache| (0..levels).map(|level| cache.len(level)).collect())
      .collect();
    let central: Vec<usize> = (0..levels).map(|level| self.central.len(level)).collect();

    Snapshot {
      min_level: self.config.min_level,
      max_level: self.config.max_level,
      thread,
      central,
      free_pages: self.heap.free_pages(),
      page_size: self.config.page_size(),
      live_bytes: self.shadow.live_bytes(),
      heap_bytes: self.mem.end() - self.mem.start(),
    }
  }

  /// Runs every structural check and halts on the first broken invariant: list lengths
  /// and bounds in all tiers, span status and residuals, per-level residual sums,
  /// shadow state of free objects, and byte conservation.
  pub fn check_invariants(&mut self) {
    let mem = self.mem;
    let spans = &self.spans;
    let shadow = &self.shadow;

    self.heap.validate(&mem);
    self.heap.for_each_page(&mem, |page| {
      spans.expect_status(spans.index_of(page), SpanStatus::OnHeap);
    });

    for idx in 0..spans.len() {
      spans.check(idx);
    }

    for level in self.classes.levels() {
      self.central.validate(level, &mem);
      self
        .central
        .for_each(level, &mem, |addr| check_free_object(spans, shadow, level, addr));

      let residual: usize = (0..spans.len())
        .filter(|&idx| spans.status(idx) == SpanStatus::InUse && spans.level(idx) == level)
        .map(|idx| spans.residual(idx))
        .sum();
      let central_bytes = self.central.len(level) * class_size(level);
      if residual != central_bytes {
        Violation::Accounting {
          what: "span residuals vs central bytes",
          expected: central_bytes,
          found: residual,
        }
        .raise();
      }
    }

    for cache in self.threads.iter_mut() {
      for level in self.classes.levels() {
        let list = cache.list(level);
        list.validate(&mem, Tier::Thread, level);
        list.for_each(&mem, |addr| check_free_object(spans, shadow, level, addr));
      }
    }

    let snap = self.snapshot();
    if snap.accounted_bytes() != snap.heap_bytes {
      Violation::Accounting {
        what: "bytes across tiers vs heap size",
        expected: snap.heap_bytes,
        found: snap.accounted_bytes(),
      }
      .raise();
    }
  }
}

/// A free object of `level` sits in a span split into that level and is not live.
fn check_free_object(spans: &SpanTable, shadow: &ShadowMemory, level: usize, addr: usize) {
  let idx = spans.index_of(addr);
  spans.expect_status(idx, SpanStatus::InUse);
  if spans.level(idx) != level || (addr - spans.base_of(idx)) % class_size(level) != 0 {
    Violation::Misaligned {
      addr,
      class_size: class_size(level),
    }
    .raise();
  }
  if shadow.is_allocated(addr) {
    Violation::ShadowMismatch {
      addr,
      len: class_size(level),
      at: addr,
      expected: crate::shadow::SHADOW_FREE,
      found: crate::shadow::SHADOW_ALLOCATED,
    }
    .raise();
  }
}

impl<I: ThreadIdentity> RawAlloc for Allocator<I> {
  fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    Allocator::alloc(self, size)
  }

  unsafe fn free(&self, ptr: NonNull<u8>) {
    unsafe { Allocator::free(self, ptr) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const PAGE_LEVEL: usize = 14;

  fn small(pages: usize) -> Allocator {
    let config = Config::default().with_max_level(PAGE_LEVEL).with_max_threads(4);
    let region = HeapRegion::map(pages << PAGE_LEVEL, 1 << PAGE_LEVEL).unwrap();
    Allocator::new(region, config).unwrap()
  }

  struct Anonymous;

  impl ThreadIdentity for Anonymous {
    fn current_thread_id(&self) -> Option<usize> {
      None
    }
  }

  #[test]
  fn region_is_trimmed_to_pages() {
    let config = Config::default().with_max_level(PAGE_LEVEL);
    let region = HeapRegion::map(3 << PAGE_LEVEL, 1 << 12).unwrap();
    let unaligned = region.start() % (1 << PAGE_LEVEL) != 0;
    let alloc = Allocator::new(region, config).unwrap();
    assert_eq!(alloc.heap_start() % (1 << PAGE_LEVEL), 0);
    assert_eq!(alloc.page_count(), if unaligned { 2 } else { 3 });
  }

  #[test]
  fn region_is_clamped_to_page_ceiling() {
    let config = Config::default().with_max_level(PAGE_LEVEL).with_max_pages(2);
    let region = HeapRegion::map(5 << PAGE_LEVEL, 1 << PAGE_LEVEL).unwrap();
    let alloc = Allocator::new(region, config).unwrap();
    assert_eq!(alloc.page_count(), 2);
    assert_eq!(alloc.heap_end() - alloc.heap_start(), 2 << PAGE_LEVEL);
  }

  #[test]
  fn tiny_region_is_rejected() {
    let config = Config::default().with_max_level(PAGE_LEVEL);
    let region = HeapRegion::map(1 << 12, 1 << 12).unwrap();
    assert!(matches!(
      Allocator::new(region, config),
      Err(ConfigError::RegionTooSmall { .. })
    ));
  }

  #[test]
  fn alloc_marks_shadow_and_free_clears_it() {
    let mut alloc = small(2);
    let p = alloc.alloc(100).unwrap();
    let addr = p.as_ptr() as usize;
    assert!(alloc.is_allocated(addr));
    assert!(alloc.is_allocated(addr + 120));
    assert_eq!(addr % 128, 0);

    unsafe { alloc.free(p) };
    assert!(!alloc.is_allocated(addr));
    alloc.check_invariants();
  }

  #[test]
  fn memory_is_usable() {
    let alloc = small(2);
    let p = alloc.alloc(256).unwrap();
    unsafe {
      core::ptr::write_bytes(p.as_ptr(), 0xab, 256);
      assert_eq!(*p.as_ptr().add(255), 0xab);
      alloc.free(p);
    }
  }

  #[test]
  fn classless_sizes_fail_softly() {
    let mut alloc = small(1);
    assert_eq!(alloc.alloc(0), Err(AllocError::NoSizeClass { size: 0 }));
    let too_big = (1 << PAGE_LEVEL) + 1;
    assert_eq!(
      alloc.alloc(too_big),
      Err(AllocError::NoSizeClass { size: too_big })
    );
    assert_eq!(alloc.snapshot().free_pages, 1);
  }

  #[test]
  #[should_panic(expected = "not the start of a 64-byte object")]
  fn interior_pointer_free_is_fatal() {
    let alloc = small(1);
    let p = alloc.alloc(64).unwrap();
    let interior = unsafe { NonNull::new_unchecked(p.as_ptr().add(8)) };
    unsafe { alloc.free(interior) };
  }

  #[test]
  #[should_panic(expected = "expected status InUse, found OnHeap")]
  fn free_into_unused_page_is_fatal() {
    let alloc = small(2);
    let p = alloc.alloc(64).unwrap();
    let other_page = unsafe { NonNull::new_unchecked(p.as_ptr().add(1 << PAGE_LEVEL)) };
    unsafe { alloc.free(other_page) };
  }

  #[test]
  #[should_panic(expected = "unidentified caller")]
  fn unidentified_caller_is_fatal() {
    let config = Config::default().with_max_level(PAGE_LEVEL);
    let region = HeapRegion::map(1 << PAGE_LEVEL, 1 << PAGE_LEVEL).unwrap();
    let alloc = Allocator::with_identity(region, config, Anonymous).unwrap();
    let _ = alloc.alloc(8);
  }

  #[test]
  #[should_panic(expected = "exceeds the configured maximum of 1 slots")]
  fn too_many_threads_is_a_configuration_error() {
    let config = Config::default().with_max_level(PAGE_LEVEL).with_max_threads(1);
    let region = HeapRegion::map(1 << PAGE_LEVEL, 1 << PAGE_LEVEL).unwrap();
    let alloc = Allocator::new(region, config).unwrap();
    alloc.alloc(8).unwrap();
    std::thread::scope(|s| {
      let worker = s.spawn(|| {
        let _ = alloc.alloc(8);
      });
      if let Err(panic) = worker.join() {
        std::panic::resume_unwind(panic);
      }
    });
  }
}
