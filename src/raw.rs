//! Raw memory: the heap region and the link words stored inside free objects.
//!
//! This is the only module that turns addresses into pointers. Everything above it
//! handles plain `usize` addresses; an address is owned either by exactly one free list
//! or by exactly one live allocation, which the shadow memory enforces.

use core::ptr::null_mut;

use crate::GRANULE;
use crate::error::{ConfigError, Violation};

/// End-of-list marker. No region starts at address zero.
pub(crate) const NULL: usize = 0;

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Rounds `x` down to a multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}

// =============================================================================
// Heap region
// =============================================================================

/// A contiguous byte range handed to an allocator at construction.
pub struct HeapRegion {
  start: usize,
  end: usize,
  /// Base and length of our own mapping, unmapped on drop.
  mapping: Option<(*mut u8, usize)>,
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
  /// Maps `bytes` of anonymous memory starting at an `align` boundary.
  pub fn map(bytes: usize, align: usize) -> Result<Self, ConfigError> {
    if !align.is_power_of_two() {
      return Err(ConfigError::InvalidAlignment { align });
    }
    // Over-allocate for alignment padding.
    let total = bytes.checked_add(align).ok_or(ConfigError::MapFailed {
      bytes,
      source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
    })?;

    let raw = unsafe { os_mmap(total) };
    if raw.is_null() {
      return Err(ConfigError::MapFailed {
        bytes: total,
        source: std::io::Error::last_os_error(),
      });
    }

    let start = align_up(raw as usize, align);
    Ok(Self {
      start,
      end: start + bytes,
      mapping: Some((raw, total)),
    })
  }

  /// Adopts caller memory. The region is not released on drop.
  ///
  /// # Safety
  /// `start` must be non-null. `[start, end)` must be readable and writable, and nothing
  /// else may touch it for the lifetime of the allocator built on it.
  pub unsafe fn from_raw(start: *mut u8, end: *mut u8) -> Self {
    Self {
      start: start as usize,
      end: end as usize,
      mapping: None,
    }
  }

  #[inline]
  pub fn start(&self) -> usize {
    self.start
  }

  #[inline]
  pub fn end(&self) -> usize {
    self.end
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.end.saturating_sub(self.start)
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Drop for HeapRegion {
  fn drop(&mut self) {
    if let Some((base, size)) = self.mapping.take() {
      unsafe { os_munmap(base, size) };
    }
  }
}

// =============================================================================
// Link words
// =============================================================================

/// Accessor for the page-aligned part of a region that the allocator manages.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawMemory {
  start: usize,
  end: usize,
}

impl RawMemory {
  /// Callers guarantee `[start, end)` lies inside a region the allocator owns.
  pub(crate) const fn new(start: usize, end: usize) -> Self {
    Self { start, end }
  }

  #[inline]
  pub(crate) fn start(&self) -> usize {
    self.start
  }

  #[inline]
  pub(crate) fn end(&self) -> usize {
    self.end
  }

  #[inline]
  pub(crate) fn contains(&self, addr: usize) -> bool {
    addr >= self.start && addr < self.end
  }

  /// Halts unless `addr` is a granule-aligned address inside the heap.
  #[inline]
  pub(crate) fn check(&self, addr: usize) {
    if !self.contains(addr) {
      Violation::OutOfBounds {
        addr,
        start: self.start,
        end: self.end,
      }
      .raise();
    }
    if addr % GRANULE != 0 {
      Violation::Misaligned {
        addr,
        class_size: GRANULE,
      }
      .raise();
    }
  }

  /// Link stored in the first word of the free object at `addr`.
  #[inline]
  pub(crate) fn next(&self, addr: usize) -> usize {
    self.check(addr);
    // SAFETY: `addr` is an aligned address inside the owned heap and belongs to a free
    // list, so no live allocation overlaps the word.
    unsafe { (addr as *const usize).read() }
  }

  #[inline]
  pub(crate) fn link(&self, addr: usize, next: usize) {
    self.check(addr);
    // SAFETY: as in `next`; the caller's list owns the object at `addr`.
    unsafe { (addr as *mut usize).write(next) }
  }
}
