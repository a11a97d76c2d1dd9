use core::ptr::NonNull;

use parking_lot::Mutex;

use crate::allocator::RawAlloc;
use crate::config::Config;
use crate::error::{AllocError, ConfigError};
use crate::raw::{HeapRegion, align_up};
use crate::size_class::{SizeClasses, class_size};

/// Simple mode: class-aligned bump allocation that never reuses memory.
///
/// Useful as a baseline and for bring-up before the tiered allocator is trusted.
/// `free` does nothing.
pub struct BumpAllocator {
  top: Mutex<usize>,
  start: usize,
  end: usize,
  classes: SizeClasses,
  _region: HeapRegion,
}

impl BumpAllocator {
  pub fn new(region: HeapRegion, config: Config) -> Result<Self, ConfigError> {
    config.validate()?;
    if region.is_empty() {
      return Err(ConfigError::RegionTooSmall {
        start: region.start(),
        end: region.end(),
        page_size: config.page_size(),
      });
    }
    Ok(Self {
      top: Mutex::new(region.start()),
      start: region.start(),
      end: region.end(),
      classes: SizeClasses::from_config(&config),
      _region: region,
    })
  }

  pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let level = self
      .classes
      .level_of(size)
      .ok_or(AllocError::NoSizeClass { size })?;

    let mut top = self.top.lock();
    let addr = align_up(*top, class_size(level));
    match addr.checked_add(size) {
      Some(next) if next <= self.end => {
        *top = next;
        tracing::trace!(addr = format_args!("{addr:#x}"), size, "bump allocated");
        // SAFETY: `addr` is at or above the region start, which is non-null.
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
      }
      _ => Err(AllocError::OutOfMemory { level }),
    }
  }

  /// Bytes between the region start and the current top.
  pub fn used(&self) -> usize {
    *self.top.lock() - self.start
  }
}

impl RawAlloc for BumpAllocator {
  fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    BumpAllocator::alloc(self, size)
  }

  unsafe fn free(&self, _ptr: NonNull<u8>) {}
}
