use parking_lot::Mutex;

use crate::GRANULE;
use crate::error::Violation;

pub const SHADOW_FREE: u8 = 0x00;
pub const SHADOW_ALLOCATED: u8 = 0xff;

/// One byte per granule of heap: `0xff` while the granule belongs to a live allocation,
/// `0x00` otherwise. Used only to validate alloc/free, never to pick addresses.
pub(crate) struct ShadowMemory {
  bytes: Mutex<Box<[u8]>>,
  start: usize,
  end: usize,
}

impl ShadowMemory {
  pub(crate) fn new(start: usize, end: usize) -> Self {
    let granules = (end - start) / GRANULE;
    Self {
      bytes: Mutex::new(vec![SHADOW_FREE; granules].into_boxed_slice()),
      start,
      end,
    }
  }

  /// Marks `[addr, addr + len)` allocated. Every granule must be free.
  pub(crate) fn mark_allocated(&self, addr: usize, len: usize) {
    self.transition(addr, len, SHADOW_FREE, SHADOW_ALLOCATED);
  }

  /// Marks `[addr, addr + len)` free. Every granule must be allocated, so a double free
  /// or a free of a never-allocated range halts here.
  pub(crate) fn mark_free(&self, addr: usize, len: usize) {
    self.transition(addr, len, SHADOW_ALLOCATED, SHADOW_FREE);
  }

  fn transition(&self, addr: usize, len: usize, expected: u8, next: u8) {
    let range = self.granules(addr, len);
    let mut bytes = self.bytes.lock();
    let shadow = &mut bytes[range];
    if let Some(pos) = shadow.iter().position(|&b| b != expected) {
      let found = shadow[pos];
      Violation::ShadowMismatch {
        addr,
        len,
        at: addr + pos * GRANULE,
        expected,
        found,
      }
      .raise();
    }
    shadow.fill(next);
  }

  fn granules(&self, addr: usize, len: usize) -> core::ops::Range<usize> {
    let end = addr.saturating_add(len);
    if addr < self.start || end > self.end {
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
    let first = (addr - self.start) / GRANULE;
    first..first + len.div_ceil(GRANULE)
  }

  pub(crate) fn is_allocated(&self, addr: usize) -> bool {
    if addr < self.start || addr >= self.end {
      return false;
    }
    self.bytes.lock()[(addr - self.start) / GRANULE] == SHADOW_ALLOCATED
  }

  pub(crate) fn live_bytes(&self) -> usize {
    self
      .bytes
      .lock()
      .iter()
      .filter(|&&b| b == SHADOW_ALLOCATED)
      .count()
      * GRANULE
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const START: usize = 0x1_0000;

  #[test]
  fn alloc_then_free_restores_state() {
    let shadow = ShadowMemory::new(START, START + 4096);
    shadow.mark_allocated(START + 64, 64);
    assert!(shadow.is_allocated(START + 64));
    assert!(shadow.is_allocated(START + 120));
    assert!(!shadow.is_allocated(START + 128));
    assert_eq!(shadow.live_bytes(), 64);

    shadow.mark_free(START + 64, 64);
    assert_eq!(shadow.live_bytes(), 0);
  }

  #[test]
  #[should_panic(expected = "expected 0xff, found 0x00")]
  fn double_free_is_fatal() {
    let shadow = ShadowMemory::new(START, START + 4096);
    shadow.mark_allocated(START, 64);
    shadow.mark_free(START, 64);
    shadow.mark_free(START, 64);
  }

  #[test]
  #[should_panic(expected = "expected 0x00, found 0xff")]
  fn overlapping_allocation_is_fatal() {
    let shadow = ShadowMemory::new(START, START + 4096);
    shadow.mark_allocated(START + 32, 32);
    shadow.mark_allocated(START, 64);
  }

  #[test]
  #[should_panic(expected = "outside heap")]
  fn range_past_end_is_fatal() {
    let shadow = ShadowMemory::new(START, START + 4096);
    shadow.mark_allocated(START + 4096 - 8, 16);
  }
}
