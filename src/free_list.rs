use crate::error::Violation;
use crate::raw::{NULL, RawMemory};

/// Which tier a list belongs to, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tier {
  Thread,
  Central,
  Heap,
}

impl Tier {
  pub(crate) const fn as_str(self) -> &'static str {
    match self {
      Tier::Thread => "thread",
      Tier::Central => "central",
      Tier::Heap => "heap",
    }
  }
}

/// Intrusive singly-linked list of free objects. Each node's link lives in the first
/// word of the object itself; `count` always equals the list length.
#[derive(Debug)]
pub(crate) struct FreeList {
  head: usize,
  count: usize,
}

impl FreeList {
  pub(crate) const fn new() -> Self {
    Self {
      head: NULL,
      count: 0,
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.count
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.head == NULL
  }

  #[inline]
  pub(crate) fn push(&mut self, mem: &RawMemory, addr: usize) {
    mem.link(addr, self.head);
    self.head = addr;
    self.count += 1;
  }

  /// Halts if `count` has drifted from the list it describes.
  #[inline]
  pub(crate) fn pop(&mut self, mem: &RawMemory) -> Option<usize> {
    if self.head == NULL {
      if self.count != 0 {
        self.count_drift(0);
      }
      return None;
    }
    if self.count == 0 {
      self.count_drift(1);
    }
    let addr = self.head;
    self.head = mem.next(addr);
    self.count -= 1;
    Some(addr)
  }

  #[cold]
  fn count_drift(&self, found: usize) -> ! {
    Violation::Accounting {
      what: "free list count vs nodes at head",
      expected: self.count,
      found,
    }
    .raise()
  }

  /// Detaches the first `n` nodes and prepends them to `to`, calling `visit` on each.
  pub(crate) fn splice_into(
    &mut self,
    to: &mut FreeList,
    n: usize,
    mem: &RawMemory,
    (tier, level): (Tier, usize),
    mut visit: impl FnMut(usize),
  ) {
    if n == 0 {
      return;
    }
    if self.count < n {
      Violation::Accounting {
        what: "bulk move larger than source list",
        expected: n,
        found: self.count,
      }
      .raise();
    }
    #[cfg(any(debug_assertions, feature = "debug-tripwire"))]
    self.validate(mem, tier, level);

    let first = self.head;
    let mut last = NULL;
    let mut cur = first;
    for walked in 0..n {
      if cur == NULL {
        Violation::FreeListLength {
          tier: tier.as_str(),
          level,
          expected: self.count,
          found: walked,
        }
        .raise();
      }
      visit(cur);
      last = cur;
      cur = mem.next(cur);
    }

    self.head = cur;
    self.count -= n;
    mem.link(last, to.head);
    to.head = first;
    to.count += n;

    #[cfg(any(debug_assertions, feature = "debug-tripwire"))]
    to.validate(mem, tier, level);
  }

  /// Unlinks every node matching `pred`. Returns how many were removed.
  pub(crate) fn remove_where(&mut self, mem: &RawMemory, mut pred: impl FnMut(usize) -> bool) -> usize {
    let mut removed = 0;

    while self.head != NULL && pred(self.head) {
      self.head = mem.next(self.head);
      removed += 1;
    }

    let mut prev = self.head;
    while prev != NULL {
      let next = mem.next(prev);
      if next != NULL && pred(next) {
        mem.link(prev, mem.next(next));
        removed += 1;
      } else {
        prev = next;
      }
    }

    self.count -= removed;
    removed
  }

  /// Walks the whole list: every node in bounds and `count` equal to the length.
  pub(crate) fn validate(&self, mem: &RawMemory, tier: Tier, level: usize) {
    let mut walked = 0;
    let mut cur = self.head;
    while cur != NULL {
      cur = mem.next(cur);
      walked += 1;
      if walked > self.count {
        break;
      }
    }
    if walked != self.count {
      Violation::FreeListLength {
        tier: tier.as_str(),
        level,
        expected: self.count,
        found: walked,
      }
      .raise();
    }
  }

  /// Calls `f` on every node without modifying the list.
  pub(crate) fn for_each(&self, mem: &RawMemory, mut f: impl FnMut(usize)) {
    let mut cur = self.head;
    while cur != NULL {
      f(cur);
      cur = mem.next(cur);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::raw::HeapRegion;

  fn setup() -> (HeapRegion, RawMemory) {
    let region = HeapRegion::map(1 << 16, 1 << 16).unwrap();
    let mem = RawMemory::new(region.start(), region.end());
    (region, mem)
  }

  fn list_of(mem: &RawMemory, base: usize, n: usize, stride: usize) -> FreeList {
    let mut list = FreeList::new();
    for i in (0..n).rev() {
      list.push(mem, base + i * stride);
    }
    list
  }

  #[test]
  fn push_pop_is_lifo() {
    let (region, mem) = setup();
    let mut list = list_of(&mem, region.start(), 3, 64);
    assert_eq!(list.len(), 3);
    assert_eq!(list.pop(&mem), Some(region.start()));
    assert_eq!(list.pop(&mem), Some(region.start() + 64));
    assert_eq!(list.pop(&mem), Some(region.start() + 128));
    assert_eq!(list.pop(&mem), None);
    assert!(list.is_empty());
  }

  #[test]
  fn splice_moves_prefix_and_visits_each_node() {
    let (region, mem) = setup();
    let mut from = list_of(&mem, region.start(), 5, 64);
    let mut to = list_of(&mem, region.start() + 4096, 2, 64);

    let mut seen = Vec::new();
    from.splice_into(&mut to, 3, &mem, (Tier::Central, 6), |a| seen.push(a));

    assert_eq!(seen, vec![region.start(), region.start() + 64, region.start() + 128]);
    assert_eq!(from.len(), 2);
    assert_eq!(to.len(), 5);
    from.validate(&mem, Tier::Central, 6);
    to.validate(&mem, Tier::Thread, 6);
    assert_eq!(to.pop(&mem), Some(region.start()));
  }

  #[test]
  fn remove_where_unlinks_head_and_interior() {
    let (region, mem) = setup();
    let mut list = list_of(&mem, region.start(), 8, 64);
    let removed = list.remove_where(&mem, |a| (a - region.start()) / 64 % 2 == 0);
    assert_eq!(removed, 4);
    assert_eq!(list.len(), 4);
    list.validate(&mem, Tier::Central, 6);

    let mut left = Vec::new();
    list.for_each(&mem, |a| left.push((a - region.start()) / 64));
    assert_eq!(left, vec![1, 3, 5, 7]);
  }

  #[test]
  #[should_panic(expected = "walked 2 nodes")]
  fn validate_catches_count_drift() {
    let (region, mem) = setup();
    let mut list = list_of(&mem, region.start(), 2, 64);
    list.count = 3;
    list.validate(&mem, Tier::Thread, 6);
  }

  #[test]
  #[should_panic(expected = "free list count vs nodes at head")]
  fn pop_catches_count_drift() {
    let (region, mem) = setup();
    let mut list = list_of(&mem, region.start(), 1, 64);
    list.count = 2;
    assert_eq!(list.pop(&mem), Some(region.start()));
    list.pop(&mem);
  }

  #[cfg(debug_assertions)]
  #[test]
  #[should_panic(expected = "walked 2 nodes")]
  fn splice_walks_the_source_in_debug_builds() {
    let (region, mem) = setup();
    let mut from = list_of(&mem, region.start(), 2, 64);
    from.count = 3;
    let mut to = FreeList::new();
    from.splice_into(&mut to, 1, &mem, (Tier::Thread, 6), |_| {});
  }

  #[test]
  #[should_panic(expected = "bulk move larger")]
  fn oversized_splice_is_fatal() {
    let (region, mem) = setup();
    let mut from = list_of(&mem, region.start(), 2, 64);
    let mut to = FreeList::new();
    from.splice_into(&mut to, 3, &mem, (Tier::Thread, 6), |_| {});
  }
}
