use core::cell::{RefCell, UnsafeCell};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::error::Violation;
use crate::free_list::FreeList;

// =============================================================================
// Thread identity
// =============================================================================

/// Supplies the small integer identity of the calling execution context.
///
/// Ids index the thread-cache slots directly, so two contexts running at the same time
/// must never report the same id. `None` means the context cannot be identified.
pub trait ThreadIdentity: Send + Sync {
  fn current_thread_id(&self) -> Option<usize>;
}

/// Default identity: hands each OS thread the lowest free slot on first use.
///
/// A slot is leased to its thread until the thread exits, when a thread-local guard
/// gives it back. `max_threads` therefore caps threads running at once, not threads ever
/// started. The slot's cache stays with the slot, so the next thread to lease it inherits
/// whatever the previous owner left there. A thread arriving while every slot is held
/// gets an id past the end, which the allocator rejects as a configuration error.
pub struct ThreadRegistry {
  shared: Arc<Owners>,
}

struct Owners {
  slots: Mutex<Vec<Option<ThreadId>>>,
}

impl Owners {
  fn release(&self, slot: usize) {
    let mut slots = self.slots.lock();
    if let Some(owner) = slots.get_mut(slot) {
      *owner = None;
    }
    tracing::debug!(slot, "released thread slot");
  }
}

/// Held in thread-local storage; returns the slot when the thread exits.
struct Lease {
  owners: Weak<Owners>,
  slot: usize,
}

impl Drop for Lease {
  fn drop(&mut self) {
    if let Some(owners) = self.owners.upgrade() {
      owners.release(self.slot);
    }
  }
}

thread_local! {
  static LEASES: RefCell<Vec<Lease>> = const { RefCell::new(Vec::new()) };
}

impl ThreadRegistry {
  pub fn new() -> Self {
    Self {
      shared: Arc::new(Owners {
        slots: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Number of slots currently leased to live threads.
  pub fn active(&self) -> usize {
    self.shared.slots.lock().iter().filter(|s| s.is_some()).count()
  }

  fn leased(&self) -> Option<usize> {
    let owners = Arc::as_ptr(&self.shared);
    LEASES
      .try_with(|leases| {
        leases
          .borrow()
          .iter()
          .find(|l| Weak::as_ptr(&l.owners) == owners)
          .map(|l| l.slot)
      })
      .ok()
      .flatten()
  }

  fn claim(&self, me: ThreadId) -> usize {
    let mut slots = self.shared.slots.lock();
    if let Some(slot) = slots.iter().position(|&s| s == Some(me)) {
      return slot;
    }
    let slot = match slots.iter().position(Option::is_none) {
      Some(slot) => {
        slots[slot] = Some(me);
        slot
      }
      None => {
        slots.push(Some(me));
        slots.len() - 1
      }
    };
    tracing::debug!(slot, "leased thread slot");
    slot
  }
}

impl Default for ThreadRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl ThreadIdentity for ThreadRegistry {
  fn current_thread_id(&self) -> Option<usize> {
    if let Some(slot) = self.leased() {
      return Some(slot);
    }

    let slot = self.claim(std::thread::current().id());
    let owners = Arc::downgrade(&self.shared);
    // During thread teardown no lease can be stored; the slot then stays claimed by this
    // thread id and is found again by `claim`.
    let _ = LEASES.try_with(|leases| {
      let mut leases = leases.borrow_mut();
      leases.retain(|l| l.owners.strong_count() > 0);
      leases.push(Lease { owners, slot });
    });
    Some(slot)
  }
}

// =============================================================================
// Thread caches
// =============================================================================

/// Top tier: one free list per level, private to one context.
pub(crate) struct ThreadCache {
  lists: Box<[FreeList]>,
}

impl ThreadCache {
  fn new(max_level: usize) -> Self {
    Self {
      lists: (0..=max_level).map(|_| FreeList::new()).collect(),
    }
  }

  #[inline]
  pub(crate) fn list(&mut self, level: usize) -> &mut FreeList {
    &mut self.lists[level]
  }

  #[inline]
  pub(crate) fn len(&self, level: usize) -> usize {
    self.lists[level].len()
  }
}

struct Slot {
  /// Set while a context is inside the slot. Never waited on: a second entrant is fatal.
  busy: AtomicBool,
  cache: UnsafeCell<ThreadCache>,
}

/// Capacity-bounded array of thread caches indexed by thread id.
pub(crate) struct ThreadCaches {
  slots: Box<[Slot]>,
}

// A slot's cache is only reached through `with`, which admits one context at a time.
unsafe impl Sync for ThreadCaches {}

struct Exit<'a>(&'a AtomicBool);

impl Drop for Exit<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl ThreadCaches {
  pub(crate) fn new(slots: usize, max_level: usize) -> Self {
    Self {
      slots: (0..slots)
        .map(|_| Slot {
          busy: AtomicBool::new(false),
          cache: UnsafeCell::new(ThreadCache::new(max_level)),
        })
        .collect(),
    }
  }

  /// Runs `f` on the cache of `slot`.
  #[inline]
  pub(crate) fn with<R>(&self, slot: usize, f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    let Some(s) = self.slots.get(slot) else {
      Violation::SlotOutOfRange {
        slot,
        max: self.slots.len(),
      }
      .raise();
    };
    if s.busy.swap(true, Ordering::Acquire) {
      Violation::SlotContended { slot }.raise();
    }
    let _exit = Exit(&s.busy);
    // SAFETY: `busy` admits a single context, so this is the only reference.
    f(unsafe { &mut *s.cache.get() })
  }

  /// Exclusive access to every cache; `&mut self` rules out concurrent users.
  pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ThreadCache> {
    self.slots.iter_mut().map(|s| s.cache.get_mut())
  }
}
