//! tiercache: a three-tier, size-classed allocator over one contiguous region.
//!
//! Objects are power-of-two classes from `2^MIN_LEVEL` to `2^MAX_LEVEL` bytes. Requests
//! are served by a per-thread cache first, refilled in bulk from a shared central cache
//! (one lock per class), which in turn splits whole pages taken from the page heap.
//! Every allocate and free is validated against a shadow bitmap, so double frees and
//! frees of never-allocated addresses halt instead of corrupting the free lists.
//!
//! ```no_run
//! use tiercache::{Allocator, Config, HeapRegion};
//!
//! let config = Config::default().with_max_level(16);
//! let region = HeapRegion::map(8 << 16, 1 << 16).unwrap();
//! let alloc = Allocator::new(region, config).unwrap();
//!
//! let p = alloc.alloc(128).unwrap();
//! unsafe { alloc.free(p) };
//! ```

pub mod allocator;
pub mod bump;
pub mod central;
pub mod config;
pub mod error;
pub mod free_list;
pub mod heap;
pub mod raw;
pub mod shadow;
pub mod size_class;
pub mod span;
pub mod stats;
pub mod thread_cache;

pub use allocator::{Allocator, RawAlloc};
pub use bump::BumpAllocator;
pub use config::Config;
pub use error::{AllocError, ConfigError, Violation};
pub use raw::HeapRegion;
pub use stats::Snapshot;
pub use thread_cache::{ThreadIdentity, ThreadRegistry};

// =============================================================================
// Constants
// =============================================================================

/// Smallest class: 8 bytes.
pub const MIN_LEVEL: usize = 3;
/// Largest class: 16MB, exactly one page.
pub const MAX_LEVEL: usize = 24;
pub const PAGE_SIZE: usize = 1 << MAX_LEVEL;

/// Shadow memory tracks one byte per granule.
pub const GRANULE: usize = 8;

/// Thread slots in the reference deployment.
pub const MAX_THREADS: usize = 16;
/// Heap ceiling in pages (4GB at 16MB pages).
pub const MAX_PAGES: usize = 256;

/// Idle full spans per level left in the central cache before pages go back to the heap.
pub const CENTRAL_SPAN_RESERVE: usize = 4;
/// A thread list flushes once it holds this many bulk moves worth of objects.
pub const LOCAL_FLUSH_MULTIPLIER: usize = 2;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(1 << MIN_LEVEL == GRANULE);
const _: () = assert!(MIN_LEVEL <= MAX_LEVEL);
const _: () = assert!(core::mem::size_of::<usize>() <= GRANULE);
const _: () = assert!(MAX_THREADS >= 1);
const _: () = assert!(LOCAL_FLUSH_MULTIPLIER >= 1);
