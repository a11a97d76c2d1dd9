use thiserror::Error;

/// Recoverable allocation failures. Callers treat these as an ordinary null return.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  #[error("no size class for a request of {size} bytes")]
  NoSizeClass { size: usize },

  #[error("out of memory: heap has no free page to refill level {level}")]
  OutOfMemory { level: usize },
}

/// Problems detected while building an allocator, before any object is handed out.
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("invalid levels: min {min}, max {max} (need 3 <= min <= max < {limit})")]
  InvalidLevels { min: usize, max: usize, limit: usize },

  #[error("{field} must be non-zero")]
  Zero { field: &'static str },

  #[error("region [0x{start:x}, 0x{end:x}) holds no whole page of {page_size} bytes")]
  RegionTooSmall {
    start: usize,
    end: usize,
    page_size: usize,
  },

  #[error("region alignment {align} is not a power of two")]
  InvalidAlignment { align: usize },

  #[error("mapping {bytes} bytes failed: {source}")]
  MapFailed {
    bytes: usize,
    #[source]
    source: std::io::Error,
  },
}

/// Broken allocator invariants. Never expected in correct usage; every one is fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
  #[error("unidentified caller: the runtime has no thread id for this context")]
  UnidentifiedCaller,

  #[error("thread slot {slot} exceeds the configured maximum of {max} slots")]
  SlotOutOfRange { slot: usize, max: usize },

  #[error("thread slot {slot} entered by two contexts at once")]
  SlotContended { slot: usize },

  #[error("address 0x{addr:x} outside heap [0x{start:x}, 0x{end:x})")]
  OutOfBounds { addr: usize, start: usize, end: usize },

  #[error("address 0x{addr:x} is not the start of a {class_size}-byte object")]
  Misaligned { addr: usize, class_size: usize },

  #[error(
    "shadow mismatch at 0x{at:x} in [0x{addr:x}, +{len}): expected 0x{expected:02x}, found 0x{found:02x}"
  )]
  ShadowMismatch {
    addr: usize,
    len: usize,
    at: usize,
    expected: u8,
    found: u8,
  },

  #[error("{tier} free list at level {level}: count {expected}, walked {found} nodes")]
  FreeListLength {
    tier: &'static str,
    level: usize,
    expected: usize,
    found: usize,
  },

  #[error("span {span}: expected status {expected}, found {found}")]
  SpanStatus {
    span: usize,
    expected: &'static str,
    found: &'static str,
  },

  #[error("span {span}: central residual {residual} outside [0, {page_size}]")]
  ResidualOutOfRange {
    span: usize,
    residual: isize,
    page_size: usize,
  },

  #[error("span {span}: removed {found} nodes from central level {level}, expected {expected}")]
  CompactionCount {
    span: usize,
    level: usize,
    expected: usize,
    found: usize,
  },

  #[error("accounting mismatch: {what}: expected {expected}, found {found}")]
  Accounting {
    what: &'static str,
    expected: usize,
    found: usize,
  },
}

impl Violation {
  /// Halt on a broken invariant. Logged first so the context survives an abort.
  #[cold]
  #[inline(never)]
  #[track_caller]
  pub fn raise(self) -> ! {
    tracing::error!(violation = %self, "allocator invariant violated");
    panic!("{self}")
  }
}
