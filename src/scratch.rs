use std::{
  alloc::{self, Layout},
  cell::Cell,
  env,
  ptr::{self, NonNull},
};

use log::{debug, error, trace, warn};

use crate::{
  align::{ALIGNMENT, checked_align},
  allocator::{self, AllocationOperation, Allocator, AllocatorKind},
  block::{BlockHeader, HEADER_SIZE},
  error::{AllocError, AllocResult},
  mib,
};

pub const DEFAULT_SCRATCH_CAPACITY: usize = mib(8);

/// Overrides the capacity, in bytes, of each thread's temporary allocator.
pub const SCRATCH_CAPACITY_ENV: &str = "BUDDY_SCRATCH_CAPACITY";
/// `null` or `terminate`, see [`ExhaustionPolicy`].
pub const SCRATCH_EXHAUSTION_ENV: &str = "BUDDY_SCRATCH_EXHAUSTION";

/// What a scratch region does when a request does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
  /// Report the failure and let the caller deal with a null block.
  #[default]
  ReturnNull,
  /// Log and abort the process.
  Terminate,
}

impl ExhaustionPolicy {
  pub fn parse(value: &str) -> Option<Self> {
    match value.trim().to_ascii_lowercase().as_str() {
      "null" | "return-null" => Some(ExhaustionPolicy::ReturnNull),
      "terminate" | "abort" => Some(ExhaustionPolicy::Terminate),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchConfig {
  pub capacity: usize,
  pub exhaustion: ExhaustionPolicy,
}

impl Default for ScratchConfig {
  fn default() -> Self {
    Self {
      capacity: DEFAULT_SCRATCH_CAPACITY,
      exhaustion: ExhaustionPolicy::default(),
    }
  }
}

impl ScratchConfig {
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      capacity,
      ..Self::default()
    }
  }

  pub fn exhaustion(
    mut self,
    policy: ExhaustionPolicy,
  ) -> Self {
    self.exhaustion = policy;
    self
  }

  /// Reads [`SCRATCH_CAPACITY_ENV`] and [`SCRATCH_EXHAUSTION_ENV`], keeping
  /// the defaults for anything unset or unparsable.
  pub fn from_env() -> Self {
    Self::from_lookup(|key| env::var(key).ok())
  }

  /// Same as [`ScratchConfig::from_env`], reading values through `lookup`.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let mut config = Self::default();

    if let Some(value) = lookup(SCRATCH_CAPACITY_ENV) {
      match value.trim().parse::<usize>() {
        Ok(capacity) => config.capacity = capacity,
        Err(err) => warn!("ignoring {SCRATCH_CAPACITY_ENV}={value:?}: {err}"),
      }
    }

    if let Some(value) = lookup(SCRATCH_EXHAUSTION_ENV) {
      match ExhaustionPolicy::parse(&value) {
        Some(policy) => config.exhaustion = policy,
        None => warn!("ignoring {SCRATCH_EXHAUSTION_ENV}={value:?}: expected `null` or `terminate`"),
      }
    }

    config
  }
}

/// Bump allocator over one fixed buffer, with stack-like mark/restore.
///
/// ```text
///   ┌────────┬──────┬────────┬────────────┬──────────────────────────┐
///   │ header │ A1   │ header │ A2         │        free              │
///   └────────┴──────┴────────┴────────────┴──────────────────────────┘
///   ▲                                     ▲                          ▲
///   0                                    head                    capacity
/// ```
///
/// Individual blocks are never freed. [`ScratchRegion::reset`] drops
/// everything, [`ScratchRegion::restore`] drops everything allocated after a
/// [`ScratchRegion::mark`]. Neither clears the discarded bytes.
///
/// A region is neither `Send` nor `Sync`. Each thread gets its own default
/// region behind [`get_temporary_allocator`].
pub struct ScratchRegion {
  buffer: NonNull<u8>,
  layout: Layout,
  capacity: usize,
  head: Cell<usize>,
  exhaustion: ExhaustionPolicy,
}

impl ScratchRegion {
  pub fn new(config: ScratchConfig) -> AllocResult<Self> {
    let out_of_memory = AllocError::OutOfMemory {
      kind: AllocatorKind::Heap,
      requested: config.capacity,
      remaining: 0,
    };

    let layout = Layout::from_size_align(config.capacity.max(ALIGNMENT), ALIGNMENT)
      .map_err(|_| out_of_memory)?;

    let buffer = NonNull::new(unsafe { alloc::alloc(layout) }).ok_or(out_of_memory)?;

    debug!(
      "scratch region of {} bytes at {:?}",
      config.capacity,
      buffer.as_ptr()
    );

    Ok(Self {
      buffer,
      layout,
      capacity: config.capacity,
      head: Cell::new(0),
      exhaustion: config.exhaustion,
    })
  }

  /// Falls back to [`ScratchConfig::default`] when `config` cannot be
  /// satisfied. Panics only if the default region cannot be created either.
  fn new_or_default(config: ScratchConfig) -> Self {
    let err = match Self::new(config) {
      Ok(region) => return region,
      Err(err) => err,
    };

    let fallback = ScratchConfig::default();
    warn!(
      "cannot create a {} byte temporary allocator ({err}), using {} bytes",
      config.capacity, fallback.capacity
    );

    match Self::new(fallback) {
      Ok(region) => region,
      Err(err) => {
        error!("cannot create the temporary allocator: {err}");
        panic!("temporary allocator: {err}");
      }
    }
  }

  fn for_current_thread() -> Self {
    Self::new_or_default(ScratchConfig::from_env())
  }

  /// Capability over this region.
  ///
  /// The capability refers to the region by address: it is valid only while
  /// the region is alive and has not been moved.
  pub fn allocator(&self) -> Allocator {
    Allocator::from_raw_parts(
      AllocatorKind::Scratch,
      self as *const ScratchRegion as *mut u8,
      Some(scratch_dispatch),
    )
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes consumed so far, headers and padding included.
  pub fn used(&self) -> usize {
    self.head.get()
  }

  pub fn remaining(&self) -> usize {
    self.capacity - self.head.get()
  }

  /// Header-tagged bump allocation of `size` bytes.
  pub fn try_alloc(
    &self,
    size: usize,
  ) -> AllocResult<*mut u8> {
    let head = self.head.get();
    let remaining = self.capacity - head;

    let actual_size = match size.checked_add(HEADER_SIZE).and_then(checked_align) {
      Some(actual_size) if actual_size <= remaining => actual_size,
      _ => return self.exhausted(size, remaining),
    };

    // head <= capacity, so the offset stays inside the buffer.
    let payload = unsafe {
      let block = self.buffer.as_ptr().add(head);
      BlockHeader::write(block, AllocatorKind::Scratch, size)
    };

    self.head.set(head + actual_size);
    trace!("scratch: {size} bytes at {payload:?}, head {}", head + actual_size);

    Ok(payload)
  }

  pub fn alloc(
    &self,
    size: usize,
  ) -> *mut u8 {
    self.try_alloc(size).unwrap_or(ptr::null_mut())
  }

  fn exhausted(
    &self,
    size: usize,
    remaining: usize,
  ) -> AllocResult<*mut u8> {
    match self.exhaustion {
      ExhaustionPolicy::ReturnNull => {
        debug!("scratch exhausted: requested {size} bytes, {remaining} remaining");
        Err(AllocError::OutOfMemory {
          kind: AllocatorKind::Scratch,
          requested: size,
          remaining,
        })
      }
      ExhaustionPolicy::Terminate => {
        error!("scratch exhausted: requested {size} bytes, {remaining} remaining");
        std::process::abort();
      }
    }
  }

  /// Drops every allocation made from this region.
  pub fn reset(&self) {
    self.head.set(0);
  }

  pub fn mark(&self) -> u64 {
    self.head.get() as u64
  }

  /// Rolls the head back to `mark`, discarding everything allocated after it.
  ///
  /// Marks are only meaningful until the next [`ScratchRegion::reset`];
  /// restoring one taken before a reset is a caller error that is not
  /// detected.
  pub fn restore(
    &self,
    mark: u64,
  ) {
    match usize::try_from(mark) {
      Ok(head) if head <= self.capacity => self.head.set(head),
      _ => panic!(
        "scratch restore: mark {mark} lies beyond the {} byte region",
        self.capacity
      ),
    }
  }
}

impl Drop for ScratchRegion {
  fn drop(&mut self) {
    unsafe { alloc::dealloc(self.buffer.as_ptr(), self.layout) };
  }
}

thread_local! {
  static TEMPORARY: ScratchRegion = ScratchRegion::for_current_thread();
}

/// A null context selects the calling thread's default region.
unsafe fn with_region<R>(
  context: *mut u8,
  f: impl FnOnce(&ScratchRegion) -> R,
) -> R {
  if context.is_null() {
    TEMPORARY.with(f)
  } else {
    f(unsafe { &*(context as *const ScratchRegion) })
  }
}

unsafe fn scratch_dispatch(
  context: *mut u8,
  operation: AllocationOperation,
  size: usize,
  old: *mut u8,
) -> AllocResult<*mut u8> {
  let allocator = Allocator::from_raw_parts(AllocatorKind::Scratch, context, Some(scratch_dispatch));

  match operation {
    AllocationOperation::Allocate => unsafe { with_region(context, |region| region.try_alloc(size)) },
    AllocationOperation::ZeroAllocate => unsafe { allocator::allocate_zeroed(&allocator, size) },
    AllocationOperation::Reallocate => unsafe { allocator::reallocate_tagged(&allocator, old, size) },
    AllocationOperation::Free => {
      trace!("scratch: free of {old:?} ignored, use reset or restore");
      Ok(ptr::null_mut())
    }
  }
}

/// Capability over the calling thread's temporary region.
pub fn get_temporary_allocator() -> Allocator {
  Allocator::from_raw_parts(AllocatorKind::Scratch, ptr::null_mut(), Some(scratch_dispatch))
}

pub fn reset_temp_memory() {
  TEMPORARY.with(ScratchRegion::reset);
}

pub fn temp_mark() -> u64 {
  TEMPORARY.with(ScratchRegion::mark)
}

pub fn temp_restore_mark(id: u64) {
  TEMPORARY.with(|region| region.restore(id));
}

pub fn temp_alloc(size: usize) -> *mut u8 {
  TEMPORARY.with(|region| region.alloc(size))
}

pub fn temp_zero_alloc(size: usize) -> *mut u8 {
  unsafe { get_temporary_allocator().zero_allocate(size) }
}

/// Copies `block` into a new temporary block. The old block is not reclaimed.
///
/// # Safety
///
/// `block` must be null or a live block; blocks from other allocators are
/// rejected with a null result.
pub unsafe fn temp_realloc(
  block: *mut u8,
  size: usize,
) -> *mut u8 {
  unsafe { get_temporary_allocator().reallocate(block, size) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::kib;

  fn region(capacity: usize) -> ScratchRegion {
    ScratchRegion::new(ScratchConfig::with_capacity(capacity)).unwrap()
  }

  #[test]
  fn test_alloc_advances_head_with_header() {
    let scratch = region(kib(1));

    let first = scratch.alloc(3);
    assert!(!first.is_null());
    assert_eq!(scratch.used(), HEADER_SIZE + ALIGNMENT);

    let second = scratch.alloc(8);
    assert!(!second.is_null());
    assert_eq!(second as usize % ALIGNMENT, 0);
    assert_eq!(unsafe { second.offset_from(first) }, (HEADER_SIZE + ALIGNMENT) as isize);
  }

  #[test]
  fn test_exhaustion_returns_error() {
    let scratch = region(64);

    assert!(!scratch.alloc(64 - HEADER_SIZE).is_null());
    assert_eq!(
      scratch.try_alloc(1),
      Err(AllocError::OutOfMemory {
        kind: AllocatorKind::Scratch,
        requested: 1,
        remaining: 0,
      })
    );
  }

  #[test]
  fn test_oversized_request_fails() {
    let scratch = region(kib(4));
    assert!(scratch.alloc(usize::MAX).is_null());
    assert!(scratch.alloc(kib(4)).is_null());
    assert_eq!(scratch.used(), 0);
  }

  #[test]
  fn test_mark_restore() {
    let scratch = region(kib(4));
    scratch.alloc(10);

    let mark = scratch.mark();
    scratch.alloc(100);
    scratch.alloc(200);
    assert!(scratch.mark() > mark);

    scratch.restore(mark);
    assert_eq!(scratch.mark(), mark);

    scratch.reset();
    assert_eq!(scratch.mark(), 0);
  }

  #[test]
  #[should_panic(expected = "beyond")]
  fn test_restore_past_capacity_panics() {
    let scratch = region(64);
    scratch.restore(65);
  }

  #[test]
  fn test_region_allocator_realloc() {
    let scratch = region(kib(1));
    let allocator = scratch.allocator();

    unsafe {
      let block = allocator.allocate(4);
      ptr::copy_nonoverlapping(b"abcd".as_ptr(), block, 4);

      let grown = allocator.reallocate(block, 16);
      assert!(!grown.is_null());
      assert_eq!(std::slice::from_raw_parts(grown, 4), b"abcd");

      // the old block is garbage, not reclaimed
      assert_eq!(std::slice::from_raw_parts(block, 4), b"abcd");

      allocator.free(grown);
      assert!(scratch.used() > 0);
    }
  }

  #[test]
  fn test_thread_local_surface() {
    reset_temp_memory();
    assert_eq!(temp_mark(), 0);

    let block = temp_zero_alloc(32);
    assert!(!block.is_null());
    assert!(unsafe { std::slice::from_raw_parts(block, 32) }.iter().all(|&b| b == 0));

    let mark = temp_mark();
    assert!(!temp_alloc(kib(1)).is_null());
    temp_restore_mark(mark);
    assert_eq!(temp_mark(), mark);

    reset_temp_memory();
  }

  #[test]
  fn test_unsatisfiable_config_falls_back_to_default() {
    let config = ScratchConfig::with_capacity(usize::MAX).exhaustion(ExhaustionPolicy::Terminate);
    assert!(ScratchRegion::new(config).is_err());

    let scratch = ScratchRegion::new_or_default(config);
    assert_eq!(scratch.capacity(), DEFAULT_SCRATCH_CAPACITY);
    assert_eq!(scratch.try_alloc(kib(1)).map(|block| block.is_null()), Ok(false));
  }

  #[test]
  fn test_config_from_lookup() {
    let lookup = |capacity: Option<&'static str>, exhaustion: Option<&'static str>| {
      ScratchConfig::from_lookup(move |key| match key {
        SCRATCH_CAPACITY_ENV => capacity.map(String::from),
        SCRATCH_EXHAUSTION_ENV => exhaustion.map(String::from),
        _ => None,
      })
    };

    assert_eq!(lookup(None, None), ScratchConfig::default());
    assert_eq!(lookup(Some(" 65536 "), None), ScratchConfig::with_capacity(65536));
    assert_eq!(
      lookup(Some("4096"), Some("terminate")),
      ScratchConfig::with_capacity(4096).exhaustion(ExhaustionPolicy::Terminate)
    );

    // unparsable values keep the defaults
    assert_eq!(lookup(Some("8MB"), Some("panic")), ScratchConfig::default());
    assert_eq!(lookup(Some("-1"), Some("null")), ScratchConfig::default());
    assert_eq!(
      lookup(Some("lots"), Some("abort")),
      ScratchConfig::default().exhaustion(ExhaustionPolicy::Terminate)
    );
  }

  // The only test in this binary that touches the process environment.
  #[test]
  fn test_environment_configures_new_threads() {
    unsafe {
      env::set_var(SCRATCH_CAPACITY_ENV, "18446744073709551615");
      env::set_var(SCRATCH_EXHAUSTION_ENV, "not-a-policy");
    }

    assert_eq!(ScratchConfig::from_env(), ScratchConfig::with_capacity(usize::MAX));

    // A capacity the host cannot provide falls back instead of panicking.
    let mark = std::thread::spawn(|| {
      let block = temp_alloc(kib(1));
      assert!(!block.is_null());
      temp_mark()
    })
    .join()
    .unwrap();
    assert_eq!(mark as usize, HEADER_SIZE + kib(1));

    unsafe {
      env::set_var(SCRATCH_CAPACITY_ENV, "65536");
      env::remove_var(SCRATCH_EXHAUSTION_ENV);
    }
    assert_eq!(ScratchConfig::from_env(), ScratchConfig::with_capacity(65536));

    unsafe { env::remove_var(SCRATCH_CAPACITY_ENV) };
    assert_eq!(ScratchConfig::from_env(), ScratchConfig::default());
  }

  #[test]
  fn test_exhaustion_policy_parse() {
    assert_eq!(ExhaustionPolicy::parse("null"), Some(ExhaustionPolicy::ReturnNull));
    assert_eq!(ExhaustionPolicy::parse(" Terminate "), Some(ExhaustionPolicy::Terminate));
    assert_eq!(ExhaustionPolicy::parse("panic"), None);
  }
}
