use std::{fmt, ptr};

use log::trace;

use crate::{block::BlockHeader, error::AllocResult};

/// Request passed to a [`DispatchFn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationOperation {
  Allocate,
  ZeroAllocate,
  Reallocate,
  Free,
}

/// Backing strategy behind an [`Allocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
  Scratch,
  Arena,
  Pool,
  Heap,
}

impl AllocatorKind {
  const SCRATCH_SIGNATURE: u64 = 0xDEAD_DECA_FC0F_FEE7;
  const ARENA_SIGNATURE: u64 = 0xBABA_BEBE_F000_000D;
  const POOL_SIGNATURE: u64 = 0xB00C_F00D_5EED_CAFE;

  /// Header signature written by this kind, `None` for the heap which relies
  /// on the host allocator's own bookkeeping.
  pub const fn signature(self) -> Option<u64> {
    match self {
      AllocatorKind::Scratch => Some(Self::SCRATCH_SIGNATURE),
      AllocatorKind::Arena => Some(Self::ARENA_SIGNATURE),
      AllocatorKind::Pool => Some(Self::POOL_SIGNATURE),
      AllocatorKind::Heap => None,
    }
  }

  pub const fn from_signature(signature: u64) -> Option<Self> {
    match signature {
      Self::SCRATCH_SIGNATURE => Some(AllocatorKind::Scratch),
      Self::ARENA_SIGNATURE => Some(AllocatorKind::Arena),
      Self::POOL_SIGNATURE => Some(AllocatorKind::Pool),
      _ => None,
    }
  }
}

impl fmt::Display for AllocatorKind {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    let name = match self {
      AllocatorKind::Scratch => "scratch",
      AllocatorKind::Arena => "arena",
      AllocatorKind::Pool => "pool",
      AllocatorKind::Heap => "heap",
    };
    f.write_str(name)
  }
}

/// Single entry point every backing strategy implements.
///
/// `old` is only meaningful for [`AllocationOperation::Reallocate`] and
/// [`AllocationOperation::Free`]; `size` is ignored by `Free`.
pub type DispatchFn = unsafe fn(
  context: *mut u8,
  operation: AllocationOperation,
  size: usize,
  old: *mut u8,
) -> AllocResult<*mut u8>;

/// Allocation capability: a context pointer paired with a dispatch function.
///
/// Copying an `Allocator` copies the reference to its backing store, never
/// the store itself. All four strategies in this crate hand out this same
/// type, so consumers don't care where their memory comes from.
///
/// Every operation is `unsafe`: the capability carries no lifetime, and the
/// caller must make sure the arena, pool or scratch region behind it is still
/// alive.
#[derive(Clone, Copy)]
pub struct Allocator {
  kind: AllocatorKind,
  context: *mut u8,
  dispatch: Option<DispatchFn>,
}

impl Allocator {
  /// Builds a capability from its parts. A `None` dispatch yields a
  /// capability whose every operation panics.
  pub const fn from_raw_parts(
    kind: AllocatorKind,
    context: *mut u8,
    dispatch: Option<DispatchFn>,
  ) -> Self {
    Self {
      kind,
      context,
      dispatch,
    }
  }

  pub fn kind(&self) -> AllocatorKind {
    self.kind
  }

  pub fn context(&self) -> *mut u8 {
    self.context
  }

  fn dispatch(
    &self,
    operation: AllocationOperation,
  ) -> DispatchFn {
    match self.dispatch {
      Some(dispatch) => dispatch,
      None => panic!(
        "{operation:?} called on a {} allocator without a dispatch function",
        self.kind
      ),
    }
  }

  /// # Safety
  ///
  /// The backing store must be alive.
  pub unsafe fn try_allocate(
    &self,
    size: usize,
  ) -> AllocResult<*mut u8> {
    let dispatch = self.dispatch(AllocationOperation::Allocate);
    unsafe { dispatch(self.context, AllocationOperation::Allocate, size, ptr::null_mut()) }
  }

  /// Requests `size` bytes, returning null when the backing store is
  /// exhausted.
  ///
  /// # Safety
  ///
  /// The backing store must be alive.
  pub unsafe fn allocate(
    &self,
    size: usize,
  ) -> *mut u8 {
    unsafe { self.try_allocate(size) }.unwrap_or(ptr::null_mut())
  }

  /// # Safety
  ///
  /// The backing store must be alive.
  pub unsafe fn try_zero_allocate(
    &self,
    size: usize,
  ) -> AllocResult<*mut u8> {
    let dispatch = self.dispatch(AllocationOperation::ZeroAllocate);
    unsafe {
      dispatch(
        self.context,
        AllocationOperation::ZeroAllocate,
        size,
        ptr::null_mut(),
      )
    }
  }

  /// Same as [`Allocator::allocate`], with every byte set to zero.
  ///
  /// # Safety
  ///
  /// The backing store must be alive.
  pub unsafe fn zero_allocate(
    &self,
    size: usize,
  ) -> *mut u8 {
    unsafe { self.try_zero_allocate(size) }.unwrap_or(ptr::null_mut())
  }

  /// # Safety
  ///
  /// `block` must be null or a live block from an allocator.
  pub unsafe fn try_reallocate(
    &self,
    block: *mut u8,
    new_size: usize,
  ) -> AllocResult<*mut u8> {
    let dispatch = self.dispatch(AllocationOperation::Reallocate);
    unsafe { dispatch(self.context, AllocationOperation::Reallocate, new_size, block) }
  }

  /// Moves `block` into a new allocation of `new_size` bytes, preserving
  /// the common prefix.
  ///
  /// Returns null when `block` does not belong to this allocator or the new
  /// allocation fails; `block` stays untouched in both cases.
  ///
  /// # Safety
  ///
  /// `block` must be null or a live block from an allocator.
  pub unsafe fn reallocate(
    &self,
    block: *mut u8,
    new_size: usize,
  ) -> *mut u8 {
    unsafe { self.try_reallocate(block, new_size) }.unwrap_or(ptr::null_mut())
  }

  /// Releases `block`. Only the heap frees individual blocks; the bump
  /// strategies ignore the request and reclaim memory in bulk.
  ///
  /// # Safety
  ///
  /// `block` must be null or a live block from this allocator.
  pub unsafe fn free(
    &self,
    block: *mut u8,
  ) {
    let dispatch = self.dispatch(AllocationOperation::Free);
    if let Err(err) = unsafe { dispatch(self.context, AllocationOperation::Free, 0, block) } {
      trace!("free of {block:?} ignored: {err}");
    }
  }
}

impl fmt::Debug for Allocator {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    f.debug_struct("Allocator")
      .field("kind", &self.kind)
      .field("context", &self.context)
      .field("dispatch", &self.dispatch.is_some())
      .finish()
  }
}

/// # Safety
///
/// See [`Allocator::allocate`].
pub unsafe fn allocate(
  allocator: Allocator,
  size: usize,
) -> *mut u8 {
  unsafe { allocator.allocate(size) }
}

/// # Safety
///
/// See [`Allocator::zero_allocate`].
pub unsafe fn zero_allocate(
  allocator: Allocator,
  size: usize,
) -> *mut u8 {
  unsafe { allocator.zero_allocate(size) }
}

/// # Safety
///
/// See [`Allocator::reallocate`].
pub unsafe fn reallocate(
  allocator: Allocator,
  block: *mut u8,
  new_size: usize,
) -> *mut u8 {
  unsafe { allocator.reallocate(block, new_size) }
}

/// # Safety
///
/// See [`Allocator::free`].
pub unsafe fn free(
  allocator: Allocator,
  block: *mut u8,
) {
  unsafe { allocator.free(block) }
}

/// `ZeroAllocate` for strategies without a native zeroing path: allocate,
/// then clear.
pub(crate) unsafe fn allocate_zeroed(
  allocator: &Allocator,
  size: usize,
) -> AllocResult<*mut u8> {
  let block = unsafe { allocator.try_allocate(size) }?;
  if !block.is_null() {
    unsafe { ptr::write_bytes(block, 0, size) };
  }
  Ok(block)
}

/// `Reallocate` for header-tagged bump strategies. The old block is validated
/// before anything is allocated and is never reclaimed.
pub(crate) unsafe fn reallocate_tagged(
  allocator: &Allocator,
  block: *mut u8,
  new_size: usize,
) -> AllocResult<*mut u8> {
  let old_size = unsafe { BlockHeader::validate(block, allocator.kind) }?;
  let moved = unsafe { allocator.try_allocate(new_size) }?;
  unsafe { ptr::copy_nonoverlapping(block, moved, old_size.min(new_size)) };
  Ok(moved)
}
