use thiserror::Error;

use crate::allocator::AllocatorKind;

/// Recoverable allocation failures.
///
/// Contract violations (unset dispatch, shrinking a pool block, destroying a
/// capability that is not a pool) are not represented here: they panic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  #[error("{kind} allocator out of memory: requested {requested} bytes, {remaining} bytes remaining")]
  OutOfMemory {
    kind: AllocatorKind,
    requested: usize,
    remaining: usize,
  },

  #[error("block does not belong to the {expected} allocator (signature 0x{found:016X})")]
  InvalidBlock { expected: AllocatorKind, found: u64 },

  #[error("cannot reallocate a null block")]
  NullPointer,

  #[error("block lies outside the live region of the {kind} allocator")]
  ForeignBlock { kind: AllocatorKind },

  #[error("pool growth to {capacity} bytes failed while serving a {requested} byte request")]
  GrowthFailed { capacity: usize, requested: usize },
}

pub type AllocResult<T> = Result<T, AllocError>;
