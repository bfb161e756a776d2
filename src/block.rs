use std::mem;

use log::warn;

use crate::{
  allocator::AllocatorKind,
  error::{AllocError, AllocResult},
};

/// Metadata written immediately before every block handed out by the
/// scratch, arena and pool allocators.
///
/// ```text
///   ┌──────────────┬──────────────┬──────────────────────────────┐
///   │  signature   │     size     │          payload             │
///   │   (u64)      │    (u64)     │       `size` bytes           │
///   └──────────────┴──────────────┴──────────────────────────────┘
///                                 ▲
///                                 └── pointer returned to the caller
/// ```
///
/// The signature is taken from [`AllocatorKind::signature`], so a block can be
/// checked against the allocator that is asked to reallocate it before its
/// recorded size is trusted.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
  pub signature: u64,
  pub size: u64,
}

/// Bytes reserved in front of every tagged payload.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

impl BlockHeader {
  /// Panics for [`AllocatorKind::Heap`]: heap blocks carry no header.
  pub fn new(
    kind: AllocatorKind,
    size: usize,
  ) -> Self {
    match kind.signature() {
      Some(signature) => Self {
        signature,
        size: size as u64,
      },
      None => panic!("{kind} blocks carry no header"),
    }
  }

  /// Writes a header for `kind` at `block` and returns the payload pointer
  /// that follows it.
  ///
  /// # Safety
  ///
  /// `block` must be valid for writes of `HEADER_SIZE + size` bytes.
  pub unsafe fn write(
    block: *mut u8,
    kind: AllocatorKind,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      (block as *mut BlockHeader).write_unaligned(Self::new(kind, size));
      block.add(HEADER_SIZE)
    }
  }

  /// Reads the header stored in front of `payload`.
  ///
  /// # Safety
  ///
  /// The `HEADER_SIZE` bytes before `payload` must be readable.
  pub unsafe fn read(payload: *const u8) -> Self {
    unsafe { (payload.sub(HEADER_SIZE) as *const BlockHeader).read_unaligned() }
  }

  /// Returns the recorded size of `payload` if it was produced by an
  /// allocator of `kind`.
  ///
  /// A mismatching signature is reported as [`AllocError::InvalidBlock`] and
  /// the stored size is never looked at.
  ///
  /// # Safety
  ///
  /// Same as [`BlockHeader::read`] for non-null pointers.
  pub unsafe fn validate(
    payload: *const u8,
    kind: AllocatorKind,
  ) -> AllocResult<usize> {
    if payload.is_null() {
      return Err(AllocError::NullPointer);
    }

    let header = unsafe { Self::read(payload) };

    match kind.signature() {
      Some(signature) if signature == header.signature => Ok(header.size as usize),
      _ => {
        warn!(
          "rejecting block {:?}: signature 0x{:016X} does not match the {} allocator",
          payload, header.signature, kind
        );
        Err(AllocError::InvalidBlock {
          expected: kind,
          found: header.signature,
        })
      }
    }
  }
}
