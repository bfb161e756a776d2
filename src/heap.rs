use std::ptr;

use libc::c_void;
use log::debug;

use crate::{
  allocator::{AllocationOperation, Allocator, AllocatorKind},
  error::{AllocError, AllocResult},
};

unsafe fn heap_dispatch(
  _context: *mut u8,
  operation: AllocationOperation,
  size: usize,
  old: *mut u8,
) -> AllocResult<*mut u8> {
  let block = unsafe {
    match operation {
      AllocationOperation::Allocate => libc::malloc(size),
      AllocationOperation::ZeroAllocate => libc::calloc(size, 1),
      AllocationOperation::Reallocate => libc::realloc(old as *mut c_void, size),
      AllocationOperation::Free => {
        libc::free(old as *mut c_void);
        return Ok(ptr::null_mut());
      }
    }
  } as *mut u8;

  // malloc(0) may legitimately return null.
  if block.is_null() && size > 0 {
    debug!("heap: {operation:?} of {size} bytes failed");
    return Err(AllocError::OutOfMemory {
      kind: AllocatorKind::Heap,
      requested: size,
      remaining: 0,
    });
  }

  Ok(block)
}

/// Stateless capability over the host allocator. Blocks carry no header:
/// `malloc` already knows their size.
pub fn get_heap_allocator() -> Allocator {
  Allocator::from_raw_parts(AllocatorKind::Heap, ptr::null_mut(), Some(heap_dispatch))
}

pub fn heap_alloc(size: usize) -> *mut u8 {
  unsafe { get_heap_allocator().allocate(size) }
}

pub fn heap_zero_alloc(size: usize) -> *mut u8 {
  unsafe { get_heap_allocator().zero_allocate(size) }
}

/// # Safety
///
/// `block` must be null or a live block from the heap allocator.
pub unsafe fn heap_realloc(
  block: *mut u8,
  size: usize,
) -> *mut u8 {
  unsafe { get_heap_allocator().reallocate(block, size) }
}

/// # Safety
///
/// `block` must be null or a live block from the heap allocator.
pub unsafe fn heap_free(block: *mut u8) {
  unsafe { get_heap_allocator().free(block) }
}
