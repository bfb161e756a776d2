use std::{
  mem,
  ptr::{self, NonNull},
};

use log::{debug, trace};

use crate::{
  align,
  allocator::{self, AllocationOperation, Allocator, AllocatorKind},
  block::{BlockHeader, HEADER_SIZE},
  error::{AllocError, AllocResult},
};

struct ArenaRecord {
  memory: *mut u8,
  capacity: usize,
  position: usize,
}

/// Space taken by the record at the head of the backing allocation.
const RECORD_SIZE: usize = align!(mem::size_of::<ArenaRecord>());

/// Fixed-capacity bump allocator released all at once.
///
/// The bookkeeping record and the region share one allocation from the
/// parent:
///
/// ```text
///   ┌──────────────┬────────┬────────┬───────────────────────────┐
///   │ ArenaRecord  │ A1     │ A2     │          free             │
///   └──────────────┴────────┴────────┴───────────────────────────┘
///                  ▲                 ▲                           ▲
///                memory           position                   capacity
/// ```
///
/// The arena never grows. Dropping the handle does not release anything;
/// call [`Arena::destroy`] with the parent used at creation.
pub struct Arena {
  record: NonNull<ArenaRecord>,
}

impl Arena {
  /// Allocates `capacity` bytes plus the arena record from `parent`.
  ///
  /// # Safety
  ///
  /// `parent` must be alive, and must stay alive until [`Arena::destroy`].
  pub unsafe fn create(
    parent: Allocator,
    capacity: usize,
  ) -> AllocResult<Self> {
    let out_of_memory = AllocError::OutOfMemory {
      kind: parent.kind(),
      requested: capacity,
      remaining: 0,
    };

    let total = capacity.checked_add(RECORD_SIZE).ok_or(out_of_memory)?;
    let block = unsafe { parent.try_allocate(total) }?;
    let record = NonNull::new(block as *mut ArenaRecord).ok_or(out_of_memory)?;

    unsafe {
      record.as_ptr().write(ArenaRecord {
        memory: block.add(RECORD_SIZE),
        capacity,
        position: 0,
      });
    }

    debug!("arena of {capacity} bytes at {block:?} from the {} allocator", parent.kind());

    Ok(Self { record })
  }

  fn record(&self) -> &ArenaRecord {
    unsafe { self.record.as_ref() }
  }

  pub fn capacity(&self) -> usize {
    self.record().capacity
  }

  pub fn position(&self) -> usize {
    self.record().position
  }

  pub fn remaining(&self) -> usize {
    self.capacity() - self.position()
  }

  /// Untagged bump allocation of `size` bytes.
  pub fn try_alloc(
    &mut self,
    size: usize,
  ) -> AllocResult<*mut u8> {
    unsafe { bump(self.record.as_ptr(), size) }
  }

  /// Returns null once `position + size` would pass the capacity.
  pub fn alloc(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    self.try_alloc(size).unwrap_or(ptr::null_mut())
  }

  pub fn zero_alloc(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    let block = self.alloc(size);
    if !block.is_null() {
      unsafe { ptr::write_bytes(block, 0, size) };
    }
    block
  }

  /// Header-tagged capability over this arena. Its `free` is a no-op.
  pub fn allocator(&self) -> Allocator {
    Allocator::from_raw_parts(
      AllocatorKind::Arena,
      self.record.as_ptr() as *mut u8,
      Some(arena_dispatch),
    )
  }

  /// Releases the backing allocation. Every block handed out by the arena,
  /// and every capability obtained from it, is invalid afterwards.
  ///
  /// # Safety
  ///
  /// `parent` must be the allocator the arena was created from.
  pub unsafe fn destroy(
    self,
    parent: Allocator,
  ) {
    debug!(
      "destroying arena at {:?} ({} of {} bytes used)",
      self.record,
      self.position(),
      self.capacity()
    );
    unsafe { parent.free(self.record.as_ptr() as *mut u8) };
  }
}

unsafe fn bump(
  record: *mut ArenaRecord,
  size: usize,
) -> AllocResult<*mut u8> {
  let arena = unsafe { &mut *record };
  let start = align!(arena.position).min(arena.capacity);

  match start.checked_add(size) {
    Some(end) if end <= arena.capacity => {
      arena.position = end;
      let block = unsafe { arena.memory.add(start) };
      trace!("arena: {size} bytes at {block:?}, position {end}");
      Ok(block)
    }
    _ => {
      debug!(
        "arena full: requested {size} bytes, {} remaining",
        arena.capacity - start
      );
      Err(AllocError::OutOfMemory {
        kind: AllocatorKind::Arena,
        requested: size,
        remaining: arena.capacity - start,
      })
    }
  }
}

unsafe fn arena_dispatch(
  context: *mut u8,
  operation: AllocationOperation,
  size: usize,
  old: *mut u8,
) -> AllocResult<*mut u8> {
  if context.is_null() {
    panic!("{operation:?} on an arena allocator without an arena");
  }

  let allocator = Allocator::from_raw_parts(AllocatorKind::Arena, context, Some(arena_dispatch));

  match operation {
    AllocationOperation::Allocate => {
      let total = size.checked_add(HEADER_SIZE).ok_or(AllocError::OutOfMemory {
        kind: AllocatorKind::Arena,
        requested: size,
        remaining: 0,
      })?;
      let block = unsafe { bump(context as *mut ArenaRecord, total) }?;
      Ok(unsafe { BlockHeader::write(block, AllocatorKind::Arena, size) })
    }
    AllocationOperation::ZeroAllocate => unsafe { allocator::allocate_zeroed(&allocator, size) },
    AllocationOperation::Reallocate => unsafe { allocator::reallocate_tagged(&allocator, old, size) },
    AllocationOperation::Free => {
      trace!("arena: free of {old:?} ignored, destroy the arena instead");
      Ok(ptr::null_mut())
    }
  }
}

/// # Safety
///
/// See [`Arena::create`].
pub unsafe fn arena_create(
  parent: Allocator,
  capacity: usize,
) -> AllocResult<Arena> {
  unsafe { Arena::create(parent, capacity) }
}

pub fn get_arena_allocator(arena: &Arena) -> Allocator {
  arena.allocator()
}

/// # Safety
///
/// See [`Arena::destroy`].
pub unsafe fn arena_destroy(
  arena: Arena,
  parent: Allocator,
) {
  unsafe { arena.destroy(parent) }
}

pub fn arena_alloc(
  arena: &mut Arena,
  size: usize,
) -> *mut u8 {
  arena.alloc(size)
}

pub fn arena_zero_alloc(
  arena: &mut Arena,
  size: usize,
) -> *mut u8 {
  arena.zero_alloc(size)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::heap::get_heap_allocator;

  #[test]
  fn test_capacity_is_a_hard_limit() {
    let heap = get_heap_allocator();

    unsafe {
      let mut arena = Arena::create(heap, 128).unwrap();
      assert!(arena.alloc(129).is_null());
      assert_eq!(arena.position(), 0);

      let block = arena.alloc(128);
      assert!(!block.is_null());
      ptr::write_bytes(block, 0xAB, 128);
      assert_eq!(arena.remaining(), 0);
      assert!(arena.alloc(1).is_null());

      arena.destroy(heap);
    }
  }

  #[test]
  fn test_raw_allocations_are_aligned() {
    let heap = get_heap_allocator();

    unsafe {
      let mut arena = Arena::create(heap, 64).unwrap();
      let first = arena.alloc(3);
      let second = arena.alloc(8);

      assert_eq!(second as usize % crate::align::ALIGNMENT, 0);
      assert_eq!(second.offset_from(first), 8);

      arena.destroy(heap);
    }
  }

  #[test]
  fn test_zero_alloc_clears_reused_bytes() {
    let heap = get_heap_allocator();

    unsafe {
      let mut arena = Arena::create(heap, 32).unwrap();
      let block = arena.zero_alloc(32);
      assert!(std::slice::from_raw_parts(block, 32).iter().all(|&b| b == 0));
      arena.destroy(heap);
    }
  }

  #[test]
  fn test_allocator_tags_blocks() {
    let heap = get_heap_allocator();

    unsafe {
      let arena = Arena::create(heap, 256).unwrap();
      let allocator = arena.allocator();

      let block = allocator.allocate(12);
      assert_eq!(BlockHeader::validate(block, AllocatorKind::Arena), Ok(12));
      assert_eq!(arena.position(), HEADER_SIZE + 12);

      ptr::copy_nonoverlapping(b"Hello world!".as_ptr(), block, 12);
      let grown = allocator.reallocate(block, 24);
      assert_eq!(std::slice::from_raw_parts(grown, 12), b"Hello world!");

      allocator.free(grown);
      arena.destroy(heap);
    }
  }

  #[test]
  fn test_allocator_reports_exhaustion() {
    let heap = get_heap_allocator();

    unsafe {
      let arena = Arena::create(heap, 32).unwrap();
      let allocator = arena.allocator();

      assert!(allocator.allocate(32).is_null());
      assert!(!allocator.allocate(32 - HEADER_SIZE).is_null());

      arena.destroy(heap);
    }
  }
}
