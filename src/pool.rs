use std::{
  iter, mem,
  ptr::{self, NonNull},
};

use log::{debug, trace, warn};

use crate::{
  align::{ALIGNMENT, checked_align},
  allocator::{self, AllocationOperation, Allocator, AllocatorKind},
  block::{BlockHeader, HEADER_SIZE},
  error::{AllocError, AllocResult},
};

struct PoolRecord {
  parent: Allocator,
  memory: *mut u8,
  capacity: usize,
  used: usize,
  generation: u64,
  /// `(base address, used)` of every earlier buffer, oldest first.
  retired: Vec<(usize, usize)>,
}

/// Smallest backing buffer a pool starts with: one header plus one aligned
/// payload. Requests below it are raised.
pub const MIN_POOL_CAPACITY: usize = ALIGNMENT + HEADER_SIZE;

/// Self-growing bump allocator.
///
/// When a request does not fit, the backing buffer is reallocated through
/// the parent at twice its capacity, repeatedly, until it does:
///
/// ```text
///   before:  ┌────┬────┬──────┐
///            │ A1 │ A2 │ free │                       capacity = C
///            └────┴────┴──────┘
///   after:   ┌────┬────┬────────┬────────────────────┐
///            │ A1 │ A2 │ A3     │        free        │  capacity = 2^k * C
///            └────┴────┴────────┴────────────────────┘
/// ```
///
/// The bookkeeping record is its own parent allocation, so the capability's
/// context never moves. The buffer can: after a growth, blocks keep their
/// offsets but not their addresses. Use [`Pool::offset_of`] and
/// [`Pool::resolve`] to carry a block across a growth.
///
/// The pool remembers where each earlier buffer lived. `reallocate` through
/// the capability and [`Pool::offset_of`] accept a pointer handed out before
/// a growth and map it to the same block in the current buffer; the stale
/// address itself is never read. If the parent reuses the address range of
/// a retired buffer for the current one, the current buffer wins.
pub struct Pool {
  record: NonNull<PoolRecord>,
}

impl Pool {
  /// # Safety
  ///
  /// `parent` must be alive, and must stay alive until [`Pool::destroy`].
  pub unsafe fn create(
    parent: Allocator,
    init_capacity: usize,
  ) -> AllocResult<Self> {
    let capacity = checked_align(init_capacity.max(MIN_POOL_CAPACITY)).ok_or(AllocError::OutOfMemory {
      kind: parent.kind(),
      requested: init_capacity,
      remaining: 0,
    })?;

    let record = unsafe { parent.try_allocate(mem::size_of::<PoolRecord>()) }?;
    let record = NonNull::new(record as *mut PoolRecord).ok_or(AllocError::OutOfMemory {
      kind: parent.kind(),
      requested: mem::size_of::<PoolRecord>(),
      remaining: 0,
    })?;

    let memory = match unsafe { parent.try_allocate(capacity) } {
      Ok(memory) if !memory.is_null() => memory,
      result => {
        unsafe { parent.free(record.as_ptr() as *mut u8) };
        return Err(result.err().unwrap_or(AllocError::OutOfMemory {
          kind: parent.kind(),
          requested: capacity,
          remaining: 0,
        }));
      }
    };

    unsafe {
      record.as_ptr().write(PoolRecord {
        parent,
        memory,
        capacity,
        used: 0,
        generation: 0,
        retired: Vec::new(),
      });
    }

    debug!("pool of {capacity} bytes at {memory:?} from the {} allocator", parent.kind());

    Ok(Self { record })
  }

  /// Recovers the handle behind a capability returned by [`pool_create`].
  ///
  /// # Safety
  ///
  /// The pool must not have been destroyed. The returned handle aliases
  /// every other handle to the same pool; destroy only one of them.
  pub unsafe fn from_allocator(allocator: &Allocator) -> Option<Self> {
    if allocator.kind() != AllocatorKind::Pool {
      return None;
    }
    NonNull::new(allocator.context() as *mut PoolRecord).map(|record| Self { record })
  }

  fn record(&self) -> &PoolRecord {
    unsafe { self.record.as_ref() }
  }

  pub fn capacity(&self) -> usize {
    self.record().capacity
  }

  /// Bytes consumed so far, headers and padding included.
  pub fn used(&self) -> usize {
    self.record().used
  }

  /// Number of times the backing buffer has been grown.
  pub fn generation(&self) -> u64 {
    self.record().generation
  }

  /// Start of the current backing buffer.
  pub fn base(&self) -> *mut u8 {
    self.record().memory
  }

  /// Offset of the payload `block` points at, if it is live. `block` may
  /// come from the current buffer or from any buffer retired by a growth.
  pub fn offset_of(
    &self,
    block: *const u8,
  ) -> Option<usize> {
    block_offset(self.record(), block)
  }

  /// Address of the payload at `offset` in the current buffer.
  pub fn resolve(
    &self,
    offset: usize,
  ) -> Option<*mut u8> {
    let record = self.record();
    if offset < HEADER_SIZE || offset > record.used {
      return None;
    }
    Some(unsafe { record.memory.add(offset) })
  }

  pub fn allocator(&self) -> Allocator {
    Allocator::from_raw_parts(
      AllocatorKind::Pool,
      self.record.as_ptr() as *mut u8,
      Some(pool_dispatch),
    )
  }

  /// Returns the buffer and the record to the parent.
  ///
  /// # Safety
  ///
  /// No block or capability of this pool may be used afterwards.
  pub unsafe fn destroy(self) {
    let PoolRecord {
      parent,
      memory,
      capacity,
      used,
      generation,
      retired: _,
    } = unsafe { self.record.as_ptr().read() };

    debug!(
      "destroying pool at {memory:?} ({used} of {capacity} bytes used, grown {generation} times)"
    );

    unsafe {
      parent.free(memory);
      parent.free(self.record.as_ptr() as *mut u8);
    }
  }
}

/// Current buffer first, then retired ones newest first.
fn block_offset(
  pool: &PoolRecord,
  block: *const u8,
) -> Option<usize> {
  let address = block as usize;

  iter::once((pool.memory as usize, pool.used))
    .chain(pool.retired.iter().rev().copied())
    .find_map(|(base, used)| {
      let offset = address.checked_sub(base)?;
      (HEADER_SIZE..=used).contains(&offset).then_some(offset)
    })
}

/// Reallocates the buffer through the parent until `required` bytes fit.
/// The record's `memory` is rewritten to the new address.
unsafe fn grow(
  record: *mut PoolRecord,
  required: usize,
  requested: usize,
) -> AllocResult<()> {
  let pool = unsafe { &mut *record };
  let old_capacity = pool.capacity;

  let mut capacity = old_capacity;
  while capacity < required {
    capacity = capacity
      .checked_mul(2)
      .ok_or(AllocError::GrowthFailed { capacity, requested })?;
  }

  let memory = match unsafe { pool.parent.try_reallocate(pool.memory, capacity) } {
    Ok(memory) if !memory.is_null() => memory,
    result => {
      if let Err(err) = result {
        warn!("pool growth to {capacity} bytes failed: {err}");
      }
      return Err(AllocError::GrowthFailed { capacity, requested });
    }
  };

  debug!(
    "pool grew from {old_capacity} to {capacity} bytes, buffer {:?} -> {memory:?}",
    pool.memory
  );

  pool.retired.push((pool.memory as usize, pool.used));
  pool.memory = memory;
  pool.capacity = capacity;
  pool.generation += 1;

  Ok(())
}

unsafe fn bump(
  record: *mut PoolRecord,
  size: usize,
) -> AllocResult<*mut u8> {
  let overflow = AllocError::GrowthFailed {
    capacity: usize::MAX,
    requested: size,
  };

  let actual_size = size.checked_add(HEADER_SIZE).and_then(checked_align).ok_or(overflow)?;
  let (start, capacity) = unsafe { ((*record).used, (*record).capacity) };
  let end = start.checked_add(actual_size).ok_or(overflow)?;

  if end > capacity {
    unsafe { grow(record, end, size) }?;
  }

  let pool = unsafe { &mut *record };
  let payload = unsafe { BlockHeader::write(pool.memory.add(start), AllocatorKind::Pool, size) };
  pool.used = end;

  trace!("pool: {size} bytes at {payload:?}, used {end} of {}", pool.capacity);

  Ok(payload)
}

unsafe fn reallocate(
  record: *mut PoolRecord,
  block: *mut u8,
  new_size: usize,
) -> AllocResult<*mut u8> {
  if block.is_null() {
    return Err(AllocError::NullPointer);
  }

  let offset = block_offset(unsafe { &*record }, block).ok_or(AllocError::ForeignBlock {
    kind: AllocatorKind::Pool,
  })?;

  // `block` may point into a retired buffer; read the header where the
  // block lives now.
  let current = unsafe { (*record).memory.add(offset) };
  let old_size = unsafe { BlockHeader::validate(current, AllocatorKind::Pool) }?;

  if new_size < old_size {
    panic!("pool reallocate: cannot shrink a {old_size} byte block to {new_size} bytes");
  }

  let moved = unsafe { bump(record, new_size) }?;

  // The allocation may have grown and relocated the buffer.
  let block = unsafe { (*record).memory.add(offset) };
  unsafe { ptr::copy_nonoverlapping(block, moved, old_size) };

  Ok(moved)
}

unsafe fn pool_dispatch(
  context: *mut u8,
  operation: AllocationOperation,
  size: usize,
  old: *mut u8,
) -> AllocResult<*mut u8> {
  if context.is_null() {
    panic!("{operation:?} on a pool allocator without a pool");
  }

  let record = context as *mut PoolRecord;
  let allocator = Allocator::from_raw_parts(AllocatorKind::Pool, context, Some(pool_dispatch));

  match operation {
    AllocationOperation::Allocate => unsafe { bump(record, size) },
    AllocationOperation::ZeroAllocate => unsafe { allocator::allocate_zeroed(&allocator, size) },
    AllocationOperation::Reallocate => unsafe { reallocate(record, old, size) },
    AllocationOperation::Free => {
      trace!("pool: free of {old:?} ignored, destroy the pool instead");
      Ok(ptr::null_mut())
    }
  }
}

/// Creates a pool and returns its capability.
///
/// # Safety
///
/// See [`Pool::create`].
pub unsafe fn pool_create(
  parent: Allocator,
  init_capacity: usize,
) -> AllocResult<Allocator> {
  unsafe { Pool::create(parent, init_capacity) }.map(|pool| pool.allocator())
}

/// Destroys the pool behind `pool_allocator`.
///
/// # Safety
///
/// See [`Pool::destroy`].
pub unsafe fn pool_destroy(pool_allocator: Allocator) {
  match unsafe { Pool::from_allocator(&pool_allocator) } {
    Some(pool) => unsafe { pool.destroy() },
    None => panic!("pool_destroy called on a {} allocator", pool_allocator.kind()),
  }
}
