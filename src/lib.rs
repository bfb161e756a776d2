//! # buddy - Pluggable Bump Allocators
//!
//! This crate provides one allocation capability, [`Allocator`], and four
//! strategies behind it: a per-thread **scratch** allocator with mark/restore,
//! a fixed-capacity **arena**, a self-growing **pool**, and a passthrough to
//! the system **heap**.
//!
//! ## Overview
//!
//! Code that needs memory takes an `Allocator` value and calls its four
//! operations. The value is a context pointer plus a dispatch function, so it
//! is cheap to copy and says nothing about where the memory comes from:
//!
//! ```text
//!   Capability Dispatch:
//!
//!          consumer (string builder, file reader, ...)
//!                          │
//!                          ▼
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │  Allocator { kind, context, dispatch }                          │
//!   │     allocate / zero_allocate / reallocate / free                │
//!   └──────┬──────────────┬──────────────────┬─────────────────┬──────┘
//!          ▼              ▼                  ▼                 ▼
//!      ┌────────┐     ┌────────┐         ┌────────┐       ┌────────┐
//!      │scratch │     │ arena  │         │  pool  │       │  heap  │
//!      └────────┘     └───┬────┘         └───┬────┘       └────────┘
//!                         │    parent        │    parent        ▲
//!                         └──────────────────┴──────────────────┘
//! ```
//!
//! Arenas and pools take their backing buffer from a *parent* allocator,
//! usually the heap or the scratch allocator.
//!
//! ## Crate Structure
//!
//! ```text
//!   buddy
//!   ├── align      - Alignment macro (align!) and checked variant
//!   ├── block      - BlockHeader tagging
//!   ├── allocator  - Allocator capability and dispatch contract
//!   ├── scratch    - ScratchRegion and the temporary allocator
//!   ├── arena      - Arena
//!   ├── pool       - Pool
//!   └── heap       - libc malloc/calloc/realloc/free
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use buddy::{Arena, get_heap_allocator};
//!
//! let heap = get_heap_allocator();
//!
//! unsafe {
//!     let arena = Arena::create(heap, 1024).unwrap();
//!     let allocator = arena.allocator();
//!
//!     let block = allocator.allocate(12);
//!     assert!(!block.is_null());
//!     block.copy_from(b"Hello world!".as_ptr(), 12);
//!
//!     arena.destroy(heap);
//! }
//! ```
//!
//! ## Block Headers
//!
//! Every block from the scratch, arena and pool allocators is preceded by a
//! header recording which kind of allocator produced it and how large it is:
//!
//! ```text
//!   ┌───────────────────────┬────────────────────────────────┐
//!   │    Block Header       │         User Data              │
//!   │  ┌─────────────────┐  │                                │
//!   │  │ signature: kind │  │  ┌──────────────────────────┐  │
//!   │  │ size: N         │  │  │     N bytes usable       │  │
//!   │  └─────────────────┘  │  └──────────────────────────┘  │
//!   │      16 bytes         │                                │
//!   └───────────────────────┴────────────────────────────────┘
//!                           ▲
//!                           └── Pointer returned to user
//! ```
//!
//! `reallocate` checks the signature before it trusts the size. A block from
//! another allocator kind yields null and is left untouched.
//!
//! ## Errors
//!
//! Recoverable failures (exhaustion, foreign blocks) surface as null from
//! the plain operations and as [`AllocError`] from the `try_*` variants.
//! Contract violations (no dispatch function, shrinking a pool block)
//! panic.
//!
//! ## Limitations
//!
//! - **Single-threaded**: an `Allocator` is neither `Send` nor `Sync`, and
//!   each thread has its own temporary region
//! - **Bulk release only**: scratch, arena and pool ignore `free`
//! - **Pools move**: growing a pool may relocate its buffer, see [`Pool`]
//!
//! ## Safety
//!
//! A capability does not borrow the store behind it. Using one after its
//! arena or pool was destroyed is undefined behavior, which is why the
//! operations are `unsafe`.

pub mod align;
pub mod allocator;
pub mod arena;
pub mod block;
mod error;
pub mod heap;
pub mod pool;
pub mod scratch;

pub use allocator::{
  AllocationOperation, Allocator, AllocatorKind, DispatchFn, allocate, free, reallocate, zero_allocate,
};
pub use arena::{Arena, arena_alloc, arena_create, arena_destroy, arena_zero_alloc, get_arena_allocator};
pub use block::{BlockHeader, HEADER_SIZE};
pub use error::{AllocError, AllocResult};
pub use heap::{get_heap_allocator, heap_alloc, heap_free, heap_realloc, heap_zero_alloc};
pub use pool::{MIN_POOL_CAPACITY, Pool, pool_create, pool_destroy};
pub use scratch::{
  ExhaustionPolicy, ScratchConfig, ScratchRegion, get_temporary_allocator, reset_temp_memory, temp_alloc,
  temp_mark, temp_realloc, temp_restore_mark, temp_zero_alloc,
};

pub const fn kib(n: usize) -> usize {
  n * 1024
}

pub const fn mib(n: usize) -> usize {
  kib(n) * 1024
}

pub const fn gib(n: usize) -> usize {
  mib(n) * 1024
}
