use std::{env, io::Read, ptr, slice};

use buddy::{
  Arena, Pool, get_heap_allocator, get_temporary_allocator, kib, reset_temp_memory, temp_mark, temp_restore_mark,
};

/// Waits for ENTER when the demo runs with `--pause`, so the process can be
/// inspected with `pmap`, `htop` or `gdb` between steps.
fn block_until_enter_pressed(pause: bool) {
  if !pause {
    return;
  }
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

fn main() {
  env_logger::init();
  let pause = env::args().any(|arg| arg == "--pause");

  let heap = get_heap_allocator();

  unsafe {
    // --------------------------------------------------------------------
    // 1) Scratch memory: allocate inside a mark, then roll it back.
    // --------------------------------------------------------------------
    let temporary = get_temporary_allocator();
    let mark = temp_mark();

    let greeting = temporary.allocate(12);
    greeting.copy_from(b"Hello world!".as_ptr(), 12);
    println!(
      "[1] scratch block {:?} = {:?}, head = {}",
      greeting,
      String::from_utf8_lossy(slice::from_raw_parts(greeting, 12)),
      temp_mark()
    );

    temp_restore_mark(mark);
    println!("[1] restored mark, head = {}", temp_mark());

    block_until_enter_pressed(pause);

    // --------------------------------------------------------------------
    // 2) Arena over the heap: fixed capacity, released all at once.
    // --------------------------------------------------------------------
    let arena = match Arena::create(heap, kib(1)) {
      Ok(arena) => arena,
      Err(err) => {
        eprintln!("arena: {err}");
        return;
      }
    };
    let allocator = arena.allocator();

    let numbers = allocator.zero_allocate(16 * 4) as *mut u32;
    for i in 0..16 {
      numbers.add(i).write(i as u32 * i as u32);
    }
    println!(
      "\n[2] arena squares = {:?}, position = {} / {}",
      slice::from_raw_parts(numbers, 16),
      arena.position(),
      arena.capacity()
    );

    let too_big = allocator.allocate(kib(2));
    println!("[2] 2 KiB from a 1 KiB arena -> {:?}", too_big);

    arena.destroy(heap);

    block_until_enter_pressed(pause);

    // --------------------------------------------------------------------
    // 3) Pool over the heap: watch it double and relocate.
    // --------------------------------------------------------------------
    let pool = match Pool::create(heap, 128) {
      Ok(pool) => pool,
      Err(err) => {
        eprintln!("pool: {err}");
        return;
      }
    };
    let allocator = pool.allocator();

    let first = allocator.allocate(24);
    first.copy_from(b"This is a longer string.".as_ptr(), 24);
    let first_at = pool.offset_of(first).unwrap_or_default();

    for size in [64, 256, 1024] {
      let block = allocator.allocate(size);
      ptr::write_bytes(block, 0xAB, size);
      println!(
        "\n[3] pool: {size} bytes -> capacity {}, used {}, base {:?}, grown {} times",
        pool.capacity(),
        pool.used(),
        pool.base(),
        pool.generation()
      );
    }

    if let Some(first) = pool.resolve(first_at) {
      println!(
        "[3] first block after growth = {:?}",
        String::from_utf8_lossy(slice::from_raw_parts(first, 24))
      );
    }

    pool.destroy();
  }

  reset_temp_memory();
  println!("\n[4] End of example.");
}
