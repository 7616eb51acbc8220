//! Fills the same kind of container through the system allocator and through the block pool:
//!
//! * Filling a `BlockMap` backed by the system allocator and by a `BlockAllocator`.
//! * Filling a `BlockVec` backed by the system allocator.
//! * Filling a `BlockVec` backed by a `BlockAllocator`.
//! * Using `Memory` directly and watching it grow.

use block_pool::{BlockAllocator, BlockMap, BlockVec, MapNode, Memory, SystemAllocator};
use new_zealand::nz;

fn factorial(value: u64) -> u64 {
    (1..=value).product()
}

fn print_values(values: &[u64]) {
    let line = values
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(" ");

    println!("{line}");
}

fn main() -> Result<(), block_pool::Error> {
    // Block creation is logged at debug level, individual allocations at trace level.
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("--- BlockMap + system allocator ---");
    let mut on_heap = BlockMap::<u64, u64>::new();
    for i in 0..10 {
        on_heap.insert(i, factorial(i));
    }
    for (key, value) in &on_heap {
        println!("{key} {value}");
    }

    println!("--- BlockMap + block allocator ---");
    let mut in_pool = BlockMap::<u64, u64, BlockAllocator<MapNode<u64, u64>, 5>>::new();
    for i in 0..10 {
        in_pool.insert(i, factorial(i));
    }
    for (key, value) in &in_pool {
        println!("{key} {value}");
    }

    println!(
        "Pool behind the map has {} blocks with capacities {:?}",
        in_pool.allocator().memory().block_count(),
        in_pool.allocator().memory().block_capacities().collect::<Vec<_>>()
    );

    println!("--- BlockVec + system allocator ---");
    let mut on_heap = BlockVec::<u64, SystemAllocator<u64>>::new();
    for i in 0..10 {
        on_heap.push(factorial(i));
    }
    print_values(&on_heap);

    println!("--- BlockVec + block allocator ---");
    let mut in_pool = BlockVec::<u64, BlockAllocator<u64, 10>>::new();
    for i in 0..10 {
        in_pool.push(factorial(i));
    }
    print_values(&in_pool);

    println!(
        "Pool behind the container has {} blocks with capacities {:?}",
        in_pool.allocator().memory().block_count(),
        in_pool.allocator().memory().block_capacities().collect::<Vec<_>>()
    );

    println!("--- Memory used directly ---");
    let mut memory = Memory::<u64>::with_base_block_size(nz!(5));

    let runs = [3, 4, 5]
        .into_iter()
        .map(|count| memory.allocate(count).map(|ptr| (ptr, count)))
        .collect::<Result<Vec<_>, _>>()?;

    println!(
        "Reserved {} of {} slots in {} blocks",
        memory.len(),
        memory.capacity(),
        memory.block_count()
    );

    for (ptr, count) in runs {
        memory.deallocate(ptr, count)?;
    }

    println!(
        "After releasing everything: {} of {} slots reserved",
        memory.len(),
        memory.capacity()
    );

    Ok(())
}
