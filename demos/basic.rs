use buddypool::{BuddyPool, PoolStats};

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn log_stats(stats: PoolStats) {
    println!(
        "Pool: {} bytes free in {} blocks, {} bytes reserved",
        stats.free_bytes, stats.free_blocks, stats.reserved_bytes
    );
}

fn main() -> buddypool::Result<()> {
    let pool = BuddyPool::with_size(1 << 20)?;
    log_stats(pool.stats());

    let mut blocks = Vec::new();
    for size in [8, 64, 1000] {
        let Some(addr) = pool.allocate(size)? else {
            continue;
        };
        log_alloc(addr.as_ptr(), size);
        blocks.push(addr);
    }
    log_stats(pool.stats());

    // Merge example
    for addr in blocks {
        pool.free(addr.as_ptr());
    }
    log_stats(pool.stats());

    pool.destroy()
}
