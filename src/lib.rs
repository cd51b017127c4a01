//! A buddy-system memory allocator.
//!
//! A [`BuddyPool`] manages one contiguous arena of `2^level` bytes obtained
//! from a [`BackingMemory`] provider and serves power-of-two sized blocks from
//! it. Blocks are split in halves on the way down to the requested size class
//! and merged with their buddy on the way back up, so fragmentation stays low
//! without any bookkeeping outside the arena itself.
//!
//! ```no_run
//! use buddypool::BuddyPool;
//!
//! let pool = BuddyPool::with_size(1 << 20)?;
//!
//! let block = pool.allocate(100)?.expect("non-zero request");
//! unsafe { block.as_ptr().write_bytes(0, 100) };
//! pool.free(block.as_ptr());
//!
//! pool.destroy()?;
//! # Ok::<(), buddypool::Error>(())
//! ```

mod arena;
mod block;
mod config;
mod error;
mod list;
mod memory;
mod pool;
mod utils;

pub use block::{HEADER_SIZE, Tag};
pub use config::{DEFAULT_LEVEL, MAX_LEVEL, MIN_LEVEL, PoolConfig, SMALLEST_LEVEL};
pub use error::{Error, InvariantError, Result};
pub use memory::{BackingMemory, HeapMemory, Mmap, page_size};
pub use pool::{BlockInfo, BuddyPool, PoolStats};
pub use utils::{bytes_to_level, level_size};
