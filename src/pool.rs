use std::{collections::HashMap, fmt, ptr::NonNull};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::{
    arena::Arena,
    block::{HEADER_SIZE, Header, Tag},
    config::{MAX_LEVEL, PoolConfig, SMALLEST_LEVEL},
    error::{Error, InvariantError, Result},
    list::FreeLists,
    memory::{BackingMemory, Mmap},
    utils::{buddy_offset, bytes_to_level, level_size},
};

/// A buddy-system allocator over one contiguous arena of `2^level` bytes.
///
/// Requests are rounded up (header included) to a power of two and served from
/// the smallest free block that fits, halving larger blocks on the way down.
/// Freed blocks are merged with their buddy for as long as the buddy is free
/// and the same size, so the arena always holds the largest free blocks it can.
///
/// ```text
///  level 20  [                               0                               ]
///  level 19  [               0               |             free              ]
///  level 18  [       0       |     free      |
///   ...
///  level 6   [ 0 | free  |
///              ^
///              Header | payload handed to the caller
/// ```
///
/// Every operation takes the pool-wide lock for its full duration, so a split
/// or a chain of merges is never observed half done.
pub struct BuddyPool<M: BackingMemory = Mmap> {
    memory: M,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Level of the whole arena; zero while there is no arena.
    level: u32,
    size_bytes: usize,
    arena: Option<Arena>,
    lists: FreeLists,
}

/// A block found while walking the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block's header from the arena base.
    pub offset: usize,
    pub level: u32,
    pub tag: Tag,
}

impl BlockInfo {
    pub fn size(&self) -> usize {
        level_size(self.level)
    }
}

/// Occupancy of a pool, derived from its free lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub level: u32,
    pub size_bytes: usize,
    pub free_bytes: usize,
    pub reserved_bytes: usize,
    pub free_blocks: usize,
    pub largest_free_level: Option<u32>,
}

impl BuddyPool<Mmap> {
    /// Creates a pool with no arena yet, backed by anonymous mappings.
    pub fn new() -> Self {
        Self::with_memory(Mmap)
    }

    /// Creates a pool backed by anonymous mappings and initializes it for
    /// `size` bytes.
    pub fn with_size(size: usize) -> Result<Self> {
        let pool = Self::new();
        pool.init(size)?;

        Ok(pool)
    }
}

impl Default for BuddyPool<Mmap> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: BackingMemory> BuddyPool<M> {
    pub fn with_memory(memory: M) -> Self {
        Self {
            memory,
            config: PoolConfig::default(),
            state: Mutex::new(PoolState::empty()),
        }
    }

    pub fn with_config(memory: M, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            memory,
            config,
            state: Mutex::new(PoolState::empty()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquires the arena and seeds it with one free block spanning all of it.
    ///
    /// `requested_size` is rounded up to a power of two and clamped into the
    /// configured level range; zero selects the default level.
    pub fn init(&self, requested_size: usize) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.arena.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let level = self.config.arena_level(requested_size);
        let size_bytes = level_size(level);
        let base = self.memory.acquire(size_bytes).map_err(Error::AllocationFailed)?;

        // SAFETY: the provider hands us `size_bytes` of memory we own
        // exclusively until we release it in `destroy`.
        let mut arena = unsafe { Arena::new(base, size_bytes) };

        state.lists.reset();
        arena.write(0, &Header::available(level));
        state.lists.push_front(&mut arena, level, 0);

        state.level = level;
        state.size_bytes = size_bytes;
        state.arena = Some(arena);

        debug!("buddy pool initialized: level {level}, {size_bytes} bytes at {base:p}");

        Ok(())
    }

    /// Reserves a block that can hold `size` bytes and returns a pointer to
    /// its content, aligned to at least 8 bytes.
    ///
    /// A zero-sized request succeeds without reserving anything.
    pub fn allocate(&self, size: usize) -> Result<Option<NonNull<u8>>> {
        if size == 0 {
            return Ok(None);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let arena = state.arena.as_mut().ok_or(Error::NotInitialized)?;
        let lists = &mut state.lists;

        let target = size.checked_add(HEADER_SIZE).map_or(usize::BITS, bytes_to_level);

        let (mut level, offset) = (target..=state.level)
            .find_map(|level| lists.pop_front(arena, level).map(|offset| (level, offset)))
            .ok_or(Error::OutOfMemory { requested: size })?;

        while level > target {
            level -= 1;

            let upper = offset + level_size(level);
            arena.write(upper, &Header::available(level));
            lists.push_front(arena, level, upper);

            trace!("split {offset:#x}: upper half {upper:#x} freed at level {level}");
        }

        arena.write(offset, &Header::reserved(level));

        Ok(Some(arena.payload(offset)))
    }

    /// Returns a block to the pool.
    ///
    /// Null pointers, pools without an arena, and pointers that don't name a
    /// block currently reserved from this pool are ignored.
    pub fn free(&self, ptr: *mut u8) {
        if let Err(err) = self.try_free(ptr) {
            warn!("ignoring free: {err}");
        }
    }

    /// Returns a block to the pool, merging it with its buddies.
    ///
    /// Null pointers and pools without an arena are a successful no-op. A
    /// pointer whose header isn't that of a reserved block of this pool is
    /// rejected with [`Error::InvalidPointer`], which catches double frees and
    /// most stray pointers. A header forged inside another block's content can
    /// still get through.
    pub fn try_free(&self, ptr: *mut u8) -> Result<()> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(arena) = state.arena.as_mut() else {
            return Ok(());
        };

        let addr = ptr.as_ptr().addr();
        let (offset, level) =
            reserved_block(arena, state.level, addr).ok_or(Error::InvalidPointer { addr })?;

        arena.write(offset, &Header::available(level));
        coalesce(arena, &mut state.lists, offset, level);

        Ok(())
    }

    /// Gives the arena back to the provider and resets the pool.
    ///
    /// Destroying a pool without an arena is a no-op, so calling this twice is
    /// safe. If the provider fails, the pool is reset anyway and the error is
    /// returned.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock();
        let Some(arena) = state.arena.take() else {
            return Ok(());
        };

        let (base, size_bytes) = (arena.base(), arena.len());
        *state = PoolState::empty();

        // SAFETY: `base` and `size_bytes` are exactly what `init` acquired and
        // the arena that referenced them is gone.
        unsafe { self.memory.release(base, size_bytes) }.map_err(Error::ProviderReleaseFailed)?;

        debug!("buddy pool destroyed: released {size_bytes} bytes at {base:p}");

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().arena.is_some()
    }

    /// Level of the arena, or zero without one.
    pub fn level(&self) -> u32 {
        self.state.lock().level
    }

    pub fn size_bytes(&self) -> usize {
        self.state.lock().size_bytes
    }

    pub fn base(&self) -> Option<NonNull<u8>> {
        self.state.lock().arena.as_ref().map(Arena::base)
    }

    /// Number of free blocks at `level`.
    pub fn free_list_len(&self, level: u32) -> usize {
        let state = self.state.lock();

        match &state.arena {
            Some(arena) if level < MAX_LEVEL => state.lists.len(arena, level),
            _ => 0,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let Some(arena) = &state.arena else {
            return PoolStats::default();
        };

        let mut stats = PoolStats {
            level: state.level,
            size_bytes: state.size_bytes,
            ..PoolStats::default()
        };

        for level in SMALLEST_LEVEL..=state.level {
            let count = state.lists.len(arena, level);

            stats.free_blocks += count;
            stats.free_bytes += count * level_size(level);
            if count > 0 {
                stats.largest_free_level = Some(level);
            }
        }

        stats.reserved_bytes = stats.size_bytes - stats.free_bytes;

        stats
    }

    /// Walks the whole arena, checks that the pool is consistent and returns
    /// every block in address order.
    ///
    /// Blocks must tile the arena exactly, sit aligned to their own size and
    /// never leave two free buddies unmerged. Each free list must hold exactly
    /// the available blocks of its level, and sentinels must stay untouched.
    pub fn audit(&self) -> std::result::Result<Vec<BlockInfo>, InvariantError> {
        self.state.lock().audit()
    }
}

impl<M: BackingMemory> Drop for BuddyPool<M> {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            warn!("dropping buddy pool: {err}");
        }
    }
}

impl<M: BackingMemory> fmt::Debug for BuddyPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("BuddyPool")
            .field("level", &state.level)
            .field("size_bytes", &state.size_bytes)
            .field("base", &state.arena.as_ref().map(Arena::base))
            .finish()
    }
}

/// Offset and level of the reserved block whose content starts at `addr`.
fn reserved_block(arena: &Arena, max_level: u32, addr: usize) -> Option<(usize, u32)> {
    let offset = arena.offset_of(addr)?.checked_sub(HEADER_SIZE)?;
    if offset % level_size(SMALLEST_LEVEL) != 0 {
        return None;
    }

    let header = arena.read(offset);
    let valid = header.tag == Tag::Reserved
        && (SMALLEST_LEVEL..=max_level).contains(&header.level)
        && offset % level_size(header.level) == 0;

    valid.then_some((offset, header.level))
}

/// Merges the available block at `offset` with its buddy for as long as the
/// buddy is free and of the same level, then files the result.
fn coalesce(arena: &mut Arena, lists: &mut FreeLists, mut offset: usize, mut level: u32) {
    loop {
        let buddy = buddy_offset(offset, level);
        if buddy >= arena.len() {
            break;
        }

        let header = arena.read(buddy);
        if header.tag != Tag::Available || header.level != level {
            break;
        }

        lists.remove(arena, buddy);

        // The lower half survives; the upper header now sits inside the
        // merged block and must never look live again.
        let upper = offset.max(buddy);
        arena.write(upper, &Header::absorbed());

        offset = offset.min(buddy);
        level += 1;
        arena.write(offset, &Header::available(level));

        trace!("merged {offset:#x} with buddy {upper:#x} into level {level}");
    }

    lists.push_front(arena, level, offset);
}

impl PoolState {
    fn empty() -> Self {
        Self {
            level: 0,
            size_bytes: 0,
            arena: None,
            lists: FreeLists::new(),
        }
    }

    fn audit(&self) -> std::result::Result<Vec<BlockInfo>, InvariantError> {
        for level in 0..MAX_LEVEL {
            let head = self.lists.sentinel(level);
            if head.tag != Tag::Unused || head.level != level {
                return Err(InvariantError::Sentinel { level });
            }
        }

        let Some(arena) = &self.arena else {
            return match (0..MAX_LEVEL).find(|&level| !self.lists.is_empty(level)) {
                Some(level) => Err(InvariantError::Sentinel { level }),
                None => Ok(Vec::new()),
            };
        };

        let mut blocks = Vec::new();
        let mut offset = 0;

        while offset < arena.len() {
            let header = arena.read(offset);
            let level = header.level;

            if !(SMALLEST_LEVEL..=self.level).contains(&level) {
                return Err(InvariantError::BadLevel { offset, level });
            }
            if offset % level_size(level) != 0 {
                return Err(InvariantError::Misaligned { offset, level });
            }
            if !matches!(header.tag, Tag::Available | Tag::Reserved) {
                return Err(InvariantError::BadTag { offset, tag: header.tag });
            }

            blocks.push(BlockInfo { offset, level, tag: header.tag });
            offset += level_size(level);
        }

        if offset != self.size_bytes {
            return Err(InvariantError::Conservation { covered: offset, size: self.size_bytes });
        }

        let by_offset: HashMap<usize, &BlockInfo> =
            blocks.iter().map(|block| (block.offset, block)).collect();

        for block in blocks.iter().filter(|block| block.tag == Tag::Available) {
            let buddy = buddy_offset(block.offset, block.level);

            if let Some(other) = by_offset.get(&buddy) {
                if other.tag == Tag::Available && other.level == block.level {
                    return Err(InvariantError::FreeBuddies {
                        offset: block.offset,
                        buddy,
                        level: block.level,
                    });
                }
            }
        }

        for level in 0..MAX_LEVEL {
            let mut listed = 0;

            for offset in self.lists.iter(arena, level) {
                match by_offset.get(&offset) {
                    Some(block) if block.tag == Tag::Available && block.level == level => listed += 1,
                    _ => return Err(InvariantError::ListMismatch { level, offset }),
                }
            }

            let found = blocks
                .iter()
                .filter(|block| block.tag == Tag::Available && block.level == level)
                .count();

            if listed != found {
                return Err(InvariantError::ListLength { level, listed, found });
            }
        }

        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::Link,
        config::MIN_LEVEL,
        memory::HeapMemory,
    };

    fn heap_pool() -> BuddyPool<HeapMemory> {
        let pool = BuddyPool::with_memory(HeapMemory);
        pool.init(level_size(MIN_LEVEL)).unwrap();
        pool
    }

    fn check_sentinels_empty_below(pool: &BuddyPool<impl BackingMemory>, level: u32) {
        let state = pool.state.lock();

        for i in 0..level {
            let head = state.lists.sentinel(i);

            assert_eq!(head.next, Link::Head(i), "levels[{i}] next not self");
            assert_eq!(head.prev, Link::Head(i), "levels[{i}] prev not self");
            assert_eq!(head.tag, Tag::Unused);
            assert_eq!(head.level, i);
        }
    }

    /// One free block spanning the whole arena, every other list empty.
    fn check_pool_full(pool: &BuddyPool<impl BackingMemory>) {
        let level = pool.level();
        check_sentinels_empty_below(pool, level);

        {
            let state = pool.state.lock();
            let head = state.lists.sentinel(level);

            assert_eq!(head.next, Link::Block(0));
            assert_eq!(head.prev, Link::Block(0));
        }

        let blocks = pool.audit().unwrap();
        assert_eq!(blocks, vec![BlockInfo { offset: 0, level, tag: Tag::Available }]);
    }

    /// Every free list empty.
    fn check_pool_empty(pool: &BuddyPool<impl BackingMemory>) {
        check_sentinels_empty_below(pool, pool.level() + 1);
    }

    #[test]
    fn init_seeds_one_free_block() {
        for level in MIN_LEVEL..=MIN_LEVEL + 6 {
            let pool = BuddyPool::new();
            pool.init(level_size(level)).unwrap();

            assert_eq!(pool.level(), level);
            assert_eq!(pool.size_bytes(), level_size(level));
            check_pool_full(&pool);

            pool.destroy().unwrap();
        }
    }

    #[test]
    fn malloc_one_byte() {
        let pool = heap_pool();

        let mem = pool.allocate(1).unwrap().unwrap();
        let blocks = pool.audit().unwrap();
        assert_eq!(blocks[0], BlockInfo { offset: 0, level: SMALLEST_LEVEL, tag: Tag::Reserved });

        pool.free(mem.as_ptr());
        check_pool_full(&pool);
    }

    #[test]
    fn malloc_one_large() {
        let pool = heap_pool();
        let ask = pool.size_bytes() - HEADER_SIZE;

        let mem = pool.allocate(ask).unwrap().unwrap();
        assert_eq!(
            pool.audit().unwrap(),
            vec![BlockInfo { offset: 0, level: MIN_LEVEL, tag: Tag::Reserved }]
        );
        check_pool_empty(&pool);

        let fail = pool.allocate(5);
        assert!(matches!(fail, Err(Error::OutOfMemory { requested: 5 })));

        pool.free(mem.as_ptr());
        check_pool_full(&pool);
    }

    #[test]
    fn zero_sized_allocation_reserves_nothing() {
        let pool = heap_pool();

        assert_eq!(pool.allocate(0).unwrap(), None);
        check_pool_full(&pool);
    }

    #[test]
    fn splitting_leaves_one_upper_half_per_level() {
        let pool = heap_pool();
        let _mem = pool.allocate(1).unwrap();

        for level in SMALLEST_LEVEL..MIN_LEVEL {
            assert_eq!(pool.free_list_len(level), 1, "level {level}");
        }
        assert_eq!(pool.free_list_len(MIN_LEVEL), 0);

        let stats = pool.stats();
        assert_eq!(stats.reserved_bytes, level_size(SMALLEST_LEVEL));
        assert_eq!(stats.free_blocks, (MIN_LEVEL - SMALLEST_LEVEL) as usize);
        assert_eq!(stats.largest_free_level, Some(MIN_LEVEL - 1));
    }

    #[test]
    fn header_counts_towards_the_size_class() {
        let pool = heap_pool();
        let payload = level_size(SMALLEST_LEVEL) - HEADER_SIZE;

        pool.allocate(payload).unwrap();
        pool.allocate(payload + 1).unwrap();

        let reserved: Vec<_> = pool
            .audit()
            .unwrap()
            .into_iter()
            .filter(|block| block.tag == Tag::Reserved)
            .map(|block| block.level)
            .collect();

        assert_eq!(reserved, vec![SMALLEST_LEVEL, SMALLEST_LEVEL + 1]);
    }

    #[test]
    fn most_recently_freed_block_is_reused_first() {
        let pool = heap_pool();

        // Keep `b` and `d` so neither freed block has a free buddy.
        let a = pool.allocate(8).unwrap().unwrap();
        let _b = pool.allocate(8).unwrap().unwrap();
        let c = pool.allocate(8).unwrap().unwrap();
        let _d = pool.allocate(8).unwrap().unwrap();

        pool.free(a.as_ptr());
        pool.free(c.as_ptr());

        assert_eq!(pool.allocate(8).unwrap(), Some(c));
        assert_eq!(pool.allocate(8).unwrap(), Some(a));
    }

    #[test]
    fn freeing_merges_back_up() {
        let pool = heap_pool();

        let a = pool.allocate(100).unwrap().unwrap();
        let b = pool.allocate(100).unwrap().unwrap();

        pool.free(a.as_ptr());
        assert!(pool.audit().is_ok());
        pool.free(b.as_ptr());

        check_pool_full(&pool);
    }

    #[test]
    fn payload_writes_leave_headers_intact() {
        let pool = heap_pool();
        let sizes = [1, 40, 41, 100, 1000, 4000];

        let blocks: Vec<_> = sizes
            .iter()
            .map(|&size| (pool.allocate(size).unwrap().unwrap(), size))
            .collect();

        for &(ptr, size) in &blocks {
            unsafe { ptr.as_ptr().write_bytes(0xFF, size) };
        }
        assert!(pool.audit().is_ok());

        for (ptr, _) in blocks {
            pool.free(ptr.as_ptr());
        }
        check_pool_full(&pool);
    }

    #[test]
    fn double_free_is_rejected() {
        let pool = heap_pool();
        let _keep = pool.allocate(1).unwrap();
        let mem = pool.allocate(1).unwrap().unwrap();

        pool.try_free(mem.as_ptr()).unwrap();
        let before = pool.audit().unwrap();

        assert!(matches!(pool.try_free(mem.as_ptr()), Err(Error::InvalidPointer { .. })));
        assert_eq!(pool.audit().unwrap(), before);
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let pool = heap_pool();
        let mem = pool.allocate(64).unwrap().unwrap();
        let mut local = 0u8;

        assert!(matches!(pool.try_free(&mut local), Err(Error::InvalidPointer { .. })));
        assert!(matches!(
            pool.try_free(unsafe { mem.as_ptr().add(8) }),
            Err(Error::InvalidPointer { .. })
        ));

        pool.free(unsafe { mem.as_ptr().add(8) });
        assert_eq!(pool.stats().reserved_bytes, level_size(SMALLEST_LEVEL + 1));
    }

    #[test]
    fn null_free_is_a_no_op() {
        let pool = heap_pool();

        assert!(pool.try_free(std::ptr::null_mut()).is_ok());
        check_pool_full(&pool);
    }

    #[test]
    fn uninitialized_pool() {
        let pool = BuddyPool::with_memory(HeapMemory);

        assert!(!pool.is_initialized());
        assert!(matches!(pool.allocate(1), Err(Error::NotInitialized)));
        assert_eq!(pool.allocate(0).unwrap(), None);
        assert!(pool.try_free(0x1000 as *mut u8).is_ok());
        assert_eq!(pool.stats(), PoolStats::default());
        assert_eq!(pool.audit().unwrap(), vec![]);
        assert!(pool.destroy().is_ok());
    }

    #[test]
    fn init_twice_is_rejected() {
        let pool = heap_pool();
        let base = pool.base();

        assert!(matches!(pool.init(0), Err(Error::AlreadyInitialized)));
        assert_eq!(pool.base(), base);
        check_pool_full(&pool);
    }

    #[test]
    fn destroy_resets_everything() {
        let pool = heap_pool();
        pool.allocate(1000).unwrap();

        pool.destroy().unwrap();

        assert!(!pool.is_initialized());
        assert_eq!(pool.level(), 0);
        assert_eq!(pool.size_bytes(), 0);
        assert_eq!(pool.base(), None);
        check_sentinels_empty_below(&pool, MAX_LEVEL);

        pool.destroy().unwrap();
    }

    #[test]
    fn pool_can_be_reinitialized_after_destroy() {
        let pool = heap_pool();
        pool.destroy().unwrap();

        pool.init(level_size(MIN_LEVEL + 1)).unwrap();

        assert_eq!(pool.level(), MIN_LEVEL + 1);
        check_pool_full(&pool);
    }

    #[test]
    fn audit_catches_unmerged_buddies() {
        let pool = heap_pool();
        let a = pool.allocate(1).unwrap().unwrap();
        let b = pool.allocate(1).unwrap().unwrap();
        pool.free(a.as_ptr());

        {
            // Mark `b` free without going through `coalesce`.
            let mut guard = pool.state.lock();
            let state = &mut *guard;
            let arena = state.arena.as_mut().unwrap();
            let offset = arena.offset_of(b.as_ptr().addr()).unwrap() - HEADER_SIZE;

            arena.write(offset, &Header::available(SMALLEST_LEVEL));
            state.lists.push_front(arena, SMALLEST_LEVEL, offset);
        }

        assert!(matches!(pool.audit(), Err(InvariantError::FreeBuddies { .. })));
    }
}
