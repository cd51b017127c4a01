//! Level bounds for the pool and the construction-time [`PoolConfig`].

use log::warn;

use crate::{
    block::HEADER_SIZE,
    error::{Error, Result},
    utils::{bytes_to_level, level_size},
};

/// Level used when the pool is initialized with a requested size of zero (1 GiB).
pub const DEFAULT_LEVEL: u32 = 30;

/// Smallest arena level a pool will be created with (1 MiB).
pub const MIN_LEVEL: u32 = 20;

/// Exclusive upper bound on the arena level. The largest arena is
/// `2^(MAX_LEVEL - 1)` bytes; this is also the number of free-list sentinels.
pub const MAX_LEVEL: u32 = if usize::BITS < 48 { usize::BITS } else { 48 };

/// Smallest block the allocator hands out. A block this size still has to hold
/// its own header.
pub const SMALLEST_LEVEL: u32 = 6;

const _: () = assert!(HEADER_SIZE <= level_size(SMALLEST_LEVEL));
const _: () = assert!(SMALLEST_LEVEL <= MIN_LEVEL && MIN_LEVEL < MAX_LEVEL);

/// Level bounds a pool is built with.
///
/// `max_level` is exclusive: the arena is clamped into
/// `[min_level, max_level - 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub default_level: u32,
    pub min_level: u32,
    pub max_level: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolConfig {
    pub const fn new() -> Self {
        Self {
            default_level: DEFAULT_LEVEL,
            min_level: MIN_LEVEL,
            max_level: MAX_LEVEL,
        }
    }

    pub const fn with_default_level(mut self, level: u32) -> Self {
        self.default_level = level;
        self
    }

    pub const fn with_min_level(mut self, level: u32) -> Self {
        self.min_level = level;
        self
    }

    pub const fn with_max_level(mut self, level: u32) -> Self {
        self.max_level = level;
        self
    }

    /// Checks that the bounds describe at least one representable arena.
    pub fn validate(&self) -> Result<()> {
        if self.min_level < SMALLEST_LEVEL {
            return Err(Error::InvalidConfig("min_level is below the smallest block level"));
        }
        if self.max_level > MAX_LEVEL {
            return Err(Error::InvalidConfig("max_level exceeds the number of free lists"));
        }
        if self.min_level >= self.max_level {
            return Err(Error::InvalidConfig("min_level must be below max_level"));
        }
        if !(self.min_level..self.max_level).contains(&self.default_level) {
            return Err(Error::InvalidConfig("default_level is outside [min_level, max_level)"));
        }

        Ok(())
    }

    /// Level of the arena a pool builds for `requested` bytes.
    ///
    /// Zero selects `default_level`. Anything else is rounded up to a power of
    /// two and then clamped, never rejected.
    pub fn arena_level(&self, requested: usize) -> u32 {
        if requested == 0 {
            return self.default_level;
        }

        let wanted = bytes_to_level(requested);
        let level = wanted.clamp(self.min_level, self.max_level - 1);

        if level < wanted {
            warn!("requested arena of {requested} bytes clamped down to level {level}");
        }

        level
    }
}
