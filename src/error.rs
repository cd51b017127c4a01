use std::io;

use thiserror::Error;

/// Errors returned by [`crate::BuddyPool`] operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The backing-memory provider could not supply the arena.
    #[error("failed to acquire backing memory: {0}")]
    AllocationFailed(#[source] io::Error),

    /// No free block at or below the arena's level can hold the request.
    #[error("out of memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    /// The backing-memory provider failed to take the arena back. The pool
    /// has been reset regardless.
    #[error("failed to release backing memory: {0}")]
    ProviderReleaseFailed(#[source] io::Error),

    #[error("pool has no arena")]
    NotInitialized,

    #[error("pool already owns an arena")]
    AlreadyInitialized,

    /// The pointer does not name a block currently reserved from this pool.
    #[error("pointer {addr:#x} was not handed out by this pool")]
    InvalidPointer { addr: usize },

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A broken pool invariant found by [`crate::BuddyPool::audit`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantError {
    #[error("block at offset {offset:#x} has invalid level {level}")]
    BadLevel { offset: usize, level: u32 },

    #[error("block at offset {offset:#x} is not aligned to its level {level}")]
    Misaligned { offset: usize, level: u32 },

    #[error("block at offset {offset:#x} has tag {tag:?}")]
    BadTag { offset: usize, tag: crate::block::Tag },

    #[error("blocks cover {covered} bytes of a {size} byte arena")]
    Conservation { covered: usize, size: usize },

    #[error("buddies at {offset:#x} and {buddy:#x} are both free at level {level}")]
    FreeBuddies { offset: usize, buddy: usize, level: u32 },

    #[error("free list {level} disagrees with the block at offset {offset:#x}")]
    ListMismatch { level: u32, offset: usize },

    #[error("free list {level} holds {listed} blocks but the arena has {found}")]
    ListLength { level: u32, listed: usize, found: usize },

    #[error("sentinel {level} is corrupted")]
    Sentinel { level: u32 },
}
