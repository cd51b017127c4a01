//! Offset-based view over the memory a pool manages.
//!
//! Blocks are addressed by their offset from the arena base. Headers are
//! copied in and out through [`Arena::read`] and [`Arena::write`], which check
//! the offset against the arena bounds, so the rest of the crate never
//! reinterprets an address as a struct.

use std::ptr::{self, NonNull};

use crate::block::{HEADER_SIZE, Header};

pub(crate) struct Arena {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the arena exclusively owns its memory until it is released, so it
// can move between threads with the pool that holds it.
unsafe impl Send for Arena {}

impl Arena {
    /// **SAFETY**: `base..base + len` must be valid for reads and writes and
    /// must not be accessed through anything but this arena (and the payload
    /// pointers it hands out) until it is released.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Offset of `addr` from the arena base, if it lies inside the arena.
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        addr.checked_sub(self.base.as_ptr().addr())
            .filter(|&offset| offset < self.len)
    }

    /// Pointer to the content of the block at `offset`.
    pub fn payload(&self, offset: usize) -> NonNull<u8> {
        self.check(offset);

        // SAFETY: `check` keeps the header inside the arena, and the payload
        // starts right where the header ends.
        unsafe { self.base.add(offset + HEADER_SIZE) }
    }

    pub fn read(&self, offset: usize) -> Header {
        self.check(offset);

        let mut bytes = [0; HEADER_SIZE];
        // SAFETY: `check` guarantees `offset..offset + HEADER_SIZE` is in bounds.
        unsafe {
            ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), bytes.as_mut_ptr(), HEADER_SIZE);
        }

        Header::decode(&bytes)
    }

    pub fn write(&mut self, offset: usize, header: &Header) {
        self.check(offset);

        let bytes = header.encode();
        // SAFETY: `check` guarantees `offset..offset + HEADER_SIZE` is in bounds.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr().add(offset), HEADER_SIZE);
        }
    }

    pub fn update(&mut self, offset: usize, f: impl FnOnce(&mut Header)) {
        let mut header = self.read(offset);
        f(&mut header);
        self.write(offset, &header);
    }

    fn check(&self, offset: usize) {
        assert!(
            offset.checked_add(HEADER_SIZE).is_some_and(|end| end <= self.len),
            "header at offset {offset:#x} is outside the {} byte arena",
            self.len,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Tag;

    fn with_arena(len: usize, f: impl FnOnce(&mut Arena)) {
        let mut memory = vec![0u64; len / 8];
        let base = NonNull::new(memory.as_mut_ptr().cast::<u8>()).unwrap();
        let mut arena = unsafe { Arena::new(base, len) };

        f(&mut arena);
    }

    #[test]
    fn headers_land_at_their_offset() {
        with_arena(256, |arena| {
            arena.write(64, &Header::reserved(6));

            assert_eq!(arena.read(64).tag, Tag::Reserved);
            assert_eq!(arena.read(0).tag, Tag::Absorbed);
            assert_eq!(arena.read(128).tag, Tag::Absorbed);
        });
    }

    #[test]
    fn update_rewrites_one_field() {
        with_arena(128, |arena| {
            arena.write(0, &Header::reserved(7));
            arena.update(0, |header| header.tag = Tag::Available);

            assert_eq!(arena.read(0), Header::available(7));
        });
    }

    #[test]
    fn offsets_outside_the_arena_are_rejected() {
        with_arena(128, |arena| {
            let base = arena.base().as_ptr().addr();

            assert_eq!(arena.offset_of(base), Some(0));
            assert_eq!(arena.offset_of(base + 127), Some(127));
            assert_eq!(arena.offset_of(base + 128), None);
            assert_eq!(arena.offset_of(base - 1), None);
        });
    }

    #[test]
    fn payload_follows_header() {
        with_arena(128, |arena| {
            let base = arena.base().as_ptr().addr();
            assert_eq!(arena.payload(64).as_ptr().addr(), base + 64 + HEADER_SIZE);
        });
    }

    #[test]
    #[should_panic]
    fn header_past_the_end_panics() {
        with_arena(128, |arena| {
            arena.read(120);
        });
    }
}
