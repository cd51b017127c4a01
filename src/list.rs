use crate::{
    arena::Arena,
    block::{Link, Tag},
    config::MAX_LEVEL,
};

/// Anchor of the circular free list of one level. It lives in the pool, not in
/// the arena, and never represents real memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sentinel {
    pub tag: Tag,
    pub level: u32,
    pub next: Link,
    pub prev: Link,
}

impl Sentinel {
    const fn empty(level: u32) -> Self {
        Self {
            tag: Tag::Unused,
            level,
            next: Link::Head(level),
            prev: Link::Head(level),
        }
    }
}

/// One intrusive, circular, doubly-linked list of free blocks per level.
///
/// The link fields of a free block live in its own header, so the registry
/// needs no storage beyond the sentinels:
///
/// ```text
///        +---------------------------------------------------+
///        v                                                   |
/// +------------+     +--------------+     +--------------+   |
/// | levels[k]  | <-> | Block(free)  | <-> | Block(free)  | <-+
/// +------------+     +--------------+     +--------------+
/// ```
///
/// A list is empty when its sentinel links back to itself. Insertions go to the
/// front, so each level hands out its most recently freed block first.
pub(crate) struct FreeLists {
    heads: [Sentinel; MAX_LEVEL as usize],
}

pub(crate) struct Iter<'a> {
    lists: &'a FreeLists,
    arena: &'a Arena,
    current: Link,
}

impl FreeLists {
    pub fn new() -> Self {
        Self {
            heads: std::array::from_fn(|level| Sentinel::empty(level as u32)),
        }
    }

    /// Empties every list.
    pub fn reset(&mut self) {
        for (level, head) in self.heads.iter_mut().enumerate() {
            *head = Sentinel::empty(level as u32);
        }
    }

    #[inline]
    pub fn sentinel(&self, level: u32) -> &Sentinel {
        &self.heads[level as usize]
    }

    #[inline]
    pub fn is_empty(&self, level: u32) -> bool {
        self.sentinel(level).next == Link::Head(level)
    }

    pub fn len(&self, arena: &Arena, level: u32) -> usize {
        self.iter(arena, level).count()
    }

    pub fn iter<'a>(&'a self, arena: &'a Arena, level: u32) -> Iter<'a> {
        Iter {
            lists: self,
            arena,
            current: self.sentinel(level).next,
        }
    }

    /// Links the available block at `offset` in front of the list of `level`.
    pub fn push_front(&mut self, arena: &mut Arena, level: u32, offset: usize) {
        let head = Link::Head(level);
        let first = self.sentinel(level).next;

        arena.update(offset, |header| {
            debug_assert_eq!(header.tag, Tag::Available);
            debug_assert_eq!(header.level, level);
            debug_assert!(header.next.is_none() && header.prev.is_none());

            header.next = Some(first);
            header.prev = Some(head);
        });

        self.set_prev(arena, first, Link::Block(offset));
        self.set_next(arena, head, Link::Block(offset));

        debug_assert_eq!(self.next_of(arena, head), Link::Block(offset));
        debug_assert_eq!(self.prev_of(arena, first), Link::Block(offset));
    }

    /// Unlinks the block at `offset` from whatever list holds it and clears
    /// its links.
    pub fn remove(&mut self, arena: &mut Arena, offset: usize) {
        let header = arena.read(offset);
        let (Some(next), Some(prev)) = (header.next, header.prev) else {
            panic!("block at offset {offset:#x} is not in a free list");
        };

        debug_assert_eq!(self.next_of(arena, prev), Link::Block(offset));
        debug_assert_eq!(self.prev_of(arena, next), Link::Block(offset));

        self.set_next(arena, prev, next);
        self.set_prev(arena, next, prev);

        arena.update(offset, |header| {
            header.next = None;
            header.prev = None;
        });

        debug_assert_eq!(self.next_of(arena, prev), next);
        debug_assert_eq!(self.prev_of(arena, next), prev);
    }

    /// Removes and returns the first block of `level`, if any.
    pub fn pop_front(&mut self, arena: &mut Arena, level: u32) -> Option<usize> {
        match self.sentinel(level).next {
            Link::Head(_) => None,
            Link::Block(offset) => {
                self.remove(arena, offset);
                Some(offset)
            }
        }
    }

    fn next_of(&self, arena: &Arena, link: Link) -> Link {
        match link {
            Link::Head(level) => self.sentinel(level).next,
            Link::Block(offset) => linked(arena.read(offset).next, offset),
        }
    }

    fn prev_of(&self, arena: &Arena, link: Link) -> Link {
        match link {
            Link::Head(level) => self.sentinel(level).prev,
            Link::Block(offset) => linked(arena.read(offset).prev, offset),
        }
    }

    fn set_next(&mut self, arena: &mut Arena, link: Link, to: Link) {
        match link {
            Link::Head(level) => self.heads[level as usize].next = to,
            Link::Block(offset) => arena.update(offset, |header| header.next = Some(to)),
        }
    }

    fn set_prev(&mut self, arena: &mut Arena, link: Link, to: Link) {
        match link {
            Link::Head(level) => self.heads[level as usize].prev = to,
            Link::Block(offset) => arena.update(offset, |header| header.prev = Some(to)),
        }
    }
}

fn linked(link: Option<Link>, offset: usize) -> Link {
    match link {
        Some(link) => link,
        None => panic!("block at offset {offset:#x} is not in a free list"),
    }
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        match self.current {
            Link::Head(_) => None,
            Link::Block(offset) => {
                self.current = self.lists.next_of(self.arena, self.current);
                Some(offset)
            }
        }
    }
}
