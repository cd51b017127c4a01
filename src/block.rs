/// Header size of a block in bytes. Every block, free or reserved, starts with
/// one and the user's payload follows it.
pub const HEADER_SIZE: usize = 24;

/// State of a block as recorded in its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Tag {
    /// Header of a block that was merged into its lower buddy. Zeroed memory
    /// also reads as this, so it never passes for a live block.
    Absorbed = 0,
    /// The block sits in the free list of its level.
    Available = 1,
    /// The block has been handed to a caller.
    Reserved = 2,
    /// Only ever found on free-list sentinels.
    Unused = 3,
}

impl Tag {
    const fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::Unused,
            _ => Self::Absorbed,
        }
    }
}

/// One end of a free-list link: either the sentinel of a level or a block
/// identified by its offset from the arena base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    Head(u32),
    Block(usize),
}

/// Encoded in the upper bit so sentinels can't collide with block offsets.
const HEAD_BIT: u64 = 1 << 63;
/// Encoding of a cleared link.
const NO_LINK: u64 = u64::MAX;

impl Link {
    fn encode(link: Option<Self>) -> u64 {
        match link {
            None => NO_LINK,
            Some(Self::Head(level)) => HEAD_BIT | level as u64,
            Some(Self::Block(offset)) => offset as u64,
        }
    }

    fn decode(raw: u64) -> Option<Self> {
        match raw {
            NO_LINK => None,
            raw if raw & HEAD_BIT != 0 => Some(Self::Head((raw & !HEAD_BIT) as u32)),
            raw => Some(Self::Block(raw as usize)),
        }
    }
}

/// Metadata at the start of every block. Content is placed after it.
///
/// ```text
/// +---------------------+ <------+
/// |  tag (2) | level (2)|        |
/// +---------------------+        |
/// |     padding (4)     |        |
/// +---------------------+        | -> Header
/// |      next (8)       |        |
/// +---------------------+        |
/// |      prev (8)       |        |
/// +---------------------+ <------+
/// |       Content       |        |
/// |         ...         |        | -> Addressable content
/// |                     |        |
/// +---------------------+ <------+
/// ```
///
/// `level` is authoritative: it shrinks as the block is split and grows as it
/// is merged. `next` and `prev` are only set while the block is in a free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub tag: Tag,
    pub level: u32,
    pub next: Option<Link>,
    pub prev: Option<Link>,
}

impl Header {
    pub const fn available(level: u32) -> Self {
        Self { tag: Tag::Available, level, next: None, prev: None }
    }

    pub const fn reserved(level: u32) -> Self {
        Self { tag: Tag::Reserved, level, next: None, prev: None }
    }

    pub const fn absorbed() -> Self {
        Self { tag: Tag::Absorbed, level: 0, next: None, prev: None }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0; HEADER_SIZE];

        bytes[0..2].copy_from_slice(&(self.tag as u16).to_ne_bytes());
        bytes[2..4].copy_from_slice(&(self.level as u16).to_ne_bytes());
        bytes[8..16].copy_from_slice(&Link::encode(self.next).to_ne_bytes());
        bytes[16..24].copy_from_slice(&Link::encode(self.prev).to_ne_bytes());

        bytes
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let word = |range: std::ops::Range<usize>| {
            let mut raw = [0; 8];
            raw.copy_from_slice(&bytes[range]);
            u64::from_ne_bytes(raw)
        };

        Self {
            tag: Tag::from_raw(u16::from_ne_bytes([bytes[0], bytes[1]])),
            level: u16::from_ne_bytes([bytes[2], bytes[3]]) as u32,
            next: Link::decode(word(8..16)),
            prev: Link::decode(word(16..24)),
        }
    }
}
