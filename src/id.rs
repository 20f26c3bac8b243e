//! Marker identifier encoding.
//!
//! A marker id packs the owning tracker and the marker's index within that
//! tracker into one 32-bit integer: `(tracker << 12) | index`. The index
//! occupies the low 12 bits (0..=4095).

use std::fmt;

/// Number of bits reserved for the marker index.
pub const INDEX_BITS: u32 = 12;

/// Mask selecting the marker index.
pub const INDEX_MASK: i32 = 0x0fff;

/// Largest valid marker index.
pub const MAX_INDEX: u32 = 4095;

/// Build a marker id from a tracker id and a marker index.
pub const fn encode_marker(tracker: i32, index: i32) -> i32 {
    (tracker << INDEX_BITS) | (index & INDEX_MASK)
}

/// Marker index (low 12 bits) of a marker id.
pub const fn decode_index(id: i32) -> i32 {
    id & INDEX_MASK
}

/// Tracker id (upper bits) of a marker id.
pub const fn decode_tracker(id: i32) -> i32 {
    id >> INDEX_BITS
}

/// Strongly typed marker id.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarkerId(pub i32);

impl MarkerId {
    pub const fn new(tracker: i32, index: i32) -> Self {
        Self(encode_marker(tracker, index))
    }

    pub const fn tracker(self) -> i32 {
        decode_tracker(self.0)
    }

    pub const fn index(self) -> i32 {
        decode_index(self.0)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl From<i32> for MarkerId {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

impl From<MarkerId> for i32 {
    fn from(id: MarkerId) -> Self {
        id.0
    }
}

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tracker(), self.index())
    }
}
