use serde::{Deserialize, Serialize};

/// Half-open byte span inside a decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, offset: usize) -> bool {
        (self.start..self.end).contains(&offset)
    }

    /// True when `other` lies entirely inside this range.
    pub fn covers(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Where a property's pieces sit in the buffer it was decoded from.
///
/// `range` spans the whole property (tag and payload); `size_field` is the
/// offset of the u32 declared payload size, `payload` the bytes that size
/// counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertySpan {
    pub range: ByteRange,
    pub size_field: usize,
    pub payload: ByteRange,
}
