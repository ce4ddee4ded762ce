//! Byte utilities for lexicographic key ranges.

use bytes::{Bytes, BytesMut};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::ops::{Bound, RangeBounds};

/// Computes the lexicographic successor of a key prefix.
///
/// Returns the smallest byte sequence that is greater than every sequence
/// starting with `data`, or `None` when no such sequence exists (the input is
/// empty or made only of `0xFF` bytes).
///
/// - `b"a"` → `Some(b"b")`
/// - `[0x61, 0xFF]` → `Some([0x62])`
/// - `[0xFF]` → `None`
pub fn lex_increment(data: &[u8]) -> Option<Bytes> {
    let mut result = BytesMut::from(data);
    while let Some(last) = result.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(result.freeze());
        }
        result.truncate(result.len() - 1);
    }
    None
}

/// A range over byte sequences ordered lexicographically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BytesRange {
    pub start: Bound<Bytes>,
    pub end: Bound<Bytes>,
}

impl BytesRange {
    pub fn new(start: Bound<Bytes>, end: Bound<Bytes>) -> Self {
        Self { start, end }
    }

    /// Creates a range that scans everything.
    pub fn unbounded() -> Self {
        Self::new(Unbounded, Unbounded)
    }

    /// Creates a range covering every key that starts with `prefix`.
    pub fn prefix(prefix: Bytes) -> Self {
        if prefix.is_empty() {
            return Self::unbounded();
        }
        let end = match lex_increment(&prefix) {
            Some(end) => Excluded(end),
            None => Unbounded,
        };
        Self::new(Included(prefix), end)
    }

    pub fn contains(&self, k: &[u8]) -> bool {
        let after_start = match &self.start {
            Included(s) => k >= s.as_ref(),
            Excluded(s) => k > s.as_ref(),
            Unbounded => true,
        };
        let before_end = match &self.end {
            Included(e) => k <= e.as_ref(),
            Excluded(e) => k < e.as_ref(),
            Unbounded => true,
        };
        after_start && before_end
    }

    /// True when no byte sequence can fall inside the range. Such bounds
    /// must not reach `BTreeMap::range`, which panics on them.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Included(s), Included(e)) => s > e,
            (Included(s), Excluded(e)) | (Excluded(s), Included(e)) | (Excluded(s), Excluded(e)) => {
                s >= e
            }
            _ => false,
        }
    }
}

impl RangeBounds<Bytes> for BytesRange {
    fn start_bound(&self) -> Bound<&Bytes> {
        self.start.as_ref()
    }
    fn end_bound(&self) -> Bound<&Bytes> {
        self.end.as_ref()
    }
}
