//! Translation of scan options into lexicographic range bounds.
//!
//! A scan walks from `start` towards `end`. Forward scans start at the lower
//! bound; reverse scans start at the upper bound, matching the argument
//! order of the server's descending lex range command.

use bytes::Bytes;
use common::LexBound;

use crate::config::ScanOptions;
use crate::error::{Error, Result};

/// The bounds of one scan, in scan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScanRange {
    pub(crate) reverse: bool,
    pub(crate) start: LexBound,
    pub(crate) end: LexBound,
}

impl ScanRange {
    /// Validates `options` and translates them into scan-order bounds.
    pub(crate) fn from_options(options: &ScanOptions) -> Result<Self> {
        let lower = side(&options.gt, &options.gte, "gt", "gte", LexBound::Min)?;
        let upper = side(&options.lt, &options.lte, "lt", "lte", LexBound::Max)?;
        let (start, end) = if options.reverse {
            (upper, lower)
        } else {
            (lower, upper)
        };
        Ok(Self {
            reverse: options.reverse,
            start,
            end,
        })
    }

    /// Moves the start past `key`, so the next fetch resumes after it.
    pub(crate) fn resume_after(&mut self, key: Bytes) {
        self.start = LexBound::Exclusive(key);
    }

    /// The range a reseek to `target` scans: `target` inclusive, unless the
    /// current start already excludes it. The end is kept.
    pub(crate) fn seek(&self, target: Bytes) -> Self {
        let candidate = LexBound::Inclusive(target);
        let start = if self.reverse {
            tighter_upper(&self.start, candidate)
        } else {
            tighter_lower(&self.start, candidate)
        };
        Self {
            reverse: self.reverse,
            start,
            end: self.end.clone(),
        }
    }
}

fn side(
    exclusive: &Option<Bytes>,
    inclusive: &Option<Bytes>,
    exclusive_name: &str,
    inclusive_name: &str,
    unbounded: LexBound,
) -> Result<LexBound> {
    match (exclusive, inclusive) {
        (Some(_), Some(_)) => Err(Error::InvalidArgument(format!(
            "{} and {} cannot both be set",
            exclusive_name, inclusive_name
        ))),
        (Some(key), None) => Ok(LexBound::Exclusive(key.clone())),
        (None, Some(key)) => Ok(LexBound::Inclusive(key.clone())),
        (None, None) => Ok(unbounded),
    }
}

/// Of two lower bounds, the one admitting fewer keys.
fn tighter_lower(current: &LexBound, candidate: LexBound) -> LexBound {
    match (current, &candidate) {
        (LexBound::Min, _) => candidate,
        (LexBound::Max, _) => LexBound::Max,
        (LexBound::Inclusive(a), LexBound::Inclusive(b)) if b > a => candidate,
        (LexBound::Exclusive(a), LexBound::Inclusive(b)) if b > a => candidate,
        _ => current.clone(),
    }
}

/// Of two upper bounds, the one admitting fewer keys.
fn tighter_upper(current: &LexBound, candidate: LexBound) -> LexBound {
    match (current, &candidate) {
        (LexBound::Max, _) => candidate,
        (LexBound::Min, _) => LexBound::Min,
        (LexBound::Inclusive(a), LexBound::Inclusive(b)) if b < a => candidate,
        (LexBound::Exclusive(a), LexBound::Inclusive(b)) if b < a => candidate,
        _ => current.clone(),
    }
}
