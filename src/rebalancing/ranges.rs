//! Compact rendering of partition sets for log output.

use crate::types::PartitionId;
use std::collections::BTreeSet;
use std::fmt;

/// Displays a partition set with contiguous runs collapsed, e.g. `1-3, 5, 7-8`.
pub struct PartitionRanges<'a>(pub &'a BTreeSet<PartitionId>);

impl fmt::Display for PartitionRanges<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.0.iter().copied();
        let Some(first) = iter.next() else {
            return Ok(());
        };

        let mut start = first;
        let mut prev = first;
        let mut wrote = false;

        let mut flush = |f: &mut fmt::Formatter<'_>, start: PartitionId, end: PartitionId| {
            if wrote {
                f.write_str(", ")?;
            }
            wrote = true;
            if start == end {
                write!(f, "{}", start)
            } else {
                write!(f, "{}-{}", start, end)
            }
        };

        for p in iter {
            if p != prev + 1 {
                flush(f, start, prev)?;
                start = p;
            }
            prev = p;
        }
        flush(f, start, prev)
    }
}

/// Render a partition set with contiguous runs collapsed.
pub fn compress_ranges(partitions: &BTreeSet<PartitionId>) -> String {
    PartitionRanges(partitions).to_string()
}
