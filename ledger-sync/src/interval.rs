//! Set algebra over half-open date ranges.
//!
//! Used by the coverage tracker to find the ranges still to request ([`clip`]) and to
//! compact processed records ([`merge`]).

use crate::primitives::{DateRange, RangeCoverageRecord};

/// Anything carrying a date range, so that stored records can be merged without losing
/// their identity.
pub trait HasDateRange {
    fn date_range(&self) -> DateRange;
}

impl HasDateRange for DateRange {
    fn date_range(&self) -> DateRange {
        *self
    }
}

impl HasDateRange for RangeCoverageRecord {
    fn date_range(&self) -> DateRange {
        self.range()
    }
}

/// Result of [`merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult<T> {
    /// coalesced ranges that are not stored verbatim and must be written
    pub new_ranges: Vec<DateRange>,
    /// stored records superseded by a coalesced range, to be deleted
    pub old_ranges: Vec<T>,
    /// the complete coalesced shape
    pub merged_ranges: Vec<DateRange>,
}

/// Sorts ranges and coalesces overlapping or adjacent ones. Empty ranges are dropped.
pub fn coalesce<I>(ranges: I) -> Vec<DateRange>
where
    I: IntoIterator<Item = DateRange>,
{
    let mut ranges: Vec<DateRange> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
    ranges.sort();

    let mut coalesced: Vec<DateRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match coalesced.last_mut() {
            Some(last) if range.start() <= last.end() => {
                *last = DateRange::new(last.start(), last.end().max(range.end()));
            }
            _ => coalesced.push(range),
        }
    }
    coalesced
}

/// Returns the parts of `requested` not covered by any range of `covered`.
///
/// The result is sorted, and no two returned ranges overlap or touch. `covered` may be
/// unsorted and overlapping.
pub fn clip<I>(requested: &[DateRange], covered: I) -> Vec<DateRange>
where
    I: IntoIterator<Item = DateRange>,
{
    let requested = coalesce(requested.iter().copied());
    let covered = coalesce(covered);

    let mut uncovered = Vec::new();
    let mut covered_iter = covered.iter().peekable();
    for range in requested {
        let mut cursor = range.start();
        while let Some(hole) = covered_iter.peek() {
            if hole.end() <= cursor {
                covered_iter.next();
                continue;
            }
            if hole.start() >= range.end() {
                break;
            }
            if hole.start() > cursor {
                uncovered.push(DateRange::new(cursor, hole.start()));
            }
            cursor = hole.end();
            if cursor >= range.end() {
                break;
            }
            covered_iter.next();
        }
        if cursor < range.end() {
            uncovered.push(DateRange::new(cursor, range.end()));
        }
    }
    uncovered
}

/// Coalesces stored records, reporting which ranges must be written and which records
/// become obsolete.
///
/// Merging the returned `merged_ranges` again yields no new and no old ranges.
pub fn merge<T, I>(stored: I) -> MergeResult<T>
where
    T: HasDateRange + Clone,
    I: IntoIterator<Item = T>,
{
    let mut old_ranges = Vec::new();
    let mut records: Vec<T> = Vec::new();
    for record in stored {
        if record.date_range().is_empty() {
            old_ranges.push(record);
        } else {
            records.push(record);
        }
    }
    records.sort_by_key(|record| record.date_range());

    let mut new_ranges = Vec::new();
    let mut merged_ranges = Vec::new();

    let mut group: Vec<T> = Vec::new();
    let mut group_range: Option<DateRange> = None;
    for record in records {
        let range = record.date_range();
        match group_range {
            Some(current) if range.start() <= current.end() => {
                group_range = Some(DateRange::new(
                    current.start(),
                    current.end().max(range.end()),
                ));
            }
            Some(current) => {
                close_group(
                    current,
                    std::mem::take(&mut group),
                    &mut new_ranges,
                    &mut old_ranges,
                );
                merged_ranges.push(current);
                group_range = Some(range);
            }
            None => group_range = Some(range),
        }
        group.push(record);
    }
    if let Some(current) = group_range {
        close_group(current, group, &mut new_ranges, &mut old_ranges);
        merged_ranges.push(current);
    }

    MergeResult {
        new_ranges,
        old_ranges,
        merged_ranges,
    }
}

fn close_group<T: HasDateRange>(
    coalesced: DateRange,
    members: Vec<T>,
    new_ranges: &mut Vec<DateRange>,
    old_ranges: &mut Vec<T>,
) {
    let mut kept = false;
    for member in members {
        if member.date_range() == coalesced && !kept {
            kept = true;
        } else {
            old_ranges.push(member);
        }
    }
    if !kept {
        new_ranges.push(coalesced);
    }
}

/// Sum of the durations of `ranges`, counting overlaps once.
pub fn total_duration<I>(ranges: I) -> u64
where
    I: IntoIterator<Item = DateRange>,
{
    coalesce(ranges).iter().map(|range| range.duration()).sum()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    fn r(start: u64, end: u64) -> DateRange {
        DateRange::new(start, end)
    }

    #[test_case(&[r(0, 10)], &[], &[r(0, 10)] ; "nothing covered")]
    #[test_case(&[r(0, 10)], &[r(0, 10)], &[] ; "fully covered")]
    #[test_case(&[r(0, 10)], &[r(3, 5)], &[r(0, 3), r(5, 10)] ; "hole in the middle")]
    #[test_case(&[r(0, 10)], &[r(8, 20), r(0, 2)], &[r(2, 8)] ; "both edges covered")]
    #[test_case(&[r(0, 5), r(5, 10)], &[], &[r(0, 10)] ; "adjacent requests are coalesced")]
    #[test_case(&[r(0, 10), r(20, 30)], &[r(5, 25)], &[r(0, 5), r(25, 30)] ; "cover spans requests")]
    #[test_case(&[r(0, 10)], &[r(4, 6), r(2, 5)], &[r(0, 2), r(6, 10)] ; "unsorted overlapping cover")]
    fn clip_cases(requested: &[DateRange], covered: &[DateRange], expected: &[DateRange]) {
        assert_eq!(clip(requested, covered.iter().copied()), expected.to_vec());
    }

    #[test]
    fn merge_reports_superseded_records() {
        let stored = vec![r(0, 10), r(10, 20), r(30, 40), r(35, 38), r(50, 60)];
        let result = merge(stored);

        assert_eq!(result.merged_ranges, vec![r(0, 20), r(30, 40), r(50, 60)]);
        assert_eq!(result.new_ranges, vec![r(0, 20)]);
        assert_eq!(result.old_ranges, vec![r(0, 10), r(10, 20), r(35, 38)]);
    }

    #[test]
    fn merge_drops_verbatim_duplicates() {
        let result = merge(vec![r(0, 10), r(0, 10)]);
        assert!(result.new_ranges.is_empty());
        assert_eq!(result.old_ranges, vec![r(0, 10)]);
        assert_eq!(result.merged_ranges, vec![r(0, 10)]);
    }

    fn arb_ranges() -> impl Strategy<Value = Vec<DateRange>> {
        prop::collection::vec((0u64..200, 0u64..40), 0..12).prop_map(|pairs| {
            pairs
                .into_iter()
                .map(|(start, len)| DateRange::new(start, start + len))
                .collect()
        })
    }

    fn covers(ranges: &[DateRange], point: u64) -> bool {
        ranges.iter().any(|range| range.contains(point))
    }

    proptest! {
        #[test]
        fn clip_subtracts_processed_ranges(requested in arb_ranges(), processed in arb_ranges()) {
            let merged = merge(processed.clone()).merged_ranges;
            let clipped = clip(&requested, merged);

            for point in 0..260u64 {
                let expected = covers(&requested, point) && !covers(&processed, point);
                prop_assert_eq!(covers(&clipped, point), expected, "point {}", point);
            }
            for pair in clipped.windows(2) {
                prop_assert!(pair[0].end() < pair[1].start());
            }
            prop_assert!(clipped.iter().all(|range| !range.is_empty()));
        }

        #[test]
        fn merge_is_idempotent(stored in arb_ranges()) {
            let first = merge(stored);
            let second = merge(first.merged_ranges.clone());

            prop_assert!(second.new_ranges.is_empty());
            prop_assert!(second.old_ranges.is_empty());
            prop_assert_eq!(second.merged_ranges, first.merged_ranges);
        }

        #[test]
        fn merge_writes_then_deletes_to_the_merged_shape(stored in arb_ranges()) {
            let result = merge(stored.clone());
            let mut remaining = stored;
            for old in &result.old_ranges {
                let index = remaining.iter().position(|range| range == old).unwrap();
                remaining.remove(index);
            }
            remaining.extend(result.new_ranges.iter().copied());
            remaining.sort();
            prop_assert_eq!(remaining, result.merged_ranges);
        }
    }
}
