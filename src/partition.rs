//! Range math: splitting `[0, size-1]` into per-worker segments.

/// Planned byte range, both bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRange {
    pub start: u64,
    pub end: u64,
}

impl SegmentRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Splits `size` bytes into `threads` contiguous inclusive ranges.
///
/// All segments get `size / threads` bytes except the last, whose end is
/// forced to `size - 1` so the remainder is absorbed without a gap or a
/// dropped tail. The effective thread count is clamped to `size` so tiny
/// files never produce inverted ranges. Returns an empty plan for size 0.
pub fn plan_segments(size: u64, threads: usize) -> Vec<SegmentRange> {
    if size == 0 || threads == 0 {
        return Vec::new();
    }

    let threads = (threads as u64).min(size);
    let average = size / threads;

    let mut out = Vec::with_capacity(threads as usize);
    for i in 0..threads {
        let start = average * i;
        let end = if i == threads - 1 {
            size - 1
        } else {
            start + average - 1
        };
        out.push(SegmentRange { start, end });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(size: u64, plan: &[SegmentRange]) {
        assert_eq!(plan[0].start, 0);
        assert_eq!(plan.last().unwrap().end, size - 1);
        for pair in plan.windows(2) {
            assert_eq!(pair[1].start, pair[0].end + 1, "contiguous, no overlap");
        }
        let total: u64 = plan.iter().map(|r| r.len()).sum();
        assert_eq!(total, size);
    }

    #[test]
    fn thousand_bytes_three_workers() {
        let plan = plan_segments(1000, 3);
        assert_eq!(
            plan,
            vec![
                SegmentRange { start: 0, end: 332 },
                SegmentRange { start: 333, end: 665 },
                SegmentRange { start: 666, end: 999 },
            ]
        );
        assert_covers(1000, &plan);
    }

    #[test]
    fn last_segment_absorbs_remainder() {
        let plan = plan_segments(10, 4);
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0], SegmentRange { start: 0, end: 1 });
        assert_eq!(plan[3], SegmentRange { start: 6, end: 9 });
        assert_covers(10, &plan);
    }

    #[test]
    fn single_worker_spans_everything() {
        let plan = plan_segments(100, 1);
        assert_eq!(plan, vec![SegmentRange { start: 0, end: 99 }]);
    }

    #[test]
    fn even_split() {
        let plan = plan_segments(900, 3);
        assert_covers(900, &plan);
        assert!(plan.iter().all(|r| r.len() == 300));
    }

    #[test]
    fn more_workers_than_bytes_clamps() {
        let plan = plan_segments(2, 5);
        assert_eq!(plan.len(), 2);
        assert_covers(2, &plan);
        for r in &plan {
            assert!(r.start <= r.end);
        }
    }

    #[test]
    fn zero_size_or_workers_is_empty() {
        assert!(plan_segments(0, 3).is_empty());
        assert!(plan_segments(100, 0).is_empty());
    }
}
