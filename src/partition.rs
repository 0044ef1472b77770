//! Pure page-range arithmetic for both assignment modes.
//!
//! Everything here is deterministic and side-effect free so the partition
//! behavior can be tested exhaustively without a coordinator.

use crate::models::PageRange;

/// Partition `[1..=total_pages]` evenly across worker ids.
///
/// Ids are assigned in ascending order; chunk size is the ceiling division,
/// so earlier workers may carry one more page and trailing workers receive
/// nothing when there are more workers than chunks.
pub fn even_partition(total_pages: u64, ids: &[u32]) -> Vec<(u32, PageRange)> {
    if total_pages == 0 || ids.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<u32> = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let chunk = total_pages.div_ceil(sorted.len() as u64);
    let mut out = Vec::with_capacity(sorted.len());
    let mut start = 1u64;
    for id in sorted {
        if start > total_pages {
            break;
        }
        let end = (start + chunk - 1).min(total_pages);
        out.push((id, PageRange::new(start, end)));
        start = end + 1;
    }
    out
}

/// The next rotation hand-out after `last_assigned`, or `None` when the
/// cycle is exhausted and must reset.
pub fn rotation_slice(last_assigned: u64, total_pages: u64, batch_size: u64) -> Option<PageRange> {
    if total_pages == 0 || batch_size == 0 || last_assigned >= total_pages {
        return None;
    }
    let start = last_assigned + 1;
    let end = (last_assigned + batch_size).min(total_pages);
    Some(PageRange::new(start, end))
}

/// Deal pages across `worker_count` buckets by position: page at index `i`
/// lands in bucket `i % worker_count`.
pub fn split_round_robin(pages: &[u64], worker_count: usize) -> Vec<Vec<u64>> {
    if worker_count == 0 {
        return Vec::new();
    }
    let mut buckets: Vec<Vec<u64>> = vec![Vec::new(); worker_count];
    for (i, page) in pages.iter().enumerate() {
        buckets[i % worker_count].push(*page);
    }
    buckets
}

/// Whether ranges (ordered by worker id) tile a contiguous prefix of
/// `[1..=total_pages]`: first starts at 1, each start follows the previous
/// end, and the last end does not overshoot.
pub fn is_contiguous_prefix(ranges: &[PageRange], total_pages: u64) -> bool {
    let mut expected_start = 1u64;
    for range in ranges {
        if range.start != expected_start || range.end < range.start {
            return false;
        }
        expected_start = range.end + 1;
    }
    expected_start == 1 || expected_start - 1 <= total_pages
}
