//! Rebalancing of product-worker page lists during a batch.
//!
//! While a general worker waits for its batch to drain it looks for skew:
//! workers that finished early sit idle while the busiest worker still has
//! a backlog. One rebalance step moves the ceiling-half of the busiest
//! worker's tail onto the idle workers. The multiset of pending pages is
//! never changed, only re-homed.

use crate::models::PageRange;

/// A live product worker and its currently pending pages.
#[derive(Debug, Clone)]
pub struct WorkerLoad {
    pub id: u32,
    pub pages: Vec<u64>,
}

/// One planned move: the donor's shrunken list plus the grants to idle
/// workers. Applying the plan means writing exactly these lists back.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalancePlan {
    pub donor: u32,
    pub donor_remaining: Vec<u64>,
    pub grants: Vec<(u32, Vec<u64>)>,
}

/// Plan a single rebalance step over the live product workers.
///
/// Returns `None` unless there is at least one busy and one idle worker.
/// The donor is the worker with the longest list (lowest id on ties); the
/// moved pages are taken from its tail so the donor keeps the pages it is
/// about to process next.
pub fn plan_rebalance(loads: &[WorkerLoad]) -> Option<RebalancePlan> {
    let mut busy: Vec<&WorkerLoad> = loads.iter().filter(|w| !w.pages.is_empty()).collect();
    let idle: Vec<u32> = loads
        .iter()
        .filter(|w| w.pages.is_empty())
        .map(|w| w.id)
        .collect();

    if busy.is_empty() || idle.is_empty() {
        return None;
    }

    busy.sort_by(|a, b| b.pages.len().cmp(&a.pages.len()).then(a.id.cmp(&b.id)));
    let donor = busy[0];

    let take = donor.pages.len().div_ceil(2);
    let keep = donor.pages.len() - take;
    let moved = donor.pages[keep..].to_vec();
    let donor_remaining = donor.pages[..keep].to_vec();

    let per_idle = moved.len().div_ceil(idle.len());
    let mut grants = Vec::new();
    let mut cursor = 0usize;
    for id in idle {
        if cursor >= moved.len() {
            break;
        }
        let end = (cursor + per_idle).min(moved.len());
        grants.push((id, moved[cursor..end].to_vec()));
        cursor = end;
    }

    Some(RebalancePlan {
        donor: donor.id,
        donor_remaining,
        grants,
    })
}

/// Check that every page in the loads sits inside the current batch window.
/// Pages outside the window indicate a stale assignment.
pub fn all_within_window(loads: &[WorkerLoad], window: PageRange) -> bool {
    loads
        .iter()
        .flat_map(|w| w.pages.iter())
        .all(|p| window.contains(*p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn load(id: u32, pages: &[u64]) -> WorkerLoad {
        WorkerLoad {
            id,
            pages: pages.to_vec(),
        }
    }

    fn multiset(loads: &[WorkerLoad]) -> Vec<u64> {
        let mut all: Vec<u64> = loads.iter().flat_map(|w| w.pages.clone()).collect();
        all.sort_unstable();
        all
    }

    fn apply(loads: &[WorkerLoad], plan: &RebalancePlan) -> Vec<WorkerLoad> {
        loads
            .iter()
            .map(|w| {
                if w.id == plan.donor {
                    load(w.id, &plan.donor_remaining)
                } else if let Some((_, grant)) = plan.grants.iter().find(|(id, _)| *id == w.id) {
                    load(w.id, grant)
                } else {
                    w.clone()
                }
            })
            .collect()
    }

    #[test]
    fn no_plan_without_idle_workers() {
        let loads = vec![load(1, &[1, 2, 3]), load(2, &[4, 5])];
        assert!(plan_rebalance(&loads).is_none());
    }

    #[test]
    fn no_plan_without_busy_workers() {
        let loads = vec![load(1, &[]), load(2, &[])];
        assert!(plan_rebalance(&loads).is_none());
    }

    #[test]
    fn moves_ceil_half_of_busiest_tail() {
        let loads = vec![load(1, &[1, 3, 5, 7, 9]), load(2, &[])];
        let plan = plan_rebalance(&loads).unwrap();
        assert_eq!(plan.donor, 1);
        assert_eq!(plan.donor_remaining, vec![1, 3]);
        assert_eq!(plan.grants, vec![(2, vec![5, 7, 9])]);
    }

    #[test]
    fn preserves_pending_multiset() {
        let loads = vec![
            load(1, &[1, 2, 3, 4, 5, 6, 7]),
            load(2, &[]),
            load(3, &[8]),
            load(4, &[]),
        ];
        let before = multiset(&loads);
        let plan = plan_rebalance(&loads).unwrap();
        let after_loads = apply(&loads, &plan);
        assert_eq!(multiset(&after_loads), before);

        // No page is in two lists.
        let mut seen = HashSet::new();
        for w in &after_loads {
            for p in &w.pages {
                assert!(seen.insert(*p), "page {} appears twice", p);
            }
        }
    }

    #[test]
    fn distributes_across_idle_by_ceil_division() {
        let loads = vec![load(1, &(1..=10).collect::<Vec<_>>()), load(2, &[]), load(3, &[])];
        let plan = plan_rebalance(&loads).unwrap();
        // 10 pages: 5 move, ceil(5/2)=3 to the first idle, 2 to the second.
        assert_eq!(plan.donor_remaining.len(), 5);
        assert_eq!(plan.grants[0].0, 2);
        assert_eq!(plan.grants[0].1.len(), 3);
        assert_eq!(plan.grants[1].0, 3);
        assert_eq!(plan.grants[1].1.len(), 2);
    }

    #[test]
    fn single_page_donor_gives_it_away() {
        let loads = vec![load(1, &[42]), load(2, &[])];
        let plan = plan_rebalance(&loads).unwrap();
        assert!(plan.donor_remaining.is_empty());
        assert_eq!(plan.grants, vec![(2, vec![42])]);
    }

    #[test]
    fn window_check() {
        let loads = vec![load(1, &[1, 2]), load(2, &[50])];
        assert!(all_within_window(&loads, PageRange::new(1, 50)));
        assert!(!all_within_window(&loads, PageRange::new(1, 49)));
    }
}
