//! Priority lanes with a bounded-fairness slot policy.
//!
//! Lanes are normally drained in strict priority order. To keep bulk work
//! moving under sustained interactive load, every `window`-th dispatch slot
//! is a *fairness slot* whose preference order starts at a lower lane. The
//! starting lane rotates over `approval, ingest, batch`, so each non-empty
//! lower lane is offered a slot at least once every `3 * window` dispatches.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use pipeq_core::Lane;

/// Preference order for one dispatch slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPlan {
    pub order: Vec<Lane>,
    pub fairness: bool,
    cursor: usize,
}

/// Lock-free slot accounting shared by the workers of one pool.
#[derive(Debug)]
pub struct LaneScheduler {
    lanes: Vec<Lane>,
    lower: Vec<Lane>,
    window: u64,
    /// Priority-order dispatches since the last fairness slot.
    since_fairness: AtomicU64,
    cursor: AtomicUsize,
    dispatched: AtomicU64,
}

impl LaneScheduler {
    /// Schedule over `lanes` (deduplicated, kept in priority order).
    pub fn new(lanes: &[Lane], window: u32) -> Self {
        let lanes: Vec<Lane> = Lane::ALL
            .into_iter()
            .filter(|lane| lanes.contains(lane))
            .collect();
        let lower = lanes.iter().copied().skip(1).collect();
        Self {
            lanes,
            lower,
            window: u64::from(window.max(1)),
            since_fairness: AtomicU64::new(0),
            cursor: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    /// Total slots consumed so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Preference order for the next slot. Does not consume the slot.
    pub fn plan(&self) -> SlotPlan {
        let since = self.since_fairness.load(Ordering::Acquire);
        if self.lower.is_empty() || since + 1 < self.window {
            return SlotPlan {
                order: self.lanes.clone(),
                fairness: false,
                cursor: 0,
            };
        }

        let cursor = self.cursor.load(Ordering::Acquire) % self.lower.len();
        let mut order: Vec<Lane> = self.lower[cursor..]
            .iter()
            .chain(&self.lower[..cursor])
            .copied()
            .collect();
        order.push(self.lanes[0]);
        SlotPlan {
            order,
            fairness: true,
            cursor,
        }
    }

    /// Consume the slot planned by `plan` after a job was claimed from it.
    pub fn commit(&self, plan: &SlotPlan) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        if plan.fairness {
            self.since_fairness.store(0, Ordering::Release);
            let next = (plan.cursor + 1) % self.lower.len().max(1);
            let _ = self.cursor.compare_exchange(
                plan.cursor,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        } else {
            self.since_fairness.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve(scheduler: &LaneScheduler, backlog: &[Lane]) -> Lane {
        let plan = scheduler.plan();
        let lane = *plan
            .order
            .iter()
            .find(|lane| backlog.contains(lane))
            .unwrap();
        scheduler.commit(&plan);
        lane
    }

    #[test]
    fn strict_priority_outside_fairness_slots() {
        let scheduler = LaneScheduler::new(&Lane::ALL, 10);
        let plan = scheduler.plan();
        assert!(!plan.fairness);
        assert_eq!(plan.order, Lane::ALL.to_vec());
    }

    #[test]
    fn every_window_offers_a_lower_lane_first() {
        let scheduler = LaneScheduler::new(&Lane::ALL, 10);
        let backlog = [Lane::Interactive, Lane::Batch];

        let served: Vec<Lane> = (0..100).map(|_| serve(&scheduler, &backlog)).collect();
        for window in served.chunks(10) {
            assert_eq!(window.iter().filter(|l| **l == Lane::Batch).count(), 1);
        }
    }

    #[test]
    fn fairness_cursor_rotates_over_lower_lanes() {
        let scheduler = LaneScheduler::new(&Lane::ALL, 2);
        let backlog = Lane::ALL;

        let fair: Vec<Lane> = (0..12)
            .map(|_| serve(&scheduler, &backlog))
            .filter(|lane| *lane != Lane::Interactive)
            .collect();
        assert_eq!(
            fair,
            vec![
                Lane::Approval,
                Lane::Ingest,
                Lane::Batch,
                Lane::Approval,
                Lane::Ingest,
                Lane::Batch
            ]
        );
    }

    #[test]
    fn empty_lower_lanes_yield_the_slot_to_interactive() {
        let scheduler = LaneScheduler::new(&Lane::ALL, 3);
        let served: Vec<Lane> = (0..9).map(|_| serve(&scheduler, &[Lane::Interactive])).collect();
        assert!(served.iter().all(|l| *l == Lane::Interactive));
        assert_eq!(scheduler.dispatched(), 9);
    }

    #[test]
    fn pool_subset_keeps_priority_order() {
        let scheduler = LaneScheduler::new(&[Lane::Batch, Lane::Ingest], 1);
        assert_eq!(scheduler.lanes(), &[Lane::Ingest, Lane::Batch]);
        // Window of one: every slot is a fairness slot.
        assert_eq!(scheduler.plan().order, vec![Lane::Batch, Lane::Ingest]);
    }
}
