use std::collections::{BTreeSet, HashMap};

// ============================================================================
// Offset Tracker
// ============================================================================
//
// Kafka commits are positional: committing offset N acknowledges everything
// below N. Deliveries are settled out of order when several handlers run
// concurrently, so the committable position per partition is the lowest
// offset still in flight (or one past the highest completed offset when
// nothing is in flight).
//
// ============================================================================

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_completed: Option<i64>,
    committed: Option<i64>,
}

#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn track(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .in_flight
            .insert(offset);
    }

    /// Mark `offset` settled. Returns the offset to commit when the
    /// committable position moved forward.
    pub fn complete(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&partition)?;
        if !state.in_flight.remove(&offset) {
            return None;
        }

        let highest = state.highest_completed.map_or(offset, |h| h.max(offset));
        state.highest_completed = Some(highest);

        let next = match state.in_flight.iter().next() {
            Some(&lowest) => lowest,
            None => highest + 1,
        };

        match state.committed {
            Some(committed) if next <= committed => None,
            _ => {
                state.committed = Some(next);
                Some(next)
            }
        }
    }

    pub fn in_flight(&self, partition: i32) -> usize {
        self.partitions
            .get(&partition)
            .map(|p| p.in_flight.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_completion_commits_each_offset() {
        let mut tracker = OffsetTracker::default();
        tracker.track(0, 10);
        tracker.track(0, 11);

        assert_eq!(tracker.complete(0, 10), Some(11));
        assert_eq!(tracker.complete(0, 11), Some(12));
        assert_eq!(tracker.in_flight(0), 0);
    }

    #[test]
    fn test_out_of_order_completion_waits_for_gap() {
        let mut tracker = OffsetTracker::default();
        tracker.track(0, 5);
        tracker.track(0, 6);
        tracker.track(0, 7);

        // 6 and 7 finish first; 5 is still in flight so nothing past it commits
        assert_eq!(tracker.complete(0, 6), Some(5));
        assert_eq!(tracker.complete(0, 7), None);
        assert_eq!(tracker.complete(0, 5), Some(8));
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut tracker = OffsetTracker::default();
        tracker.track(0, 1);
        tracker.track(1, 100);

        assert_eq!(tracker.complete(1, 100), Some(101));
        assert_eq!(tracker.in_flight(0), 1);
    }

    #[test]
    fn test_unknown_offset_is_ignored() {
        let mut tracker = OffsetTracker::default();
        tracker.track(0, 1);
        assert_eq!(tracker.complete(0, 2), None);
        assert_eq!(tracker.complete(3, 1), None);
    }
}
