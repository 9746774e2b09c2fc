//! Reclamation log for rendezvous points.
//!
//! Points are freed deterministically when their last link handle goes
//! away. Tests use this log to confirm which points were freed instead of
//! waiting on a collector.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Number of freed point ids retained in the log
pub const RECLAIM_LOG_CAPACITY: usize = 1024;

static FREED: Mutex<VecDeque<u64>> = Mutex::new(VecDeque::new());

pub(crate) fn record(point_id: u64) {
    let mut freed = FREED.lock().unwrap_or_else(|p| p.into_inner());
    if freed.len() >= RECLAIM_LOG_CAPACITY {
        freed.pop_front();
    }
    freed.push_back(point_id);
}

/// Returns the ids of recently freed points, oldest first
pub fn freed_points() -> Vec<u64> {
    FREED
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .iter()
        .copied()
        .collect()
}

/// Returns true if the point with `point_id` has been freed recently
pub fn was_reclaimed(point_id: u64) -> bool {
    FREED
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .contains(&point_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_query() {
        // Far above anything the point counter reaches in tests.
        let id = u64::MAX - 7;
        assert!(!was_reclaimed(id));
        record(id);
        assert!(was_reclaimed(id));
        assert!(freed_points().contains(&id));
        assert!(freed_points().len() <= RECLAIM_LOG_CAPACITY);
    }
}
