//! The global priority queue of queued request ids, per spec.md §4.3: ordered by
//! (priority desc, submitted-at asc), with bounded skip-ahead to avoid
//! head-of-line blocking and a maximum depth for backpressure.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::ids::RequestId;

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub request_id: RequestId,
    pub provider: String,
    pub priority: i64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFullError;

pub struct PriorityQueue {
    items: Mutex<VecDeque<QueueItem>>,
    max_depth: usize,
    skip_ahead: usize,
}

impl PriorityQueue {
    pub fn new(max_depth: usize, skip_ahead: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            max_depth,
            skip_ahead,
        }
    }

    pub fn push(&self, item: QueueItem) -> Result<(), QueueFullError> {
        let mut items = self.items.lock();
        if items.len() >= self.max_depth {
            return Err(QueueFullError);
        }
        items.push_back(item);
        items
            .make_contiguous()
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.submitted_at.cmp(&b.submitted_at)));
        Ok(())
    }

    /// Scans at most `skip_ahead + 1` items from the head for the first one
    /// `runnable` accepts, removing and returning it. Returns `None` if nothing in
    /// the window is runnable right now — the caller should stall.
    pub fn pop_runnable<F: Fn(&QueueItem) -> bool>(&self, runnable: F) -> Option<QueueItem> {
        let mut items = self.items.lock();
        let limit = items.len().min(self.skip_ahead + 1);
        for i in 0..limit {
            if runnable(&items[i]) {
                return items.remove(i);
            }
        }
        None
    }

    /// Removes a specific request (e.g. on external cancel while still queued).
    pub fn remove(&self, id: RequestId) -> Option<QueueItem> {
        let mut items = self.items.lock();
        let pos = items.iter().position(|i| i.request_id == id)?;
        items.remove(pos)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(priority: i64, offset_ms: i64) -> QueueItem {
        QueueItem {
            request_id: RequestId::new(),
            provider: "p".to_string(),
            priority,
            submitted_at: Utc::now() + chrono::Duration::milliseconds(offset_ms),
        }
    }

    #[test]
    fn pops_highest_priority_first() {
        let queue = PriorityQueue::new(100, 8);
        queue.push(item(1, 0)).unwrap();
        queue.push(item(100, 1)).unwrap();
        queue.push(item(1, 2)).unwrap();
        let first = queue.pop_runnable(|_| true).unwrap();
        assert_eq!(first.priority, 100);
    }

    #[test]
    fn ties_are_fifo_by_submitted_at() {
        let queue = PriorityQueue::new(100, 8);
        let earlier = item(5, 0);
        let later = item(5, 10);
        let earlier_id = earlier.request_id;
        queue.push(later).unwrap();
        queue.push(earlier).unwrap();
        let popped = queue.pop_runnable(|_| true).unwrap();
        assert_eq!(popped.request_id, earlier_id);
    }

    #[test]
    fn skip_ahead_passes_over_unrunnable_head() {
        let queue = PriorityQueue::new(100, 8);
        let blocked = item(100, 0);
        let runnable = item(1, 1);
        let runnable_id = runnable.request_id;
        queue.push(blocked).unwrap();
        queue.push(runnable).unwrap();
        let popped = queue.pop_runnable(|i| i.priority == 1).unwrap();
        assert_eq!(popped.request_id, runnable_id);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn rejects_past_max_depth() {
        let queue = PriorityQueue::new(1, 8);
        queue.push(item(0, 0)).unwrap();
        assert!(queue.push(item(0, 1)).is_err());
    }
}
