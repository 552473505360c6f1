//! Request queue used to sequence a stage's requests within its concurrency budget.
//!
//! The scheduler enqueues every planned request, then spawns N workers that
//! drain the queue; N is the concurrency decided by the rate limiter, so at
//! most N requests are in flight at once.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::time::Instant;

use crate::remote::ApiRequest;

/// Priority of a queued request. Lower variants are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RequestPriority {
    High,
    Normal,
    Low,
}

impl RequestPriority {
    pub const ALL: [RequestPriority; 3] = [
        RequestPriority::High,
        RequestPriority::Normal,
        RequestPriority::Low,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// A request waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub id: u64,
    pub request: ApiRequest,
    pub priority: RequestPriority,
    pub enqueued_at: Instant,
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub cleared: u64,
    pub pending: usize,
    /// Pending requests per priority, high first.
    pub pending_by_priority: [usize; 3],
}

/// Capability contract for a request queue.
pub trait RequestQueue: Send + Sync {
    /// Add a request; returns its queue id.
    fn enqueue(&self, request: ApiRequest, priority: RequestPriority) -> u64;
    /// Take the next request: highest priority first, FIFO within a priority.
    fn dequeue(&self) -> Option<QueuedRequest>;
    fn peek(&self) -> Option<QueuedRequest>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Drop all pending requests; returns how many were dropped.
    fn clear(&self) -> usize;
    fn stats(&self) -> QueueStats;
}

/// In-memory [`RequestQueue`] with one FIFO lane per priority.
#[derive(Default)]
pub struct PriorityRequestQueue {
    lanes: Mutex<[VecDeque<QueuedRequest>; 3]>,
    next_id: AtomicU64,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    cleared: AtomicU64,
}

impl PriorityRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lanes(&self) -> std::sync::MutexGuard<'_, [VecDeque<QueuedRequest>; 3]> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RequestQueue for PriorityRequestQueue {
    fn enqueue(&self, request: ApiRequest, priority: RequestPriority) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lanes()[priority.index()].push_back(QueuedRequest {
            id,
            request,
            priority,
            enqueued_at: Instant::now(),
        });
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        id
    }

    fn dequeue(&self) -> Option<QueuedRequest> {
        let next = self.lanes().iter_mut().find_map(VecDeque::pop_front);
        if next.is_some() {
            self.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        next
    }

    fn peek(&self) -> Option<QueuedRequest> {
        self.lanes().iter().find_map(|lane| lane.front().cloned())
    }

    fn len(&self) -> usize {
        self.lanes().iter().map(VecDeque::len).sum()
    }

    fn clear(&self) -> usize {
        let mut lanes = self.lanes();
        let dropped: usize = lanes.iter().map(VecDeque::len).sum();
        for lane in lanes.iter_mut() {
            lane.clear();
        }
        self.cleared.fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    fn stats(&self) -> QueueStats {
        let lanes = self.lanes();
        let pending_by_priority = [lanes[0].len(), lanes[1].len(), lanes[2].len()];
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            cleared: self.cleared.load(Ordering::Relaxed),
            pending: pending_by_priority.iter().sum(),
            pending_by_priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeue_serves_priority_then_fifo() {
        let queue = PriorityRequestQueue::new();
        queue.enqueue(ApiRequest::get("/low"), RequestPriority::Low);
        queue.enqueue(ApiRequest::get("/normal-1"), RequestPriority::Normal);
        queue.enqueue(ApiRequest::get("/high"), RequestPriority::High);
        queue.enqueue(ApiRequest::get("/normal-2"), RequestPriority::Normal);

        assert_eq!(queue.peek().unwrap().request.endpoint, "/high");

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|q| q.request.endpoint)
            .collect();
        assert_eq!(order, vec!["/high", "/normal-1", "/normal-2", "/low"]);
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let queue = PriorityRequestQueue::new();
        let a = queue.enqueue(ApiRequest::get("/a"), RequestPriority::Normal);
        let b = queue.enqueue(ApiRequest::get("/b"), RequestPriority::Normal);
        assert!(b > a);
    }

    #[test]
    fn clear_and_stats() {
        let queue = PriorityRequestQueue::new();
        queue.enqueue(ApiRequest::get("/a"), RequestPriority::High);
        queue.enqueue(ApiRequest::get("/b"), RequestPriority::Low);
        queue.enqueue(ApiRequest::get("/c"), RequestPriority::Low);
        queue.dequeue();

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.dequeued, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.pending_by_priority, [0, 0, 2]);

        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.stats().cleared, 2);
    }
}
