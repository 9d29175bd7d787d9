// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline-ordered timer queue.
//!
//! Deadlines are rounded up onto a fixed grid anchored at the queue's
//! epoch, so tasks sleeping for nearby durations share a bucket and a
//! task never wakes before its requested deadline.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::task::TaskId;

/// Longer sleeps are clamped so the deadline stays representable.
const MAX_SLEEP: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 100);

pub(crate) struct TimerQueue {
    epoch: Instant,
    resolution: Duration,
    /// Deadline bucket → tasks in insertion order.
    buckets: BTreeMap<Instant, Vec<TaskId>>,
    len: usize,
}

impl TimerQueue {
    pub fn new(resolution: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            resolution,
            buckets: BTreeMap::new(),
            len: 0,
        }
    }

    /// Bucket a task sleeping `duration` from `now` belongs to.
    pub fn deadline_after(&self, now: Instant, duration: Duration) -> Instant {
        let deadline = now + duration.min(MAX_SLEEP);
        let res = self.resolution.as_nanos();
        if res == 0 || deadline <= self.epoch {
            return deadline;
        }
        let offset = deadline.duration_since(self.epoch).as_nanos();
        let ticks = (offset + res - 1) / res;
        match u64::try_from(ticks * res) {
            Ok(nanos) => self.epoch + Duration::from_nanos(nanos),
            Err(_) => deadline,
        }
    }

    pub fn insert(&mut self, deadline: Instant, task: TaskId) {
        self.buckets.entry(deadline).or_default().push(task);
        self.len += 1;
    }

    /// Drop a parked task (kill). Returns whether it was found.
    pub fn remove(&mut self, deadline: Instant, task: TaskId) -> bool {
        let Some(bucket) = self.buckets.get_mut(&deadline) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|&t| t == task) else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&deadline);
        }
        self.len -= 1;
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.buckets.keys().next().copied()
    }

    /// Pop every bucket at or before `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TaskId> {
        let mut expired = Vec::new();
        while let Some(entry) = self.buckets.first_entry() {
            if *entry.key() > now {
                break;
            }
            expired.extend(entry.remove());
        }
        self.len -= expired.len();
        expired
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> TaskId {
        TaskId::from_raw(n)
    }

    #[test]
    fn deadline_never_before_request() {
        let q = TimerQueue::new(Duration::from_millis(10));
        let now = Instant::now();
        for ms in [0, 1, 9, 10, 11, 99, 100, 1234] {
            let d = Duration::from_millis(ms);
            let deadline = q.deadline_after(now, d);
            assert!(deadline >= now + d, "{}ms rounded early", ms);
            assert!(deadline < now + d + Duration::from_millis(10));
        }
    }

    #[test]
    fn nearby_deadlines_share_a_bucket() {
        let mut q = TimerQueue::new(Duration::from_secs(1));
        let now = q.epoch;
        let a = q.deadline_after(now, Duration::from_millis(100));
        let b = q.deadline_after(now, Duration::from_millis(200));
        assert_eq!(a, b);
        q.insert(a, id(2));
        q.insert(b, id(3));
        assert_eq!(q.buckets.len(), 1);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn zero_resolution_keeps_exact_deadline() {
        let q = TimerQueue::new(Duration::ZERO);
        let now = Instant::now();
        let d = Duration::from_micros(1234);
        assert_eq!(q.deadline_after(now, d), now + d);
    }

    #[test]
    fn pop_expired_in_deadline_then_insertion_order() {
        let mut q = TimerQueue::new(Duration::ZERO);
        let now = Instant::now();
        let early = now + Duration::from_millis(1);
        let late = now + Duration::from_millis(2);
        let future = now + Duration::from_secs(60);
        q.insert(late, id(4));
        q.insert(early, id(2));
        q.insert(early, id(3));
        q.insert(future, id(5));

        assert!(q.pop_expired(now).is_empty());
        assert_eq!(q.pop_expired(late), vec![id(2), id(3), id(4)]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_deadline(), Some(future));
    }

    #[test]
    fn remove_drops_empty_bucket() {
        let mut q = TimerQueue::new(Duration::ZERO);
        let at = Instant::now() + Duration::from_secs(1);
        q.insert(at, id(2));
        assert!(q.remove(at, id(2)));
        assert!(!q.remove(at, id(2)));
        assert!(q.is_empty());
        assert_eq!(q.next_deadline(), None);
    }

    #[test]
    fn huge_sleep_is_clamped() {
        let q = TimerQueue::new(Duration::from_millis(1));
        let now = Instant::now();
        let deadline = q.deadline_after(now, Duration::MAX);
        assert!(deadline > now + Duration::from_secs(60 * 60 * 24 * 365));
    }
}
