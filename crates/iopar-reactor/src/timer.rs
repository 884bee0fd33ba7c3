//! One-shot timer queue with cancellable handles.
//!
//! Timers are keyed by `(deadline, sequence)`, so timers sharing a deadline
//! fire in the order they were scheduled. A [`TimerHandle`] is never reused,
//! which makes cancelling an already-fired timer a harmless no-op.

use core::time::Duration;
use std::collections::BTreeMap;

use ahash::AHashMap;

/// Identifies one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Raw sequence number, useful in log fields.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// A timer that reached its deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct Expired<T> {
    pub handle: TimerHandle,
    pub deadline: Duration,
    pub target: T,
}

/// Pending timers ordered by deadline.
#[derive(Debug)]
pub struct TimerQueue<T> {
    queue: BTreeMap<(Duration, u64), T>,
    deadlines: AHashMap<u64, Duration>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            deadlines: AHashMap::new(),
            next_seq: 1,
        }
    }

    /// Schedule `target` to expire at the absolute time `deadline`.
    pub fn schedule_at(&mut self, deadline: Duration, target: T) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((deadline, seq), target);
        self.deadlines.insert(seq, deadline);
        TimerHandle(seq)
    }

    /// Cancel a pending timer. Returns `false` when it already fired or was
    /// cancelled before.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.remove(handle).is_some()
    }

    /// Cancel a pending timer and hand back its target.
    pub fn remove(&mut self, handle: TimerHandle) -> Option<T> {
        let deadline = self.deadlines.remove(&handle.0)?;
        self.queue.remove(&(deadline, handle.0))
    }

    /// Cancel every pending timer whose target matches `pred`.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> usize {
        let doomed: Vec<(Duration, u64)> = self
            .queue
            .iter()
            .filter(|(_, target)| pred(target))
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            self.queue.remove(key);
            self.deadlines.remove(&key.1);
        }
        doomed.len()
    }

    /// Replace the timer held in `slot`: the previous one (if any) is
    /// cancelled and the new handle is stored back.
    pub fn reschedule(&mut self, slot: &mut Option<TimerHandle>, deadline: Duration, target: T) {
        if let Some(old) = slot.take() {
            self.cancel(old);
        }
        *slot = Some(self.schedule_at(deadline, target));
    }

    /// Deadline of a pending timer.
    #[must_use]
    pub fn deadline(&self, handle: TimerHandle) -> Option<Duration> {
        self.deadlines.get(&handle.0).copied()
    }

    #[must_use]
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.deadlines.contains_key(&handle.0)
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest timer if it is due at `now`.
    pub fn pop_expired(&mut self, now: Duration) -> Option<Expired<T>> {
        let (&(deadline, seq), _) = self.queue.iter().next()?;
        if deadline > now {
            return None;
        }
        let target = self.queue.remove(&(deadline, seq))?;
        self.deadlines.remove(&seq);
        Some(Expired {
            handle: TimerHandle(seq),
            deadline,
            target,
        })
    }

    /// Time left until the next deadline, zero when already due.
    #[must_use]
    pub fn time_to_next(&self, now: Duration) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_sub(now))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Iterate pending targets in deadline order.
    pub fn targets(&self) -> impl Iterator<Item = &T> {
        self.queue.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.schedule_at(ms(30), "c");
        q.schedule_at(ms(10), "a");
        q.schedule_at(ms(20), "b");

        let fired: Vec<_> = std::iter::from_fn(|| q.pop_expired(ms(100)))
            .map(|e| e.target)
            .collect();
        assert_eq!(fired, vec!["a", "b", "c"]);
    }

    #[test]
    fn equal_deadlines_keep_schedule_order() {
        let mut q = TimerQueue::new();
        q.schedule_at(ms(5), 1);
        q.schedule_at(ms(5), 2);
        q.schedule_at(ms(5), 3);
        let fired: Vec<_> = std::iter::from_fn(|| q.pop_expired(ms(5)))
            .map(|e| e.target)
            .collect();
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn nothing_fires_before_deadline() {
        let mut q = TimerQueue::new();
        q.schedule_at(ms(50), ());
        assert!(q.pop_expired(ms(49)).is_none());
        assert!(q.pop_expired(ms(50)).is_some());
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let mut q = TimerQueue::new();
        let h = q.schedule_at(ms(10), "x");
        assert!(q.is_pending(h));
        assert!(q.cancel(h));
        assert!(!q.cancel(h), "second cancel is a no-op");
        assert!(q.is_empty());
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let mut q = TimerQueue::new();
        let h = q.schedule_at(ms(1), "x");
        let fired = q.pop_expired(ms(1)).unwrap();
        assert_eq!(fired.handle, h);
        assert!(!q.cancel(h));
    }

    #[test]
    fn remove_returns_target() {
        let mut q = TimerQueue::new();
        let h = q.schedule_at(ms(3), "payload");
        assert_eq!(q.remove(h), Some("payload"));
        assert_eq!(q.remove(h), None);
    }

    #[test]
    fn cancel_where_matches_targets() {
        let mut q = TimerQueue::new();
        q.schedule_at(ms(1), 7);
        q.schedule_at(ms(2), 8);
        q.schedule_at(ms(3), 7);
        assert_eq!(q.cancel_where(|t| *t == 7), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_expired(ms(10)).map(|e| e.target), Some(8));
    }

    #[test]
    fn reschedule_replaces_previous() {
        let mut q = TimerQueue::new();
        let mut slot = None;
        q.reschedule(&mut slot, ms(10), "lost");
        let first = slot.unwrap();
        q.reschedule(&mut slot, ms(20), "lost");
        assert!(!q.is_pending(first));
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_deadline(), Some(ms(20)));
    }

    #[test]
    fn time_to_next_saturates() {
        let mut q = TimerQueue::new();
        assert_eq!(q.time_to_next(ms(5)), None);
        q.schedule_at(ms(10), ());
        assert_eq!(q.time_to_next(ms(4)), Some(ms(6)));
        assert_eq!(q.time_to_next(ms(40)), Some(Duration::ZERO));
    }
}
