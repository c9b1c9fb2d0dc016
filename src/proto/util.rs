//! Small utilities shared by the protocol runtime and its tests.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A map from deadlines to pending items, for draining expired timers.
#[derive(Debug)]
pub struct TimerMap<T>(BTreeMap<Instant, Vec<T>>);

impl<T> Default for TimerMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerMap<T> {
    pub fn new() -> Self {
        TimerMap(BTreeMap::new())
    }

    /// Register `item` to fire at `deadline`.
    pub fn insert(&mut self, deadline: Instant, item: T) {
        self.0.entry(deadline).or_default().push(item);
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.0.keys().next().copied()
    }

    /// Remove and return all items due at or before `now`.
    pub fn drain_expired(&mut self, now: Instant) -> impl Iterator<Item = (Instant, T)> {
        let rest = self.0.split_off(&(now + Duration::from_nanos(1)));
        let expired = std::mem::replace(&mut self.0, rest);
        expired
            .into_iter()
            .flat_map(|(t, items)| items.into_iter().map(move |item| (t, item)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T: PartialEq> TimerMap<T> {
    /// Drop a specific pending item wherever it is scheduled.
    pub fn remove(&mut self, item: &T) {
        self.0.retain(|_, items| {
            items.retain(|x| x != item);
            !items.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_deadline_order() {
        let start = Instant::now();
        let mut timers = TimerMap::new();
        timers.insert(start + Duration::from_secs(2), "b");
        timers.insert(start + Duration::from_secs(1), "a");
        timers.insert(start + Duration::from_secs(1), "a2");
        timers.insert(start + Duration::from_secs(3), "c");

        assert_eq!(timers.next_deadline(), Some(start + Duration::from_secs(1)));
        let fired: Vec<&str> = timers
            .drain_expired(start + Duration::from_secs(2))
            .map(|(_, item)| item)
            .collect();
        assert_eq!(fired, vec!["a", "a2", "b"]);
        assert_eq!(timers.next_deadline(), Some(start + Duration::from_secs(3)));
    }

    #[test]
    fn remove_cancels_pending_items() {
        let start = Instant::now();
        let mut timers = TimerMap::new();
        timers.insert(start + Duration::from_secs(1), 7u32);
        timers.insert(start + Duration::from_secs(1), 8u32);
        timers.remove(&7);
        let fired: Vec<u32> = timers
            .drain_expired(start + Duration::from_secs(5))
            .map(|(_, item)| item)
            .collect();
        assert_eq!(fired, vec![8]);
        assert!(timers.is_empty());
    }
}
