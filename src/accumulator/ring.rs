use std::collections::HashMap;

use chrono::{NaiveDateTime, TimeDelta};

use crate::container::ContainerID;
use crate::trace::TraceEvent;

/// Maximum distance between an event and the first event of a bucket.
fn bucket_window() -> TimeDelta {
    TimeDelta::seconds(1)
}

/// One slot of the ring: events of all containers that arrived within
/// one second of the bucket's first event.
#[derive(Debug, Default)]
struct Bucket {
    first_seen: Option<NaiveDateTime>,
    events: HashMap<ContainerID, Vec<TraceEvent>>,
}

impl Bucket {
    fn claim(&mut self, first_seen: NaiveDateTime) {
        self.first_seen = Some(first_seen);
        self.events.clear();
    }

    fn accepts(&self, timestamp: NaiveDateTime) -> bool {
        self.first_seen.is_some_and(|first| {
            let delta = timestamp - first;
            delta < bucket_window() && delta > -bucket_window()
        })
    }
}

/// Where an event was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// An empty slot was claimed.
    Claimed(usize),
    /// The event joined a bucket opened within the last second.
    Appended(usize),
    /// The bucket with the oldest first event was discarded and reused.
    Evicted(usize),
}

/// Fixed-size ring of time buckets.
///
/// Eviction picks the bucket whose *first* event is the oldest, so a bucket
/// that keeps receiving events is still recycled once it is numerically the
/// oldest one.
#[derive(Debug)]
pub struct Ring {
    buckets: Vec<Bucket>,
}

impl Ring {
    pub fn new(size: usize) -> Self {
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, Bucket::default);
        Self { buckets }
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Number of buckets currently holding events.
    pub fn occupied(&self) -> usize {
        self.buckets
            .iter()
            .filter(|bucket| bucket.first_seen.is_some())
            .count()
    }

    /// Stores the event, returning `None` if the ring has no slot for it.
    pub fn insert(&mut self, event: TraceEvent) -> Option<Placement> {
        let placement = self.find_slot(event.timestamp)?;
        let slot = match placement {
            Placement::Appended(slot) => slot,
            Placement::Claimed(slot) | Placement::Evicted(slot) => {
                self.buckets[slot].claim(event.timestamp);
                slot
            }
        };
        self.buckets[slot]
            .events
            .entry(event.container_id.clone())
            .or_default()
            .push(event);

        Some(placement)
    }

    fn find_slot(&self, timestamp: NaiveDateTime) -> Option<Placement> {
        for (slot, bucket) in self.buckets.iter().enumerate() {
            if bucket.first_seen.is_none() {
                return Some(Placement::Claimed(slot));
            }
            if bucket.accepts(timestamp) {
                return Some(Placement::Appended(slot));
            }
        }

        self.oldest().map(Placement::Evicted)
    }

    fn oldest(&self) -> Option<usize> {
        let mut oldest: Option<(usize, NaiveDateTime)> = None;
        for (slot, bucket) in self.buckets.iter().enumerate() {
            let Some(first) = bucket.first_seen else {
                continue;
            };
            if oldest.is_none_or(|(_, current)| first < current) {
                oldest = Some((slot, first));
            }
        }
        oldest.map(|(slot, _)| slot)
    }

    /// Events of a container, concatenated in slot order.
    pub fn events_of(&self, container_id: &ContainerID) -> Vec<TraceEvent> {
        self.buckets
            .iter()
            .filter_map(|bucket| bucket.events.get(container_id))
            .flat_map(|events| events.iter().cloned())
            .collect()
    }

    /// First-event timestamps per slot, `None` for empty slots.
    pub fn first_seen(&self) -> Vec<Option<NaiveDateTime>> {
        self.buckets.iter().map(|bucket| bucket.first_seen).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(secs: u32, micros: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_micro_opt(0, 0, secs, micros)
            .unwrap()
    }

    fn event(container: &str, timestamp: NaiveDateTime, pid: u32) -> TraceEvent {
        TraceEvent {
            timestamp,
            container_id: ContainerID::new(container).unwrap(),
            syscall_category: "proc".to_owned(),
            ppid: 1,
            pid,
            syscall_type: "execve".to_owned(),
            exe: "/bin/sh".to_owned(),
            cmd: "sh".to_owned(),
        }
    }

    #[test]
    fn first_event_claims_first_slot() {
        let mut ring = Ring::new(3);
        assert_eq!(
            ring.insert(event("aaa", at(0, 0), 1)),
            Some(Placement::Claimed(0))
        );
        assert_eq!(ring.occupied(), 1);
    }

    #[test]
    fn events_within_a_second_share_a_bucket_across_containers() {
        let mut ring = Ring::new(3);
        ring.insert(event("aaa", at(0, 0), 1));
        assert_eq!(
            ring.insert(event("bbb", at(0, 999_999), 2)),
            Some(Placement::Appended(0))
        );
        assert_eq!(
            ring.insert(event("aaa", at(1, 0), 3)),
            Some(Placement::Claimed(1))
        );
    }

    #[test]
    fn same_container_order_is_preserved() {
        let mut ring = Ring::new(2);
        for pid in 0..10 {
            ring.insert(event("aaa", at(0, pid * 1000), pid));
        }
        let pids: Vec<u32> = ring
            .events_of(&ContainerID::new("aaa").unwrap())
            .iter()
            .map(|e| e.pid)
            .collect();
        assert_eq!(pids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn full_ring_evicts_bucket_with_oldest_first_event() {
        let mut ring = Ring::new(5);
        for secs in 0..5 {
            ring.insert(event("aaa", at(secs, 0), secs));
        }
        assert_eq!(ring.occupied(), 5);

        let placement = ring.insert(event("zzz", at(10, 0), 99));
        assert_eq!(placement, Some(Placement::Evicted(0)));
        assert_eq!(ring.capacity(), 5);
        assert_eq!(ring.first_seen()[0], Some(at(10, 0)));

        let survivors: Vec<u32> = ring
            .events_of(&ContainerID::new("aaa").unwrap())
            .iter()
            .map(|e| e.pid)
            .collect();
        assert_eq!(survivors, vec![1, 2, 3, 4]);
        assert_eq!(ring.events_of(&ContainerID::new("zzz").unwrap()).len(), 1);
    }

    #[test]
    fn busy_bucket_is_still_evicted_when_oldest() {
        let mut ring = Ring::new(2);
        ring.insert(event("aaa", at(0, 0), 1));
        ring.insert(event("aaa", at(2, 0), 2));
        // keeps writing into the bucket opened at t=0
        ring.insert(event("aaa", at(0, 900_000), 3));

        assert_eq!(
            ring.insert(event("bbb", at(5, 0), 4)),
            Some(Placement::Evicted(0))
        );
    }

    #[test]
    fn query_concatenates_in_slot_order_after_wrap() {
        let mut ring = Ring::new(2);
        ring.insert(event("aaa", at(0, 0), 1));
        ring.insert(event("aaa", at(2, 0), 2));
        ring.insert(event("aaa", at(4, 0), 3));

        let pids: Vec<u32> = ring
            .events_of(&ContainerID::new("aaa").unwrap())
            .iter()
            .map(|e| e.pid)
            .collect();
        assert_eq!(pids, vec![3, 2]);
    }

    #[test]
    fn ring_without_slots_drops_events() {
        let mut ring = Ring::new(0);
        assert_eq!(ring.insert(event("aaa", at(0, 0), 1)), None);
        assert!(ring.events_of(&ContainerID::new("aaa").unwrap()).is_empty());
    }
}
