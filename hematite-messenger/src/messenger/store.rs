//! Bounded-window tracker queues
//!
//! One queue per direction. Every delivery the user puts or gets is
//! appended here and addressed afterwards through its [`Tracker`]. The
//! window bounds how many settled deliveries stay addressable: sliding
//! drops settled heads beyond the window, expiring their trackers.

use std::collections::VecDeque;

use crate::engine::DeliveryId;

/// Which tracker queue a tracker belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Incoming,
    Outgoing,
}

/// Opaque reference to a past delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracker {
    pub(crate) direction: Direction,
    pub(crate) sequence: u64,
}

/// Delivery status observed through a tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The tracker is expired or was never issued
    Unknown,

    /// No disposition has been reached yet
    Pending,

    /// The delivery was accepted
    Accepted,

    /// The delivery was rejected
    Rejected,

    /// The delivery was released
    Released,

    /// The delivery was modified
    Modified,

    /// The delivery was settled without reaching a disposition
    Settled,

    /// The delivery was aborted mid-transfer
    Aborted,
}

#[derive(Debug)]
pub(crate) struct StoreEntry {
    /// Connector the delivery lives on
    pub(crate) connector: usize,
    pub(crate) delivery: DeliveryId,

    /// Engine delivery serial; a mismatch means the slot was reused
    pub(crate) serial: u64,

    pub(crate) disposition: Option<Status>,
    pub(crate) settled: bool,
}

#[derive(Debug)]
pub(crate) struct TrackerStore {
    direction: Direction,
    window: usize,

    /// Sequence the next added delivery gets; never decreases
    hwm: u64,

    /// Sequence of the head entry
    lwm: u64,

    entries: VecDeque<StoreEntry>,
}

impl TrackerStore {
    pub(crate) fn new(direction: Direction) -> Self {
        Self {
            direction,
            window: 0,
            hwm: 0,
            lwm: 0,
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn window(&self) -> usize {
        self.window
    }

    pub(crate) fn set_window(&mut self, window: usize) {
        self.window = window;
    }

    /// Append a delivery, returning its tracker
    pub(crate) fn add(&mut self, connector: usize, delivery: DeliveryId, serial: u64) -> Tracker {
        let sequence = self.hwm;
        self.hwm += 1;
        self.entries.push_back(StoreEntry {
            connector,
            delivery,
            serial,
            disposition: None,
            settled: false,
        });
        Tracker {
            direction: self.direction,
            sequence,
        }
    }

    /// Tracker of the most recently added delivery
    pub(crate) fn last_tracker(&self) -> Option<Tracker> {
        (self.hwm > 0).then(|| Tracker {
            direction: self.direction,
            sequence: self.hwm - 1,
        })
    }

    fn index_of(&self, sequence: u64) -> Option<usize> {
        if sequence < self.lwm || sequence >= self.hwm {
            return None;
        }
        Some((sequence - self.lwm) as usize)
    }

    pub(crate) fn entry_by_sequence(&self, sequence: u64) -> Option<&StoreEntry> {
        self.index_of(sequence).map(|index| &self.entries[index])
    }

    pub(crate) fn entry_mut_by_sequence(&mut self, sequence: u64) -> Option<&mut StoreEntry> {
        self.index_of(sequence)
            .map(|index| &mut self.entries[index])
    }

    /// Status observed through a tracker; expired and future trackers are
    /// Unknown
    pub(crate) fn status(&self, tracker: Tracker) -> Status {
        match self.entry_by_sequence(tracker.sequence) {
            None => Status::Unknown,
            Some(entry) => entry.disposition.unwrap_or(if entry.settled {
                Status::Settled
            } else {
                Status::Pending
            }),
        }
    }

    /// Sequences a (possibly cumulative) operation applies to, tail to
    /// tracker inclusive
    pub(crate) fn selection(&self, tracker: Tracker, cumulative: bool) -> Vec<u64> {
        if self.index_of(tracker.sequence).is_none() {
            return Vec::new();
        }
        if cumulative {
            (self.lwm..=tracker.sequence).collect()
        } else {
            vec![tracker.sequence]
        }
    }

    /// Drop settled heads beyond the window, expiring their trackers
    pub(crate) fn slide(&mut self) {
        while self.entries.len() > self.window {
            match self.entries.front() {
                Some(entry) if entry.settled => {
                    self.entries.pop_front();
                    self.lwm += 1;
                }
                _ => break,
            }
        }
    }

    /// Still-live entries in insertion order
    pub(crate) fn entries(&self) -> impl Iterator<Item = (u64, &StoreEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (self.lwm + index as u64, entry))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(store: &mut TrackerStore) -> Tracker {
        let delivery = DeliveryId(store.hwm as usize);
        store.add(0, delivery, store.hwm)
    }

    #[test]
    fn trackers_are_dense_and_increasing() {
        let mut store = TrackerStore::new(Direction::Outgoing);
        let sequences: Vec<u64> = (0..5).map(|_| entry(&mut store).sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn unknown_for_expired_and_future() {
        let mut store = TrackerStore::new(Direction::Outgoing);
        let first = entry(&mut store);
        entry(&mut store);
        store.entry_mut_by_sequence(first.sequence).unwrap().settled = true;
        store.slide();

        assert_eq!(store.status(first), Status::Unknown);
        let future = Tracker {
            direction: Direction::Outgoing,
            sequence: 99,
        };
        assert_eq!(store.status(future), Status::Unknown);
    }

    #[test]
    fn window_bounds_settled_tail() {
        let mut store = TrackerStore::new(Direction::Outgoing);
        store.set_window(2);
        let trackers: Vec<Tracker> = (0..3).map(|_| entry(&mut store)).collect();
        for tracker in &trackers {
            let e = store.entry_mut_by_sequence(tracker.sequence).unwrap();
            e.disposition = Some(Status::Accepted);
            e.settled = true;
        }
        store.slide();

        assert_eq!(store.len(), 2);
        assert_eq!(store.status(trackers[0]), Status::Unknown);
        assert_eq!(store.status(trackers[1]), Status::Accepted);
        assert_eq!(store.status(trackers[2]), Status::Accepted);
    }

    #[test]
    fn pending_head_blocks_slide() {
        let mut store = TrackerStore::new(Direction::Incoming);
        let head = entry(&mut store);
        let tail = entry(&mut store);
        store.entry_mut_by_sequence(tail.sequence).unwrap().settled = true;
        store.slide();

        // Window 0 but the head is unsettled, so nothing slides
        assert_eq!(store.len(), 2);
        assert_eq!(store.status(head), Status::Pending);
        assert_eq!(store.status(tail), Status::Settled);
    }

    #[test]
    fn cumulative_selection_runs_tail_to_tracker() {
        let mut store = TrackerStore::new(Direction::Outgoing);
        let trackers: Vec<Tracker> = (0..4).map(|_| entry(&mut store)).collect();
        assert_eq!(store.selection(trackers[2], true), vec![0, 1, 2]);
        assert_eq!(store.selection(trackers[1], false), vec![1]);

        // Expired trackers select nothing
        store.entry_mut_by_sequence(0).unwrap().settled = true;
        store.slide();
        assert_eq!(store.selection(trackers[0], true), Vec::<u64>::new());
    }

    #[test]
    fn settle_is_idempotent_on_status() {
        let mut store = TrackerStore::new(Direction::Outgoing);
        store.set_window(8);
        let tracker = entry(&mut store);
        let e = store.entry_mut_by_sequence(tracker.sequence).unwrap();
        e.disposition = Some(Status::Accepted);
        e.settled = true;
        let first = store.status(tracker);
        store.entry_mut_by_sequence(tracker.sequence).unwrap().settled = true;
        assert_eq!(store.status(tracker), first);
    }
}
