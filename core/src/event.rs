//! Engine event queue.
//!
//! RULE: Dequeue order is total and explicit:
//!   (time, team index, player index, insertion sequence)
//! Equal-time events never depend on heap internals.

use crate::types::SimSeconds;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A player (or a group led by that player) finishes an attempt.
    AttemptCompleted {
        activity_id: String,
        attempt_index: usize,
        tile_key: String,
        /// Player indexes within the team, leader first.
        members: Vec<usize>,
    },
    /// An offline player's next session starts.
    Wake,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    pub time: SimSeconds,
    pub team: usize,
    pub player: usize,
    pub seq: u64,
    pub kind: EventKind,
}

impl QueuedEvent {
    fn sort_key(&self) -> (SimSeconds, usize, usize, u64) {
        (self.time, self.team, self.player, self.seq)
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<QueuedEvent>>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, time: SimSeconds, team: usize, player: usize, kind: EventKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(QueuedEvent {
            time,
            team,
            player,
            seq,
            kind,
        }));
    }

    pub fn pop(&mut self) -> Option<QueuedEvent> {
        self.heap.pop().map(|Reverse(e)| e)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_break_by_team_then_player_then_sequence() {
        let mut q = EventQueue::new();
        q.push(10, 1, 0, EventKind::Wake);
        q.push(10, 0, 1, EventKind::Wake);
        q.push(5, 1, 1, EventKind::Wake);
        q.push(10, 0, 1, EventKind::Wake);
        q.push(10, 0, 0, EventKind::Wake);

        let order: Vec<_> = std::iter::from_fn(|| q.pop())
            .map(|e| (e.time, e.team, e.player, e.seq))
            .collect();
        assert_eq!(
            order,
            vec![(5, 1, 1, 2), (10, 0, 0, 4), (10, 0, 1, 1), (10, 0, 1, 3), (10, 1, 0, 0)]
        );
    }
}
