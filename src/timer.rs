// Library for event-driven network services built around channel pipelines.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::future::Promise;
use crate::reactor::Task;

/// A task scheduled for execution at a deadline.
///
/// Entries are ordered by `(deadline, seq)` so that tasks scheduled for the
/// same instant run in submission order.
pub(crate) struct ScheduledEntry {
    pub deadline: Instant,
    pub seq: u64,
    pub task: Task,
    pub promise: Promise<()>,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for ScheduledEntry {
    // Reversed so that `BinaryHeap` pops the nearest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

/// Min-heap of scheduled tasks owned by a reactor thread.
///
/// Cancellation is lazy: a cancelled entry stays in the heap and is discarded
/// when it reaches the top.
#[derive(Default)]
pub(crate) struct ScheduledQueue {
    heap: BinaryHeap<ScheduledEntry>,
}

impl ScheduledQueue {
    pub fn new() -> Self { ScheduledQueue { heap: BinaryHeap::new() } }

    pub fn push(&mut self, entry: ScheduledEntry) { self.heap.push(entry) }

    /// Time remaining until the next live deadline; `None` when nothing is
    /// scheduled. Dropping expired cancellations on the way.
    pub fn next_deadline(&mut self, now: Instant) -> Option<Duration> {
        loop {
            let entry = self.heap.peek()?;
            if entry.promise.future().is_cancelled() {
                self.heap.pop();
                continue;
            }
            return Some(entry.deadline.saturating_duration_since(now));
        }
    }

    /// Pops the next entry whose deadline has been reached, skipping
    /// cancelled entries.
    pub fn pop_due(&mut self, now: Instant) -> Option<ScheduledEntry> {
        loop {
            let entry = self.heap.peek()?;
            if entry.promise.future().is_cancelled() {
                self.heap.pop();
                continue;
            }
            if entry.deadline > now {
                return None;
            }
            return self.heap.pop();
        }
    }

    pub fn is_empty(&self) -> bool { self.heap.is_empty() }

    /// Removes every remaining entry, cancelled or not. Used at reactor
    /// teardown to fail outstanding timers.
    pub fn drain(&mut self) -> Vec<ScheduledEntry> { self.heap.drain().collect() }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(deadline: Instant, seq: u64) -> ScheduledEntry {
        ScheduledEntry {
            deadline,
            seq,
            task: Box::new(|| {}),
            promise: Promise::new(None),
        }
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut queue = ScheduledQueue::new();
        let now = Instant::now();

        queue.push(entry(now + Duration::from_millis(64), 2));
        queue.push(entry(now + Duration::from_millis(8), 0));
        queue.push(entry(now + Duration::from_millis(16), 1));

        assert!(queue.next_deadline(now).unwrap() <= Duration::from_millis(8));
        assert!(queue.pop_due(now).is_none(), "nothing is due yet");

        let later = now + Duration::from_millis(20);
        assert_eq!(queue.pop_due(later).unwrap().seq, 0);
        assert_eq!(queue.pop_due(later).unwrap().seq, 1);
        assert!(queue.pop_due(later).is_none());
        assert_eq!(queue.pop_due(later + Duration::from_millis(60)).unwrap().seq, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn same_deadline_runs_in_submission_order() {
        let mut queue = ScheduledQueue::new();
        let deadline = Instant::now() + Duration::from_millis(1);
        for seq in 0..4 {
            queue.push(entry(deadline, seq));
        }
        for seq in 0..4 {
            assert_eq!(queue.pop_due(deadline).unwrap().seq, seq);
        }
    }

    #[test]
    fn cancelled_entries_are_discarded_on_pop() {
        let mut queue = ScheduledQueue::new();
        let now = Instant::now();

        let cancelled = ScheduledEntry {
            promise: Promise::cancellable(None),
            ..entry(now, 0)
        };
        assert!(cancelled.promise.future().cancel());
        queue.push(cancelled);
        queue.push(entry(now, 1));

        assert_eq!(queue.pop_due(now).unwrap().seq, 1);
        assert!(queue.is_empty());
    }
}
