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

//! Fixed-size pools of reactors with a fair round-robin chooser.

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::future::{Future, Promise};
use crate::reactor::Reactor;
use crate::Error;

struct GroupInner {
    reactors: Box<[Reactor]>,
    next: AtomicU64,
    /// Set when the size is a power of two: `index = counter & mask` is
    /// cheaper than the modulo taken otherwise.
    mask: Option<u64>,
    terminated: Promise<()>,
}

/// A fixed pool of [`Reactor`]s with a strictly fair round-robin chooser.
///
/// Reactors are created eagerly and owned by the group; no reactor is shared
/// across groups. A channel registered through the group is assigned to one
/// reactor for its whole life.
#[derive(Clone)]
pub struct ReactorGroup(Arc<GroupInner>);

impl Debug for ReactorGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ReactorGroup({})", self.0.reactors.len())
    }
}

impl ReactorGroup {
    /// Creates a group of `size` reactors using the default selector.
    #[cfg(feature = "popol")]
    pub fn new(size: usize) -> Result<ReactorGroup, Error> {
        static GROUP_SEQ: AtomicU64 = AtomicU64::new(1);
        if size == 0 {
            return Err(Error::EmptyGroup);
        }
        let group_id = GROUP_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut reactors = Vec::with_capacity(size);
        for index in 0..size {
            let reactor = Reactor::with_poller(
                format!("reactor-{group_id}-{index}"),
                crate::poller::popol::Poller::new(),
            )?;
            reactors.push(reactor);
        }
        Ok(ReactorGroup::from_reactors(reactors))
    }

    /// Builds a group around already constructed reactors.
    pub fn from_reactors(reactors: Vec<Reactor>) -> ReactorGroup {
        assert!(!reactors.is_empty(), "a reactor group must contain at least one reactor");
        let size = reactors.len();
        let terminated = Promise::new(None);
        let finished = Arc::new(AtomicUsize::new(0));
        for reactor in &reactors {
            let terminated = terminated.clone();
            let finished = finished.clone();
            reactor.terminated_future().on_complete(move |_| {
                if finished.fetch_add(1, Ordering::SeqCst) + 1 == size {
                    terminated.try_success(());
                }
            });
        }
        ReactorGroup(Arc::new(GroupInner {
            reactors: reactors.into_boxed_slice(),
            next: AtomicU64::new(0),
            mask: if size.is_power_of_two() {
                Some(size as u64 - 1)
            } else {
                None
            },
            terminated,
        }))
    }

    pub fn len(&self) -> usize { self.0.reactors.len() }

    pub fn is_empty(&self) -> bool { false }

    /// Picks the next reactor in strict round-robin order, starting from
    /// index zero.
    pub fn next(&self) -> Reactor {
        let counter = self.0.next.fetch_add(1, Ordering::Relaxed);
        let index = match self.0.mask {
            Some(mask) => (counter & mask) as usize,
            None => (counter % self.0.reactors.len() as u64) as usize,
        };
        self.0.reactors[index].clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reactor> { self.0.reactors.iter() }

    /// Registers a channel on the next reactor of the group.
    pub fn register(&self, channel: &Channel) -> Future<()> { self.next().register(channel) }

    /// Fans the graceful shutdown out to every reactor; the returned future
    /// completes when all of them have terminated.
    pub fn shutdown_gracefully(&self, quiet: Duration, timeout: Duration) -> Future<()> {
        for reactor in self.iter() {
            reactor.shutdown_gracefully(quiet, timeout);
        }
        self.terminated_future()
    }

    pub fn terminated_future(&self) -> Future<()> { self.0.terminated.future() }

    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.terminated_future().wait_timeout(timeout)
    }

    pub fn is_shutting_down(&self) -> bool { self.iter().all(Reactor::is_shutting_down) }

    pub fn is_shutdown(&self) -> bool { self.iter().all(Reactor::is_shutdown) }

    pub fn is_terminated(&self) -> bool { self.iter().all(Reactor::is_terminated) }
}

#[cfg(all(test, feature = "popol"))]
mod test {
    use std::collections::HashMap;

    use super::*;

    fn chosen_counts(group: &ReactorGroup, calls: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..calls {
            *counts.entry(group.next().name().to_owned()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn chooser_is_exactly_fair_for_power_of_two() {
        let group = ReactorGroup::new(4).unwrap();
        let counts = chosen_counts(&group, 4 * 25);
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|count| *count == 25));
    }

    #[test]
    fn chooser_is_exactly_fair_for_odd_sizes() {
        let group = ReactorGroup::new(3).unwrap();
        let counts = chosen_counts(&group, 3 * 25);
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|count| *count == 25));
    }

    #[test]
    fn round_robin_starts_from_the_first_reactor() {
        let group = ReactorGroup::new(2).unwrap();
        assert!(group.next().name().ends_with("-0"));
        assert!(group.next().name().ends_with("-1"));
        assert!(group.next().name().ends_with("-0"));
    }

    #[test]
    fn empty_groups_are_rejected() {
        assert!(matches!(ReactorGroup::new(0), Err(Error::EmptyGroup)));
    }

    #[test]
    fn group_terminates_when_every_reactor_does() {
        let group = ReactorGroup::new(2).unwrap();
        for reactor in group.iter() {
            reactor.submit(|| {});
        }
        let terminated =
            group.shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(2));
        assert!(terminated.wait_timeout(Duration::from_secs(5)));
        assert!(group.is_terminated());
        assert!(group.is_shutdown());
        assert!(group.is_shutting_down());
        assert!(group.await_termination(Duration::from_millis(10)));
    }
}
