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

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::poller::{IoFail, IoType, Poll, Token};

/// Selector implementation backed by the [`popol`] poll(2) wrapper.
///
/// Keeps its own registration table so that the OS-level source set can be
/// rebuilt from scratch and so that an empty interest set can be expressed by
/// standing the descriptor down (poll(2) has no "registered but silent" mode
/// which would not busy-report level-triggered readiness).
pub struct Poller {
    sources: popol::Sources<Token>,
    registry: HashMap<Token, (RawFd, IoType)>,
    queue: VecDeque<(Token, Result<IoType, IoFail>)>,
    events: Vec<popol::Event<Token>>,
}

struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd { self.0 }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            sources: popol::Sources::new(),
            registry: empty!(),
            queue: empty!(),
            events: vec![],
        }
    }

    fn arm(sources: &mut popol::Sources<Token>, fd: RawFd, token: Token, interest: IoType) {
        let interest = match (interest.read, interest.write) {
            (true, true) => popol::interest::ALL,
            (true, false) => popol::interest::READ,
            (false, true) => popol::interest::WRITE,
            (false, false) => return,
        };
        sources.register(token, &Fd(fd), interest);
    }
}

impl Default for Poller {
    fn default() -> Self { Poller::new() }
}

impl Poll for Poller {
    fn register(&mut self, fd: RawFd, token: Token, interest: IoType) {
        debug_assert!(!self.registry.contains_key(&token), "token {token} is already registered");
        self.registry.insert(token, (fd, interest));
        Self::arm(&mut self.sources, fd, token, interest);
    }

    fn unregister(&mut self, token: Token) {
        if let Some((_, interest)) = self.registry.remove(&token) {
            if !interest.is_none() {
                self.sources.unregister(&token);
            }
        }
    }

    fn set_interest(&mut self, token: Token, interest: IoType) -> bool {
        let Some((fd, current)) = self.registry.get_mut(&token) else {
            return false;
        };
        let fd = *fd;
        let prev = *current;
        *current = interest;
        match (prev.is_none(), interest.is_none()) {
            (true, true) => {}
            (false, true) => {
                self.sources.unregister(&token);
            }
            (true, false) => Self::arm(&mut self.sources, fd, token, interest),
            (false, false) => {
                let set = match (interest.read, interest.write) {
                    (true, true) => popol::interest::ALL,
                    (true, false) => popol::interest::READ,
                    (false, true) => popol::interest::WRITE,
                    (false, false) => unreachable!(),
                };
                self.sources.set(&token, set);
            }
        }
        true
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let len = self.queue.len();
        let timeout = match timeout {
            Some(duration) => popol::Timeout::from(duration),
            None => popol::Timeout::Never,
        };

        // Blocking call
        match self.sources.poll(&mut self.events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(0),
            Err(err) => return Err(err),
        }

        for event in self.events.drain(..) {
            let token = event.key;
            let res = if event.is_invalid() || event.is_error() {
                Err(IoFail::Os)
            } else if event.is_hangup() && !event.is_readable() {
                Err(IoFail::Connectivity)
            } else {
                // Hangup with pending data is delivered as a read so the final
                // bytes are not lost; EOF is then detected by the read itself.
                Ok(IoType {
                    read: event.is_readable() || event.is_hangup(),
                    write: event.is_writable(),
                })
            };
            self.queue.push_back((token, res));
        }

        Ok(self.queue.len() - len)
    }

    fn rebuild(&mut self) -> io::Result<()> {
        self.sources = popol::Sources::with_capacity(self.registry.len());
        for (token, (fd, interest)) in &self.registry {
            Self::arm(&mut self.sources, *fd, *token, *interest);
        }
        Ok(())
    }
}

impl Iterator for Poller {
    type Item = (Token, Result<IoType, IoFail>);

    fn next(&mut self) -> Option<Self::Item> { self.queue.pop_front() }
}
