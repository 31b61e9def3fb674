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

//! Abstraction over OS readiness selectors (poll/epoll/kqueue wrappers).

#[cfg(feature = "popol")]
pub mod popol;

use std::fmt::{self, Display, Formatter};
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{io, ops};

/// Identifier under which a file descriptor is registered with a [`Poll`]
/// implementation.
///
/// Tokens are assigned by the reactor and are never reused, unlike raw file
/// descriptors which the OS recycles.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display(inner)]
pub struct Token(pub u64);

impl Token {
    /// Token of the reactor waker (always zero).
    pub const WAKER: Token = Token(0);
}

/// Interest in, or readiness of, I/O operations on a registered descriptor.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// Read readiness (or interest in reading).
    pub read: bool,
    /// Write readiness (or interest in writing).
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
}

impl ops::BitOr for IoType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            read: self.read | rhs.read,
            write: self.write | rhs.write,
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (false, false) => f.write_str("none"),
            (true, false) => f.write_str("read"),
            (false, true) => f.write_str("write"),
            (true, true) => f.write_str("read-write"),
        }
    }
}

/// Failure reported by the selector for a single registered descriptor.
#[derive(Copy, Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum IoFail {
    /// connection is absent or was hung up
    Connectivity,
    /// OS-level failure on the descriptor
    Os,
}

/// An OS readiness selector consumed by the reactor.
///
/// Implementations own the set of registered descriptors keyed by [`Token`] and
/// report readiness as an iterator of `(Token, Result<IoType, IoFail>)` pairs
/// filled in by [`Poll::poll`].
pub trait Poll
where
    Self: Send + Iterator<Item = (Token, Result<IoType, IoFail>)>,
{
    /// Registers a descriptor under the given token with an initial interest
    /// set.
    fn register(&mut self, fd: RawFd, token: Token, interest: IoType);

    /// Removes the descriptor registered under `token`. Unknown tokens are
    /// ignored.
    fn unregister(&mut self, token: Token);

    /// Replaces the interest set of a registered descriptor.
    ///
    /// Returns `false` when the token is not registered.
    fn set_interest(&mut self, token: Token, interest: IoType) -> bool;

    /// Waits for readiness events up to `timeout` (or indefinitely when
    /// `None`), queueing them for iteration.
    ///
    /// Returns the number of newly queued events; zero signals a timeout.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;

    /// Discards the OS selector and constructs a fresh one, re-registering
    /// every known descriptor with its current interest set.
    ///
    /// Used as the runtime response to selectors which start reporting
    /// readiness in a tight loop without producing events.
    fn rebuild(&mut self) -> io::Result<()>;
}
