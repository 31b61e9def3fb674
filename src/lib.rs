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

//! Reactor-based server runtime in which every accepted connection is a *channel*
//! whose inbound and outbound events traverse a user-configurable *pipeline* of
//! *handlers*.
//!
//! The library consists of three tightly coupled parts:
//! - a [`ReactorGroup`] of single-threaded [`Reactor`]s, each owning an OS
//!   readiness selector, a task queue and a timer heap;
//! - a per-channel [`Pipeline`] of [`ChannelHandler`]s with computed capability
//!   masks, dispatching inbound events head-to-tail and outbound operations
//!   tail-to-head, always on the reactor owning the channel;
//! - a [`ServerBootstrap`] which binds a listening channel on a *parent* reactor
//!   and hands each accepted child channel over to a *child* reactor group.
//!
//! All blocking happens inside reactor threads on the selector wait; every other
//! thread communicates with a reactor by enqueueing tasks.

#[macro_use]
extern crate amplify;

pub mod poller;
mod attr;
mod bootstrap;
mod channel;
mod future;
mod group;
mod handler;
mod pipeline;
mod reactor;
mod timer;
mod transport;

use std::io;
use std::sync::Arc;

pub use attr::{AttrKey, AttrValues, AttributeMap, ChannelOption, OptionValues};
pub use bootstrap::ServerBootstrap;
pub use channel::{options, Channel, ChannelConfig, ChannelId, ChannelState, Message};
pub use future::{Future, Promise};
pub use group::ReactorGroup;
pub use handler::{ChannelHandler, ChannelInitializer, EventMask};
pub use pipeline::{Context, Pipeline};
pub use reactor::{DefaultSelectStrategy, Reactor, SelectStrategy, SelectVerdict};
pub use transport::{FlushOutcome, IoStatus, ReadOutcome, ServerTransport, StreamTransport, Transport};

/// Errors produced by reactors, channels, pipelines and bootstraps.
///
/// The type is cheaply clonable since a single failure may have to be delivered
/// to multiple future listeners.
#[derive(Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// channel is already registered with a reactor
    AlreadyRegistered,

    /// channel is not registered with any reactor
    NotRegistered,

    /// channel is closed
    ChannelClosed,

    /// reactor is shut down and does not accept new work
    ReactorShutdown,

    /// reactor group must contain at least one reactor
    EmptyGroup,

    /// duplicate handler name "{0}" in the pipeline
    DuplicateName(String),

    /// handler "{0}" declares an empty event mask
    EmptyMask(String),

    /// no handler named "{0}" in the pipeline
    UnknownHandler(String),

    /// head and tail of a pipeline can not be removed
    SentinelRemoval,

    /// a key named "{0}" is already registered
    DuplicateKey(String),

    /// invalid value for the "{0}" option
    InvalidOption(&'static str),

    /// required bootstrap parameter `{0}` is not set
    BootstrapIncomplete(&'static str),

    /// message of this kind can not be written to the transport
    UnsupportedMessage,

    /// operation was cancelled
    Cancelled,

    /// I/O error: {0}
    Io(Arc<io::Error>),

    /// {0}
    Other(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self { Error::Io(Arc::new(err)) }
}

impl Error {
    /// Constructs an application-defined error from a displayable value.
    pub fn other(msg: impl ToString) -> Self { Error::Other(msg.to_string()) }
}
