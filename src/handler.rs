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

//! Channel handlers and their capability masks.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::ops;

use crate::channel::{Channel, Message};
use crate::future::Promise;
use crate::pipeline::Context;
use crate::Error;

/// Bitset over the event callbacks a handler implements.
///
/// The pipeline skips a handler for every event whose bit is absent from its
/// mask, in O(1) per skipped context.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);

    pub const EXCEPTION_CAUGHT: EventMask = EventMask(1);
    pub const CHANNEL_REGISTERED: EventMask = EventMask(1 << 1);
    pub const CHANNEL_UNREGISTERED: EventMask = EventMask(1 << 2);
    pub const CHANNEL_ACTIVE: EventMask = EventMask(1 << 3);
    pub const CHANNEL_INACTIVE: EventMask = EventMask(1 << 4);
    pub const CHANNEL_READ: EventMask = EventMask(1 << 5);
    pub const CHANNEL_READ_COMPLETE: EventMask = EventMask(1 << 6);
    pub const USER_EVENT: EventMask = EventMask(1 << 7);
    pub const WRITABILITY_CHANGED: EventMask = EventMask(1 << 8);
    pub const BIND: EventMask = EventMask(1 << 9);
    pub const CONNECT: EventMask = EventMask(1 << 10);
    pub const DISCONNECT: EventMask = EventMask(1 << 11);
    pub const CLOSE: EventMask = EventMask(1 << 12);
    pub const DEREGISTER: EventMask = EventMask(1 << 13);
    pub const READ: EventMask = EventMask(1 << 14);
    pub const WRITE: EventMask = EventMask(1 << 15);
    pub const FLUSH: EventMask = EventMask(1 << 16);

    /// All inbound events except `exception_caught`.
    pub const ONLY_INBOUND: EventMask = EventMask(
        Self::CHANNEL_REGISTERED.0
            | Self::CHANNEL_UNREGISTERED.0
            | Self::CHANNEL_ACTIVE.0
            | Self::CHANNEL_INACTIVE.0
            | Self::CHANNEL_READ.0
            | Self::CHANNEL_READ_COMPLETE.0
            | Self::USER_EVENT.0
            | Self::WRITABILITY_CHANGED.0,
    );

    /// All inbound events including `exception_caught`.
    pub const ALL_INBOUND: EventMask = EventMask(Self::EXCEPTION_CAUGHT.0 | Self::ONLY_INBOUND.0);

    /// All outbound operations.
    pub const ONLY_OUTBOUND: EventMask = EventMask(
        Self::BIND.0
            | Self::CONNECT.0
            | Self::DISCONNECT.0
            | Self::CLOSE.0
            | Self::DEREGISTER.0
            | Self::READ.0
            | Self::WRITE.0
            | Self::FLUSH.0,
    );

    /// All outbound operations including `exception_caught`.
    pub const ALL_OUTBOUND: EventMask =
        EventMask(Self::EXCEPTION_CAUGHT.0 | Self::ONLY_OUTBOUND.0);

    /// Every known event bit.
    pub const ALL: EventMask = EventMask(Self::ALL_INBOUND.0 | Self::ALL_OUTBOUND.0);

    pub fn contains(self, other: EventMask) -> bool { self.0 & other.0 == other.0 }

    pub fn intersects(self, other: EventMask) -> bool { self.0 & other.0 != 0 }

    pub fn is_empty(self) -> bool { self.0 == 0 }
}

impl ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: Self) -> Self::Output { EventMask(self.0 | rhs.0) }
}

impl ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0 }
}

impl ops::BitAnd for EventMask {
    type Output = EventMask;
    fn bitand(self, rhs: Self) -> Self::Output { EventMask(self.0 & rhs.0) }
}

impl ops::Not for EventMask {
    type Output = EventMask;
    fn not(self) -> Self::Output { EventMask(!self.0 & Self::ALL.0) }
}

impl Debug for EventMask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { write!(f, "EventMask({:#019b})", self.0) }
}

thread_local! {
    static MASK_CACHE: RefCell<HashMap<TypeId, EventMask>> = RefCell::new(HashMap::new());
}

/// Computes the execution mask for a handler type, caching the result in a
/// per-thread map keyed by the type so repeated adds of the same handler type
/// never re-run the declaration.
pub(crate) fn mask_of(type_id: TypeId, compute: impl FnOnce() -> EventMask) -> EventMask {
    MASK_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        match cache.get(&type_id) {
            Some(mask) => *mask,
            None => {
                let mask = compute() & EventMask::ALL;
                cache.insert(type_id, mask);
                mask
            }
        }
    })
}

/// User-supplied code reacting to inbound channel events and intercepting
/// outbound operations.
///
/// Every method has a default implementation which forwards the event to the
/// next handler in the pipeline. [`ChannelHandler::handled_events`] declares
/// which methods carry a real implementation: the default declaration is
/// [`EventMask::ALL`], matching a handler that implements everything, and a
/// handler overriding only some callbacks narrows the set so that the pipeline
/// can skip it for everything else. A bit left out of the declaration is a
/// promise that the corresponding method only forwards.
///
/// Callbacks always run on the executor of the handler's context, which is the
/// channel's reactor unless the handler was added with an override executor.
/// Returning an `Err` from an inbound callback fires `exception_caught` on the
/// *next* context; returning an `Err` from an outbound callback fails the
/// operation's promise.
#[allow(unused_variables)]
pub trait ChannelHandler: Send + 'static {
    /// Declares the events this handler actually implements.
    fn handled_events(&self) -> EventMask { EventMask::ALL }

    /// Called after the handler's context became part of a registered
    /// pipeline, before any event can reach it.
    fn handler_added(&mut self, ctx: &Context) -> Result<(), Error> { Ok(()) }

    /// Called after the handler's context was unlinked and no dispatch can
    /// observe it anymore.
    fn handler_removed(&mut self, ctx: &Context) -> Result<(), Error> { Ok(()) }

    fn channel_registered(&mut self, ctx: &Context) -> Result<(), Error> {
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&mut self, ctx: &Context) -> Result<(), Error> {
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&mut self, ctx: &Context) -> Result<(), Error> {
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&mut self, ctx: &Context) -> Result<(), Error> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), Error> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn channel_read_complete(&mut self, ctx: &Context) -> Result<(), Error> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    fn user_event(&mut self, ctx: &Context, event: Box<dyn Any + Send>) -> Result<(), Error> {
        ctx.fire_user_event(event);
        Ok(())
    }

    fn writability_changed(&mut self, ctx: &Context) -> Result<(), Error> {
        ctx.fire_writability_changed();
        Ok(())
    }

    fn exception_caught(&mut self, ctx: &Context, err: Error) -> Result<(), Error> {
        ctx.fire_exception_caught(err);
        Ok(())
    }

    fn bind(&mut self, ctx: &Context, addr: SocketAddr, promise: Promise<()>) -> Result<(), Error> {
        ctx.bind(addr, promise);
        Ok(())
    }

    fn connect(
        &mut self,
        ctx: &Context,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: Promise<()>,
    ) -> Result<(), Error> {
        ctx.connect(remote, local, promise);
        Ok(())
    }

    fn disconnect(&mut self, ctx: &Context, promise: Promise<()>) -> Result<(), Error> {
        ctx.disconnect(promise);
        Ok(())
    }

    fn close(&mut self, ctx: &Context, promise: Promise<()>) -> Result<(), Error> {
        ctx.close(promise);
        Ok(())
    }

    fn deregister(&mut self, ctx: &Context, promise: Promise<()>) -> Result<(), Error> {
        ctx.deregister(promise);
        Ok(())
    }

    fn read(&mut self, ctx: &Context) -> Result<(), Error> {
        ctx.read();
        Ok(())
    }

    fn write(&mut self, ctx: &Context, msg: Message, promise: Promise<()>) -> Result<(), Error> {
        ctx.write(msg, promise);
        Ok(())
    }

    fn flush(&mut self, ctx: &Context) -> Result<(), Error> {
        ctx.flush();
        Ok(())
    }
}

type InitFn = dyn FnMut(&Channel) -> Result<(), Error> + Send;

/// Handler whose sole role is deferred pipeline population.
///
/// When `channel_registered` (or `handler_added` on an already registered
/// channel) reaches it, the user callback populates the pipeline with the real
/// handlers and the initializer removes itself. The callback runs exactly once
/// per channel no matter which of the two paths wins.
pub struct ChannelInitializer {
    init: Box<InitFn>,
    done: bool,
}

impl ChannelInitializer {
    pub fn new(init: impl FnMut(&Channel) -> Result<(), Error> + Send + 'static) -> Self {
        ChannelInitializer {
            init: Box::new(init),
            done: false,
        }
    }

    /// Runs the user callback and removes the context; returns whether it ran
    /// on this invocation.
    fn init_channel(&mut self, ctx: &Context) -> bool {
        if self.done {
            return false;
        }
        self.done = true;
        let res = (self.init)(ctx.channel());
        ctx.pipeline().remove(ctx.name()).unwrap_or_else(|err| {
            #[cfg(feature = "log")]
            log::warn!(target: "pipeline",
                "Failed to remove initializer from {:?}: {err}", ctx.channel());
            #[cfg(not(feature = "log"))]
            let _ = err;
        });
        if let Err(err) = res {
            #[cfg(feature = "log")]
            log::warn!(target: "pipeline",
                "Failed to initialize {:?}, closing the channel: {err}", ctx.channel());
            #[cfg(not(feature = "log"))]
            let _ = err;
            ctx.channel().close();
        }
        true
    }
}

impl ChannelHandler for ChannelInitializer {
    fn handled_events(&self) -> EventMask {
        EventMask::CHANNEL_REGISTERED | EventMask::EXCEPTION_CAUGHT
    }

    fn handler_added(&mut self, ctx: &Context) -> Result<(), Error> {
        if ctx.channel().is_registered() {
            self.init_channel(ctx);
        }
        Ok(())
    }

    fn channel_registered(&mut self, ctx: &Context) -> Result<(), Error> {
        if self.init_channel(ctx) {
            // The original event was consumed while the pipeline still
            // contained only the initializer; re-fire so the freshly added
            // handlers observe the registration.
            ctx.channel().pipeline().fire_channel_registered();
        } else {
            ctx.fire_channel_registered();
        }
        Ok(())
    }

    fn exception_caught(&mut self, ctx: &Context, err: Error) -> Result<(), Error> {
        #[cfg(feature = "log")]
        log::warn!(target: "pipeline",
            "Initialization of {:?} failed: {err}; closing the channel", ctx.channel());
        #[cfg(not(feature = "log"))]
        let _ = err;
        ctx.channel().close();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct ReadOnly;
    impl ChannelHandler for ReadOnly {
        fn handled_events(&self) -> EventMask { EventMask::CHANNEL_READ }
        fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), Error> {
            ctx.fire_channel_read(msg);
            Ok(())
        }
    }

    struct Everything;
    impl ChannelHandler for Everything {}

    #[test]
    fn declared_bits_are_the_mask() {
        let handler = ReadOnly;
        let mask = mask_of(TypeId::of::<ReadOnly>(), || handler.handled_events());
        assert!(mask.contains(EventMask::CHANNEL_READ));
        assert!(!mask.intersects(EventMask::CHANNEL_ACTIVE));
        assert!(!mask.intersects(EventMask::ONLY_OUTBOUND));
    }

    #[test]
    fn default_declaration_is_everything() {
        let handler = Everything;
        let mask = mask_of(TypeId::of::<Everything>(), || handler.handled_events());
        assert_eq!(mask, EventMask::ALL);
        assert!(mask.contains(EventMask::EXCEPTION_CAUGHT));
    }

    #[test]
    fn mask_cache_is_keyed_by_type() {
        let first = mask_of(TypeId::of::<ReadOnly>(), || EventMask::CHANNEL_READ);
        // A different closure result must not override the cached value.
        let second = mask_of(TypeId::of::<ReadOnly>(), || EventMask::ALL);
        assert_eq!(first, second);
    }

    #[test]
    fn inbound_and_outbound_partition() {
        assert_eq!(
            EventMask::ALL_INBOUND & EventMask::ONLY_OUTBOUND,
            EventMask::NONE
        );
        assert_eq!(
            EventMask::ONLY_INBOUND | EventMask::ONLY_OUTBOUND | EventMask::EXCEPTION_CAUGHT,
            EventMask::ALL
        );
    }
}
