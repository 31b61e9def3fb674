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

//! Channel pipelines: ordered chains of handler contexts dispatching inbound
//! events head-to-tail and outbound operations tail-to-head.

use std::any::{Any, TypeId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, TryLockError, Weak};

use crate::channel::{Channel, ChannelCore, ChannelState, Message};
use crate::future::{Future, Promise};
use crate::handler::{mask_of, ChannelHandler, EventMask};
use crate::reactor::{Ctl, Reactor};
use crate::transport::FlushOutcome;
use crate::Error;

/// Context was linked but its `handler_added` callback did not run yet.
const CTX_INIT: u8 = 0;
/// `handler_added` ran (or is running); the context takes part in dispatch.
const CTX_ADDED: u8 = 1;
/// Context was unlinked; dispatch walks over it without invoking.
const CTX_REMOVED: u8 = 2;

/// Marker for the two sentinel contexts. Their handlers are stateless, so
/// dispatch reaches them without taking the handler cell, which keeps the
/// transport terminals reachable even while an upstream handler cell is held
/// by an in-flight callback.
#[derive(Copy, Clone, Eq, PartialEq)]
enum Sentinel {
    Head,
    Tail,
}

/// The pipeline's wrapper around a single handler: links, name, executor and
/// execution mask.
pub(crate) struct HandlerCtx {
    name: String,
    handler: Mutex<Box<dyn ChannelHandler>>,
    mask: EventMask,
    /// Override executor; `None` means the channel's reactor.
    executor: Option<Reactor>,
    prev: Mutex<Weak<HandlerCtx>>,
    next: Mutex<Option<Arc<HandlerCtx>>>,
    state: AtomicU8,
    sentinel: Option<Sentinel>,
}

impl HandlerCtx {
    fn is_removed(&self) -> bool { self.state.load(Ordering::SeqCst) == CTX_REMOVED }

    fn next_ctx(&self) -> Option<Arc<HandlerCtx>> {
        self.next.lock().expect("pipeline link poisoned").clone()
    }

    fn prev_ctx(&self) -> Option<Arc<HandlerCtx>> {
        self.prev.lock().expect("pipeline link poisoned").upgrade()
    }
}

/// Inbound events travelling head-to-tail.
pub(crate) enum Inbound {
    Registered,
    Unregistered,
    Active,
    Inactive,
    Read(Message),
    ReadComplete,
    UserEvent(Box<dyn Any + Send>),
    WritabilityChanged,
    Exception(Error),
}

impl Inbound {
    fn bit(&self) -> EventMask {
        match self {
            Inbound::Registered => EventMask::CHANNEL_REGISTERED,
            Inbound::Unregistered => EventMask::CHANNEL_UNREGISTERED,
            Inbound::Active => EventMask::CHANNEL_ACTIVE,
            Inbound::Inactive => EventMask::CHANNEL_INACTIVE,
            Inbound::Read(_) => EventMask::CHANNEL_READ,
            Inbound::ReadComplete => EventMask::CHANNEL_READ_COMPLETE,
            Inbound::UserEvent(_) => EventMask::USER_EVENT,
            Inbound::WritabilityChanged => EventMask::WRITABILITY_CHANGED,
            Inbound::Exception(_) => EventMask::EXCEPTION_CAUGHT,
        }
    }
}

/// Outbound operations travelling tail-to-head, each carrying the promise of
/// its result where applicable.
pub(crate) enum Outbound {
    Bind(SocketAddr, Promise<()>),
    Connect(SocketAddr, Option<SocketAddr>, Promise<()>),
    Disconnect(Promise<()>),
    Close(Promise<()>),
    Deregister(Promise<()>),
    Read,
    Write(Message, Promise<()>),
    Flush,
}

impl Outbound {
    fn bit(&self) -> EventMask {
        match self {
            Outbound::Bind(..) => EventMask::BIND,
            Outbound::Connect(..) => EventMask::CONNECT,
            Outbound::Disconnect(_) => EventMask::DISCONNECT,
            Outbound::Close(_) => EventMask::CLOSE,
            Outbound::Deregister(_) => EventMask::DEREGISTER,
            Outbound::Read => EventMask::READ,
            Outbound::Write(..) => EventMask::WRITE,
            Outbound::Flush => EventMask::FLUSH,
        }
    }

    fn promise(&self) -> Option<Promise<()>> {
        match self {
            Outbound::Bind(_, promise)
            | Outbound::Connect(_, _, promise)
            | Outbound::Disconnect(promise)
            | Outbound::Close(promise)
            | Outbound::Deregister(promise)
            | Outbound::Write(_, promise) => Some(promise.clone()),
            Outbound::Read | Outbound::Flush => None,
        }
    }
}

struct PipeInner {
    /// False until the channel is first registered; handler callbacks are
    /// deferred while it is.
    registered: bool,
    pending_added: Vec<Arc<HandlerCtx>>,
    name_seq: usize,
}

enum Anchor {
    First,
    Last,
    Before(String),
    After(String),
}

struct PipeShared {
    channel: Weak<ChannelCore>,
    head: Arc<HandlerCtx>,
    tail: Arc<HandlerCtx>,
    inner: Mutex<PipeInner>,
}

/// Doubly linked list of handler contexts between the head and tail
/// sentinels.
///
/// The list structure is mutated only on the owning reactor once the channel
/// is registered; mutation requests from other threads are enqueued there.
/// Before registration the configuring thread mutates directly and the
/// `handler_added` callbacks are deferred until registration.
#[derive(Clone)]
pub struct Pipeline(Arc<PipeShared>);

impl Pipeline {
    pub(crate) fn new(channel: Weak<ChannelCore>) -> Pipeline {
        let head = Arc::new(HandlerCtx {
            name: "head".to_owned(),
            handler: Mutex::new(Box::new(HeadHandler)),
            mask: EventMask::ALL,
            executor: None,
            prev: Mutex::new(Weak::new()),
            next: Mutex::new(None),
            state: AtomicU8::new(CTX_ADDED),
            sentinel: Some(Sentinel::Head),
        });
        let tail = Arc::new(HandlerCtx {
            name: "tail".to_owned(),
            handler: Mutex::new(Box::new(TailHandler)),
            mask: EventMask::ALL_INBOUND,
            executor: None,
            prev: Mutex::new(Arc::downgrade(&head)),
            next: Mutex::new(None),
            state: AtomicU8::new(CTX_ADDED),
            sentinel: Some(Sentinel::Tail),
        });
        *head.next.lock().expect("pipeline link poisoned") = Some(tail.clone());
        Pipeline(Arc::new(PipeShared {
            channel,
            head,
            tail,
            inner: Mutex::new(PipeInner {
                registered: false,
                pending_added: vec![],
                name_seq: 0,
            }),
        }))
    }

    fn channel(&self) -> Option<Channel> { self.0.channel.upgrade().map(Channel) }

    /// Snapshot of handler names in pipeline order, including the `head` and
    /// `tail` sentinels.
    pub fn names(&self) -> Vec<String> {
        let _guard = self.0.inner.lock().expect("pipeline poisoned");
        let mut names = vec![self.0.head.name.clone()];
        let mut cursor = self.0.head.next_ctx();
        while let Some(ctx) = cursor {
            names.push(ctx.name.clone());
            cursor = ctx.next_ctx();
        }
        names
    }

    pub fn len(&self) -> usize { self.names().len() - 2 }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    // ------------------------------------------------------------------
    // Mutation

    pub fn add_last<H: ChannelHandler>(&self, name: Option<&str>, handler: H) -> Result<(), Error> {
        self.add::<H>(Anchor::Last, None, name, handler)
    }

    pub fn add_first<H: ChannelHandler>(
        &self,
        name: Option<&str>,
        handler: H,
    ) -> Result<(), Error> {
        self.add::<H>(Anchor::First, None, name, handler)
    }

    pub fn add_before<H: ChannelHandler>(
        &self,
        anchor: &str,
        name: Option<&str>,
        handler: H,
    ) -> Result<(), Error> {
        self.add::<H>(Anchor::Before(anchor.to_owned()), None, name, handler)
    }

    pub fn add_after<H: ChannelHandler>(
        &self,
        anchor: &str,
        name: Option<&str>,
        handler: H,
    ) -> Result<(), Error> {
        self.add::<H>(Anchor::After(anchor.to_owned()), None, name, handler)
    }

    /// Adds a handler which will run on `executor` instead of the channel's
    /// reactor. Per-channel ordering is kept relative to other handlers on the
    /// same executor only.
    pub fn add_last_on<H: ChannelHandler>(
        &self,
        executor: Reactor,
        name: Option<&str>,
        handler: H,
    ) -> Result<(), Error> {
        self.add::<H>(Anchor::Last, Some(executor), name, handler)
    }

    fn add<H: ChannelHandler>(
        &self,
        anchor: Anchor,
        executor: Option<Reactor>,
        name: Option<&str>,
        handler: H,
    ) -> Result<(), Error> {
        let mask = mask_of(TypeId::of::<H>(), || handler.handled_events());
        let label = short_type_name::<H>();
        self.add_ctx(anchor, executor, name, label, Box::new(handler), mask)
    }

    /// Type-erased variant of the `add_*` family for handlers constructed by
    /// factories. The mask is computed from the instance declaration without
    /// the per-type cache.
    pub fn add_last_boxed(
        &self,
        name: Option<&str>,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<(), Error> {
        let mask = handler.handled_events() & EventMask::ALL;
        self.add_ctx(Anchor::Last, None, name, "handler", handler, mask)
    }

    fn add_ctx(
        &self,
        anchor: Anchor,
        executor: Option<Reactor>,
        name: Option<&str>,
        label: &str,
        handler: Box<dyn ChannelHandler>,
        mask: EventMask,
    ) -> Result<(), Error> {
        if mask.is_empty() {
            return Err(Error::EmptyMask(name.unwrap_or(label).to_owned()));
        }
        let name = name.map(str::to_owned);
        let label = label.to_owned();
        let reactor = self.channel().as_ref().and_then(|c| c.reactor().cloned());
        {
            let mut inner = self.0.inner.lock().expect("pipeline poisoned");
            if !inner.registered {
                let ctx = self.link_new(&mut inner, anchor, name, label, executor, handler, mask)?;
                inner.pending_added.push(ctx);
                return Ok(());
            }
        }
        match reactor {
            Some(reactor) if reactor.in_event_loop() => {
                let ctx = {
                    let mut inner = self.0.inner.lock().expect("pipeline poisoned");
                    self.link_new(&mut inner, anchor, name, label, executor, handler, mask)?
                };
                self.invoke_handler_added(ctx);
                Ok(())
            }
            Some(reactor) => {
                let this = self.clone();
                reactor.submit(move || {
                    let linked = {
                        let mut inner = this.0.inner.lock().expect("pipeline poisoned");
                        this.link_new(&mut inner, anchor, name, label, executor, handler, mask)
                    };
                    match linked {
                        Ok(ctx) => this.invoke_handler_added(ctx),
                        Err(_err) => {
                            #[cfg(feature = "log")]
                            log::warn!(target: "pipeline", "Dropping handler add: {_err}");
                        }
                    }
                });
                Ok(())
            }
            // A registered channel always has a reactor; this arm only guards
            // against the channel being torn down concurrently.
            None => Err(Error::ChannelClosed),
        }
    }

    fn link_new(
        &self,
        inner: &mut PipeInner,
        anchor: Anchor,
        name: Option<String>,
        label: String,
        executor: Option<Reactor>,
        handler: Box<dyn ChannelHandler>,
        mask: EventMask,
    ) -> Result<Arc<HandlerCtx>, Error> {
        let name = match name {
            Some(name) => {
                if self.find_ctx(&name).is_some() {
                    return Err(Error::DuplicateName(name));
                }
                name
            }
            None => loop {
                let candidate = format!("{label}#{}", inner.name_seq);
                inner.name_seq += 1;
                if self.find_ctx(&candidate).is_none() {
                    break candidate;
                }
            },
        };

        // Resolve the neighbor pair the new context goes between.
        let (before, after) = match anchor {
            Anchor::First => {
                let after = self.0.head.next_ctx().expect("head is always linked");
                (self.0.head.clone(), after)
            }
            Anchor::Last => {
                let before = self.0.tail.prev_ctx().expect("tail is always linked");
                (before, self.0.tail.clone())
            }
            Anchor::Before(anchor_name) => {
                let after = self
                    .find_user_ctx(&anchor_name)
                    .ok_or(Error::UnknownHandler(anchor_name))?;
                let before = after.prev_ctx().expect("non-head context has a predecessor");
                (before, after)
            }
            Anchor::After(anchor_name) => {
                let before = self
                    .find_user_ctx(&anchor_name)
                    .ok_or(Error::UnknownHandler(anchor_name))?;
                let after = before.next_ctx().expect("non-tail context has a successor");
                (before, after)
            }
        };

        let ctx = Arc::new(HandlerCtx {
            name,
            handler: Mutex::new(handler),
            mask,
            executor,
            prev: Mutex::new(Arc::downgrade(&before)),
            next: Mutex::new(Some(after.clone())),
            state: AtomicU8::new(CTX_INIT),
            sentinel: None,
        });
        *before.next.lock().expect("pipeline link poisoned") = Some(ctx.clone());
        *after.prev.lock().expect("pipeline link poisoned") = Arc::downgrade(&ctx);
        Ok(ctx)
    }

    /// Removes the handler registered under `name`.
    ///
    /// `handler_removed` fires on the context's executor once no in-flight
    /// dispatch can observe the context anymore.
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        if name == "head" || name == "tail" {
            return Err(Error::SentinelRemoval);
        }
        let reactor = self.channel().as_ref().and_then(|c| c.reactor().cloned());
        let registered = self.0.inner.lock().expect("pipeline poisoned").registered;
        match reactor {
            Some(reactor) if registered && !reactor.in_event_loop() => {
                let this = self.clone();
                let name = name.to_owned();
                reactor.submit(move || {
                    if let Err(_err) = this.remove_now(&name) {
                        #[cfg(feature = "log")]
                        log::warn!(target: "pipeline", "Dropping handler removal: {_err}");
                    }
                });
                Ok(())
            }
            _ => self.remove_now(name),
        }
    }

    fn remove_now(&self, name: &str) -> Result<(), Error> {
        let ctx = {
            let mut inner = self.0.inner.lock().expect("pipeline poisoned");
            let ctx = self
                .find_user_ctx(name)
                .ok_or_else(|| Error::UnknownHandler(name.to_owned()))?;
            let prev = ctx.prev_ctx().expect("non-sentinel context has a predecessor");
            let next = ctx.next_ctx().expect("non-sentinel context has a successor");
            *prev.next.lock().expect("pipeline link poisoned") = Some(next.clone());
            *next.prev.lock().expect("pipeline link poisoned") = Arc::downgrade(&prev);
            inner.pending_added.retain(|pending| !Arc::ptr_eq(pending, &ctx));
            ctx
        };
        let had_added = ctx.state.swap(CTX_REMOVED, Ordering::SeqCst) == CTX_ADDED;
        if had_added {
            self.invoke_handler_removed(ctx);
        }
        Ok(())
    }

    /// Replaces the handler registered under `old` with a new one in the same
    /// position.
    pub fn replace<H: ChannelHandler>(
        &self,
        old: &str,
        name: Option<&str>,
        handler: H,
    ) -> Result<(), Error> {
        if old == "head" || old == "tail" {
            return Err(Error::SentinelRemoval);
        }
        let mask = mask_of(TypeId::of::<H>(), || handler.handled_events());
        if mask.is_empty() {
            return Err(Error::EmptyMask(name.unwrap_or(old).to_owned()));
        }
        let new_name = name.unwrap_or(old).to_owned();
        let old = old.to_owned();
        let reactor = self.channel().as_ref().and_then(|c| c.reactor().cloned());
        let registered = self.0.inner.lock().expect("pipeline poisoned").registered;
        match reactor {
            Some(reactor) if registered && !reactor.in_event_loop() => {
                let this = self.clone();
                let handler: Box<dyn ChannelHandler> = Box::new(handler);
                reactor.submit(move || {
                    if let Err(_err) = this.replace_now(&old, new_name, handler, mask) {
                        #[cfg(feature = "log")]
                        log::warn!(target: "pipeline", "Dropping handler replacement: {_err}");
                    }
                });
                Ok(())
            }
            _ => self.replace_now(&old, new_name, Box::new(handler), mask),
        }
    }

    fn replace_now(
        &self,
        old: &str,
        new_name: String,
        handler: Box<dyn ChannelHandler>,
        mask: EventMask,
    ) -> Result<(), Error> {
        let (old_ctx, new_ctx, deferred) = {
            let mut inner = self.0.inner.lock().expect("pipeline poisoned");
            let old_ctx = self
                .find_user_ctx(old)
                .ok_or_else(|| Error::UnknownHandler(old.to_owned()))?;
            if new_name != old_ctx.name && self.find_ctx(&new_name).is_some() {
                return Err(Error::DuplicateName(new_name));
            }
            let prev = old_ctx.prev_ctx().expect("non-sentinel context has a predecessor");
            let next = old_ctx.next_ctx().expect("non-sentinel context has a successor");
            let new_ctx = Arc::new(HandlerCtx {
                name: new_name,
                handler: Mutex::new(handler),
                mask,
                executor: None,
                prev: Mutex::new(Arc::downgrade(&prev)),
                next: Mutex::new(Some(next.clone())),
                state: AtomicU8::new(CTX_INIT),
                sentinel: None,
            });
            *prev.next.lock().expect("pipeline link poisoned") = Some(new_ctx.clone());
            *next.prev.lock().expect("pipeline link poisoned") = Arc::downgrade(&new_ctx);
            let deferred = !inner.registered;
            if deferred {
                inner.pending_added.retain(|pending| !Arc::ptr_eq(pending, &old_ctx));
                inner.pending_added.push(new_ctx.clone());
            }
            (old_ctx, new_ctx, deferred)
        };
        let had_added = old_ctx.state.swap(CTX_REMOVED, Ordering::SeqCst) == CTX_ADDED;
        if !deferred {
            self.invoke_handler_added(new_ctx);
        }
        if had_added {
            self.invoke_handler_removed(old_ctx);
        }
        Ok(())
    }

    fn find_ctx(&self, name: &str) -> Option<Arc<HandlerCtx>> {
        if name == self.0.head.name {
            return Some(self.0.head.clone());
        }
        let mut cursor = self.0.head.next_ctx();
        while let Some(ctx) = cursor {
            if ctx.name == name {
                return Some(ctx);
            }
            cursor = ctx.next_ctx();
        }
        None
    }

    fn find_user_ctx(&self, name: &str) -> Option<Arc<HandlerCtx>> {
        self.find_ctx(name).filter(|ctx| ctx.sentinel.is_none())
    }

    // ------------------------------------------------------------------
    // Lifecycle callbacks

    /// Marks the pipeline registered and fires deferred `handler_added`
    /// callbacks in addition order. Called by the reactor during channel
    /// registration, before `channel_registered` is fired.
    pub(crate) fn invoke_pending_added(&self) {
        let pending = {
            let mut inner = self.0.inner.lock().expect("pipeline poisoned");
            inner.registered = true;
            std::mem::take(&mut inner.pending_added)
        };
        for ctx in pending {
            self.invoke_handler_added(ctx);
        }
    }

    fn invoke_handler_added(&self, ctx: Arc<HandlerCtx>) {
        let Some(channel) = self.channel() else {
            return;
        };
        let Some(exec) = ctx_executor(&channel, &ctx) else {
            return;
        };
        let run = {
            let channel = channel.clone();
            move || {
                if ctx.is_removed() {
                    return;
                }
                ctx.state.store(CTX_ADDED, Ordering::SeqCst);
                let context = Context {
                    ctx: ctx.clone(),
                    channel: channel.clone(),
                };
                let res = match ctx.handler.try_lock() {
                    Ok(mut handler) => handler.handler_added(&context),
                    Err(_) => return,
                };
                if let Err(err) = res {
                    #[cfg(feature = "log")]
                    log::warn!(target: "pipeline",
                        "handler_added of \"{}\" failed: {err}; removing the handler",
                        ctx.name);
                    #[cfg(not(feature = "log"))]
                    let _ = &err;
                    let _ = channel.pipeline().remove(&ctx.name);
                }
            }
        };
        if exec.in_event_loop() {
            run();
        } else {
            exec.submit(run);
        }
    }

    fn invoke_handler_removed(&self, ctx: Arc<HandlerCtx>) {
        let Some(channel) = self.channel() else {
            return;
        };
        let Some(exec) = ctx_executor(&channel, &ctx) else {
            return;
        };
        // Always a fresh task: by the time it runs, any dispatch in progress
        // on this executor has finished and can not observe the context.
        exec.submit(move || {
            let context = Context {
                ctx: ctx.clone(),
                channel: channel.clone(),
            };
            if let Ok(mut handler) = ctx.handler.try_lock() {
                if let Err(_err) = handler.handler_removed(&context) {
                    #[cfg(feature = "log")]
                    log::warn!(target: "pipeline",
                        "handler_removed of \"{}\" failed: {_err}", ctx.name);
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Inbound entry points

    pub fn fire_channel_registered(&self) { self.dispatch_from_head(Inbound::Registered) }

    pub fn fire_channel_unregistered(&self) { self.dispatch_from_head(Inbound::Unregistered) }

    pub fn fire_channel_active(&self) { self.dispatch_from_head(Inbound::Active) }

    pub fn fire_channel_inactive(&self) { self.dispatch_from_head(Inbound::Inactive) }

    pub fn fire_channel_read(&self, msg: Message) { self.dispatch_from_head(Inbound::Read(msg)) }

    pub fn fire_channel_read_complete(&self) { self.dispatch_from_head(Inbound::ReadComplete) }

    pub fn fire_user_event(&self, event: Box<dyn Any + Send>) {
        self.dispatch_from_head(Inbound::UserEvent(event))
    }

    pub fn fire_writability_changed(&self) { self.dispatch_from_head(Inbound::WritabilityChanged) }

    pub fn fire_exception_caught(&self, err: Error) {
        self.dispatch_from_head(Inbound::Exception(err))
    }

    fn dispatch_from_head(&self, event: Inbound) {
        let Some(channel) = self.channel() else {
            return;
        };
        // The head sentinel implements every inbound event and forwards it.
        invoke_inbound(&channel, self.0.head.clone(), event);
    }

    // ------------------------------------------------------------------
    // Outbound entry points

    pub fn bind(&self, addr: SocketAddr) -> Future<()> {
        let promise = self.new_promise();
        self.dispatch_outbound(Outbound::Bind(addr, promise.clone()));
        promise.future()
    }

    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Future<()> {
        let promise = self.new_promise();
        self.dispatch_outbound(Outbound::Connect(remote, local, promise.clone()));
        promise.future()
    }

    pub fn disconnect(&self) -> Future<()> {
        let promise = self.new_promise();
        self.dispatch_outbound(Outbound::Disconnect(promise.clone()));
        promise.future()
    }

    pub fn close(&self) -> Future<()> {
        let promise = self.new_promise();
        self.dispatch_outbound(Outbound::Close(promise.clone()));
        promise.future()
    }

    pub fn deregister(&self) -> Future<()> {
        let promise = self.new_promise();
        self.dispatch_outbound(Outbound::Deregister(promise.clone()));
        promise.future()
    }

    pub fn read(&self) { self.dispatch_outbound(Outbound::Read) }

    pub fn write(&self, msg: Message) -> Future<()> {
        let promise = self.new_promise();
        self.dispatch_outbound(Outbound::Write(msg, promise.clone()));
        promise.future()
    }

    pub fn flush(&self) { self.dispatch_outbound(Outbound::Flush) }

    pub fn write_and_flush(&self, msg: Message) -> Future<()> {
        let promise = self.new_promise();
        self.dispatch_outbound(Outbound::Write(msg, promise.clone()));
        self.dispatch_outbound(Outbound::Flush);
        promise.future()
    }

    fn new_promise(&self) -> Promise<()> {
        Promise::new(self.channel().as_ref().and_then(|c| c.reactor().cloned()))
    }

    fn dispatch_outbound(&self, op: Outbound) {
        let Some(channel) = self.channel() else {
            fail_op(op, Error::ChannelClosed);
            return;
        };
        let Some(reactor) = channel.reactor().cloned() else {
            fail_op(op, Error::NotRegistered);
            return;
        };
        let tail = self.0.tail.clone();
        if reactor.in_event_loop() {
            start_outbound(&channel, &tail, op);
        } else {
            reactor.submit(move || start_outbound(&channel, &tail, op));
        }
    }
}

fn short_type_name<H>() -> &'static str {
    let full = std::any::type_name::<H>();
    full.rsplit("::").next().unwrap_or(full)
}

fn fail_op(op: Outbound, err: Error) {
    if let Some(promise) = op.promise() {
        promise.try_failure(err);
    }
}

fn ctx_executor(channel: &Channel, ctx: &HandlerCtx) -> Option<Reactor> {
    ctx.executor.clone().or_else(|| channel.reactor().cloned())
}

fn next_inbound(from: &HandlerCtx, bit: EventMask) -> Option<Arc<HandlerCtx>> {
    let mut cursor = from.next_ctx();
    while let Some(ctx) = cursor {
        if !ctx.is_removed() && ctx.mask.contains(bit) {
            return Some(ctx);
        }
        cursor = ctx.next_ctx();
    }
    None
}

fn prev_outbound(from: &HandlerCtx, bit: EventMask) -> Option<Arc<HandlerCtx>> {
    let mut cursor = from.prev_ctx();
    while let Some(ctx) = cursor {
        if !ctx.is_removed() && ctx.mask.contains(bit) {
            return Some(ctx);
        }
        cursor = ctx.prev_ctx();
    }
    None
}

fn start_outbound(channel: &Channel, tail: &HandlerCtx, op: Outbound) {
    // The tail sentinel has no outbound bits, so the search starts right
    // before it.
    match prev_outbound(tail, op.bit()) {
        Some(ctx) => invoke_outbound(channel, ctx, op),
        None => fail_op(op, Error::ChannelClosed),
    }
}

pub(crate) fn invoke_inbound(channel: &Channel, ctx: Arc<HandlerCtx>, event: Inbound) {
    let Some(exec) = ctx_executor(channel, &ctx) else {
        #[cfg(feature = "log")]
        log::warn!(target: "pipeline",
            "Dropping {:?} event on unregistered {channel:?}", event.bit());
        return;
    };
    if exec.in_event_loop() {
        invoke_inbound_now(channel, ctx, event);
    } else {
        let channel = channel.clone();
        exec.submit(move || invoke_inbound_now(&channel, ctx, event));
    }
}

fn deliver_inbound(
    handler: &mut dyn ChannelHandler,
    context: &Context,
    event: Inbound,
) -> Result<(), Error> {
    match event {
        Inbound::Registered => handler.channel_registered(context),
        Inbound::Unregistered => handler.channel_unregistered(context),
        Inbound::Active => handler.channel_active(context),
        Inbound::Inactive => handler.channel_inactive(context),
        Inbound::Read(msg) => handler.channel_read(context, msg),
        Inbound::ReadComplete => handler.channel_read_complete(context),
        Inbound::UserEvent(event) => handler.user_event(context, event),
        Inbound::WritabilityChanged => handler.writability_changed(context),
        Inbound::Exception(err) => handler.exception_caught(context, err),
    }
}

/// Delivers to a user handler, or hands the event back when the handler cell
/// is held by a callback further up this very call stack.
fn try_deliver_user_inbound(
    ctx: &HandlerCtx,
    context: &Context,
    event: Inbound,
) -> Result<Result<(), Error>, Inbound> {
    match ctx.handler.try_lock() {
        Ok(mut handler) => Ok(deliver_inbound(handler.as_mut(), context, event)),
        Err(TryLockError::WouldBlock) => Err(event),
        Err(TryLockError::Poisoned(_)) => Ok(Ok(())),
    }
}

fn invoke_inbound_now(channel: &Channel, ctx: Arc<HandlerCtx>, event: Inbound) {
    let context = Context {
        ctx: ctx.clone(),
        channel: channel.clone(),
    };
    let res = match ctx.sentinel {
        // Sentinels are stateless and dispatched without the handler cell, so
        // the transport terminals stay reachable from inside user callbacks.
        Some(Sentinel::Head) => deliver_inbound(&mut HeadHandler, &context, event),
        Some(Sentinel::Tail) => deliver_inbound(&mut TailHandler, &context, event),
        None => match try_deliver_user_inbound(&ctx, &context, event) {
            Ok(res) => res,
            // Reentrant delivery: retry once the stack has unwound.
            Err(event) => {
                if let Some(exec) = ctx_executor(channel, &ctx) {
                    let channel = channel.clone();
                    exec.submit(move || invoke_inbound_now(&channel, ctx, event));
                }
                return;
            }
        },
    };
    if let Err(err) = res {
        // The throwing handler must not receive its own error.
        match next_inbound(&ctx, EventMask::EXCEPTION_CAUGHT) {
            Some(next) => invoke_inbound(channel, next, Inbound::Exception(err)),
            None => {
                #[cfg(feature = "log")]
                log::warn!(target: "pipeline",
                    "Unhandled failure at the end of {channel:?} pipeline: {err}");
            }
        }
    }
}

pub(crate) fn invoke_outbound(channel: &Channel, ctx: Arc<HandlerCtx>, op: Outbound) {
    let Some(exec) = ctx_executor(channel, &ctx) else {
        fail_op(op, Error::NotRegistered);
        return;
    };
    if exec.in_event_loop() {
        invoke_outbound_now(channel, ctx, op);
    } else {
        let channel = channel.clone();
        exec.submit(move || invoke_outbound_now(&channel, ctx, op));
    }
}

fn deliver_outbound(
    handler: &mut dyn ChannelHandler,
    context: &Context,
    op: Outbound,
) -> Result<(), Error> {
    match op {
        Outbound::Bind(addr, promise) => handler.bind(context, addr, promise),
        Outbound::Connect(remote, local, promise) => {
            handler.connect(context, remote, local, promise)
        }
        Outbound::Disconnect(promise) => handler.disconnect(context, promise),
        Outbound::Close(promise) => handler.close(context, promise),
        Outbound::Deregister(promise) => handler.deregister(context, promise),
        Outbound::Read => handler.read(context),
        Outbound::Write(msg, promise) => handler.write(context, msg, promise),
        Outbound::Flush => handler.flush(context),
    }
}

/// Outbound twin of [`try_deliver_user_inbound`].
fn try_deliver_user_outbound(
    ctx: &HandlerCtx,
    context: &Context,
    op: Outbound,
) -> Result<Result<(), Error>, Outbound> {
    match ctx.handler.try_lock() {
        Ok(mut handler) => Ok(deliver_outbound(handler.as_mut(), context, op)),
        Err(TryLockError::WouldBlock) => Err(op),
        Err(TryLockError::Poisoned(_)) => Ok(Err(Error::ChannelClosed)),
    }
}

fn invoke_outbound_now(channel: &Channel, ctx: Arc<HandlerCtx>, op: Outbound) {
    let context = Context {
        ctx: ctx.clone(),
        channel: channel.clone(),
    };
    let failsafe = op.promise();
    let res = match ctx.sentinel {
        Some(Sentinel::Head) => deliver_outbound(&mut HeadHandler, &context, op),
        Some(Sentinel::Tail) => deliver_outbound(&mut TailHandler, &context, op),
        None => match try_deliver_user_outbound(&ctx, &context, op) {
            Ok(res) => res,
            // Operation initiated from inside this very handler's callback;
            // retry once the stack has unwound.
            Err(op) => {
                if let Some(exec) = ctx_executor(channel, &ctx) {
                    let channel = channel.clone();
                    exec.submit(move || invoke_outbound_now(&channel, ctx, op));
                } else {
                    fail_op(op, Error::NotRegistered);
                }
                return;
            }
        },
    };
    if let Err(err) = res {
        // Outbound operations complete their promise exactly once; the
        // write-once semantics make this safe even if the handler already
        // passed the promise along.
        match failsafe {
            Some(promise) => {
                promise.try_failure(err);
            }
            None => {
                #[cfg(feature = "log")]
                log::warn!(target: "pipeline",
                    "Outbound operation failed in \"{}\": {err}", ctx.name);
            }
        }
    }
}

/// A handler's view of its position in the pipeline, passed into every
/// callback.
pub struct Context {
    ctx: Arc<HandlerCtx>,
    channel: Channel,
}

impl Context {
    pub fn channel(&self) -> &Channel { &self.channel }

    pub fn pipeline(&self) -> Pipeline { self.channel.pipeline().clone() }

    pub fn name(&self) -> &str { &self.ctx.name }

    /// The executor this context's callbacks run on.
    pub fn executor(&self) -> Option<Reactor> { ctx_executor(&self.channel, &self.ctx) }

    fn forward(&self, event: Inbound) {
        if let Some(next) = next_inbound(&self.ctx, event.bit()) {
            invoke_inbound(&self.channel, next, event);
        } else if let Inbound::Read(_msg) = event {
            #[cfg(feature = "log")]
            log::warn!(target: "pipeline",
                "Discarding unhandled inbound message {_msg:?} on {:?}", self.channel);
        }
    }

    fn forward_outbound(&self, op: Outbound) {
        match prev_outbound(&self.ctx, op.bit()) {
            Some(prev) => invoke_outbound(&self.channel, prev, op),
            None => fail_op(op, Error::ChannelClosed),
        }
    }

    pub fn fire_channel_registered(&self) { self.forward(Inbound::Registered) }

    pub fn fire_channel_unregistered(&self) { self.forward(Inbound::Unregistered) }

    pub fn fire_channel_active(&self) { self.forward(Inbound::Active) }

    pub fn fire_channel_inactive(&self) { self.forward(Inbound::Inactive) }

    pub fn fire_channel_read(&self, msg: Message) { self.forward(Inbound::Read(msg)) }

    pub fn fire_channel_read_complete(&self) { self.forward(Inbound::ReadComplete) }

    pub fn fire_user_event(&self, event: Box<dyn Any + Send>) {
        self.forward(Inbound::UserEvent(event))
    }

    pub fn fire_writability_changed(&self) { self.forward(Inbound::WritabilityChanged) }

    pub fn fire_exception_caught(&self, err: Error) { self.forward(Inbound::Exception(err)) }

    pub fn bind(&self, addr: SocketAddr, promise: Promise<()>) {
        self.forward_outbound(Outbound::Bind(addr, promise))
    }

    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: Promise<()>) {
        self.forward_outbound(Outbound::Connect(remote, local, promise))
    }

    pub fn disconnect(&self, promise: Promise<()>) {
        self.forward_outbound(Outbound::Disconnect(promise))
    }

    pub fn close(&self, promise: Promise<()>) { self.forward_outbound(Outbound::Close(promise)) }

    pub fn deregister(&self, promise: Promise<()>) {
        self.forward_outbound(Outbound::Deregister(promise))
    }

    pub fn read(&self) { self.forward_outbound(Outbound::Read) }

    pub fn write(&self, msg: Message, promise: Promise<()>) {
        self.forward_outbound(Outbound::Write(msg, promise))
    }

    pub fn flush(&self) { self.forward_outbound(Outbound::Flush) }
}

// ----------------------------------------------------------------------
// Sentinels

/// Head sentinel: terminates outbound operations by driving the transport and
/// forwards every inbound event, triggering auto-read where configured.
struct HeadHandler;

impl HeadHandler {
    fn read_if_auto_read(channel: &Channel) {
        if channel.config().auto_read() {
            channel.read();
        }
    }
}

impl ChannelHandler for HeadHandler {
    fn handled_events(&self) -> EventMask { EventMask::ALL }

    fn channel_active(&mut self, ctx: &Context) -> Result<(), Error> {
        ctx.fire_channel_active();
        Self::read_if_auto_read(ctx.channel());
        Ok(())
    }

    fn channel_read_complete(&mut self, ctx: &Context) -> Result<(), Error> {
        ctx.fire_channel_read_complete();
        Self::read_if_auto_read(ctx.channel());
        Ok(())
    }

    fn bind(&mut self, ctx: &Context, addr: SocketAddr, promise: Promise<()>) -> Result<(), Error> {
        let channel = ctx.channel().clone();
        let backlog = channel.config().backlog();
        let res = {
            let mut transport = channel.0.transport.lock().expect("transport poisoned");
            transport.bind(addr, backlog)
        };
        match res {
            Ok(()) => {
                if let Some(reactor) = channel.reactor() {
                    reactor.ctl(Ctl::Attach(channel.clone()));
                }
                promise.try_success(());
                if channel.is_registered() && !channel.is_active() {
                    channel.set_state(ChannelState::Active);
                    channel.pipeline().fire_channel_active();
                }
            }
            Err(err) => {
                promise.try_failure(err.into());
            }
        }
        Ok(())
    }

    fn connect(
        &mut self,
        ctx: &Context,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: Promise<()>,
    ) -> Result<(), Error> {
        let channel = ctx.channel().clone();
        let timeout = channel.config().connect_timeout();
        let res = {
            let mut transport = channel.0.transport.lock().expect("transport poisoned");
            transport.connect(remote, local, timeout)
        };
        match res {
            Ok(()) => {
                if let Some(reactor) = channel.reactor() {
                    reactor.ctl(Ctl::Attach(channel.clone()));
                }
                promise.try_success(());
                if channel.is_registered() && !channel.is_active() {
                    channel.set_state(ChannelState::Active);
                    channel.pipeline().fire_channel_active();
                }
            }
            Err(err) => {
                promise.try_failure(err.into());
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, ctx: &Context, promise: Promise<()>) -> Result<(), Error> {
        // TCP has no half-way teardown here; disconnect and close coincide.
        head_close(ctx.channel(), promise);
        Ok(())
    }

    fn close(&mut self, ctx: &Context, promise: Promise<()>) -> Result<(), Error> {
        head_close(ctx.channel(), promise);
        Ok(())
    }

    fn deregister(&mut self, ctx: &Context, promise: Promise<()>) -> Result<(), Error> {
        let channel = ctx.channel().clone();
        match channel.reactor() {
            Some(reactor) => reactor.ctl(Ctl::Deregister(channel.clone(), promise)),
            None => {
                promise.try_failure(Error::NotRegistered);
            }
        }
        Ok(())
    }

    fn read(&mut self, ctx: &Context) -> Result<(), Error> {
        let channel = ctx.channel();
        channel.0.read_interest.store(true, Ordering::SeqCst);
        if let Some(reactor) = channel.reactor() {
            reactor.ctl(Ctl::SyncInterest(channel.clone()));
        }
        Ok(())
    }

    fn write(&mut self, ctx: &Context, msg: Message, promise: Promise<()>) -> Result<(), Error> {
        let channel = ctx.channel();
        match msg {
            Message::Buffer(bytes) => {
                channel
                    .0
                    .transport
                    .lock()
                    .expect("transport poisoned")
                    .buffer_write(bytes, promise);
                channel.update_writability();
            }
            _ => {
                promise.try_failure(Error::UnsupportedMessage);
            }
        }
        Ok(())
    }

    fn flush(&mut self, ctx: &Context) -> Result<(), Error> {
        let channel = ctx.channel().clone();
        let outcome = channel.0.transport.lock().expect("transport poisoned").flush();
        match outcome {
            FlushOutcome::Idle | FlushOutcome::Pending => {
                if let Some(reactor) = channel.reactor() {
                    reactor.ctl(Ctl::SyncInterest(channel.clone()));
                }
                channel.update_writability();
            }
            FlushOutcome::Failed(err) => {
                channel.pipeline().fire_exception_caught(err);
                channel.close();
            }
        }
        Ok(())
    }
}

/// Closes the transport, fails writes which can never complete and fires the
/// teardown event sequence.
fn head_close(channel: &Channel, promise: Promise<()>) {
    if channel.state() == ChannelState::Closed {
        promise.try_success(());
        return;
    }
    let was_active = channel.is_active();
    let was_registered = channel.is_registered();
    let orphans = channel.0.transport.lock().expect("transport poisoned").close();
    channel.set_state(ChannelState::Closed);
    for orphan in orphans {
        orphan.try_failure(Error::ChannelClosed);
    }
    promise.try_success(());
    if was_active {
        channel.pipeline().fire_channel_inactive();
    }
    if was_registered {
        if let Some(reactor) = channel.reactor() {
            let channel = channel.clone();
            // Deferred so the inactive dispatch settles before unregistration.
            reactor.submit(move || {
                channel.pipeline().fire_channel_unregistered();
                if let Some(reactor) = channel.reactor() {
                    reactor.ctl(Ctl::Detach(channel.clone()));
                }
            });
        }
    }
}

/// Tail sentinel: terminates inbound events, logging and releasing whatever
/// the user pipeline did not handle.
struct TailHandler;

impl ChannelHandler for TailHandler {
    fn handled_events(&self) -> EventMask { EventMask::ALL_INBOUND }

    fn channel_read(&mut self, _ctx: &Context, msg: Message) -> Result<(), Error> {
        #[cfg(feature = "log")]
        log::warn!(target: "pipeline",
            "Discarded inbound message {msg:?} that reached the tail of the pipeline");
        drop(msg);
        Ok(())
    }

    fn user_event(&mut self, _ctx: &Context, event: Box<dyn Any + Send>) -> Result<(), Error> {
        #[cfg(feature = "log")]
        log::debug!(target: "pipeline", "Released unhandled user event");
        drop(event);
        Ok(())
    }

    fn exception_caught(&mut self, _ctx: &Context, err: Error) -> Result<(), Error> {
        #[cfg(feature = "log")]
        log::warn!(target: "pipeline",
            "An exception_caught event reached the tail of the pipeline unhandled: {err}");
        #[cfg(not(feature = "log"))]
        let _ = err;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Noop;
    impl ChannelHandler for Noop {
        fn handled_events(&self) -> EventMask { EventMask::CHANNEL_READ }
    }

    struct OtherNoop;
    impl ChannelHandler for OtherNoop {
        fn handled_events(&self) -> EventMask { EventMask::CHANNEL_ACTIVE }
    }

    struct Mute;
    impl ChannelHandler for Mute {
        fn handled_events(&self) -> EventMask { EventMask::NONE }
    }

    #[test]
    fn sentinels_are_always_present() {
        let channel = Channel::server();
        assert_eq!(channel.pipeline().names(), vec!["head", "tail"]);
        assert!(channel.pipeline().is_empty());
    }

    #[test]
    fn ordering_of_structural_ops() {
        let channel = Channel::server();
        let pipeline = channel.pipeline();

        pipeline.add_last(Some("b"), Noop).unwrap();
        pipeline.add_first(Some("a"), Noop).unwrap();
        pipeline.add_after("b", Some("d"), Noop).unwrap();
        pipeline.add_before("d", Some("c"), Noop).unwrap();
        assert_eq!(pipeline.names(), vec!["head", "a", "b", "c", "d", "tail"]);
        assert_eq!(pipeline.len(), 4);

        pipeline.remove("b").unwrap();
        assert_eq!(pipeline.names(), vec!["head", "a", "c", "d", "tail"]);

        pipeline.replace("c", Some("c2"), OtherNoop).unwrap();
        assert_eq!(pipeline.names(), vec!["head", "a", "c2", "d", "tail"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let channel = Channel::server();
        let pipeline = channel.pipeline();
        pipeline.add_last(Some("x"), Noop).unwrap();
        assert!(matches!(
            pipeline.add_last(Some("x"), Noop),
            Err(Error::DuplicateName(name)) if name == "x"
        ));
        assert!(matches!(
            pipeline.add_last(Some("head"), Noop),
            Err(Error::DuplicateName(_))
        ));
    }

    #[test]
    fn sentinel_removal_is_rejected() {
        let channel = Channel::server();
        assert!(matches!(channel.pipeline().remove("head"), Err(Error::SentinelRemoval)));
        assert!(matches!(channel.pipeline().remove("tail"), Err(Error::SentinelRemoval)));
    }

    #[test]
    fn empty_mask_is_rejected() {
        let channel = Channel::server();
        assert!(matches!(
            channel.pipeline().add_last(Some("mute"), Mute),
            Err(Error::EmptyMask(name)) if name == "mute"
        ));
    }

    #[test]
    fn generated_names_never_clash() {
        let channel = Channel::server();
        let pipeline = channel.pipeline();
        pipeline.add_last(None, Noop).unwrap();
        pipeline.add_last(None, Noop).unwrap();
        pipeline.add_last(None, Noop).unwrap();
        assert_eq!(pipeline.len(), 3);
    }

    #[test]
    fn unknown_anchors_are_reported() {
        let channel = Channel::server();
        assert!(matches!(
            channel.pipeline().add_before("ghost", None, Noop),
            Err(Error::UnknownHandler(name)) if name == "ghost"
        ));
        assert!(matches!(
            channel.pipeline().remove("ghost"),
            Err(Error::UnknownHandler(_))
        ));
    }
}
