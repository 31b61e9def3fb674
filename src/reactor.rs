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

//! Single-threaded reactors multiplexing selector readiness with task queues
//! and timers.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use crate::channel::{Channel, ChannelId, ChannelState, Message};
use crate::future::{Future, Promise};
use crate::poller::{IoType, Poll, Token};
use crate::timer::{ScheduledEntry, ScheduledQueue};
use crate::transport::{FlushOutcome, ReadOutcome};
use crate::Error;

/// Maximum amount of time to wait for I/O when nothing else bounds the wait.
const WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Upper bound on accepts or reads consumed per readiness event, so a single
/// busy channel can not monopolize the loop.
const MAX_READS_PER_EVENT: usize = 16;

/// Premature selector returns within [`SPIN_WINDOW`] which trigger a selector
/// rebuild.
const DEFAULT_SPIN_THRESHOLD: u32 = 512;
const SPIN_WINDOW: Duration = Duration::from_secs(1);

/// Share of loop wall-time granted to I/O versus tasks (percent spent on I/O).
const DEFAULT_IO_RATIO: u32 = 50;

/// Consecutive selector failures after which the reactor gives up.
const MAX_POLL_FAILURES: u32 = 16;

const PHASE_RUNNING: u8 = 0;
const PHASE_SHUTTING_DOWN: u8 = 1;
const PHASE_SHUTDOWN: u8 = 2;
const PHASE_TERMINATED: u8 = 3;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Decision taken by a [`SelectStrategy`] before each selector wait.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SelectVerdict {
    /// Poll without blocking, then continue with I/O and tasks.
    PollNow,
    /// Block on the selector until I/O or the next scheduled deadline.
    Wait,
    /// Skip selection on this iteration and run queued tasks first.
    TasksFirst,
}

/// Chooses how the next loop iteration interleaves selection with task
/// processing, given the current task-queue state.
pub trait SelectStrategy: Send {
    fn verdict(&mut self, has_tasks: bool) -> SelectVerdict;
}

/// Polls without blocking whenever tasks are queued so neither side starves.
pub struct DefaultSelectStrategy;

impl SelectStrategy for DefaultSelectStrategy {
    fn verdict(&mut self, has_tasks: bool) -> SelectVerdict {
        if has_tasks {
            SelectVerdict::PollNow
        } else {
            SelectVerdict::Wait
        }
    }
}

/// Cross-thread input for a reactor, applied on the loop thread between
/// selector waits.
pub(crate) enum Ctl {
    Register(Channel, Promise<()>),
    Deregister(Channel, Promise<()>),
    /// A channel got its OS descriptor (e.g. after `bind`); put it under the
    /// selector.
    Attach(Channel),
    /// Recompute a channel's selector interest from its current read request
    /// and pending writes.
    SyncInterest(Channel),
    /// Remove a closed channel from the selector and the loop.
    Detach(Channel),
    Schedule(ScheduledEntry),
    Shutdown { quiet: Duration, timeout: Duration },
}

fn fail_ctl(ctl: Ctl) {
    match ctl {
        Ctl::Register(_, promise) | Ctl::Deregister(_, promise) => {
            promise.try_failure(Error::ReactorShutdown);
        }
        Ctl::Schedule(entry) => {
            entry.promise.try_failure(Error::ReactorShutdown);
        }
        _ => {}
    }
}

struct LoopSeed {
    poller: Box<dyn Poll>,
    tasks: chan::Receiver<Task>,
    ctls: chan::Receiver<Ctl>,
    waker: UnixStream,
    strategy: Box<dyn SelectStrategy>,
    io_ratio: u32,
    spin_threshold: u32,
}

struct ReactorInner {
    name: String,
    task_send: chan::Sender<Task>,
    ctl_send: chan::Sender<Ctl>,
    waker: Mutex<UnixStream>,
    worker: OnceLock<ThreadId>,
    seed: Mutex<Option<LoopSeed>>,
    started: AtomicBool,
    phase: AtomicU8,
    seq: AtomicU64,
    terminated: Promise<()>,
}

/// Handle to a single-threaded event loop owning a selector, a task queue and
/// a timer heap.
///
/// The handle is cheap to clone and safe to use from any thread; all work it
/// accepts executes on the reactor's worker thread, which is spawned lazily on
/// the first submission.
#[derive(Clone)]
pub struct Reactor(Arc<ReactorInner>);

impl Debug for Reactor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { write!(f, "Reactor({})", self.0.name) }
}

impl Reactor {
    /// Creates a reactor with the default poll(2)-based selector.
    #[cfg(feature = "popol")]
    pub fn new() -> io::Result<Reactor> {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        Reactor::with_poller(
            format!("reactor-{}", SEQ.fetch_add(1, Ordering::Relaxed)),
            crate::poller::popol::Poller::new(),
        )
    }

    pub fn with_poller(name: String, poller: impl Poll + 'static) -> io::Result<Reactor> {
        Reactor::with_tuning(
            name,
            poller,
            Box::new(DefaultSelectStrategy),
            DEFAULT_IO_RATIO,
            DEFAULT_SPIN_THRESHOLD,
        )
    }

    pub fn with_tuning(
        name: String,
        poller: impl Poll + 'static,
        strategy: Box<dyn SelectStrategy>,
        io_ratio: u32,
        spin_threshold: u32,
    ) -> io::Result<Reactor> {
        let (task_send, task_recv) = chan::unbounded();
        let (ctl_send, ctl_recv) = chan::unbounded();
        let (waker_writer, waker_reader) = UnixStream::pair()?;
        waker_reader.set_nonblocking(true)?;
        waker_writer.set_nonblocking(true)?;

        Ok(Reactor(Arc::new(ReactorInner {
            name,
            task_send,
            ctl_send,
            waker: Mutex::new(waker_writer),
            worker: OnceLock::new(),
            seed: Mutex::new(Some(LoopSeed {
                poller: Box::new(poller),
                tasks: task_recv,
                ctls: ctl_recv,
                waker: waker_reader,
                strategy,
                io_ratio: io_ratio.clamp(1, 100),
                spin_threshold,
            })),
            started: AtomicBool::new(false),
            phase: AtomicU8::new(PHASE_RUNNING),
            seq: AtomicU64::new(0),
            terminated: Promise::new(None),
        })))
    }

    pub fn name(&self) -> &str { &self.0.name }

    /// Whether the calling thread is this reactor's worker thread.
    pub fn in_event_loop(&self) -> bool {
        self.0.worker.get() == Some(&thread::current().id())
    }

    /// Enqueues a task for execution on the reactor thread. Safe from any
    /// thread, including the reactor's own.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_shutdown() {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor", "{} rejected a task: reactor is shut down", self.0.name);
            return;
        }
        self.ensure_started();
        if self.0.task_send.send(Box::new(task)).is_err() {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor", "{} task queue is disconnected", self.0.name);
            return;
        }
        let _ = self.wake();
    }

    /// Schedules a task to run on the reactor thread after `delay`. The
    /// returned future is cancellable; cancelled tasks are discarded when
    /// their deadline pops.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Future<()> {
        let promise = Promise::cancellable(Some(self.clone()));
        let entry = ScheduledEntry {
            deadline: Instant::now() + delay,
            seq: self.0.seq.fetch_add(1, Ordering::Relaxed),
            task: Box::new(task),
            promise: promise.clone(),
        };
        self.ctl(Ctl::Schedule(entry));
        promise.future()
    }

    /// Registers a channel with this reactor, permanently binding it here on
    /// success. The returned future completes on this reactor.
    pub fn register(&self, channel: &Channel) -> Future<()> {
        let promise = Promise::new(Some(self.clone()));
        self.ctl(Ctl::Register(channel.clone(), promise.clone()));
        promise.future()
    }

    pub(crate) fn ctl(&self, ctl: Ctl) {
        self.ensure_started();
        if let Err(chan::SendError(ctl)) = self.0.ctl_send.send(ctl) {
            fail_ctl(ctl);
            return;
        }
        let _ = self.wake();
    }

    fn ensure_started(&self) {
        if self.0.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let seed = self
            .0
            .seed
            .lock()
            .expect("reactor seed poisoned")
            .take()
            .expect("reactor seed is consumed exactly once");
        let inner = self.0.clone();
        thread::Builder::new()
            .name(self.0.name.clone())
            .spawn(move || {
                let _ = inner.worker.set(thread::current().id());
                #[cfg(feature = "log")]
                log::info!(target: "reactor", "{} entering the event loop", inner.name);
                Loop::new(Reactor(inner), seed).run();
            })
            .expect("unable to spawn a reactor thread");
    }

    /// Requests a graceful shutdown: tasks are still accepted, and once no
    /// new work is observed for `quiet` (or `timeout` elapses) the loop
    /// stops, closes its channels and completes the termination future.
    pub fn shutdown_gracefully(&self, quiet: Duration, timeout: Duration) -> Future<()> {
        let prev = self.0.phase.fetch_max(PHASE_SHUTTING_DOWN, Ordering::SeqCst);
        if prev == PHASE_RUNNING {
            if !self.0.started.load(Ordering::SeqCst)
                && !self.0.started.swap(true, Ordering::SeqCst)
            {
                // The worker never ran; there is nothing to quiesce.
                self.0.phase.store(PHASE_TERMINATED, Ordering::SeqCst);
                self.0.terminated.try_success(());
                return self.terminated_future();
            }
            if self.0.ctl_send.send(Ctl::Shutdown { quiet, timeout }).is_ok() {
                let _ = self.wake();
            }
        }
        self.terminated_future()
    }

    /// Future completing once the loop has exited and every owned resource is
    /// closed.
    pub fn terminated_future(&self) -> Future<()> { self.0.terminated.future() }

    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.terminated_future().wait_timeout(timeout)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.phase.load(Ordering::SeqCst) >= PHASE_SHUTTING_DOWN
    }

    pub fn is_shutdown(&self) -> bool { self.0.phase.load(Ordering::SeqCst) >= PHASE_SHUTDOWN }

    pub fn is_terminated(&self) -> bool {
        self.0.phase.load(Ordering::SeqCst) >= PHASE_TERMINATED
    }

    fn wake(&self) -> io::Result<()> {
        use io::ErrorKind::*;

        let mut waker = self.0.waker.lock().map_err(|_| io::Error::from(WouldBlock))?;
        loop {
            match waker.write_all(&[0x1]) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == WouldBlock => {
                    // The loop is far behind on draining the waker pipe; the
                    // pending bytes already guarantee a wakeup.
                    reset_fd(&waker.as_raw_fd())?;
                    return Ok(());
                }
                Err(e) if e.kind() == Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Drains a non-blocking fd with a raw read, avoiding the drop semantics a
/// borrowed `UnixStream` would carry.
fn reset_fd(fd: &impl AsRawFd) -> io::Result<()> {
    let mut buf = [0u8; 4096];

    loop {
        match unsafe {
            libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        } {
            -1 => match io::Error::last_os_error() {
                e if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                e => return Err(e),
            },
            0 => return Ok(()),
            _ => continue,
        }
    }
}

struct ShutdownState {
    quiet: Duration,
    deadline: Instant,
    last_activity: Instant,
}

struct Loop {
    handle: Reactor,
    poller: Box<dyn Poll>,
    tasks: chan::Receiver<Task>,
    ctls: chan::Receiver<Ctl>,
    waker: UnixStream,
    timers: ScheduledQueue,
    channels: HashMap<ChannelId, Channel>,
    strategy: Box<dyn SelectStrategy>,
    io_ratio: u32,
    spin_threshold: u32,
    spins: u32,
    spin_window: Instant,
    poll_failures: u32,
    shutdown: Option<ShutdownState>,
}

impl Loop {
    fn new(handle: Reactor, seed: LoopSeed) -> Self {
        Loop {
            handle,
            poller: seed.poller,
            tasks: seed.tasks,
            ctls: seed.ctls,
            waker: seed.waker,
            timers: ScheduledQueue::new(),
            channels: empty!(),
            strategy: seed.strategy,
            io_ratio: seed.io_ratio,
            spin_threshold: seed.spin_threshold,
            spins: 0,
            spin_window: Instant::now(),
            poll_failures: 0,
            shutdown: None,
        }
    }

    fn run(mut self) {
        self.poller.register(self.waker.as_raw_fd(), Token::WAKER, IoType::read_only());

        loop {
            self.process_ctl();

            let now = Instant::now();
            let mut wait = self.timers.next_deadline(now).unwrap_or(WAIT_TIMEOUT);
            if let Some(shutdown) = &self.shutdown {
                let quiet_deadline = shutdown.last_activity + shutdown.quiet;
                let cap = quiet_deadline.min(shutdown.deadline).saturating_duration_since(now);
                wait = wait.min(cap);
            }

            let timeout = match self.strategy.verdict(!self.tasks.is_empty()) {
                SelectVerdict::TasksFirst => {
                    self.run_tasks(None);
                    if self.check_shutdown(true) {
                        return self.terminate(None);
                    }
                    continue;
                }
                SelectVerdict::PollNow => Duration::ZERO,
                SelectVerdict::Wait => wait,
            };

            // Blocking
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "{} polling with timeout {timeout:?}", self.handle.0.name);
            let poll_start = Instant::now();
            let polled = match self.poller.poll(Some(timeout)) {
                Ok(count) => {
                    self.poll_failures = 0;
                    count
                }
                Err(_err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor",
                        "{} selector failure: {_err}; rebuilding", self.handle.0.name);
                    self.poll_failures += 1;
                    if self.poll_failures > MAX_POLL_FAILURES || self.rebuild().is_err() {
                        return self.terminate(Some(Error::from(_err)));
                    }
                    continue;
                }
            };
            let poll_elapsed = poll_start.elapsed();

            let io_start = Instant::now();
            let awoken = self.process_events();
            let timers_fired = self.run_due_timers(Instant::now());
            let io_time = io_start.elapsed();

            // Tasks get wall-time proportional to what I/O just used, with a
            // minimum batch so they can not starve when I/O is instant.
            let budget = if self.io_ratio >= 100 {
                None
            } else {
                Some(io_time * (100 - self.io_ratio) / self.io_ratio)
            };
            let ran = self.run_tasks(budget);

            self.detect_spin(timeout, poll_elapsed, polled, awoken, timers_fired);

            if self.check_shutdown(ran > 0 || timers_fired > 0) {
                return self.terminate(None);
            }
        }
    }

    /// Returns `true` when the loop must exit.
    fn check_shutdown(&mut self, had_activity: bool) -> bool {
        let Some(shutdown) = &mut self.shutdown else {
            return false;
        };
        let now = Instant::now();
        if had_activity {
            shutdown.last_activity = now;
        }
        now >= shutdown.deadline
            || (self.tasks.is_empty() && now >= shutdown.last_activity + shutdown.quiet)
    }

    /// Detects the selector returning prematurely with no events in a tight
    /// loop (the classic epoll 100%-CPU defect) and rebuilds it when the spin
    /// count passes the threshold within a one second window.
    fn detect_spin(
        &mut self,
        timeout: Duration,
        poll_elapsed: Duration,
        polled: usize,
        awoken: bool,
        timers_fired: usize,
    ) {
        let premature = polled == 0
            && !awoken
            && timers_fired == 0
            && !timeout.is_zero()
            && poll_elapsed < timeout;
        if !premature {
            self.spins = 0;
            return;
        }
        if self.spins == 0 {
            self.spin_window = Instant::now();
        }
        self.spins += 1;
        if self.spin_window.elapsed() > SPIN_WINDOW {
            self.spins = 1;
            self.spin_window = Instant::now();
        } else if self.spins >= self.spin_threshold {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor",
                "{} selector returned prematurely {} times within {SPIN_WINDOW:?}; rebuilding",
                self.handle.0.name, self.spins);
            let _ = self.rebuild();
            self.spins = 0;
        }
    }

    fn rebuild(&mut self) -> io::Result<()> {
        self.poller.rebuild().map_err(|err| {
            #[cfg(feature = "log")]
            log::error!(target: "reactor",
                "{} failed to rebuild the selector: {err}", self.handle.0.name);
            err
        })
    }

    fn process_ctl(&mut self) {
        while let Ok(ctl) = self.ctls.try_recv() {
            match ctl {
                Ctl::Register(channel, promise) => self.do_register(channel, promise),
                Ctl::Deregister(channel, promise) => self.do_deregister(channel, promise),
                Ctl::Attach(channel) => self.do_attach(&channel),
                Ctl::SyncInterest(channel) => self.sync_interest(&channel),
                Ctl::Detach(channel) => self.do_detach(&channel),
                Ctl::Schedule(entry) => self.timers.push(entry),
                Ctl::Shutdown { quiet, timeout } => {
                    let now = Instant::now();
                    self.shutdown.get_or_insert(ShutdownState {
                        quiet,
                        deadline: now + timeout,
                        last_activity: now,
                    });
                }
            }
        }
    }

    fn do_register(&mut self, channel: Channel, promise: Promise<()>) {
        if self.handle.is_shutting_down() {
            promise.try_failure(Error::ReactorShutdown);
            return;
        }
        if channel.0.reactor.set(self.handle.clone()).is_err()
            || channel.state() != ChannelState::Unregistered
        {
            promise.try_failure(Error::AlreadyRegistered);
            return;
        }
        #[cfg(feature = "log")]
        log::debug!(target: "reactor",
            "Registering {channel:?} with {}", self.handle.0.name);

        channel.set_state(ChannelState::Registered);
        self.channels.insert(channel.id(), channel.clone());
        self.do_attach(&channel);
        promise.try_success(());

        let pipeline = channel.pipeline().clone();
        pipeline.invoke_pending_added();
        pipeline.fire_channel_registered();

        let connected =
            channel.0.transport.lock().expect("transport poisoned").is_connected();
        if connected && !channel.is_active() {
            channel.set_state(ChannelState::Active);
            pipeline.fire_channel_active();
        }
    }

    fn do_deregister(&mut self, channel: Channel, promise: Promise<()>) {
        if self.channels.remove(&channel.id()).is_none() {
            promise.try_failure(Error::NotRegistered);
            return;
        }
        self.poller.unregister(Token(channel.id().0));
        promise.try_success(());
        channel.pipeline().fire_channel_unregistered();
    }

    fn do_attach(&mut self, channel: &Channel) {
        let fd = channel.0.transport.lock().expect("transport poisoned").raw_fd();
        let Some(fd) = fd else {
            return;
        };
        let token = Token(channel.id().0);
        let interest = self.desired_interest(channel);
        if !self.poller.set_interest(token, interest) {
            self.poller.register(fd, token, interest);
        }
    }

    fn do_detach(&mut self, channel: &Channel) {
        self.poller.unregister(Token(channel.id().0));
        self.channels.remove(&channel.id());
    }

    fn desired_interest(&self, channel: &Channel) -> IoType {
        IoType {
            read: channel.0.read_interest.load(Ordering::SeqCst),
            write: channel.0.transport.lock().expect("transport poisoned").pending_bytes() > 0,
        }
    }

    fn sync_interest(&mut self, channel: &Channel) {
        if channel.state() == ChannelState::Closed || !self.channels.contains_key(&channel.id()) {
            return;
        }
        let interest = self.desired_interest(channel);
        self.poller.set_interest(Token(channel.id().0), interest);
    }

    /// Translates readiness into pipeline events.
    ///
    /// # Returns
    ///
    /// Whether the loop was awoken by the waker.
    fn process_events(&mut self) -> bool {
        let mut awoken = false;
        let mut ready = Vec::new();
        while let Some(event) = self.poller.next() {
            ready.push(event);
        }
        for (token, res) in ready {
            if token == Token::WAKER {
                res.unwrap_or_else(|err| panic!("waker failure: {err}"));
                reset_fd(&self.waker).expect("waker failure");
                awoken = true;
                continue;
            }
            let Some(channel) = self.channels.get(&ChannelId(token.0)).cloned() else {
                // Stale event for a channel detached in this same batch.
                continue;
            };
            match res {
                Ok(io) => {
                    #[cfg(feature = "log")]
                    log::trace!(target: "reactor", "Got `{io}` event for {channel:?}");
                    if io.read {
                        self.handle_readable(&channel);
                    }
                    if io.write {
                        self.handle_writable(&channel);
                    }
                }
                Err(fail) => {
                    channel.pipeline().fire_exception_caught(Error::other(fail));
                    channel.close();
                }
            }
        }
        awoken
    }

    fn handle_readable(&mut self, channel: &Channel) {
        if channel.state() == ChannelState::Closed {
            return;
        }
        let chunk = channel.config().receive_buffer_size();
        let outcome = channel
            .0
            .transport
            .lock()
            .expect("transport poisoned")
            .handle_readable(chunk, MAX_READS_PER_EVENT);

        // The read request is consumed by this burst; auto-read re-arms it
        // from the head's `channel_read_complete`.
        channel.0.read_interest.store(false, Ordering::SeqCst);

        let pipeline = channel.pipeline().clone();
        match outcome {
            Ok(ReadOutcome::Accepted(streams)) => {
                let produced = !streams.is_empty();
                for stream in streams {
                    match Channel::from_stream(stream) {
                        Ok(child) => pipeline.fire_channel_read(Message::Channel(child)),
                        Err(err) => pipeline.fire_exception_caught(err.into()),
                    }
                }
                if produced {
                    pipeline.fire_channel_read_complete();
                }
            }
            Ok(ReadOutcome::Data { chunks, eof }) => {
                let produced = !chunks.is_empty();
                for bytes in chunks {
                    pipeline.fire_channel_read(Message::Buffer(bytes));
                }
                if produced {
                    pipeline.fire_channel_read_complete();
                }
                if eof {
                    channel.close();
                }
            }
            Err(err) => {
                let listener =
                    channel.0.transport.lock().expect("transport poisoned").is_listener();
                pipeline.fire_exception_caught(err.into());
                if !listener {
                    channel.close();
                }
            }
        }
        self.sync_interest(channel);
    }

    fn handle_writable(&mut self, channel: &Channel) {
        if channel.state() == ChannelState::Closed {
            return;
        }
        let outcome = channel.0.transport.lock().expect("transport poisoned").flush();
        match outcome {
            FlushOutcome::Idle | FlushOutcome::Pending => {
                channel.update_writability();
                self.sync_interest(channel);
            }
            FlushOutcome::Failed(err) => {
                channel.pipeline().fire_exception_caught(err);
                channel.close();
            }
        }
    }

    fn run_due_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(entry) = self.timers.pop_due(now) {
            fired += 1;
            let task = entry.task;
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(()) => {
                    entry.promise.try_success(());
                }
                Err(_) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor",
                        "{} scheduled task panicked", self.handle.0.name);
                    entry.promise.try_failure(Error::other("scheduled task panicked"));
                }
            }
        }
        fired
    }

    /// Runs queued tasks, at least one batch and then until the wall-time
    /// budget is exhausted (`None` drains the queue).
    fn run_tasks(&mut self, budget: Option<Duration>) -> usize {
        let start = Instant::now();
        let mut ran = 0;
        loop {
            for _ in 0..64 {
                match self.tasks.try_recv() {
                    Ok(task) => {
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            #[cfg(feature = "log")]
                            log::error!(target: "reactor",
                                "{} task panicked; the loop continues", self.handle.0.name);
                        }
                        ran += 1;
                    }
                    Err(_) => return ran,
                }
            }
            if let Some(budget) = budget {
                if start.elapsed() >= budget {
                    return ran;
                }
            }
        }
    }

    fn terminate(mut self, failure: Option<Error>) {
        #[cfg(feature = "log")]
        log::info!(target: "reactor", "{} shutting down", self.handle.0.name);

        // Close every channel still owned by the loop and let the teardown
        // dispatches settle; tasks are still accepted while they do.
        for channel in self.channels.values().cloned().collect::<Vec<_>>() {
            channel.close();
        }
        for _ in 0..4 {
            self.run_tasks(None);
            self.process_ctl();
        }
        self.handle.0.phase.store(PHASE_SHUTDOWN, Ordering::SeqCst);
        // Tasks accepted while the phase was still shutting-down but never
        // reached by the drain rounds above are dropped, not lost silently.
        let mut dropped = 0usize;
        while self.tasks.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor",
                "{} dropped {dropped} tasks submitted during shutdown", self.handle.0.name);
        }
        while let Ok(ctl) = self.ctls.try_recv() {
            fail_ctl(ctl);
        }
        for entry in self.timers.drain() {
            entry.promise.try_failure(Error::ReactorShutdown);
        }

        self.handle.0.phase.store(PHASE_TERMINATED, Ordering::SeqCst);
        match failure {
            None => self.handle.0.terminated.try_success(()),
            Some(err) => self.handle.0.terminated.try_failure(err),
        };
        #[cfg(feature = "log")]
        log::info!(target: "reactor", "{} terminated", self.handle.0.name);
    }
}

#[cfg(all(test, feature = "popol"))]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn tasks_run_on_the_worker_thread() {
        let reactor = Reactor::new().unwrap();
        let probe = Promise::<bool>::new(None);
        let inner = probe.clone();
        let handle = reactor.clone();
        reactor.submit(move || {
            inner.try_success(handle.in_event_loop());
        });
        assert!(probe.future().wait().unwrap(), "task must observe the loop thread");
        assert!(!reactor.in_event_loop());
        reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
        assert!(reactor.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn scheduled_tasks_fire_after_their_deadline() {
        let reactor = Reactor::new().unwrap();
        let fired_at = Promise::<u128>::new(None);
        let inner = fired_at.clone();
        let started = Instant::now();
        reactor.schedule(Duration::from_millis(50), move || {
            inner.try_success(started.elapsed().as_millis());
        });
        let elapsed = fired_at.future().wait().unwrap();
        assert!(elapsed >= 50, "timer fired after {elapsed}ms");
        reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
        assert!(reactor.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn cancelled_timers_do_not_run() {
        let reactor = Reactor::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let future = reactor.schedule(Duration::from_millis(100), move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(future.cancel());
        thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
        assert!(reactor.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn graceful_shutdown_completes_in_time() {
        let reactor = Reactor::new().unwrap();
        reactor.submit(|| {});
        let terminated =
            reactor.shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(2));
        assert!(terminated.wait_timeout(Duration::from_secs(5)));
        assert!(reactor.is_terminated());
        assert!(reactor.is_shutting_down());
    }

    #[test]
    fn never_started_reactor_terminates_immediately() {
        let reactor = Reactor::new().unwrap();
        let terminated =
            reactor.shutdown_gracefully(Duration::from_secs(1), Duration::from_secs(1));
        assert!(terminated.wait_timeout(Duration::from_millis(100)));
        assert!(reactor.is_terminated());
    }

    /// Selector which reports readiness without ever producing events,
    /// emulating the broken-epoll spin.
    struct SpinningPoller {
        rebuilds: Arc<AtomicUsize>,
    }

    impl Iterator for SpinningPoller {
        type Item = (Token, Result<IoType, crate::poller::IoFail>);
        fn next(&mut self) -> Option<Self::Item> { None }
    }

    impl Poll for SpinningPoller {
        fn register(&mut self, _fd: RawFd, _token: Token, _interest: IoType) {}
        fn unregister(&mut self, _token: Token) {}
        fn set_interest(&mut self, _token: Token, _interest: IoType) -> bool { true }
        fn poll(&mut self, _timeout: Option<Duration>) -> io::Result<usize> { Ok(0) }
        fn rebuild(&mut self) -> io::Result<()> {
            self.rebuilds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn spinning_selector_is_rebuilt() {
        let rebuilds = Arc::new(AtomicUsize::new(0));
        let reactor = Reactor::with_tuning(
            "spinner".to_owned(),
            SpinningPoller {
                rebuilds: rebuilds.clone(),
            },
            Box::new(DefaultSelectStrategy),
            DEFAULT_IO_RATIO,
            16,
        )
        .unwrap();
        reactor.submit(|| {});
        assert!(
            {
                let deadline = Instant::now() + Duration::from_secs(5);
                loop {
                    if rebuilds.load(Ordering::SeqCst) > 0 {
                        break true;
                    }
                    if Instant::now() > deadline {
                        break false;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            },
            "the spin threshold must trigger a selector rebuild"
        );
        reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
        assert!(reactor.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn submissions_after_termination_are_rejected() {
        let reactor = Reactor::new().unwrap();
        reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
        assert!(reactor.await_termination(Duration::from_secs(5)));
        // Must not panic or hang.
        reactor.submit(|| panic!("must never run"));
        let future = reactor.register(&Channel::server());
        assert!(future.wait_timeout(Duration::from_secs(1)));
        assert!(matches!(future.cause(), Some(Error::ReactorShutdown)));
    }
}
