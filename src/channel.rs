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

//! Channels: bidirectional network endpoints owning a pipeline, a
//! configuration and an attribute map, bound to exactly one reactor for life.

use std::any::Any;
use std::fmt::{self, Debug, Formatter};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use std::io;

use crate::attr::{AttrKey, AttributeMap, ChannelOption};
use crate::future::Future;
use crate::pipeline::Pipeline;
use crate::reactor::{Ctl, Reactor};
use crate::transport::{ServerTransport, StreamTransport, Transport};

/// Stable channel identity, unique within the process and never reused.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display(inner)]
pub struct ChannelId(pub(crate) u64);

impl ChannelId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ChannelId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Channel lifecycle state. Transitions are monotonic in the order listed;
/// states may be skipped but never revisited.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
pub enum ChannelState {
    #[display("unregistered")]
    Unregistered = 0,
    #[display("registered")]
    Registered = 1,
    #[display("active")]
    Active = 2,
    #[display("closed")]
    Closed = 3,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Unregistered,
            1 => ChannelState::Registered,
            2 => ChannelState::Active,
            _ => ChannelState::Closed,
        }
    }
}

/// A unit of data travelling through a pipeline.
pub enum Message {
    /// Raw bytes read from, or to be written to, the transport.
    Buffer(Vec<u8>),
    /// A freshly accepted child channel travelling through a server pipeline.
    Channel(Channel),
    /// Application-defined payload exchanged between handlers.
    Other(Box<dyn Any + Send>),
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Message::Buffer(bytes) => write!(f, "Buffer({} bytes)", bytes.len()),
            Message::Channel(channel) => write!(f, "Channel({})", channel.id()),
            Message::Other(_) => f.write_str("Other(..)"),
        }
    }
}

/// Recognized channel configuration options.
///
/// The set is extensible: any [`ChannelOption`] may be passed to
/// [`ChannelConfig::set_option`], which reports whether the channel supports
/// it so callers can warn and skip.
pub mod options {
    use super::*;

    /// Whether the transport is asked for more data automatically after each
    /// read completes.
    pub fn auto_read() -> ChannelOption<bool> { ChannelOption::of("AUTO_READ") }

    /// Size of the buffer used for a single transport read.
    pub fn receive_buffer_size() -> ChannelOption<usize> {
        ChannelOption::of("RECEIVE_BUFFER_SIZE").with_validator(|size| *size > 0)
    }

    /// Socket send buffer size hint.
    pub fn send_buffer_size() -> ChannelOption<usize> {
        ChannelOption::of("SEND_BUFFER_SIZE").with_validator(|size| *size > 0)
    }

    /// Timeout for outbound connect operations.
    pub fn connect_timeout() -> ChannelOption<Duration> {
        ChannelOption::of("CONNECT_TIMEOUT").with_validator(|timeout: &Duration| !timeout.is_zero())
    }

    /// Pending outbound bytes above which the channel reports itself
    /// unwritable.
    pub fn write_high_watermark() -> ChannelOption<usize> {
        ChannelOption::of("WRITE_HIGH_WATERMARK").with_validator(|mark| *mark > 0)
    }

    /// Pending outbound bytes below which the channel becomes writable again.
    pub fn write_low_watermark() -> ChannelOption<usize> {
        ChannelOption::of("WRITE_LOW_WATERMARK").with_validator(|mark| *mark > 0)
    }

    /// Listen backlog for server channels.
    pub fn backlog() -> ChannelOption<usize> {
        ChannelOption::of("BACKLOG").with_validator(|backlog| *backlog > 0)
    }
}

/// Per-channel configuration with atomically updatable recognized options.
pub struct ChannelConfig {
    channel: Weak<ChannelCore>,
    pub(crate) auto_read: AtomicBool,
    rcv_buf: AtomicUsize,
    snd_buf: AtomicUsize,
    connect_timeout_ms: AtomicU64,
    write_high: AtomicUsize,
    write_low: AtomicUsize,
    backlog: AtomicUsize,
}

impl ChannelConfig {
    fn new(channel: Weak<ChannelCore>) -> Self {
        ChannelConfig {
            channel,
            auto_read: AtomicBool::new(true),
            rcv_buf: AtomicUsize::new(2048),
            snd_buf: AtomicUsize::new(0),
            connect_timeout_ms: AtomicU64::new(30_000),
            write_high: AtomicUsize::new(64 * 1024),
            write_low: AtomicUsize::new(32 * 1024),
            backlog: AtomicUsize::new(128),
        }
    }

    pub fn auto_read(&self) -> bool { self.auto_read.load(Ordering::SeqCst) }

    pub fn receive_buffer_size(&self) -> usize { self.rcv_buf.load(Ordering::SeqCst) }

    pub fn send_buffer_size(&self) -> usize { self.snd_buf.load(Ordering::SeqCst) }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::SeqCst))
    }

    pub fn write_high_watermark(&self) -> usize { self.write_high.load(Ordering::SeqCst) }

    pub fn write_low_watermark(&self) -> usize { self.write_low.load(Ordering::SeqCst) }

    pub fn backlog(&self) -> usize { self.backlog.load(Ordering::SeqCst) }

    /// Applies a single option value.
    ///
    /// Returns `false` when the option is not recognized by this channel or
    /// its value does not pass validation; callers are expected to warn and
    /// continue.
    pub fn set_option<T: Any + Send>(&self, option: &ChannelOption<T>, value: T) -> bool {
        if !option.validate(&value) {
            return false;
        }
        let id = option.id();
        let value = &value as &dyn Any;
        if id == options::auto_read().id() {
            let Some(on) = value.downcast_ref::<bool>() else {
                return false;
            };
            match self.channel.upgrade() {
                Some(core) => Channel(core).set_auto_read(*on),
                None => self.auto_read.store(*on, Ordering::SeqCst),
            }
        } else if id == options::receive_buffer_size().id() {
            let Some(size) = value.downcast_ref::<usize>() else {
                return false;
            };
            self.rcv_buf.store(*size, Ordering::SeqCst);
            self.apply_socket_buffers(Some(*size), None);
        } else if id == options::send_buffer_size().id() {
            let Some(size) = value.downcast_ref::<usize>() else {
                return false;
            };
            self.snd_buf.store(*size, Ordering::SeqCst);
            self.apply_socket_buffers(None, Some(*size));
        } else if id == options::connect_timeout().id() {
            let Some(timeout) = value.downcast_ref::<Duration>() else {
                return false;
            };
            self.connect_timeout_ms.store(timeout.as_millis() as u64, Ordering::SeqCst);
        } else if id == options::write_high_watermark().id() {
            let Some(mark) = value.downcast_ref::<usize>() else {
                return false;
            };
            // Watermarks validate against each other, which is why option
            // application preserves insertion order.
            if *mark < self.write_low_watermark() {
                return false;
            }
            self.write_high.store(*mark, Ordering::SeqCst);
        } else if id == options::write_low_watermark().id() {
            let Some(mark) = value.downcast_ref::<usize>() else {
                return false;
            };
            if *mark > self.write_high_watermark() {
                return false;
            }
            self.write_low.store(*mark, Ordering::SeqCst);
        } else if id == options::backlog().id() {
            let Some(backlog) = value.downcast_ref::<usize>() else {
                return false;
            };
            self.backlog.store(*backlog, Ordering::SeqCst);
        } else {
            return false;
        }
        true
    }

    #[cfg(feature = "socket2")]
    fn apply_socket_buffers(&self, recv: Option<usize>, send: Option<usize>) {
        use std::os::fd::BorrowedFd;

        let Some(core) = self.channel.upgrade() else {
            return;
        };
        let Some(fd) = core.transport.lock().expect("transport poisoned").raw_fd() else {
            return;
        };
        // The fd stays alive for the duration of the borrow: the transport is
        // owned by the channel core we hold an Arc to.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let sock = socket2::SockRef::from(&fd);
        if let Some(size) = recv {
            let _ = sock.set_recv_buffer_size(size);
        }
        if let Some(size) = send {
            let _ = sock.set_send_buffer_size(size);
        }
    }

    #[cfg(not(feature = "socket2"))]
    fn apply_socket_buffers(&self, _recv: Option<usize>, _send: Option<usize>) {}
}

pub(crate) struct ChannelCore {
    pub(crate) id: ChannelId,
    pub(crate) config: ChannelConfig,
    pub(crate) attrs: AttributeMap,
    pub(crate) pipeline: OnceLock<Pipeline>,
    pub(crate) reactor: OnceLock<Reactor>,
    pub(crate) state: AtomicU8,
    pub(crate) transport: Mutex<Box<dyn Transport>>,
    /// Whether the channel currently wants read readiness from the selector.
    pub(crate) read_interest: AtomicBool,
    pub(crate) writable: AtomicBool,
}

/// Shared handle to a network channel.
///
/// All operations are valid from any thread: when the caller is not on the
/// channel's reactor the operation is enqueued there and the returned future
/// completes on that reactor.
#[derive(Clone)]
pub struct Channel(pub(crate) Arc<ChannelCore>);

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({}, {})", self.id(), self.state())
    }
}

impl Channel {
    fn with_transport(transport: Box<dyn Transport>) -> Channel {
        let core = Arc::new_cyclic(|weak: &Weak<ChannelCore>| ChannelCore {
            id: ChannelId::next(),
            config: ChannelConfig::new(weak.clone()),
            attrs: AttributeMap::new(),
            pipeline: OnceLock::new(),
            reactor: OnceLock::new(),
            state: AtomicU8::new(ChannelState::Unregistered as u8),
            transport: Mutex::new(transport),
            read_interest: AtomicBool::new(false),
            writable: AtomicBool::new(true),
        });
        let _ = core.pipeline.set(Pipeline::new(Arc::downgrade(&core)));
        Channel(core)
    }

    /// Creates an unbound server (listening) channel.
    pub fn server() -> Channel { Channel::with_transport(Box::new(ServerTransport::new())) }

    /// Wraps an established TCP stream (e.g. an accepted connection) into a
    /// channel, switching it into non-blocking mode.
    pub fn from_stream(stream: TcpStream) -> io::Result<Channel> {
        stream.set_nonblocking(true)?;
        Ok(Channel::with_transport(Box::new(StreamTransport::new(stream))))
    }

    /// Creates a stream channel with no connection yet; connect it after
    /// registration.
    pub fn client() -> Channel {
        Channel::with_transport(Box::new(StreamTransport::unconnected()))
    }

    pub fn id(&self) -> ChannelId { self.0.id }

    pub fn config(&self) -> &ChannelConfig { &self.0.config }

    pub fn attrs(&self) -> &AttributeMap { &self.0.attrs }

    /// Convenience accessor for a single attribute value.
    pub fn attr<T: Clone + Send + Sync + 'static>(&self, key: AttrKey<T>) -> Option<T> {
        self.0.attrs.get(key)
    }

    pub fn pipeline(&self) -> &Pipeline {
        self.0.pipeline.get().expect("pipeline is set at construction")
    }

    /// The reactor this channel is bound to; `None` until registration.
    pub fn reactor(&self) -> Option<&Reactor> { self.0.reactor.get() }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.0.state.load(Ordering::SeqCst))
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.state(), ChannelState::Registered | ChannelState::Active)
    }

    pub fn is_active(&self) -> bool { self.state() == ChannelState::Active }

    /// Whether pending outbound data is below the configured high watermark.
    pub fn is_writable(&self) -> bool { self.0.writable.load(Ordering::SeqCst) }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.0.transport.lock().expect("transport poisoned").local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.0.transport.lock().expect("transport poisoned").peer_addr()
    }

    /// Moves the state machine forward; backward transitions are ignored.
    pub(crate) fn set_state(&self, state: ChannelState) {
        self.0.state.fetch_max(state as u8, Ordering::SeqCst);
    }

    /// Recomputes the writability flag from the amount of buffered outbound
    /// data and fires `writability_changed` when the flag flips.
    pub(crate) fn update_writability(&self) {
        let pending =
            self.0.transport.lock().expect("transport poisoned").pending_bytes();
        let writable = if self.is_writable() {
            pending <= self.config().write_high_watermark()
        } else {
            pending < self.config().write_low_watermark()
        };
        if self.0.writable.swap(writable, Ordering::SeqCst) != writable {
            self.pipeline().fire_writability_changed();
        }
    }

    /// Toggles automatic reading. Turning it on issues a `read`; turning it
    /// off drops read interest so the transport stops producing data.
    pub fn set_auto_read(&self, on: bool) {
        let was = self.0.config.auto_read.swap(on, Ordering::SeqCst);
        if on && !was {
            self.read();
        } else if !on && was {
            self.0.read_interest.store(false, Ordering::SeqCst);
            if let Some(reactor) = self.reactor() {
                reactor.ctl(Ctl::SyncInterest(self.clone()));
            }
        }
    }

    pub fn bind(&self, addr: SocketAddr) -> Future<()> { self.pipeline().bind(addr) }

    pub fn connect(&self, remote: SocketAddr) -> Future<()> {
        self.pipeline().connect(remote, None)
    }

    pub fn disconnect(&self) -> Future<()> { self.pipeline().disconnect() }

    pub fn close(&self) -> Future<()> { self.pipeline().close() }

    pub fn deregister(&self) -> Future<()> { self.pipeline().deregister() }

    /// Requests one read burst from the transport.
    pub fn read(&self) { self.pipeline().read() }

    pub fn write(&self, msg: Message) -> Future<()> { self.pipeline().write(msg) }

    pub fn flush(&self) { self.pipeline().flush() }

    pub fn write_and_flush(&self, msg: Message) -> Future<()> {
        self.pipeline().write_and_flush(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_transitions_are_monotonic() {
        let channel = Channel::server();
        assert_eq!(channel.state(), ChannelState::Unregistered);
        channel.set_state(ChannelState::Registered);
        assert!(channel.is_registered());
        channel.set_state(ChannelState::Active);
        assert!(channel.is_active());
        // Active can not go back to registered.
        channel.set_state(ChannelState::Registered);
        assert_eq!(channel.state(), ChannelState::Active);
        channel.set_state(ChannelState::Closed);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn recognized_options_are_applied() {
        let channel = Channel::server();
        let config = channel.config();

        assert!(config.set_option(&options::receive_buffer_size(), 4096));
        assert_eq!(config.receive_buffer_size(), 4096);

        assert!(!config.set_option(&options::receive_buffer_size(), 0), "validator rejects zero");
        assert_eq!(config.receive_buffer_size(), 4096);

        assert!(config.set_option(&options::connect_timeout(), Duration::from_secs(5)));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));

        let unknown = ChannelOption::<u64>::of("test.unknown-option");
        assert!(!config.set_option(&unknown, 1), "unsupported options are reported");
    }

    #[test]
    fn watermarks_validate_against_each_other() {
        let channel = Channel::server();
        let config = channel.config();

        assert!(!config.set_option(&options::write_high_watermark(), 16 * 1024),
            "high watermark below the current low one is rejected");
        assert!(config.set_option(&options::write_low_watermark(), 8 * 1024));
        assert!(config.set_option(&options::write_high_watermark(), 16 * 1024));
        assert_eq!(config.write_high_watermark(), 16 * 1024);
        assert_eq!(config.write_low_watermark(), 8 * 1024);
    }

    #[test]
    fn channel_ids_are_unique() {
        let a = Channel::server();
        let b = Channel::server();
        assert_ne!(a.id(), b.id());
    }
}
