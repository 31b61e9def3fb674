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

//! Server bootstrap: binds a listening channel on a parent reactor group and
//! hands accepted children over to a child group.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::attr::{AttrKey, AttrValues, ChannelOption, OptionValues};
use crate::channel::{Channel, Message};
use crate::future::{Future, Promise};
use crate::group::ReactorGroup;
use crate::handler::{ChannelHandler, ChannelInitializer, EventMask};
use crate::pipeline::Context;
use crate::Error;

type InitFn = dyn Fn(&Channel) -> Result<(), Error> + Send + Sync;
type HandlerFactory = dyn Fn() -> Box<dyn ChannelHandler> + Send + Sync;

/// Configuration and runtime wiring for a TCP server.
///
/// The *parent* group accepts connections on the listening channel; every
/// accepted child channel receives the configured options, attributes and
/// initializer and is registered with the *child* group.
#[derive(Default)]
pub struct ServerBootstrap {
    parent_group: Option<ReactorGroup>,
    child_group: Option<ReactorGroup>,
    parent_handler: Option<Arc<HandlerFactory>>,
    child_initializer: Option<Arc<InitFn>>,
    parent_options: OptionValues,
    child_options: OptionValues,
    parent_attrs: AttrValues,
    child_attrs: AttrValues,
    local_addr: Option<SocketAddr>,
}

impl ServerBootstrap {
    pub fn new() -> Self { ServerBootstrap::default() }

    /// Sets the same group for accepting and for serving accepted channels.
    pub fn group(&mut self, group: ReactorGroup) -> &mut Self {
        self.parent_group = Some(group.clone());
        self.child_group = Some(group);
        self
    }

    pub fn groups(&mut self, parent: ReactorGroup, child: ReactorGroup) -> &mut Self {
        self.parent_group = Some(parent);
        self.child_group = Some(child);
        self
    }

    /// Optional handler installed on the server channel's own pipeline,
    /// constructed once per bind.
    pub fn parent_handler<H: ChannelHandler>(
        &mut self,
        factory: impl Fn() -> H + Send + Sync + 'static,
    ) -> &mut Self {
        self.parent_handler = Some(Arc::new(move || Box::new(factory())));
        self
    }

    /// Required callback populating every accepted child's pipeline. Runs on
    /// the child's reactor.
    pub fn child_initializer(
        &mut self,
        init: impl Fn(&Channel) -> Result<(), Error> + Send + Sync + 'static,
    ) -> &mut Self {
        self.child_initializer = Some(Arc::new(init));
        self
    }

    pub fn parent_option<T: Clone + Send + Sync + 'static>(
        &mut self,
        option: ChannelOption<T>,
        value: Option<T>,
    ) -> Result<&mut Self, Error> {
        self.parent_options.set(option, value)?;
        Ok(self)
    }

    pub fn child_option<T: Clone + Send + Sync + 'static>(
        &mut self,
        option: ChannelOption<T>,
        value: Option<T>,
    ) -> Result<&mut Self, Error> {
        self.child_options.set(option, value)?;
        Ok(self)
    }

    pub fn parent_attr<T: Clone + Send + Sync + 'static>(
        &mut self,
        key: AttrKey<T>,
        value: Option<T>,
    ) -> &mut Self {
        self.parent_attrs.set(key, value);
        self
    }

    pub fn child_attr<T: Clone + Send + Sync + 'static>(
        &mut self,
        key: AttrKey<T>,
        value: Option<T>,
    ) -> &mut Self {
        self.child_attrs.set(key, value);
        self
    }

    pub fn local_addr(&mut self, addr: SocketAddr) -> &mut Self {
        self.local_addr = Some(addr);
        self
    }

    /// The child group falls back to the parent group when unset; the warning
    /// marks this as a convenience rather than a production setup.
    fn resolve(&self) -> Result<(ReactorGroup, ReactorGroup, Arc<InitFn>), Error> {
        let parent = self
            .parent_group
            .clone()
            .ok_or(Error::BootstrapIncomplete("parent_group"))?;
        let init = self
            .child_initializer
            .clone()
            .ok_or(Error::BootstrapIncomplete("child_initializer"))?;
        let child = match &self.child_group {
            Some(child) => child.clone(),
            None => {
                #[cfg(feature = "log")]
                log::warn!(target: "bootstrap",
                    "Child group is not set; using the parent group instead");
                parent.clone()
            }
        };
        Ok((parent, child, init))
    }

    /// Checks that every required parameter is present.
    pub fn validate(&self) -> Result<(), Error> {
        self.resolve()?;
        if self.local_addr.is_none() {
            return Err(Error::BootstrapIncomplete("local_addr"));
        }
        Ok(())
    }

    /// Binds on the configured local address.
    pub fn bind(&self) -> Result<Future<Channel>, Error> {
        self.validate()?;
        self.bind_addr(self.local_addr.expect("validated"))
    }

    /// Binds on an explicit address; the returned future yields the bound
    /// server channel.
    pub fn bind_addr(&self, addr: SocketAddr) -> Result<Future<Channel>, Error> {
        let (parent, child_group, child_init) = self.resolve()?;

        let channel = Channel::server();
        self.parent_options.apply(&channel);
        self.parent_attrs.apply(&channel);

        let parent_handler = self.parent_handler.clone();
        let child_options = Arc::new(self.child_options.clone());
        let child_attrs = Arc::new(self.child_attrs.clone());
        let initializer = ChannelInitializer::new(move |server: &Channel| {
            if let Some(factory) = &parent_handler {
                server.pipeline().add_last_boxed(None, factory())?;
            }
            let acceptor = Acceptor {
                child_group: child_group.clone(),
                child_init: child_init.clone(),
                child_options: child_options.clone(),
                child_attrs: child_attrs.clone(),
                server: server.clone(),
            };
            let reactor = server.reactor().cloned().ok_or(Error::NotRegistered)?;
            // Appended via a task rather than inline: the pipeline must
            // finish its own initialization before the acceptor becomes
            // reachable by the first accept's `channel_read`.
            let server = server.clone();
            reactor.submit(move || {
                if let Err(_err) = server.pipeline().add_last(Some("acceptor"), acceptor) {
                    #[cfg(feature = "log")]
                    log::error!(target: "bootstrap",
                        "Failed to install the acceptor on {server:?}: {_err}");
                }
            });
            Ok(())
        });
        channel.pipeline().add_last(Some("bootstrap"), initializer)?;

        let reactor = parent.next();
        let bound = Promise::<Channel>::new(Some(reactor.clone()));

        let result = bound.clone();
        let server = channel.clone();
        reactor.register(&channel).on_complete(move |registered| {
            if !registered.is_success() {
                result.try_failure(
                    registered.cause().unwrap_or_else(|| Error::other("registration failed")),
                );
                return;
            }
            let result = result.clone();
            let observer = server.clone();
            server.bind(addr).on_complete(move |bind| {
                if bind.is_success() {
                    result.try_success(observer.clone());
                } else {
                    result.try_failure(
                        bind.cause().unwrap_or_else(|| Error::other("bind failed")),
                    );
                    observer.close();
                }
            });
        });
        Ok(bound.future())
    }
}

/// Inbound handler at the tail of a server pipeline turning accepted channels
/// into registered members of the child group.
struct Acceptor {
    child_group: ReactorGroup,
    child_init: Arc<InitFn>,
    child_options: Arc<OptionValues>,
    child_attrs: Arc<AttrValues>,
    server: Channel,
}

fn force_close(channel: &Channel, _err: &Error) {
    #[cfg(feature = "log")]
    log::warn!(target: "bootstrap",
        "Failed to set up accepted {channel:?}: {_err}; force-closing");
    channel.close();
}

impl ChannelHandler for Acceptor {
    fn handled_events(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::EXCEPTION_CAUGHT
    }

    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), Error> {
        let Message::Channel(child) = msg else {
            ctx.fire_channel_read(msg);
            return Ok(());
        };

        let init = self.child_init.clone();
        let installed = child
            .pipeline()
            .add_last(None, ChannelInitializer::new(move |channel| (init)(channel)));
        if let Err(err) = installed {
            force_close(&child, &err);
            return Ok(());
        }
        self.child_options.apply(&child);
        self.child_attrs.apply(&child);

        let observer = child.clone();
        self.child_group.register(&child).on_complete(move |registered| {
            if !registered.is_success() {
                force_close(
                    &observer,
                    &registered.cause().unwrap_or_else(|| Error::other("registration failed")),
                );
            }
        });
        Ok(())
    }

    fn exception_caught(&mut self, ctx: &Context, err: Error) -> Result<(), Error> {
        let server = &self.server;
        if server.config().auto_read() {
            // Stop accepting for one second so the process can recover from
            // accept storms such as descriptor exhaustion.
            server.set_auto_read(false);
            if let Some(reactor) = server.reactor() {
                let server = server.clone();
                reactor.schedule(Duration::from_secs(1), move || server.set_auto_read(true));
            }
        }
        // The application still observes the failure further down the
        // pipeline.
        ctx.fire_exception_caught(err);
        Ok(())
    }
}

#[cfg(all(test, feature = "popol"))]
mod test {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::reactor::Reactor;

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    struct ActiveRecorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ChannelHandler for ActiveRecorder {
        fn handled_events(&self) -> EventMask { EventMask::CHANNEL_ACTIVE }

        fn channel_active(&mut self, ctx: &Context) -> Result<(), Error> {
            let name = ctx.executor().map(|r| r.name().to_owned()).unwrap_or_default();
            self.log.lock().unwrap().push(name);
            ctx.fire_channel_active();
            Ok(())
        }
    }

    struct ReadOnlyProbe {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ChannelHandler for ReadOnlyProbe {
        fn handled_events(&self) -> EventMask { EventMask::CHANNEL_READ }

        fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), Error> {
            self.log.lock().unwrap().push(format!("read:{msg:?}"));
            ctx.fire_channel_read(msg);
            Ok(())
        }

        // Would record if it were ever invoked; the mask must prevent that.
        fn channel_active(&mut self, ctx: &Context) -> Result<(), Error> {
            self.log.lock().unwrap().push("active".to_owned());
            ctx.fire_channel_active();
            Ok(())
        }
    }

    struct Sink;
    impl ChannelHandler for Sink {
        fn handled_events(&self) -> EventMask { EventMask::CHANNEL_READ }
        fn channel_read(&mut self, _ctx: &Context, _msg: Message) -> Result<(), Error> { Ok(()) }
    }

    #[test]
    fn bind_and_accept_round_robin() {
        let parent = ReactorGroup::new(1).unwrap();
        let child = ReactorGroup::new(2).unwrap();

        let server_active = Arc::new(AtomicUsize::new(0));
        let child_active = Arc::new(Mutex::new(Vec::new()));

        let mut bootstrap = ServerBootstrap::new();
        let server_hits = server_active.clone();
        let log = child_active.clone();
        bootstrap
            .groups(parent.clone(), child.clone())
            .parent_handler(move || {
                struct CountActive(Arc<AtomicUsize>);
                impl ChannelHandler for CountActive {
                    fn handled_events(&self) -> EventMask { EventMask::CHANNEL_ACTIVE }
                    fn channel_active(&mut self, ctx: &Context) -> Result<(), Error> {
                        self.0.fetch_add(1, Ordering::SeqCst);
                        ctx.fire_channel_active();
                        Ok(())
                    }
                }
                CountActive(server_hits.clone())
            })
            .child_initializer(move |channel| {
                channel.pipeline().add_last(Some("recorder"), ActiveRecorder {
                    log: log.clone(),
                })?;
                Ok(())
            });

        let server = bootstrap
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .wait()
            .unwrap();
        let addr = server.local_addr().unwrap();
        assert!(server.is_active());

        let _c1 = TcpStream::connect(addr).unwrap();
        let _c2 = TcpStream::connect(addr).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || child_active.lock().unwrap().len() == 2),
            "both children must become active"
        );
        assert_eq!(server_active.load(Ordering::SeqCst), 1, "one active on the server channel");

        // The two actives fire on different reactor threads, so their
        // recording order is not deterministic; the assignment set is.
        let mut recorded = child_active.lock().unwrap().clone();
        recorded.sort();
        assert!(recorded[0].ends_with("-0"), "one child lands on reactor 0, got {recorded:?}");
        assert!(recorded[1].ends_with("-1"), "one child lands on reactor 1, got {recorded:?}");

        parent.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
        child.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
        assert!(parent.await_termination(Duration::from_secs(5)));
        assert!(child.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn initializer_runs_once_and_removes_itself() {
        let reactor = Reactor::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();

        let channel = Channel::from_stream(stream).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        channel
            .pipeline()
            .add_last(
                Some("init"),
                ChannelInitializer::new(move |channel| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    channel.pipeline().add_last(Some("a"), Sink)?;
                    channel.pipeline().add_last(Some("b"), Sink)?;
                    Ok(())
                }),
            )
            .unwrap();
        assert_eq!(channel.pipeline().names(), vec!["head", "init", "tail"]);

        reactor.register(&channel).wait().unwrap();

        // Flush the loop so the deferred callbacks have settled.
        let settled = Promise::<()>::new(None);
        let probe = settled.clone();
        reactor.submit(move || {
            probe.try_success(());
        });
        settled.future().wait().unwrap();

        assert_eq!(channel.pipeline().names(), vec!["head", "a", "b", "tail"]);
        assert_eq!(runs.load(Ordering::SeqCst), 1, "initializer runs exactly once");

        reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
        assert!(reactor.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn masked_out_events_skip_the_handler() {
        let reactor = Reactor::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();

        let channel = Channel::from_stream(stream).unwrap();
        channel.set_auto_read(false);
        let log = Arc::new(Mutex::new(Vec::new()));
        channel
            .pipeline()
            .add_last(Some("probe"), ReadOnlyProbe { log: log.clone() })
            .unwrap();
        reactor.register(&channel).wait().unwrap();

        channel.pipeline().fire_channel_active();
        channel.pipeline().fire_channel_read(Message::Buffer(b"x".to_vec()));

        assert!(wait_until(Duration::from_secs(5), || !log.lock().unwrap().is_empty()));
        let events = log.lock().unwrap().clone();
        assert_eq!(events.len(), 1, "channel_active must be skipped, got {events:?}");
        assert!(events[0].starts_with("read:"));

        reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
        assert!(reactor.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn accept_exception_pauses_auto_read() {
        let parent = ReactorGroup::new(1).unwrap();
        let mut bootstrap = ServerBootstrap::new();
        bootstrap.group(parent.clone()).child_initializer(|channel| {
            channel.pipeline().add_last(Some("sink"), Sink)?;
            Ok(())
        });

        let server = bootstrap
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .wait()
            .unwrap();
        assert!(server.config().auto_read());

        server.pipeline().fire_exception_caught(Error::other("accept storm"));

        assert!(
            wait_until(Duration::from_secs(2), || !server.config().auto_read()),
            "auto-read must be paused after an accept failure"
        );
        assert!(
            wait_until(Duration::from_secs(3), || server.config().auto_read()),
            "auto-read must be restored by the scheduled task"
        );

        parent.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
        assert!(parent.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn cross_thread_write_executes_on_the_channel_reactor() {
        let parent = ReactorGroup::new(1).unwrap();
        let child = ReactorGroup::new(1).unwrap();

        let accepted = Arc::new(Mutex::new(Option::<Channel>::None));
        let slot = accepted.clone();
        let mut bootstrap = ServerBootstrap::new();
        bootstrap.groups(parent.clone(), child.clone()).child_initializer(move |channel| {
            channel.pipeline().add_last(Some("sink"), Sink)?;
            *slot.lock().unwrap() = Some(channel.clone());
            Ok(())
        });

        let server = bootstrap
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .wait()
            .unwrap();
        let mut client = TcpStream::connect(server.local_addr().unwrap()).unwrap();

        assert!(wait_until(Duration::from_secs(5), || accepted.lock().unwrap().is_some()));
        let channel = accepted.lock().unwrap().clone().unwrap();
        assert!(wait_until(Duration::from_secs(5), || channel.is_active()));

        let reactor = channel.reactor().cloned().unwrap();
        let future = channel.write_and_flush(Message::Buffer(b"ping".to_vec()));

        let listener_thread = Promise::<bool>::new(None);
        let probe = listener_thread.clone();
        let observer = reactor.clone();
        future.on_complete(move |f| {
            probe.try_success(f.is_success() && observer.in_event_loop());
        });
        assert!(
            listener_thread.future().wait().unwrap(),
            "write must complete and notify on the channel's reactor"
        );

        let mut buf = [0u8; 4];
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        parent.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
        child.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
        assert!(parent.await_termination(Duration::from_secs(5)));
        assert!(child.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn validation_reports_missing_parameters() {
        let bootstrap = ServerBootstrap::new();
        assert!(matches!(
            bootstrap.validate(),
            Err(Error::BootstrapIncomplete("parent_group"))
        ));

        let parent = ReactorGroup::new(1).unwrap();
        let mut bootstrap = ServerBootstrap::new();
        bootstrap.group(parent.clone());
        assert!(matches!(
            bootstrap.validate(),
            Err(Error::BootstrapIncomplete("child_initializer"))
        ));

        bootstrap.child_initializer(|_| Ok(()));
        assert!(matches!(
            bootstrap.validate(),
            Err(Error::BootstrapIncomplete("local_addr"))
        ));

        bootstrap.local_addr("127.0.0.1:0".parse().unwrap());
        bootstrap.validate().unwrap();

        parent.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
        assert!(parent.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn unhandled_reads_reach_the_tail_without_panicking() {
        let parent = ReactorGroup::new(1).unwrap();
        let mut bootstrap = ServerBootstrap::new();
        // The initializer installs nothing: inbound data must be discarded by
        // the tail sentinel.
        bootstrap.group(parent.clone()).child_initializer(|_| Ok(()));

        let server = bootstrap
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .wait()
            .unwrap();
        let mut client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        client.write_all(b"unexpected").unwrap();
        drop(client);

        // Nothing to assert beyond the group still shutting down cleanly
        // after the data was discarded.
        thread::sleep(Duration::from_millis(200));
        parent.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
        assert!(parent.await_termination(Duration::from_secs(5)));
    }
}
