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

//! Low-level non-blocking TCP transports consumed by pipeline heads and
//! reactors.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::future::Promise;
use crate::Error;

/// Result of a single non-blocking I/O attempt.
pub enum IoStatus {
    Success(usize),
    WouldBlock,
    Shutdown,
    Err(io::Error),
}

fn read_status(stream: &mut TcpStream, buf: &mut [u8]) -> IoStatus {
    match stream.read(buf) {
        Ok(0) => IoStatus::Shutdown,
        Ok(len) => IoStatus::Success(len),
        Err(err) if err.kind() == ErrorKind::WouldBlock => IoStatus::WouldBlock,
        Err(err) => IoStatus::Err(err),
    }
}

fn write_status(stream: &mut TcpStream, buf: &[u8]) -> IoStatus {
    match stream.write(buf) {
        Ok(0) => IoStatus::WouldBlock,
        Ok(len) => IoStatus::Success(len),
        Err(err) if err.kind() == ErrorKind::WouldBlock => IoStatus::WouldBlock,
        Err(err) if err.kind() == ErrorKind::WriteZero => IoStatus::WouldBlock,
        Err(err) => IoStatus::Err(err),
    }
}

/// Data produced by a transport in response to read readiness.
pub enum ReadOutcome {
    /// Connections accepted by a listening transport.
    Accepted(Vec<TcpStream>),
    /// Byte chunks read from a stream transport; `eof` reports an orderly
    /// remote shutdown observed after the chunks.
    Data { chunks: Vec<Vec<u8>>, eof: bool },
}

/// State of the outbound buffer after a flush attempt.
pub enum FlushOutcome {
    /// Everything buffered has reached the OS.
    Idle,
    /// The OS would block; write readiness is required to continue.
    Pending,
    /// The transport failed; the channel must be torn down.
    Failed(Error),
}

/// Interface the pipeline head and the reactor demand from the byte-level
/// machinery of a channel.
///
/// Transport methods are only invoked on the channel's reactor thread.
pub trait Transport: Send {
    /// OS descriptor to register with the selector; `None` until the
    /// transport has one (e.g. a server channel before `bind`).
    fn raw_fd(&self) -> Option<RawFd>;

    fn local_addr(&self) -> Option<SocketAddr> { None }

    fn peer_addr(&self) -> Option<SocketAddr> { None }

    fn is_open(&self) -> bool;

    /// Whether the transport is live end-to-end (a bound listener or an
    /// established connection); drives the `active` channel state.
    fn is_connected(&self) -> bool { false }

    /// Listening transports survive accept failures; stream transports are
    /// torn down on read failures.
    fn is_listener(&self) -> bool { false }

    fn bind(&mut self, addr: SocketAddr, backlog: usize) -> io::Result<()> {
        let _ = (addr, backlog);
        Err(ErrorKind::Unsupported.into())
    }

    fn connect(
        &mut self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        timeout: Duration,
    ) -> io::Result<()> {
        let _ = (remote, local, timeout);
        Err(ErrorKind::Unsupported.into())
    }

    /// Consumes read readiness: accepts pending connections or reads up to
    /// `max_ops` chunks of `chunk_size` bytes.
    fn handle_readable(&mut self, chunk_size: usize, max_ops: usize) -> io::Result<ReadOutcome>;

    /// Appends bytes to the outbound buffer; the promise completes when they
    /// have fully reached the OS.
    fn buffer_write(&mut self, bytes: Vec<u8>, promise: Promise<()>);

    /// Pushes buffered outbound data into the OS without blocking.
    fn flush(&mut self) -> FlushOutcome;

    /// Bytes buffered but not yet accepted by the OS.
    fn pending_bytes(&self) -> usize { 0 }

    /// Closes the OS resources and returns the promises of writes which will
    /// never complete, for the caller to fail.
    fn close(&mut self) -> Vec<Promise<()>>;
}

/// Listening TCP socket transport backing server channels.
pub struct ServerTransport {
    listener: Option<TcpListener>,
    closed: bool,
}

impl ServerTransport {
    pub fn new() -> Self {
        ServerTransport {
            listener: None,
            closed: false,
        }
    }
}

impl Default for ServerTransport {
    fn default() -> Self { ServerTransport::new() }
}

impl Transport for ServerTransport {
    fn raw_fd(&self) -> Option<RawFd> { self.listener.as_ref().map(|l| l.as_raw_fd()) }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn is_open(&self) -> bool { !self.closed }

    fn is_connected(&self) -> bool { self.listener.is_some() }

    fn is_listener(&self) -> bool { true }

    #[cfg(feature = "socket2")]
    fn bind(&mut self, addr: SocketAddr, backlog: usize) -> io::Result<()> {
        use socket2::{Domain, Socket, Type};

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;
        self.listener = Some(socket.into());
        Ok(())
    }

    #[cfg(not(feature = "socket2"))]
    fn bind(&mut self, addr: SocketAddr, _backlog: usize) -> io::Result<()> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        self.listener = Some(listener);
        Ok(())
    }

    fn handle_readable(&mut self, _chunk_size: usize, max_ops: usize) -> io::Result<ReadOutcome> {
        let Some(listener) = &self.listener else {
            return Ok(ReadOutcome::Accepted(vec![]));
        };
        let mut accepted = Vec::new();
        while accepted.len() < max_ops {
            match listener.accept() {
                Ok((stream, _)) => accepted.push(stream),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if accepted.is_empty() => return Err(err),
                // Deliver what was accepted; the error will resurface on the
                // next readiness event.
                Err(_) => break,
            }
        }
        Ok(ReadOutcome::Accepted(accepted))
    }

    fn buffer_write(&mut self, _bytes: Vec<u8>, promise: Promise<()>) {
        promise.try_failure(Error::UnsupportedMessage);
    }

    fn flush(&mut self) -> FlushOutcome { FlushOutcome::Idle }

    fn close(&mut self) -> Vec<Promise<()>> {
        self.listener = None;
        self.closed = true;
        vec![]
    }
}

struct PendingWrite {
    bytes: Vec<u8>,
    offset: usize,
    promise: Promise<()>,
}

/// Established TCP connection transport backing stream channels.
pub struct StreamTransport {
    stream: Option<TcpStream>,
    queue: VecDeque<PendingWrite>,
    pending: usize,
    closed: bool,
}

impl StreamTransport {
    /// Wraps an already established connection. The stream must be in
    /// non-blocking mode.
    pub fn new(stream: TcpStream) -> Self {
        StreamTransport {
            stream: Some(stream),
            queue: empty!(),
            pending: 0,
            closed: false,
        }
    }

    /// A transport with no connection yet; `connect` establishes one.
    pub fn unconnected() -> Self {
        StreamTransport {
            stream: None,
            queue: empty!(),
            pending: 0,
            closed: false,
        }
    }
}

impl Transport for StreamTransport {
    fn raw_fd(&self) -> Option<RawFd> { self.stream.as_ref().map(|s| s.as_raw_fd()) }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    fn is_open(&self) -> bool { !self.closed }

    fn is_connected(&self) -> bool { !self.closed && self.stream.is_some() }

    fn connect(
        &mut self,
        remote: SocketAddr,
        _local: Option<SocketAddr>,
        timeout: Duration,
    ) -> io::Result<()> {
        if self.stream.is_some() {
            return Err(ErrorKind::AlreadyExists.into());
        }
        let stream = TcpStream::connect_timeout(&remote, timeout)?;
        stream.set_nonblocking(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn handle_readable(&mut self, chunk_size: usize, max_ops: usize) -> io::Result<ReadOutcome> {
        let Some(stream) = &mut self.stream else {
            return Err(ErrorKind::NotConnected.into());
        };
        let mut chunks = Vec::new();
        let mut eof = false;
        while chunks.len() < max_ops {
            let mut buf = vec![0u8; chunk_size];
            match read_status(stream, &mut buf) {
                IoStatus::Success(len) => {
                    buf.truncate(len);
                    chunks.push(buf);
                    if len < chunk_size {
                        // Short read: the socket is drained for now.
                        break;
                    }
                }
                IoStatus::WouldBlock => break,
                IoStatus::Shutdown => {
                    eof = true;
                    break;
                }
                IoStatus::Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                IoStatus::Err(err) => return Err(err),
            }
        }
        Ok(ReadOutcome::Data { chunks, eof })
    }

    fn buffer_write(&mut self, bytes: Vec<u8>, promise: Promise<()>) {
        if self.closed || self.stream.is_none() {
            promise.try_failure(Error::ChannelClosed);
            return;
        }
        self.pending += bytes.len();
        self.queue.push_back(PendingWrite {
            bytes,
            offset: 0,
            promise,
        });
    }

    fn flush(&mut self) -> FlushOutcome {
        let Some(stream) = &mut self.stream else {
            return FlushOutcome::Idle;
        };
        while let Some(front) = self.queue.front_mut() {
            match write_status(stream, &front.bytes[front.offset..]) {
                IoStatus::Success(len) => {
                    front.offset += len;
                    self.pending -= len;
                    if front.offset == front.bytes.len() {
                        let done = self.queue.pop_front().expect("front exists");
                        done.promise.try_success(());
                    }
                }
                IoStatus::WouldBlock => return FlushOutcome::Pending,
                IoStatus::Shutdown => {
                    return FlushOutcome::Failed(Error::from(io::Error::from(
                        ErrorKind::ConnectionReset,
                    )))
                }
                IoStatus::Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                IoStatus::Err(err) => {
                    let err = Error::from(err);
                    if let Some(failed) = self.queue.pop_front() {
                        self.pending -= failed.bytes.len() - failed.offset;
                        failed.promise.try_failure(err.clone());
                    }
                    return FlushOutcome::Failed(err);
                }
            }
        }
        FlushOutcome::Idle
    }

    fn pending_bytes(&self) -> usize { self.pending }

    fn close(&mut self) -> Vec<Promise<()>> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.closed = true;
        self.pending = 0;
        self.queue.drain(..).map(|write| write.promise).collect()
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;

    use super::*;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn reads_come_back_in_chunks() {
        let (client, server) = pair();
        let mut client = client;
        client.write_all(b"hello world").unwrap();
        client.flush().unwrap();

        server.set_nonblocking(true).unwrap();
        let mut transport = StreamTransport::new(server);
        // Wait for the data to arrive through the loopback.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut collected = Vec::new();
        while collected.len() < 11 && std::time::Instant::now() < deadline {
            match transport.handle_readable(4, 16).unwrap() {
                ReadOutcome::Data { chunks, .. } => {
                    collected.extend(chunks.into_iter().flatten())
                }
                ReadOutcome::Accepted(_) => unreachable!(),
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(collected, b"hello world");
    }

    #[test]
    fn eof_is_reported_after_final_bytes() {
        let (mut client, server) = pair();
        client.write_all(b"bye").unwrap();
        drop(client);

        server.set_nonblocking(true).unwrap();
        let mut transport = StreamTransport::new(server);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut collected = Vec::new();
        let mut seen_eof = false;
        while !seen_eof && std::time::Instant::now() < deadline {
            match transport.handle_readable(64, 16).unwrap() {
                ReadOutcome::Data { chunks, eof } => {
                    collected.extend(chunks.into_iter().flatten());
                    seen_eof = eof;
                }
                ReadOutcome::Accepted(_) => unreachable!(),
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(collected, b"bye");
        assert!(seen_eof);
    }

    #[test]
    fn close_fails_pending_writes() {
        let (_client, server) = pair();
        server.set_nonblocking(true).unwrap();
        let mut transport = StreamTransport::new(server);

        let promise = Promise::new(None);
        transport.buffer_write(vec![0u8; 128], promise.clone());
        assert_eq!(transport.pending_bytes(), 128);

        let orphans = transport.close();
        assert_eq!(orphans.len(), 1);
        for orphan in orphans {
            orphan.try_failure(Error::ChannelClosed);
        }
        assert!(matches!(promise.future().cause(), Some(Error::ChannelClosed)));
        assert_eq!(transport.pending_bytes(), 0);
    }

    #[test]
    fn writes_after_close_fail_immediately() {
        let (_client, server) = pair();
        server.set_nonblocking(true).unwrap();
        let mut transport = StreamTransport::new(server);
        transport.close();

        let promise = Promise::new(None);
        transport.buffer_write(b"late".to_vec(), promise.clone());
        assert!(matches!(promise.future().cause(), Some(Error::ChannelClosed)));
    }
}
