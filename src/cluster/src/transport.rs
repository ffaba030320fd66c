// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A transport owns one TCP connection to a cache server. Requests are
//! pipelined: the frame bytes are walked through a pinned send buffer
//! while earlier requests are still awaiting replies, and responses are
//! matched against the pending queue in FIFO order by opaque.
//!
//! The type is split in two. [`Transport`] is the shared handle callers
//! and the owning node interact with: submission, lifecycle flags, and
//! the backpressure hand-off. [`TransportIo`] is owned by the driver
//! thread and holds the socket, the pinned buffers, and the pending
//! queue, so the hot paths run without locks.

use crate::driver::{Control, DriverContext};
use crate::request::QuitRequest;
use crate::*;
use buffer::{Buffer, PinnedBuffer};
use crossbeam_queue::ArrayQueue;
use metriken::*;
use protocol_binary::{HeaderError, HEADER_LEN};
use std::borrow::Borrow;
use std::collections::VecDeque;
use std::io::{Error, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error as ThisError;

use ::net::event::Source;
use ::net::{Interest, Registry, Token};

#[metric(name = "transport_send", description = "requests handed to a socket")]
pub static TRANSPORT_SEND: Counter = Counter::new();

#[metric(
    name = "transport_send_ex",
    description = "exceptions while writing to a socket"
)]
pub static TRANSPORT_SEND_EX: Counter = Counter::new();

#[metric(name = "transport_recv", description = "responses received")]
pub static TRANSPORT_RECV: Counter = Counter::new();

#[metric(
    name = "transport_recv_ex",
    description = "exceptions while reading from a socket"
)]
pub static TRANSPORT_RECV_EX: Counter = Counter::new();

#[metric(name = "transport_connect", description = "connection attempts")]
pub static TRANSPORT_CONNECT: Counter = Counter::new();

#[metric(
    name = "transport_connect_ex",
    description = "connection attempts which failed"
)]
pub static TRANSPORT_CONNECT_EX: Counter = Counter::new();

#[metric(
    name = "transport_dead",
    description = "transports torn down after a fatal failure"
)]
pub static TRANSPORT_DEAD: Counter = Counter::new();

// user submissions hand off through a small fixed slot; a transport is
// out of the available pool while a submission is in flight, so the
// queue only ever holds a few entries
const SUBMISSION_DEPTH: usize = 4;

/// Errors that invalidate the response stream.
#[derive(ThisError, Debug)]
pub enum ProtocolError {
    #[error("received a response to quiet opcode {0:#04x}")]
    QuietReply(u8),
    #[error("received a response with no request pending")]
    EmptyPending,
    #[error("opaque mismatch: expected {expected}, got {actual}")]
    OpaqueMismatch { expected: u32, actual: u32 },
    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// The shared handle for one transport. Lifecycle flags are atomics:
/// they are read on the caller's submission path and written from the
/// driver thread.
pub struct Transport {
    endpoint: SocketAddr,
    ctx: Arc<DriverContext>,
    node: Weak<Node>,
    token: AtomicUsize,
    submissions: ArrayQueue<Arc<dyn Request>>,
    pub(crate) pending_len: AtomicUsize,
    pub(crate) disposed: AtomicBool,
    pub(crate) alive: AtomicBool,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) registered: AtomicBool,
    pub(crate) availability_deferred: AtomicBool,
}

impl Transport {
    pub(crate) fn new(ctx: &Arc<DriverContext>, endpoint: SocketAddr, node: Weak<Node>) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            ctx: ctx.clone(),
            node,
            token: AtomicUsize::new(usize::MAX),
            submissions: ArrayQueue::new(SUBMISSION_DEPTH),
            pending_len: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            alive: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            availability_deferred: AtomicBool::new(false),
        })
    }

    /// Hand this transport to the driver thread, which owns the socket
    /// and performs the connect. Delayed transports wait one reconnect
    /// period before their first attempt.
    pub(crate) fn register_with_driver(self: &Arc<Self>, delayed: bool) {
        let _ = self.ctx.ctrl.send(Control::Register {
            transport: self.clone(),
            delayed,
        });
        let _ = self.ctx.waker.wake();
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_token(&self, token: Token) {
        self.token.store(token.0, Ordering::Release);
    }

    pub(crate) fn token(&self) -> Option<Token> {
        match self.token.load(Ordering::Acquire) {
            usize::MAX => None,
            token => Some(Token(token)),
        }
    }

    pub(crate) fn node_closing(&self) -> bool {
        self.node.upgrade().map(|n| n.is_closing()).unwrap_or(true)
    }

    pub(crate) fn node(&self) -> Option<Arc<Node>> {
        self.node.upgrade()
    }

    /// Submit a request. Returns false if the transport is disposed,
    /// shutting down, or its pending queue is saturated. Never blocks on
    /// network I/O: the write is initiated by the driver thread.
    pub fn try_send(&self, request: Arc<dyn Request>) -> bool {
        if self.is_disposed() || self.shutting_down.load(Ordering::Acquire) {
            return false;
        }

        let Some(token) = self.token() else {
            return false;
        };

        let cap = self.ctx.settings.queue_length as usize;
        if cap > 0 && self.pending_len.load(Ordering::Acquire) >= cap {
            // saturated: defer availability so the receive path hands the
            // transport back once the queue drains below the cap
            self.availability_deferred.store(true, Ordering::SeqCst);
            if self.pending_len.load(Ordering::SeqCst) == 0 {
                // the queue drained while the flag was being raised; undo
                // it unless the receive side already re-admitted us (the
                // compare and swap pair avoids a lost wakeup)
                let _ = self.availability_deferred.compare_exchange(
                    true,
                    false,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            return false;
        }

        if self.submissions.push(request).is_err() {
            return false;
        }

        if self.ctx.ctrl.send(Control::Submit(token)).is_err() {
            return false;
        }
        let _ = self.ctx.waker.wake();

        true
    }

    /// Idempotent shutdown. With a callback and a live connection, a
    /// `QUIT` request is sent and the callback fires on its reply before
    /// the transport is disposed; otherwise pending requests are failed
    /// and the transport is disposed immediately.
    pub fn shutdown(self: &Arc<Self>, callback: Option<Box<dyn FnOnce() + Send>>) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.ctx.ctrl.send(Control::Shutdown {
            transport: self.clone(),
            callback,
        });
        let _ = self.ctx.waker.wake();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Unconnected,
    Connecting,
    Authenticating,
    Ready,
    /// The socket failed on the receive side and was torn down. The
    /// transport stays pooled so the next send discovers the dead socket
    /// and spawns the replacement.
    Broken,
    Draining,
    Disposed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum IoResult {
    Keep,
    Remove,
}

pub(crate) struct Matched {
    pub request: Arc<dyn Request>,
    pub dequeued: bool,
}

/// Match a response header against the pending queue. A `Stat` row with
/// a body peeks the head, since one stat invocation streams multiple
/// rows before its empty terminator; everything else dequeues. A reply
/// to a quiet opcode, or an opaque that does not match the head, means
/// the stream is desynchronized.
pub(crate) fn dequeue_to_match(
    pending: &mut VecDeque<Arc<dyn Request>>,
    header: &ResponseHeader,
) -> Result<Matched, ProtocolError> {
    if let Some(opcode) = header.opcode() {
        if opcode.is_quiet() {
            return Err(ProtocolError::QuietReply(header.opcode));
        }
    }

    let peek = header.opcode() == Some(Opcode::Stat)
        && header.total_body_len != 0
        && header.status.is_ok();

    let request = if peek {
        pending.front().cloned().ok_or(ProtocolError::EmptyPending)?
    } else {
        pending.pop_front().ok_or(ProtocolError::EmptyPending)?
    };

    if request.request_id() != header.opaque {
        request.fail();
        return Err(ProtocolError::OpaqueMismatch {
            expected: request.request_id(),
            actual: header.opaque,
        });
    }

    Ok(Matched {
        request,
        dequeued: !peek,
    })
}

struct Outgoing {
    bytes: Vec<u8>,
    offset: usize,
}

/// Driver-owned I/O state for one transport: the socket, the pinned
/// buffers, the pending FIFO, and the connection state machine.
pub(crate) struct TransportIo {
    shared: Arc<Transport>,
    stream: Option<::net::TcpStream>,
    state: State,
    send_buffer: PinnedBuffer,
    outgoing: Option<Outgoing>,
    pending: VecDeque<Arc<dyn Request>>,
    header_buffer: PinnedBuffer,
    header: Option<ResponseHeader>,
    body_buffer: PinnedBuffer,
    body: Buffer,
    body_read: usize,
    auth: Option<Box<dyn AuthToken>>,
    deadline: Option<Instant>,
}

impl TransportIo {
    pub(crate) fn new(shared: Arc<Transport>) -> Self {
        let pinned = shared.ctx.settings.pinned_buffer_size;

        Self {
            stream: None,
            state: State::Unconnected,
            send_buffer: PinnedBuffer::new(pinned),
            outgoing: None,
            pending: VecDeque::new(),
            header_buffer: PinnedBuffer::new(HEADER_LEN),
            header: None,
            body_buffer: PinnedBuffer::new(pinned),
            body: Buffer::new(pinned),
            body_read: 0,
            auth: None,
            deadline: None,
            shared,
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether this io state belongs to the given handle. Slab tokens
    /// are reused, so control messages verify identity before acting.
    pub(crate) fn is_for(&self, transport: &Arc<Transport>) -> bool {
        Arc::ptr_eq(&self.shared, transport)
    }

    fn token(&self) -> Token {
        self.shared.token().unwrap_or(Token(usize::MAX))
    }

    fn endpoint(&self) -> SocketAddr {
        self.shared.endpoint
    }

    fn observers(&self) -> Arc<Observers> {
        self.shared.ctx.observers.clone()
    }

    /// Wait one reconnect period before attempting to connect. Used for
    /// replacement transports so a flapping endpoint is retried on the
    /// timer rather than in a tight loop.
    pub(crate) fn schedule_reconnect(&mut self, now: Instant) {
        self.state = State::Unconnected;
        self.deadline = Some(now + self.shared.ctx.settings.connect_timer_period);
    }

    pub(crate) fn start_connect(&mut self, registry: &Registry) {
        TRANSPORT_CONNECT.increment();

        match ::net::TcpStream::connect(self.endpoint()) {
            Ok(mut stream) => {
                if let Err(e) = stream.set_buffer_size(self.shared.ctx.settings.socket_buffer_size)
                {
                    debug!("could not set socket buffer size: {}", e);
                }
                if let Err(e) = stream.register(
                    registry,
                    self.token(),
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    return self.connect_failed(e);
                }
                self.stream = Some(stream);
                self.state = State::Connecting;
                self.deadline = None;
            }
            Err(e) => self.connect_failed(e),
        }
    }

    fn connect_failed(&mut self, error: Error) {
        TRANSPORT_CONNECT_EX.increment();
        debug!("connect to {} failed: {}", self.endpoint(), error);
        self.observers().transport_error(self.endpoint(), &error);

        self.stream = None;
        self.schedule_reconnect(Instant::now());
    }

    fn established(&mut self, registry: &Registry) -> IoResult {
        let error = match self.stream.as_ref().map(|s| s.take_error()) {
            Some(Ok(Some(e))) => Some(e),
            Some(Err(e)) => Some(e),
            Some(Ok(None)) => None,
            None => Some(Error::new(ErrorKind::NotConnected, "no socket")),
        };
        if let Some(e) = error {
            if let Some(mut stream) = self.stream.take() {
                let _ = stream.deregister(registry);
            }
            self.connect_failed(e);
            return IoResult::Keep;
        }

        if !self.stream.as_ref().map(|s| s.is_established()).unwrap_or(false) {
            // spurious wakeup while the connect is still in flight
            return IoResult::Keep;
        }

        debug!("connected to {}", self.endpoint());
        self.begin_auth(registry)
    }

    /// Run the authentication handshake if one is configured. For its
    /// duration the send-complete hook is swapped over to the handshake
    /// driver instead of pool re-admission; `finish_auth` restores it.
    fn begin_auth(&mut self, registry: &Registry) -> IoResult {
        if let Some(authenticator) = self.shared.ctx.authenticator.clone() {
            if let Some(mut token) = authenticator.create_token() {
                self.state = State::Authenticating;
                self.deadline = Some(Instant::now() + self.shared.ctx.settings.socket_timeout);

                let (status, request) = token.step(None);
                self.auth = Some(token);
                return self.advance_auth_step(registry, status, request);
            }
        }

        self.finish_auth(registry)
    }

    fn advance_auth_step(
        &mut self,
        registry: &Registry,
        status: Status,
        request: Option<Arc<dyn Request>>,
    ) -> IoResult {
        match (status, request) {
            (Status::NoError, _) => self.finish_auth(registry),
            (Status::AuthContinue, Some(request)) => {
                self.deadline = Some(Instant::now() + self.shared.ctx.settings.socket_timeout);
                self.start_outgoing(registry, request)
            }
            (Status::AuthContinue, None) => self.auth_failed(
                registry,
                Error::new(ErrorKind::Other, "authentication step produced no request"),
            ),
            (status, _) => self.auth_failed(
                registry,
                Error::new(
                    ErrorKind::PermissionDenied,
                    format!("authentication failed with status {:?}", status),
                ),
            ),
        }
    }

    fn advance_auth(&mut self, registry: &Registry, header: &ResponseHeader, value: &[u8]) -> IoResult {
        let Some(mut token) = self.auth.take() else {
            return IoResult::Keep;
        };
        let (status, request) = token.step(Some((header, value)));
        self.auth = Some(token);
        self.advance_auth_step(registry, status, request)
    }

    fn finish_auth(&mut self, registry: &Registry) -> IoResult {
        // the token drops here, releasing its resources; the
        // send-complete hook reverts to pool re-admission
        self.auth = None;
        self.deadline = None;
        self.state = State::Ready;
        self.shared.alive.store(true, Ordering::Release);

        if let Some(node) = self.shared.node() {
            node.register(&self.shared);
        }
        self.admit();

        // anything queued while the handshake ran goes out now
        self.on_submit(registry)
    }

    /// Authentication failures dispose the transport without a
    /// replacement: retrying a configuration error is pointless.
    fn auth_failed(&mut self, registry: &Registry, error: Error) -> IoResult {
        error!("authentication failed for {}: {}", self.endpoint(), error);
        self.observers().transport_error(self.endpoint(), &error);
        self.auth = None;
        self.dispose(registry);
        IoResult::Remove
    }

    pub(crate) fn on_event(&mut self, registry: &Registry, event: &::net::event::Event) -> IoResult {
        match self.state {
            State::Connecting => {
                if event.is_error() {
                    let error = self
                        .stream
                        .as_ref()
                        .and_then(|s| s.take_error().ok().flatten())
                        .unwrap_or_else(|| Error::new(ErrorKind::Other, "connect failed"));
                    if let Some(mut stream) = self.stream.take() {
                        let _ = stream.deregister(registry);
                    }
                    self.connect_failed(error);
                    return IoResult::Keep;
                }
                if event.is_writable() {
                    let result = self.established(registry);
                    if result == IoResult::Remove {
                        return result;
                    }
                    // a submission may have queued while connecting
                    if self.state == State::Ready {
                        return self.on_submit(registry);
                    }
                }
                IoResult::Keep
            }
            State::Authenticating | State::Ready | State::Draining => {
                if event.is_error() {
                    return self.receive_failure(
                        registry,
                        Error::new(ErrorKind::Other, "socket error event"),
                    );
                }
                if event.is_writable() {
                    let result = self.continue_send(registry);
                    if result == IoResult::Remove {
                        return result;
                    }
                }
                if event.is_readable() {
                    return self.drive_receive(registry);
                }
                IoResult::Keep
            }
            State::Unconnected | State::Broken | State::Disposed => IoResult::Keep,
        }
    }

    pub(crate) fn on_tick(&mut self, registry: &Registry, now: Instant) -> IoResult {
        match self.state {
            State::Unconnected => {
                if self.deadline.map(|d| now >= d).unwrap_or(false) {
                    self.start_connect(registry);
                }
                IoResult::Keep
            }
            State::Authenticating => {
                if self.deadline.map(|d| now >= d).unwrap_or(false) {
                    return self.auth_failed(
                        registry,
                        Error::new(ErrorKind::TimedOut, "authentication timed out"),
                    );
                }
                IoResult::Keep
            }
            _ => IoResult::Keep,
        }
    }

    /// Drain the submission queue, sending one request at a time. The
    /// current send must complete before the next request is staged so
    /// the pending queue order matches the wire order.
    pub(crate) fn on_submit(&mut self, registry: &Registry) -> IoResult {
        loop {
            if self.outgoing.is_some() {
                return IoResult::Keep;
            }

            match self.state {
                State::Ready | State::Draining => {}
                State::Broken => {
                    // the previous receive failure left the socket dead;
                    // this send discovers it
                    return self.send_failure(
                        registry,
                        Error::new(ErrorKind::NotConnected, "socket closed"),
                    );
                }
                State::Disposed => {
                    while let Some(request) = self.shared.submissions.pop() {
                        request.fail();
                    }
                    return IoResult::Keep;
                }
                // not connected yet; leave the submission queued
                State::Unconnected | State::Connecting | State::Authenticating => {
                    return IoResult::Keep;
                }
            }

            let Some(request) = self.shared.submissions.pop() else {
                return IoResult::Keep;
            };

            let result = self.start_outgoing(registry, request);
            if result == IoResult::Remove {
                return result;
            }
        }
    }

    /// Begin writing one request. The request joins the pending FIFO as
    /// its first byte is handed to the socket, which keeps the queue in
    /// wire order.
    fn start_outgoing(&mut self, registry: &Registry, request: Arc<dyn Request>) -> IoResult {
        TRANSPORT_SEND.increment();

        let bytes = request.query_buffer();
        self.pending.push_back(request);
        self.shared.pending_len.fetch_add(1, Ordering::AcqRel);
        self.outgoing = Some(Outgoing { bytes, offset: 0 });

        self.continue_send(registry)
    }

    fn continue_send(&mut self, registry: &Registry) -> IoResult {
        loop {
            if self.outgoing.is_none() {
                // spurious writable event
                return IoResult::Keep;
            }

            if self.send_buffer.is_empty() {
                let finished = self
                    .outgoing
                    .as_ref()
                    .map(|o| o.offset == o.bytes.len())
                    .unwrap_or(true);

                if finished {
                    self.outgoing = None;
                    self.send_complete();
                    return self.on_submit(registry);
                }

                // walk the frame through the pinned buffer in chunks
                if let Some(outgoing) = self.outgoing.as_mut() {
                    let staged = self.send_buffer.put_truncated(&outgoing.bytes[outgoing.offset..]);
                    outgoing.offset += staged;
                }
            }

            let result = match self.stream.as_mut() {
                Some(stream) => stream.write(self.send_buffer.chunk()),
                None => Err(Error::new(ErrorKind::NotConnected, "no socket")),
            };

            match result {
                Ok(0) => {
                    return self.send_failure(registry, Error::from(ErrorKind::WriteZero));
                }
                Ok(n) => {
                    // a partial write resumes from the current position
                    self.send_buffer.advance(n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    // the writable event resumes this send
                    return IoResult::Keep;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return self.send_failure(registry, e);
                }
            }
        }
    }

    /// The send-complete hook. During authentication the handshake
    /// driver owns it; afterwards it re-admits the transport into the
    /// node's available pool unless the pending queue is saturated.
    fn send_complete(&mut self) {
        if self.state != State::Ready {
            return;
        }

        let cap = self.shared.ctx.settings.queue_length as usize;
        if cap > 0 && self.shared.pending_len.load(Ordering::Acquire) >= cap {
            self.shared
                .availability_deferred
                .store(true, Ordering::SeqCst);
            if self.shared.pending_len.load(Ordering::SeqCst) == 0 {
                let _ = self.shared.availability_deferred.compare_exchange(
                    true,
                    false,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            return;
        }

        self.admit();
    }

    fn admit(&mut self) {
        if self.shared.availability_deferred.load(Ordering::SeqCst) {
            return;
        }
        if let Some(node) = self.shared.node() {
            node.release(&self.shared);
        }
    }

    /// Re-admission from the receive side once a saturated pending queue
    /// drains below the cap. The compare and swap pairs with the
    /// submission path raising the flag.
    fn maybe_readmit(&mut self) {
        let cap = self.shared.ctx.settings.queue_length as usize;
        if cap == 0 {
            return;
        }

        if self.shared.pending_len.load(Ordering::SeqCst) < cap
            && self
                .shared
                .availability_deferred
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            if let Some(node) = self.shared.node() {
                node.release(&self.shared);
            }
        }
    }

    fn drive_receive(&mut self, registry: &Registry) -> IoResult {
        loop {
            if self.stream.is_none() {
                return IoResult::Keep;
            }

            if self.header.is_none() {
                // read exactly one header, looping on short reads
                while self.header_buffer.remaining() < HEADER_LEN {
                    let result = match self.stream.as_mut() {
                        Some(stream) => stream.read(self.header_buffer.chunk_mut()),
                        None => return IoResult::Keep,
                    };
                    match result {
                        Ok(0) => return self.hangup(registry),
                        Ok(n) => self.header_buffer.advance_mut(n),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return IoResult::Keep,
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => return self.receive_failure(registry, e),
                    }
                }

                match ResponseHeader::parse(self.header_buffer.chunk()) {
                    Ok(header) => {
                        self.header = Some(header);
                        self.body_read = 0;
                        self.body.clear();
                        self.body_buffer.clear();
                    }
                    Err(e) => return self.protocol_failure(registry, ProtocolError::from(e)),
                }
            }

            let total = self
                .header
                .map(|h| h.total_body_len as usize)
                .unwrap_or(0);

            // read the body in pinned-buffer-sized chunks, spilling into
            // the growable accumulator when it does not fit
            while self.body_read < total {
                if self.body_buffer.remaining_mut() == 0 {
                    self.body.put_slice(self.body_buffer.chunk());
                    self.body_buffer.clear();
                }

                let want = core::cmp::min(total - self.body_read, self.body_buffer.remaining_mut());
                let result = match self.stream.as_mut() {
                    Some(stream) => stream.read(&mut self.body_buffer.chunk_mut()[..want]),
                    None => return IoResult::Keep,
                };
                match result {
                    Ok(0) => return self.hangup(registry),
                    Ok(n) => {
                        self.body_buffer.advance_mut(n);
                        self.body_read += n;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return IoResult::Keep,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => return self.receive_failure(registry, e),
                }
            }

            let result = self.dispatch_response(registry);
            if result == IoResult::Remove {
                return result;
            }
        }
    }

    fn dispatch_response(&mut self, registry: &Registry) -> IoResult {
        let Some(header) = self.header.take() else {
            return IoResult::Keep;
        };
        TRANSPORT_RECV.increment();

        let matched = match dequeue_to_match(&mut self.pending, &header) {
            Ok(matched) => matched,
            Err(e) => return self.protocol_failure(registry, e),
        };
        if matched.dequeued {
            self.shared.pending_len.fetch_sub(1, Ordering::AcqRel);
        }

        let total = header.total_body_len as usize;
        let spilled = total > self.body_buffer.capacity();
        let mut auth_reply = None;

        {
            if spilled {
                self.body.put_slice(self.body_buffer.chunk());
                self.body_buffer.clear();
            }
            let body: &[u8] = if spilled {
                self.body.borrow()
            } else {
                self.body_buffer.chunk()
            };

            let extras_len = header.extras_len as usize;
            let key_len = header.key_len as usize;
            let extras = (extras_len > 0).then(|| &body[..extras_len]);
            let key = (key_len > 0).then(|| &body[extras_len..extras_len + key_len]);
            let value = (header.value_len() > 0).then(|| &body[extras_len + key_len..total]);

            if header.status.is_ok() {
                self.shared
                    .ctx
                    .observers
                    .memcache_response(&header, &*matched.request);
            } else {
                self.shared
                    .ctx
                    .observers
                    .memcache_error(&header, &*matched.request);
            }

            let response = Response {
                header,
                key,
                extras,
                value,
            };
            matched.request.handle_response(&response);

            if self.state == State::Authenticating {
                auth_reply = Some(value.map(|v| v.to_vec()).unwrap_or_default());
            }
        }

        // reset for the next response
        self.header_buffer.clear();
        self.body_buffer.clear();
        self.body.clear();
        self.body_read = 0;

        if matched.dequeued {
            self.maybe_readmit();
        }

        if self.state == State::Draining && self.pending.is_empty() {
            // the quit reply arrived and the stream is drained
            self.dispose(registry);
            return IoResult::Remove;
        }

        if let Some(value) = auth_reply {
            return self.advance_auth(registry, &header, &value);
        }

        IoResult::Keep
    }

    fn hangup(&mut self, registry: &Registry) -> IoResult {
        if self.state == State::Draining {
            // the server closed the stream after acknowledging quit
            self.dispose(registry);
            return IoResult::Remove;
        }
        self.receive_failure(registry, Error::new(ErrorKind::Other, "server hangup"))
    }

    fn protocol_failure(&mut self, registry: &Registry, error: ProtocolError) -> IoResult {
        error!("protocol error on {}: {}", self.endpoint(), error);
        self.receive_failure(registry, Error::new(ErrorKind::InvalidData, error))
    }

    /// A failure on the receive path. The socket is torn down and
    /// pending requests fail, but no replacement is allocated here: the
    /// transport re-enters the pool so the next send takes the
    /// replacement path.
    fn receive_failure(&mut self, registry: &Registry, error: Error) -> IoResult {
        if self.state == State::Authenticating {
            return self.auth_failed(registry, error);
        }
        if self.state == State::Draining || self.state == State::Disposed {
            self.dispose(registry);
            return IoResult::Remove;
        }

        TRANSPORT_RECV_EX.increment();
        error!("transport error on {}: {}", self.endpoint(), error);
        self.observers().transport_error(self.endpoint(), &error);

        self.fail_pending();
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.deregister(registry);
        }
        self.reset_io_state();
        self.state = State::Broken;
        self.shared.alive.store(false, Ordering::Release);

        // re-emit availability so the node can prune the dead transport
        if let Some(node) = self.shared.node() {
            node.release(&self.shared);
        }

        IoResult::Keep
    }

    /// A failure on the send path. The transport is fatal here: pending
    /// requests fail and a replacement transport takes over the pool
    /// slot, reconnecting on the timer.
    fn send_failure(&mut self, registry: &Registry, error: Error) -> IoResult {
        if self.state == State::Authenticating {
            return self.auth_failed(registry, error);
        }
        if self.state == State::Draining || self.state == State::Disposed {
            self.dispose(registry);
            return IoResult::Remove;
        }

        TRANSPORT_SEND_EX.increment();
        error!("transport error on {}: {}", self.endpoint(), error);
        self.observers().transport_error(self.endpoint(), &error);

        if !self.shared.node_closing() {
            if let Some(node) = self.shared.node() {
                node.replace(&self.shared);
            }
        }

        TRANSPORT_DEAD.increment();
        self.observers().transport_dead(self.endpoint());
        self.dispose(registry);

        IoResult::Remove
    }

    pub(crate) fn on_shutdown(
        &mut self,
        registry: &Registry,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> IoResult {
        match callback {
            Some(callback) if self.state == State::Ready && self.stream.is_some() => {
                self.state = State::Draining;
                let quit: Arc<dyn Request> = Arc::new(QuitRequest::new(callback));
                if self.outgoing.is_some() {
                    // queue behind the in-flight send
                    if self.shared.submissions.push(quit).is_err() {
                        self.dispose(registry);
                        return IoResult::Remove;
                    }
                    IoResult::Keep
                } else {
                    self.start_outgoing(registry, quit)
                }
            }
            _ => {
                self.dispose(registry);
                IoResult::Remove
            }
        }
    }

    fn reset_io_state(&mut self) {
        self.outgoing = None;
        self.send_buffer.clear();
        self.header = None;
        self.header_buffer.clear();
        self.body_buffer.clear();
        self.body.clear();
        self.body_read = 0;
    }

    fn fail_pending(&mut self) {
        self.outgoing = None;
        while let Some(request) = self.pending.pop_front() {
            request.fail();
        }
        self.shared.pending_len.store(0, Ordering::SeqCst);
        while let Some(request) = self.shared.submissions.pop() {
            request.fail();
        }
    }

    /// Release the socket and buffers exactly once; subsequent calls are
    /// no-ops.
    pub(crate) fn dispose(&mut self, registry: &Registry) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        if self.state == State::Disposed {
            return;
        }
        self.state = State::Disposed;
        self.shared.alive.store(false, Ordering::SeqCst);

        self.fail_pending();
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.deregister(registry);
        }
        self.auth = None;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_context;
    use std::sync::atomic::AtomicUsize;

    struct TestRequest {
        id: u32,
        failed: AtomicUsize,
    }

    impl TestRequest {
        fn new(id: u32) -> Arc<Self> {
            Arc::new(Self {
                id,
                failed: AtomicUsize::new(0),
            })
        }
    }

    impl Request for TestRequest {
        fn request_id(&self) -> u32 {
            self.id
        }

        fn key(&self) -> &[u8] {
            &[]
        }

        fn replicas(&self) -> u8 {
            0
        }

        fn policy(&self) -> ReplyPolicy {
            ReplyPolicy::AnyOk
        }

        fn vbucket(&self) -> u16 {
            0
        }

        fn set_vbucket(&self, _vbucket: u16) {}

        fn query_buffer(&self) -> Vec<u8> {
            let mut frame = protocol_binary::RequestFrame::new(Opcode::Get, b"key");
            frame.opaque = self.id;
            frame.to_vec()
        }

        fn handle_response(&self, _response: &Response<'_>) {}

        fn fail(&self) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn header(opcode: Opcode, opaque: u32, status: Status, total_body_len: u32) -> ResponseHeader {
        ResponseHeader {
            opcode: opcode.into(),
            key_len: 0,
            extras_len: 0,
            data_type: 0,
            status,
            total_body_len,
            opaque,
            cas: 0,
        }
    }

    #[test]
    fn match_dequeues_head() {
        let mut pending: VecDeque<Arc<dyn Request>> = VecDeque::new();
        pending.push_back(TestRequest::new(1));
        pending.push_back(TestRequest::new(2));

        let matched =
            dequeue_to_match(&mut pending, &header(Opcode::Get, 1, Status::NoError, 0)).unwrap();
        assert!(matched.dequeued);
        assert_eq!(matched.request.request_id(), 1);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn match_peeks_stat_rows() {
        let mut pending: VecDeque<Arc<dyn Request>> = VecDeque::new();
        pending.push_back(TestRequest::new(1));

        // a stat row with a body peeks
        let matched =
            dequeue_to_match(&mut pending, &header(Opcode::Stat, 1, Status::NoError, 8)).unwrap();
        assert!(!matched.dequeued);
        assert_eq!(pending.len(), 1);

        // the empty terminator dequeues
        let matched =
            dequeue_to_match(&mut pending, &header(Opcode::Stat, 1, Status::NoError, 0)).unwrap();
        assert!(matched.dequeued);
        assert!(pending.is_empty());
    }

    #[test]
    fn match_rejects_quiet_reply() {
        let mut pending: VecDeque<Arc<dyn Request>> = VecDeque::new();
        pending.push_back(TestRequest::new(1));

        let result = dequeue_to_match(&mut pending, &header(Opcode::SetQ, 1, Status::NoError, 0));
        assert!(matches!(result, Err(ProtocolError::QuietReply(0x11))));
        // quiet replies are rejected before touching the queue
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn match_fails_on_opaque_mismatch() {
        let mut pending: VecDeque<Arc<dyn Request>> = VecDeque::new();
        let request = TestRequest::new(1);
        pending.push_back(request.clone());

        let result = dequeue_to_match(&mut pending, &header(Opcode::Get, 9, Status::NoError, 0));
        assert!(matches!(
            result,
            Err(ProtocolError::OpaqueMismatch {
                expected: 1,
                actual: 9
            })
        ));
        assert_eq!(request.failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn match_empty_pending() {
        let mut pending: VecDeque<Arc<dyn Request>> = VecDeque::new();
        let result = dequeue_to_match(&mut pending, &header(Opcode::Get, 1, Status::NoError, 0));
        assert!(matches!(result, Err(ProtocolError::EmptyPending)));
    }

    #[test]
    fn try_send_backpressure() {
        let (ctx, _rx) = test_context(2);
        let transport = Transport::new(&ctx, "127.0.0.1:11211".parse().unwrap(), Weak::new());
        transport.set_token(Token(0));

        // a saturated pending queue defers availability and refuses
        transport.pending_len.store(2, Ordering::SeqCst);
        assert!(!transport.try_send(TestRequest::new(1)));
        assert!(transport.availability_deferred.load(Ordering::SeqCst));

        // the receive side drains below the cap and takes the flag back
        transport.pending_len.store(1, Ordering::SeqCst);
        let mut io = TransportIo::new(transport.clone());
        io.maybe_readmit();
        assert!(!transport.availability_deferred.load(Ordering::SeqCst));

        // with the queue drained the transport accepts again
        assert!(transport.try_send(TestRequest::new(2)));
    }

    #[test]
    fn try_send_refuses_when_disposed() {
        let (ctx, _rx) = test_context(0);
        let transport = Transport::new(&ctx, "127.0.0.1:11211".parse().unwrap(), Weak::new());
        transport.set_token(Token(0));

        assert!(transport.try_send(TestRequest::new(1)));

        transport.disposed.store(true, Ordering::SeqCst);
        assert!(!transport.try_send(TestRequest::new(2)));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (ctx, rx) = test_context(0);
        let transport = Transport::new(&ctx, "127.0.0.1:11211".parse().unwrap(), Weak::new());
        transport.set_token(Token(3));

        transport.shutdown(None);
        transport.shutdown(None);

        let mut shutdowns = 0;
        while let Ok(control) = rx.try_recv() {
            if matches!(control, Control::Shutdown { .. }) {
                shutdowns += 1;
            }
        }
        assert_eq!(shutdowns, 1);
    }
}
