// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The driver owns every socket in the cluster and runs the event loop
//! on its own thread. Callers hand it work through a control channel
//! paired with a waker; the driver is the only thread that initiates
//! writes, which serializes send initiation per transport and keeps the
//! pending queues in wire order without locks.

use crate::transport::{IoResult, TransportIo};
use crate::*;
use crossbeam_channel::{Receiver, Sender};
use slab::Slab;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::net::{Events, Poll, Token, Waker};

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

const NEVENT: usize = 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) enum Control {
    Register {
        transport: Arc<Transport>,
        delayed: bool,
    },
    Submit(Token),
    Shutdown {
        transport: Arc<Transport>,
        callback: Option<Box<dyn FnOnce() + Send>>,
    },
    Stop,
}

/// Connection settings shared by every transport the driver owns.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub pinned_buffer_size: usize,
    pub socket_buffer_size: usize,
    pub connect_timer_period: Duration,
    pub socket_timeout: Duration,
    pub queue_length: u32,
}

impl From<&config::Connection> for Settings {
    fn from(config: &config::Connection) -> Self {
        Self {
            pinned_buffer_size: config.pinned_buffer_size(),
            socket_buffer_size: config.socket_buffer_size(),
            connect_timer_period: Duration::from_millis(config.connect_timer_period_ms()),
            socket_timeout: Duration::from_millis(config.socket_timeout_ms()),
            queue_length: config.queue_length(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&config::Connection::default())
    }
}

/// Shared context handed to every transport and node: the way into the
/// driver thread plus the pieces of configuration they act on.
pub struct DriverContext {
    pub(crate) ctrl: Sender<Control>,
    pub(crate) waker: Arc<Waker>,
    pub(crate) settings: Settings,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) observers: Arc<Observers>,
}

pub(crate) struct Driver {
    poll: Poll,
    ctrl: Receiver<Control>,
    transports: Slab<TransportIo>,
}

impl Driver {
    pub(crate) fn new(poll: Poll, ctrl: Receiver<Control>) -> Self {
        Self {
            poll,
            ctrl,
            transports: Slab::new(),
        }
    }

    pub(crate) fn run(&mut self) {
        let mut events = Events::with_capacity(NEVENT);

        loop {
            let timeout = self.poll_timeout();
            if self.poll.poll(&mut events, Some(timeout)).is_err() {
                error!("Error polling");
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {
                        // control messages are drained below
                    }
                    token => self.transport_event(token, event),
                }
            }

            if self.drain_control() {
                return;
            }

            self.tick();
        }
    }

    fn transport_event(&mut self, token: Token, event: &::net::event::Event) {
        let Some(io) = self.transports.get_mut(token.0) else {
            return;
        };
        if io.on_event(self.poll.registry(), event) == IoResult::Remove {
            self.transports.remove(token.0);
        }
    }

    /// Handle all queued control messages. Returns true on `Stop`, after
    /// force-disposing every remaining transport.
    fn drain_control(&mut self) -> bool {
        while let Ok(control) = self.ctrl.try_recv() {
            match control {
                Control::Register { transport, delayed } => {
                    let key = self.transports.insert(TransportIo::new(transport.clone()));
                    transport.set_token(Token(key));

                    if let Some(io) = self.transports.get_mut(key) {
                        if delayed {
                            io.schedule_reconnect(Instant::now());
                        } else {
                            io.start_connect(self.poll.registry());
                        }
                    }
                }
                Control::Submit(token) => {
                    if let Some(io) = self.transports.get_mut(token.0) {
                        if io.on_submit(self.poll.registry()) == IoResult::Remove {
                            self.transports.remove(token.0);
                        }
                    }
                }
                Control::Shutdown {
                    transport,
                    callback,
                } => {
                    let Some(token) = transport.token() else {
                        continue;
                    };
                    if let Some(io) = self.transports.get_mut(token.0) {
                        // tokens are reused; only act on the right transport
                        if !io.is_for(&transport) {
                            continue;
                        }
                        if io.on_shutdown(self.poll.registry(), callback) == IoResult::Remove {
                            self.transports.remove(token.0);
                        }
                    }
                }
                Control::Stop => {
                    for (_, io) in self.transports.iter_mut() {
                        io.dispose(self.poll.registry());
                    }
                    self.transports.clear();
                    return true;
                }
            }
        }

        false
    }

    /// Fire reconnect and authentication deadlines.
    fn tick(&mut self) {
        let now = Instant::now();

        let mut dead = Vec::new();
        for (key, io) in self.transports.iter_mut() {
            if io.on_tick(self.poll.registry(), now) == IoResult::Remove {
                dead.push(key);
            }
        }
        for key in dead {
            self.transports.remove(key);
        }
    }

    /// Sleep until the next timer deadline, bounded by the default tick.
    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = DEFAULT_TIMEOUT;

        for (_, io) in self.transports.iter() {
            if let Some(deadline) = io.next_deadline() {
                timeout = timeout.min(deadline.saturating_duration_since(now));
            }
        }

        timeout
    }
}

#[cfg(test)]
pub(crate) fn test_context(queue_length: u32) -> (Arc<DriverContext>, Receiver<Control>) {
    let poll = Poll::new().unwrap();
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).unwrap());
    // keep the poll instance alive for the waker registration
    std::mem::forget(poll);

    let (tx, rx) = crossbeam_channel::unbounded();

    let settings = Settings {
        queue_length,
        ..Default::default()
    };

    (
        Arc::new(DriverContext {
            ctrl: tx,
            waker,
            settings,
            authenticator: None,
            observers: Arc::new(Observers::new()),
        }),
        rx,
    )
}
