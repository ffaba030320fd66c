// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A node owns the pool of transports bound to one server endpoint.
//! Dispatch pops a transport from the available stack; an accepting
//! transport re-admits itself once its send completes, so a transport is
//! never in the pool while it is sending. A node with no accepting
//! transport fails the request and marks itself dead until a transport
//! recovers.

use crate::driver::DriverContext;
use crate::*;
use metriken::*;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[metric(
    name = "node_dispatch_ex",
    description = "requests refused because no transport could accept them"
)]
pub static NODE_DISPATCH_EX: Counter = Counter::new();

/// Creates transports. The default factory builds real connections; a
/// substitute can wrap or replace it for tests.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        ctx: &Arc<DriverContext>,
        endpoint: SocketAddr,
        node: &Weak<Node>,
        delayed: bool,
    ) -> Arc<Transport>;
}

pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        ctx: &Arc<DriverContext>,
        endpoint: SocketAddr,
        node: &Weak<Node>,
        delayed: bool,
    ) -> Arc<Transport> {
        let transport = Transport::new(ctx, endpoint, node.clone());
        transport.register_with_driver(delayed);
        transport
    }
}

/// Creates nodes, one per endpoint.
pub trait NodeFactory: Send + Sync {
    fn create(
        &self,
        ctx: &Arc<DriverContext>,
        endpoint: SocketAddr,
        pool_size: usize,
        transports: Arc<dyn TransportFactory>,
    ) -> Arc<Node>;
}

pub struct DefaultNodeFactory;

impl NodeFactory for DefaultNodeFactory {
    fn create(
        &self,
        ctx: &Arc<DriverContext>,
        endpoint: SocketAddr,
        pool_size: usize,
        transports: Arc<dyn TransportFactory>,
    ) -> Arc<Node> {
        Node::new(ctx, endpoint, pool_size, transports)
    }
}

pub struct Node {
    endpoint: SocketAddr,
    ctx: Arc<DriverContext>,
    pool_size: usize,
    factory: Arc<dyn TransportFactory>,
    transports: Mutex<Vec<Arc<Transport>>>,
    available: Mutex<Vec<Arc<Transport>>>,
    dead: AtomicBool,
    closing: AtomicBool,
}

impl Node {
    pub fn new(
        ctx: &Arc<DriverContext>,
        endpoint: SocketAddr,
        pool_size: usize,
        factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let node = Arc::new(Self {
            endpoint,
            ctx: ctx.clone(),
            pool_size,
            factory,
            transports: Mutex::new(Vec::new()),
            available: Mutex::new(Vec::new()),
            dead: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });
        node.start();
        node
    }

    fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut transports = self.transports.lock().unwrap();
        for _ in 0..self.pool_size {
            transports.push(self.factory.create(&self.ctx, self.endpoint, &weak, false));
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Dispatch one request. Transports are tried in stack order; one
    /// that accepts is left out of the pool and re-admits itself on
    /// send-complete. With no accepting transport the request fails and
    /// the node is dead until a transport recovers.
    pub fn try_send(&self, request: Arc<dyn Request>) -> bool {
        loop {
            let transport = self.available.lock().unwrap().pop();
            match transport {
                Some(transport) => {
                    if transport.try_send(request.clone()) {
                        return true;
                    }
                }
                None => break,
            }
        }

        NODE_DISPATCH_EX.increment();
        self.dead.store(true, Ordering::Release);
        request.fail();
        false
    }

    /// The on-register hook: a transport completed its handshake and
    /// joined the pool membership.
    pub(crate) fn register(&self, transport: &Arc<Transport>) {
        transport.registered.store(true, Ordering::Release);
        debug!("transport registered for {}", self.endpoint);
    }

    /// The on-available hook: hand a transport back to the available
    /// stack. A transport appears at most once.
    pub(crate) fn release(&self, transport: &Arc<Transport>) {
        if self.is_closing()
            || transport.is_disposed()
            || transport.shutting_down.load(Ordering::Acquire)
            || !transport.is_registered()
        {
            return;
        }

        let mut available = self.available.lock().unwrap();
        if available.iter().any(|t| Arc::ptr_eq(t, transport)) {
            return;
        }
        available.push(transport.clone());
        drop(available);

        // a usable transport revives the node
        self.dead.store(false, Ordering::Release);
    }

    /// Swap in a replacement transport after a fatal send failure so the
    /// pool keeps its slot. The replacement reconnects on the timer.
    pub(crate) fn replace(self: &Arc<Self>, old: &Arc<Transport>) {
        if self.is_closing() {
            return;
        }

        let weak = Arc::downgrade(self);
        let fresh = self.factory.create(&self.ctx, self.endpoint, &weak, true);

        let mut transports = self.transports.lock().unwrap();
        if let Some(slot) = transports.iter_mut().find(|t| Arc::ptr_eq(t, old)) {
            *slot = fresh;
        } else {
            transports.push(fresh);
        }
    }

    /// Cooperative shutdown: a best-effort `QUIT` on each live transport
    /// with a one-shot callback, immediate disposal for the rest. The
    /// cluster force-disposes stragglers after the grace period.
    pub fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        self.available.lock().unwrap().clear();

        let transports = self.transports.lock().unwrap().clone();
        for transport in transports {
            if transport.is_alive() {
                let endpoint = transport.endpoint();
                transport.shutdown(Some(Box::new(move || {
                    trace!("quit acknowledged for {}", endpoint);
                })));
            } else {
                transport.shutdown(None);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_dead(&self, dead: bool) {
        self.dead.store(dead, Ordering::Release);
    }
}
