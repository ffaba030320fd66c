// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;
use std::net::SocketAddr;

pub type TransportErrorFn = Box<dyn Fn(SocketAddr, &std::io::Error) + Send + Sync>;
pub type MemcacheErrorFn = Box<dyn Fn(&ResponseHeader, &dyn Request) + Send + Sync>;
pub type MemcacheResponseFn = Box<dyn Fn(&ResponseHeader, &dyn Request) + Send + Sync>;
pub type TransportDeadFn = Box<dyn Fn(SocketAddr) + Send + Sync>;

/// Observer slots for the transport events. Each slot fans out to every
/// registered callback; the set is fixed at construction.
#[derive(Default)]
pub struct Observers {
    transport_error: Vec<TransportErrorFn>,
    memcache_error: Vec<MemcacheErrorFn>,
    memcache_response: Vec<MemcacheResponseFn>,
    transport_dead: Vec<TransportDeadFn>,
}

impl Observers {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn on_transport_error(&mut self, f: impl Fn(SocketAddr, &std::io::Error) + Send + Sync + 'static) {
        self.transport_error.push(Box::new(f));
    }

    pub fn on_memcache_error(&mut self, f: impl Fn(&ResponseHeader, &dyn Request) + Send + Sync + 'static) {
        self.memcache_error.push(Box::new(f));
    }

    pub fn on_memcache_response(&mut self, f: impl Fn(&ResponseHeader, &dyn Request) + Send + Sync + 'static) {
        self.memcache_response.push(Box::new(f));
    }

    pub fn on_transport_dead(&mut self, f: impl Fn(SocketAddr) + Send + Sync + 'static) {
        self.transport_dead.push(Box::new(f));
    }

    pub(crate) fn transport_error(&self, endpoint: SocketAddr, error: &std::io::Error) {
        for f in &self.transport_error {
            f(endpoint, error);
        }
    }

    pub(crate) fn memcache_error(&self, header: &ResponseHeader, request: &dyn Request) {
        for f in &self.memcache_error {
            f(header, request);
        }
    }

    pub(crate) fn memcache_response(&self, header: &ResponseHeader, request: &dyn Request) {
        for f in &self.memcache_response {
            f(header, request);
        }
    }

    pub(crate) fn transport_dead(&self, endpoint: SocketAddr) {
        for f in &self.transport_dead {
            f(endpoint);
        }
    }
}
