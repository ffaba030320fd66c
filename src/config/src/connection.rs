// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const PINNED_BUFFER_SIZE: usize = 4096;
const SOCKET_BUFFER_SIZE: usize = 0;
const CONNECT_TIMER_PERIOD_MS: u64 = 2000;
const SOCKET_TIMEOUT_MS: u64 = 10_000;
const QUEUE_LENGTH: u32 = 0;

// helper functions
fn pinned_buffer_size() -> usize {
    PINNED_BUFFER_SIZE
}

fn socket_buffer_size() -> usize {
    SOCKET_BUFFER_SIZE
}

fn connect_timer_period_ms() -> u64 {
    CONNECT_TIMER_PERIOD_MS
}

fn socket_timeout_ms() -> u64 {
    SOCKET_TIMEOUT_MS
}

fn queue_length() -> u32 {
    QUEUE_LENGTH
}

// definitions
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Connection {
    /// size of the per-transport pinned send/receive buffers
    #[serde(default = "pinned_buffer_size")]
    pinned_buffer_size: usize,
    /// SO_RCVBUF/SO_SNDBUF value, zero leaves the kernel default
    #[serde(default = "socket_buffer_size")]
    socket_buffer_size: usize,
    /// backoff between reconnect attempts, in milliseconds
    #[serde(default = "connect_timer_period_ms")]
    connect_timer_period_ms: u64,
    /// bound on each authentication step, in milliseconds
    #[serde(default = "socket_timeout_ms")]
    socket_timeout_ms: u64,
    /// per-transport pending request cap, zero is unbounded
    #[serde(default = "queue_length")]
    queue_length: u32,
}

// implementation
impl Connection {
    pub fn pinned_buffer_size(&self) -> usize {
        // the receive path depends on being able to hold a full header
        std::cmp::max(self.pinned_buffer_size, 64)
    }

    pub fn socket_buffer_size(&self) -> usize {
        self.socket_buffer_size
    }

    pub fn connect_timer_period_ms(&self) -> u64 {
        self.connect_timer_period_ms
    }

    pub fn socket_timeout_ms(&self) -> u64 {
        self.socket_timeout_ms
    }

    pub fn queue_length(&self) -> u32 {
        self.queue_length
    }
}

// trait implementations
impl Default for Connection {
    fn default() -> Self {
        Self {
            pinned_buffer_size: pinned_buffer_size(),
            socket_buffer_size: socket_buffer_size(),
            connect_timer_period_ms: connect_timer_period_ms(),
            socket_timeout_ms: socket_timeout_ms(),
            queue_length: queue_length(),
        }
    }
}

// trait definitions
pub trait ConnectionConfig {
    fn connection(&self) -> &Connection;
}
