// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Byte buffers for connection I/O: a fixed-capacity `PinnedBuffer` that
//! is owned by one connection and reused for every socket read and write,
//! and a growable `Buffer` used to accumulate response bodies that do not
//! fit the pinned region.

#[macro_use]
extern crate log;

pub use bytes::Buf;

use core::borrow::Borrow;
use metriken::*;

#[metric(
    name = "buffer_byte",
    description = "current size of the connection buffers in bytes"
)]
pub static BUFFER_BYTE: Gauge = Gauge::new();

/// A fixed-capacity byte region owned by a single connection. The buffer
/// never reallocates; writers copy in as much as fits and drain it before
/// staging more.
pub struct PinnedBuffer {
    data: Box<[u8]>,
    read_offset: usize,
    write_offset: usize,
}

impl PinnedBuffer {
    pub fn new(capacity: usize) -> Self {
        BUFFER_BYTE.add(capacity as _);

        Self {
            data: vec![0; capacity].into_boxed_slice(),
            read_offset: 0,
            write_offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes staged and not yet consumed.
    pub fn remaining(&self) -> usize {
        self.write_offset - self.read_offset
    }

    /// Free space available for staging.
    pub fn remaining_mut(&self) -> usize {
        self.data.len() - self.write_offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn clear(&mut self) {
        self.read_offset = 0;
        self.write_offset = 0;
    }

    /// The staged bytes that have not been consumed yet.
    pub fn chunk(&self) -> &[u8] {
        &self.data[self.read_offset..self.write_offset]
    }

    /// The writable tail of the buffer.
    pub fn chunk_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write_offset..]
    }

    /// Mark `amt` staged bytes as consumed. Offsets reset once the buffer
    /// fully drains so the whole capacity becomes writable again.
    pub fn advance(&mut self, amt: usize) {
        self.read_offset = core::cmp::min(self.read_offset + amt, self.write_offset);
        if self.read_offset == self.write_offset {
            self.clear();
        }
    }

    /// Mark `amt` additional bytes as staged after writing through
    /// `chunk_mut`.
    pub fn advance_mut(&mut self, amt: usize) {
        self.write_offset = core::cmp::min(self.write_offset + amt, self.data.len());
    }

    /// Copy as much of `src` as fits into the free space, returning the
    /// number of bytes copied.
    pub fn put_truncated(&mut self, src: &[u8]) -> usize {
        let amt = core::cmp::min(src.len(), self.remaining_mut());
        self.data[self.write_offset..self.write_offset + amt].copy_from_slice(&src[..amt]);
        self.write_offset += amt;
        amt
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        BUFFER_BYTE.sub(self.data.len() as _);
    }
}

/// A growable byte buffer for contents that exceed the pinned regions.
/// The buffer may grow beyond its `target_size` while accumulating but
/// shrinks back down once drained.
pub struct Buffer {
    data: Vec<u8>,
    read_offset: usize,
    target_size: usize,
}

impl Buffer {
    pub fn new(target_size: usize) -> Self {
        let target_size = target_size.next_power_of_two();

        BUFFER_BYTE.add(target_size as _);

        Self {
            data: Vec::with_capacity(target_size),
            read_offset: 0,
            target_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Reserve space for `amt` additional bytes.
    pub fn reserve(&mut self, amt: usize) {
        if self.remaining() == 0 {
            self.data.clear();
            self.read_offset = 0;
        }

        if amt > self.data.capacity() - self.data.len() {
            let old = self.data.capacity();
            self.data.reserve(amt);
            BUFFER_BYTE.add((self.data.capacity() - old) as _);
        }
    }

    /// Clear the buffer, shrinking back to the target size if it grew.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_offset = 0;

        if self.data.capacity() > self.target_size {
            trace!("shrinking buffer");

            BUFFER_BYTE.sub((self.data.capacity() - self.target_size) as _);

            self.data.shrink_to(self.target_size);
        }
    }

    /// Append bytes, growing the buffer if needed.
    pub fn put_slice(&mut self, src: &[u8]) {
        self.reserve(src.len());
        self.data.extend_from_slice(src);
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_offset
    }

    /// Mark `amt` bytes as consumed from the front of the buffer.
    pub fn advance(&mut self, amt: usize) {
        self.read_offset = core::cmp::min(self.read_offset + amt, self.data.len());
        if self.read_offset == self.data.len() {
            self.clear();
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        BUFFER_BYTE.sub(self.data.capacity() as _);
    }
}

impl Borrow<[u8]> for Buffer {
    fn borrow(&self) -> &[u8] {
        &self.data[self.read_offset..]
    }
}

impl Buf for Buffer {
    fn remaining(&self) -> usize {
        Buffer::remaining(self)
    }

    fn chunk(&self) -> &[u8] {
        self.borrow()
    }

    fn advance(&mut self, amt: usize) {
        Buffer::advance(self, amt)
    }
}
