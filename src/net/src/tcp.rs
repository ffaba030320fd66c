// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use core::fmt::Debug;
use core::ops::Deref;
use std::io::{Read, Result, Write};
use std::net::SocketAddr;
use std::os::fd::BorrowedFd;
use std::os::unix::prelude::AsRawFd;

use socket2::SockRef;

pub struct TcpStream {
    inner: mio::net::TcpStream,
}

impl TcpStream {
    /// Begin a non-blocking connect to the endpoint. The stream must be
    /// registered for events; the connection is established once the
    /// socket reports writable and `is_established` returns true.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let inner = mio::net::TcpStream::connect(addr)?;

        Ok(Self { inner })
    }

    pub fn from_std(stream: std::net::TcpStream) -> Self {
        let inner = mio::net::TcpStream::from_std(stream);

        Self { inner }
    }

    pub fn is_established(&self) -> bool {
        self.inner.peer_addr().is_ok()
    }

    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    /// Set SO_RCVBUF and SO_SNDBUF. A size of zero leaves the kernel
    /// defaults in place.
    pub fn set_buffer_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        // SAFETY: the borrowed fd does not outlive the stream which owns it
        let fd = unsafe { BorrowedFd::borrow_raw(self.inner.as_raw_fd()) };
        let socket = SockRef::from(&fd);
        socket.set_recv_buffer_size(size)?;
        socket.set_send_buffer_size(size)?;

        Ok(())
    }

    /// Take the pending error on the socket, used to determine the
    /// outcome of a non-blocking connect.
    pub fn take_error(&self) -> Result<Option<std::io::Error>> {
        self.inner.take_error()
    }
}

impl Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{:?}", self.inner)
    }
}

impl Deref for TcpStream {
    type Target = mio::net::TcpStream;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> i32 {
        self.inner.as_raw_fd()
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

impl crate::event::Source for TcpStream {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interest: mio::Interest,
    ) -> Result<()> {
        self.inner.register(registry, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interest: mio::Interest,
    ) -> Result<()> {
        self.inner.reregister(registry, token, interest)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> Result<()> {
        self.inner.deregister(registry)
    }
}
