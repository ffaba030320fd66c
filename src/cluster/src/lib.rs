// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Core of a client for clusters speaking the memcached binary protocol.
//! A cluster is composed of nodes, one per server endpoint. Each node
//! owns a pool of transports, and each transport owns one pipelined TCP
//! connection driven by a shared event loop thread. A locator maps
//! request keys onto nodes, optionally with vbucket partitioning and
//! replication.
//!
//! Requests are polymorphic: the core only needs the capabilities of the
//! [`Request`] trait to serialize, dispatch, and aggregate replies.

#[macro_use]
extern crate log;

mod auth;
mod cluster;
mod driver;
mod hash;
mod locator;
mod node;
mod observers;
mod request;
mod transport;

pub use auth::{AuthToken, Authenticator, PlainAuthenticator};
pub use cluster::{Cluster, ClusterBuilder, LocatorPolicy};
pub use driver::DriverContext;
pub use hash::bucket_hash;
pub use locator::{Ketama, Locator, RoundRobin, VBucketMap, VBucketServerMap};
pub use node::{
    DefaultNodeFactory, DefaultTransportFactory, Node, NodeFactory, TransportFactory,
};
pub use observers::Observers;
pub use request::{
    CompletionCallback, OpRequest, QuitRequest, ReplyPolicy, Request, Response, StatCallback,
    StatRequest,
};
pub use transport::{ProtocolError, Transport};

pub use protocol_binary::{Opcode, ResponseHeader, Status};
