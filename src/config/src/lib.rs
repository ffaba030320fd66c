// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

#[macro_use]
extern crate log;

mod client;
mod connection;
mod sasl;

pub use client::ClientConfig;
pub use connection::{Connection, ConnectionConfig};
pub use sasl::{Sasl, SaslConfig};
