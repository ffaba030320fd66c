// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Client-side non-blocking TCP. Wraps the mio stream type with the
//! connection establishment and socket option handling the transports
//! need, and re-exports the mio polling surface.

pub use mio::*;

pub mod event {
    pub use mio::event::*;
}

mod tcp;

pub use tcp::*;
