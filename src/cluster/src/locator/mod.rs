// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Locators map a request onto the node(s) that must handle it.

mod ketama;
mod round_robin;
mod vbucket;

pub use ketama::Ketama;
pub use round_robin::RoundRobin;
pub use vbucket::{VBucketMap, VBucketServerMap};

use crate::*;
use std::sync::Arc;

/// Deterministic mapping from a request to nodes. Returns at most
/// `request.replicas() + 1` nodes in dispatch order; the facade converts
/// any shortfall into failure events so reply aggregation still
/// completes.
pub trait Locator: Send + Sync {
    fn locate(&self, request: &Arc<dyn Request>) -> Vec<Arc<Node>>;
}
