// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotates through the nodes, ignoring the key. A dead node is skipped
/// by probing forward; when every node is dead the result is empty.
pub struct RoundRobin {
    nodes: Vec<Arc<Node>>,
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self {
            nodes,
            counter: AtomicUsize::new(0),
        }
    }
}

impl Locator for RoundRobin {
    fn locate(&self, _request: &Arc<dyn Request>) -> Vec<Arc<Node>> {
        let n = self.nodes.len();
        if n == 0 {
            return Vec::new();
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        for probe in 0..n {
            let node = &self.nodes[(start.wrapping_add(probe)) % n];
            if !node.is_dead() {
                return vec![node.clone()];
            }
        }

        Vec::new()
    }
}
